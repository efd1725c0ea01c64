//! Connection health monitor.
//!
//! A periodic task that watches two things the receive path cannot see on
//! its own: a delivery task that died (nowhere to hand notifications to)
//! and a connection that went silent without a socket error. Silence is
//! judged against the client heartbeat interval when one is configured,
//! otherwise against the interval requested from the server.

use std::sync::Arc;
use std::time::Duration;

use super::session::{RunState, Shared};

/// Slack on top of the server heartbeat interval before silence counts as
/// a dead connection.
const SERVER_HEARTBEAT_GRACE: Duration = Duration::from_secs(2);

pub(crate) async fn monitor_loop(shared: Arc<Shared>) {
    let interval = shared.config.monitor_interval();
    let mut listening_rx = shared.listening.subscribe();

    while shared.is_listening() {
        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = listening_rx.changed() => continue,
        }

        if shared.dispatch_closed() {
            tracing::error!("Notification delivery task is gone, shutting down");
            shared.terminate();
            break;
        }

        if shared.run_state() != RunState::Started {
            continue;
        }

        check_heartbeat(&shared).await;
    }

    tracing::debug!("Monitor loop exited");
}

async fn check_heartbeat(shared: &Arc<Shared>) {
    let Some(age) = shared.last_message_age() else {
        return;
    };

    if let Some(client_interval) = shared.config.client_heartbeat_interval() {
        if age <= client_interval {
            return;
        }
        if let Err(err) = shared.send_heartbeat_ping().await {
            // Transport failures are the listen loop's to recover from; the
            // next pass sees whatever state it left behind.
            tracing::debug!("Heartbeat send failed: {}", err);
            return;
        }
        let mut listening_rx = shared.listening.subscribe();
        tokio::select! {
            () = tokio::time::sleep(shared.config.heartbeat_ack_timeout()) => {}
            _ = listening_rx.changed() => return,
        }
        let stale = shared
            .last_message_age()
            .is_some_and(|age| age > client_interval);
        if stale && shared.is_listening() && shared.run_state() == RunState::Started {
            tracing::warn!("No heartbeat response within timeout, resetting connection");
            if let Err(err) = shared.reset().await {
                tracing::error!("Reset after missed heartbeat failed: {}", err);
            }
        }
    } else if let Some(server_interval) = shared.config.server_heartbeat_interval() {
        if age > server_interval + SERVER_HEARTBEAT_GRACE {
            tracing::warn!("No server heartbeat for {:?}, resetting connection", age);
            if let Err(err) = shared.reset().await {
                tracing::error!("Reset after heartbeat silence failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PushClientConfig;
    use crate::connection::TcpConnector;
    use crate::credentials::{Credentials, FcmCredentials, GcmCredentials, KeyBundle};
    use crate::crypto::{DecryptError, PayloadDecryptor};

    struct NullDecryptor;

    impl PayloadDecryptor for NullDecryptor {
        fn decrypt(
            &self,
            _credentials: &Credentials,
            _salt: &[u8],
            _sender_public_key: &[u8],
            ciphertext: &[u8],
        ) -> Result<Vec<u8>, DecryptError> {
            Ok(ciphertext.to_vec())
        }
    }

    fn monitored_shared(config: PushClientConfig) -> Arc<Shared> {
        let credentials = Credentials {
            gcm: GcmCredentials {
                android_id: "1".to_string(),
                security_token: "2".to_string(),
                app_id: None,
                token: None,
            },
            fcm: FcmCredentials {
                token: "t".to_string(),
            },
            keys: KeyBundle {
                public: String::new(),
                private: String::new(),
                secret: String::new(),
            },
        };
        Arc::new(Shared::new(
            config,
            Arc::new(TcpConnector::new("127.0.0.1", 1)),
            Arc::new(NullDecryptor),
            None,
            Some(credentials),
            None,
            Vec::new(),
        ))
    }

    #[tokio::test]
    async fn test_monitor_terminates_when_delivery_gone() {
        let config = PushClientConfig {
            monitor_interval_secs: 0.01,
            ..Default::default()
        };
        let shared = monitored_shared(config);
        shared.listening.send_replace(true);
        let (tx, rx) =
            tokio::sync::mpsc::unbounded_channel::<crate::client::dispatch::Notification>();
        shared.set_dispatch(tx);
        drop(rx);

        tokio::time::timeout(Duration::from_secs(5), monitor_loop(Arc::clone(&shared)))
            .await
            .expect("monitor should notice the closed channel");
        assert_eq!(shared.run_state(), RunState::Stopping);
    }

    #[tokio::test]
    async fn test_monitor_exits_on_stop_signal() {
        let shared = monitored_shared(PushClientConfig::default());
        shared.listening.send_replace(true);
        let task = tokio::spawn(monitor_loop(Arc::clone(&shared)));

        shared.listening.send_replace(false);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("monitor should exit promptly")
            .unwrap();
    }
}
