//! Notification delivery.
//!
//! The receive loop never runs user code directly. Decrypted notifications
//! go through an unbounded channel to a dedicated delivery task, which may
//! live on a different runtime than the connection itself. A panicking
//! handler is caught and counted rather than taking the stream down; the
//! sequential notify counter decides when repeated failures terminate the
//! client.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::session::{ErrorKind, Shared};

/// Decrypted notification content.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationPayload {
    /// Payload parsed as a JSON document, the common case.
    Json(serde_json::Value),
    /// Payload that was not valid JSON, passed through untouched.
    Raw(Vec<u8>),
}

/// A decrypted push delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Decrypted message content.
    pub payload: NotificationPayload,
    /// Server-assigned id, also usable for deduplication across restarts.
    pub persistent_id: String,
}

impl Notification {
    pub(crate) fn from_plaintext(plaintext: Vec<u8>, persistent_id: String) -> Self {
        let payload = match serde_json::from_slice(&plaintext) {
            Ok(value) => NotificationPayload::Json(value),
            Err(_) => NotificationPayload::Raw(plaintext),
        };
        Self {
            payload,
            persistent_id,
        }
    }
}

/// Receives decrypted notifications.
///
/// Implemented for plain closures; implement the trait directly when the
/// handler needs shared state with the rest of the application.
pub trait NotificationHandler: Send + Sync + 'static {
    /// Called once per delivered notification, in arrival order.
    fn on_notification(&self, notification: Notification);
}

impl<F> NotificationHandler for F
where
    F: Fn(Notification) + Send + Sync + 'static,
{
    fn on_notification(&self, notification: Notification) {
        self(notification);
    }
}

/// Spawn the delivery task on `handle` and hand back the sending side.
///
/// The task drains the channel until every sender is dropped, then exits.
/// It holds only a weak reference to the session so a forgotten client can
/// still be dropped.
pub(crate) fn spawn_delivery_task(
    handle: &Handle,
    handler: Arc<dyn NotificationHandler>,
    shared: Weak<Shared>,
) -> mpsc::UnboundedSender<Notification> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();

    handle.spawn(async move {
        while let Some(notification) = rx.recv().await {
            let persistent_id = notification.persistent_id.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler.on_notification(notification);
            }));

            // The session may already be gone during shutdown; delivery
            // still drains the channel, only the bookkeeping is skipped.
            let session = shared.upgrade();
            match outcome {
                Ok(()) => {
                    if let Some(session) = session {
                        session.reset_error_count(ErrorKind::Notify);
                    }
                }
                Err(_) => {
                    tracing::error!(
                        "Notification handler panicked on message {}",
                        persistent_id
                    );
                    if let Some(session) = session {
                        session.try_increment_error_count(ErrorKind::Notify);
                    }
                }
            }
        }
        tracing::debug!("Notification delivery task exiting");
    });

    tx
}
