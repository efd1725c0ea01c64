//! Persistent push client.
//!
//! This module ties the wire codec, the connection layer and the session
//! state machine together behind one handle. A started client owns two
//! background tasks plus a delivery task:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        PushClient                          │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  listen task ──── frames ───> session ──── plaintext ──┐   │
//! │      │                          │                      v   │
//! │      │                          │               delivery   │
//! │      │                          │                 task     │
//! │      │                          │                      │   │
//! │  monitor task ── heartbeats ────┘        handler <─────┘   │
//! │                                                            │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! The listen task owns the socket and feeds every inbound message through
//! the session; the monitor task watches for silent connections and a dead
//! delivery task; the delivery task runs the user handler so a slow or
//! panicking callback can never stall the socket.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use mcs::{Credentials, Notification, PushClient, PushClientConfig};
//!
//! let credentials = Credentials::from_file("credentials.json")?;
//! let client = PushClient::new(PushClientConfig::default(), Arc::new(decryptor))
//!     .with_credentials(credentials);
//!
//! client.start(|notification: Notification| {
//!     println!("received: {:?}", notification.payload);
//! })?;
//! ```
//!
//! Without a runtime handle, `start` spins up a dedicated single threaded
//! runtime on its own thread; pass one to [`PushClient::start_with_runtime`]
//! to run inside an existing runtime instead.

mod dispatch;
mod monitor;
mod session;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;

use crate::config::PushClientConfig;
use crate::connection::{Connector, TlsConnector};
use crate::credentials::Credentials;
use crate::crypto::PayloadDecryptor;
use crate::error::{PushError, Result};
use crate::registration::Registrar;
use crate::wire::{MCS_HOST, MCS_PORT};

use dispatch::spawn_delivery_task;
use monitor::monitor_loop;
use session::Shared;

pub use dispatch::{Notification, NotificationHandler, NotificationPayload};
pub use session::RunState;

/// Handle to a push session.
///
/// Cheap to construct; nothing touches the network until
/// [`PushClient::start`] or [`PushClient::check_in`].
pub struct PushClient {
    shared: Arc<Shared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl PushClient {
    /// Create a client with the default TLS connector for the MCS endpoint.
    pub fn new(config: PushClientConfig, decryptor: Arc<dyn PayloadDecryptor>) -> Self {
        let connector: Arc<dyn Connector> = Arc::new(TlsConnector::new(MCS_HOST, MCS_PORT));
        Self {
            shared: Arc::new(Shared::new(
                config, connector, decryptor, None, None, None, Vec::new(),
            )),
            thread: Mutex::new(None),
        }
    }

    /// Use previously stored credentials instead of checking in first.
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.shared.seed_credentials(credentials);
        self
    }

    /// Replay these persistent ids on the first login so the server knows
    /// they were already delivered.
    pub fn with_received_persistent_ids(self, ids: Vec<String>) -> Self {
        self.shared.seed_persistent_ids(ids);
        self
    }

    /// Attach a registrar for [`PushClient::check_in`].
    ///
    /// Has no effect once the client has been started.
    pub fn with_registrar(mut self, registrar: Arc<dyn Registrar>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.registrar = Some(registrar);
        }
        self
    }

    /// Dial somewhere other than the production MCS endpoint.
    ///
    /// Has no effect once the client has been started.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.connector = connector;
        }
        self
    }

    /// Observe credential changes, typically to persist them.
    ///
    /// Has no effect once the client has been started.
    pub fn on_credentials_updated(
        mut self,
        callback: impl Fn(&Credentials) + Send + Sync + 'static,
    ) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.credentials_updated = Some(Box::new(callback));
        }
        self
    }

    /// Current lifecycle state.
    pub fn run_state(&self) -> RunState {
        self.shared.run_state()
    }

    /// Whether the client is logged in and receiving.
    pub fn is_started(&self) -> bool {
        self.shared.run_state() == RunState::Started
    }

    /// Validate the stored credentials against the registrar, registering
    /// fresh ones if they are missing or rejected. Returns the FCM token to
    /// subscribe with.
    pub async fn check_in(&self, sender_id: u64, app_id: &str) -> Result<String> {
        let registrar = self
            .shared
            .registrar
            .clone()
            .ok_or_else(|| PushError::Registration("no registrar configured".to_string()))?;
        self.shared.set_app_id(app_id);

        if let Some(credentials) = self.shared.credentials_snapshot() {
            if registrar.check_in(&credentials).await? {
                tracing::debug!("Existing credentials are still valid");
                return Ok(credentials.fcm.token.clone());
            }
            tracing::info!("Existing credentials were rejected, registering again");
        }
        self.register(sender_id, app_id).await
    }

    /// Register with the sender unconditionally, replacing any stored
    /// credentials. Returns the new FCM token.
    pub async fn register(&self, sender_id: u64, app_id: &str) -> Result<String> {
        let registrar = self
            .shared
            .registrar
            .clone()
            .ok_or_else(|| PushError::Registration("no registrar configured".to_string()))?;
        self.shared.set_app_id(app_id);

        let credentials = registrar.register(sender_id, app_id).await?;
        let credentials = self.shared.replace_credentials(credentials);
        tracing::info!("Registered new credentials");
        Ok(credentials.fcm.token.clone())
    }

    /// Start listening on a dedicated runtime thread.
    pub fn start(&self, handler: impl NotificationHandler) -> Result<()> {
        self.start_with_runtime(Arc::new(handler), None, None)
    }

    /// Start listening on an existing runtime.
    ///
    /// `listen_runtime` runs the socket and monitor tasks; `None` spawns a
    /// dedicated thread with its own single threaded runtime.
    /// `callback_runtime` runs the notification handler and defaults to the
    /// listen runtime.
    pub fn start_with_runtime(
        &self,
        handler: Arc<dyn NotificationHandler>,
        listen_runtime: Option<Handle>,
        callback_runtime: Option<Handle>,
    ) -> Result<()> {
        let state = self.shared.run_state();
        if !matches!(state, RunState::Created | RunState::Stopped) {
            return Err(PushError::InvalidState(format!(
                "cannot start from {:?}",
                state
            )));
        }
        if self.shared.credentials_snapshot().is_none() {
            return Err(PushError::InvalidState(
                "no credentials; check in or provide them before starting".to_string(),
            ));
        }

        tracing::info!("Starting push client for {}", self.shared.connector.endpoint());
        self.shared.set_run_state(RunState::StartingTasks);
        self.shared.listening.send_replace(true);

        match listen_runtime {
            Some(handle) => {
                let delivery_handle = callback_runtime.unwrap_or_else(|| handle.clone());
                let sender = spawn_delivery_task(
                    &delivery_handle,
                    handler,
                    Arc::downgrade(&self.shared),
                );
                self.shared.set_dispatch(sender);
                handle.spawn(Self::run_tasks(Arc::clone(&self.shared)));
            }
            None => {
                let shared = Arc::clone(&self.shared);
                let spawned = std::thread::Builder::new()
                    .name("mcs-push".to_string())
                    .spawn(move || {
                        let runtime = match tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        {
                            Ok(runtime) => runtime,
                            Err(err) => {
                                tracing::error!("Could not build push runtime: {}", err);
                                shared.terminate();
                                shared.set_run_state(RunState::Stopped);
                                return;
                            }
                        };
                        let delivery_handle = callback_runtime
                            .unwrap_or_else(|| runtime.handle().clone());
                        let sender = spawn_delivery_task(
                            &delivery_handle,
                            handler,
                            Arc::downgrade(&shared),
                        );
                        shared.set_dispatch(sender);
                        runtime.block_on(Self::run_tasks(shared));
                    });
                match spawned {
                    Ok(thread) => *self.thread_guard() = Some(thread),
                    Err(err) => {
                        self.shared.terminate();
                        self.shared.set_run_state(RunState::Stopped);
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_tasks(shared: Arc<Shared>) {
        let listen = tokio::spawn(Arc::clone(&shared).listen_loop());
        let monitor = tokio::spawn(monitor_loop(Arc::clone(&shared)));
        shared.register_tasks(vec![listen.abort_handle(), monitor.abort_handle()]);

        let (listen_result, monitor_result) = tokio::join!(listen, monitor);
        for result in [listen_result, monitor_result] {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    tracing::error!("Push task failed: {}", err);
                }
            }
        }
        tracing::info!("Push client has shut down");
    }

    /// Stop listening and release the connection. Idempotent.
    pub async fn stop(&self) {
        self.shared.stop().await;
        // The dedicated runtime thread, if any, exits once its tasks are
        // gone; there is nothing to join from async context.
        self.thread_guard().take();
    }

    fn thread_guard(&self) -> MutexGuard<'_, Option<std::thread::JoinHandle<()>>> {
        self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
