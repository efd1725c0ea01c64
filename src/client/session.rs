//! Session state machine and receive loop.
//!
//! One [`Shared`] instance carries everything the listen task, the monitor
//! task and the public [`PushClient`](super::PushClient) handle agree on.
//! The lifecycle is strictly forward except for the reset cycle:
//!
//! ```text
//! Created -> StartingTasks -> StartingConnection -> StartingLogin -> Started
//!                                     ^                                 |
//!                                     |            Resetting <----------+
//!                                     +---------------(reconnect)
//!
//! any state -> Stopping -> Stopped
//! ```
//!
//! Error handling is counter based: each failure class increments its own
//! sequential counter and any success of that class clears it. Hitting the
//! configured threshold terminates the client instead of retrying forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::AbortHandle;

use crate::config::PushClientConfig;
use crate::connection::{connect_with_retry, Connection, Connector, McsReader, McsWriter};
use crate::credentials::Credentials;
use crate::crypto::{DecryptError, EncryptionParams, PayloadDecryptor};
use crate::error::{PushError, Result};
use crate::registration::Registrar;
use crate::wire::{
    decode_message, DataMessageStanza, Decoded, HeartbeatAck, HeartbeatPing, IqStanza,
    LoginRequest, LoginResponse, McsMessage, RawFrame, SELECTIVE_ACK_EXTENSION_ID,
    STREAM_ACK_EXTENSION_ID,
};

use super::dispatch::Notification;

/// Poll cadence while another task is mid-reset and the loop has no reader.
const RESETTING_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on the close handshake of an outgoing connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifecycle of a push client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Built but never started.
    Created,
    /// `start` accepted, background tasks are being spawned.
    StartingTasks,
    /// Dialing the endpoint.
    StartingConnection,
    /// Connected and logging in.
    StartingLogin,
    /// Logged in and receiving.
    Started,
    /// Tearing the connection down to replace it.
    Resetting,
    /// Shutdown in progress.
    Stopping,
    /// Shut down.
    Stopped,
}

/// Failure classes tracked by independent sequential counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    Connection,
    Read,
    Login,
    Notify,
}

#[derive(Debug, Clone, Copy, Default)]
struct ErrorCounters {
    connection: u32,
    read: u32,
    login: u32,
    notify: u32,
}

impl ErrorCounters {
    fn slot_mut(&mut self, kind: ErrorKind) -> &mut u32 {
        match kind {
            ErrorKind::Connection => &mut self.connection,
            ErrorKind::Read => &mut self.read,
            ErrorKind::Login => &mut self.login,
            ErrorKind::Notify => &mut self.notify,
        }
    }

    #[cfg(test)]
    fn get(self, kind: ErrorKind) -> u32 {
        match kind {
            ErrorKind::Connection => self.connection,
            ErrorKind::Read => self.read,
            ErrorKind::Login => self.login,
            ErrorKind::Notify => self.notify,
        }
    }
}

/// Mutable session fields, all behind one lock.
#[derive(Debug)]
struct SessionState {
    run_state: RunState,
    /// Count of messages received on the current connection.
    input_stream_id: u64,
    last_stream_id_reported: Option<u64>,
    last_login: Option<Instant>,
    last_message: Option<Instant>,
    /// Ids received but not yet confirmed to the server by a login.
    persistent_ids: Vec<String>,
    counters: ErrorCounters,
    warn_counts: HashMap<&'static str, u32>,
}

impl SessionState {
    fn new(received_persistent_ids: Vec<String>) -> Self {
        Self {
            run_state: RunState::Created,
            input_stream_id: 0,
            last_stream_id_reported: None,
            last_login: None,
            last_message: None,
            persistent_ids: received_persistent_ids,
            counters: ErrorCounters::default(),
            warn_counts: HashMap::new(),
        }
    }
}

/// State shared between the client handle and its background tasks.
pub(crate) struct Shared {
    pub(crate) config: PushClientConfig,
    pub(crate) connector: Arc<dyn Connector>,
    decryptor: Arc<dyn PayloadDecryptor>,
    pub(crate) registrar: Option<Arc<dyn Registrar>>,
    credentials: RwLock<Option<Arc<Credentials>>>,
    pub(crate) credentials_updated: Option<Box<dyn Fn(&Credentials) + Send + Sync>>,
    app_id: RwLock<Option<String>>,
    state: Mutex<SessionState>,
    /// Global liveness flag; `false` wakes every select in the background
    /// tasks so they can exit.
    pub(crate) listening: watch::Sender<bool>,
    writer: AsyncMutex<Option<McsWriter>>,
    /// Reader of a freshly established connection, waiting for the listen
    /// loop to pick it up between reads.
    pending_reader: Mutex<Option<(McsReader, watch::Receiver<bool>)>>,
    /// Close signal of the current connection.
    conn_close: Mutex<Option<watch::Sender<bool>>>,
    reset_gate: AsyncMutex<()>,
    stop_gate: AsyncMutex<()>,
    dispatch: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: PushClientConfig,
        connector: Arc<dyn Connector>,
        decryptor: Arc<dyn PayloadDecryptor>,
        registrar: Option<Arc<dyn Registrar>>,
        credentials: Option<Credentials>,
        credentials_updated: Option<Box<dyn Fn(&Credentials) + Send + Sync>>,
        received_persistent_ids: Vec<String>,
    ) -> Self {
        let (listening, _) = watch::channel(false);
        Self {
            config,
            connector,
            decryptor,
            registrar,
            credentials: RwLock::new(credentials.map(Arc::new)),
            credentials_updated,
            app_id: RwLock::new(None),
            state: Mutex::new(SessionState::new(received_persistent_ids)),
            listening,
            writer: AsyncMutex::new(None),
            pending_reader: Mutex::new(None),
            conn_close: Mutex::new(None),
            reset_gate: AsyncMutex::new(()),
            stop_gate: AsyncMutex::new(()),
            dispatch: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // Lock poisoning only happens if a holder panicked; the state itself
    // stays usable, so recover the guard instead of propagating.
    fn state_guard(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_reader_guard(
        &self,
    ) -> MutexGuard<'_, Option<(McsReader, watch::Receiver<bool>)>> {
        self.pending_reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn conn_close_guard(&self) -> MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.conn_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch_guard(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Notification>>> {
        self.dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks_guard(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn run_state(&self) -> RunState {
        self.state_guard().run_state
    }

    pub(crate) fn set_run_state(&self, next: RunState) {
        let mut state = self.state_guard();
        if state.run_state != next {
            tracing::debug!("Run state {:?} -> {:?}", state.run_state, next);
            state.run_state = next;
        }
    }

    pub(crate) fn is_listening(&self) -> bool {
        *self.listening.borrow()
    }

    pub(crate) fn credentials_snapshot(&self) -> Option<Arc<Credentials>> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install credentials without firing the update callback. Used while
    /// assembling a client, before anything observes them.
    pub(crate) fn seed_credentials(&self, credentials: Credentials) {
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(credentials));
    }

    /// Replace the pending unacknowledged ids wholesale.
    pub(crate) fn seed_persistent_ids(&self, ids: Vec<String>) {
        self.state_guard().persistent_ids = ids;
    }

    pub(crate) fn replace_credentials(&self, credentials: Credentials) -> Arc<Credentials> {
        let credentials = Arc::new(credentials);
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&credentials));
        if let Some(callback) = &self.credentials_updated {
            callback(&credentials);
        }
        credentials
    }

    pub(crate) fn set_app_id(&self, app_id: &str) {
        *self.app_id.write().unwrap_or_else(PoisonError::into_inner) =
            Some(app_id.to_string());
    }

    fn app_id_snapshot(&self) -> Option<String> {
        self.app_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_dispatch(&self, sender: mpsc::UnboundedSender<Notification>) {
        *self.dispatch_guard() = Some(sender);
    }

    /// Whether the delivery task dropped its receiver, meaning notifications
    /// have nowhere to go anymore.
    pub(crate) fn dispatch_closed(&self) -> bool {
        self.dispatch_guard().as_ref().is_some_and(|tx| tx.is_closed())
    }

    pub(crate) fn register_tasks(&self, handles: Vec<AbortHandle>) {
        *self.tasks_guard() = handles;
    }

    /// Record a failure of `kind`. Returns false when the sequential limit
    /// was hit, in which case the client has already been terminated.
    pub(crate) fn try_increment_error_count(&self, kind: ErrorKind) -> bool {
        let count = {
            let mut state = self.state_guard();
            let slot = state.counters.slot_mut(kind);
            *slot += 1;
            *slot
        };
        if let Some(limit) = self.config.abort_on_sequential_error_count {
            if count >= limit {
                tracing::error!(
                    "Sequential {:?} error limit of {} reached, shutting down",
                    kind,
                    limit
                );
                self.terminate();
                return false;
            }
        }
        true
    }

    pub(crate) fn reset_error_count(&self, kind: ErrorKind) {
        *self.state_guard().counters.slot_mut(kind) = 0;
    }

    /// Spend one emission from the per-session budget for this warning.
    fn warn_budget(&self, key: &'static str) -> bool {
        let Some(limit) = self.config.log_warn_limit else {
            return false;
        };
        let mut state = self.state_guard();
        let count = state.warn_counts.entry(key).or_insert(0);
        if *count < limit {
            *count += 1;
            true
        } else {
            false
        }
    }

    /// The stream id to report to the server, or `None` when the current
    /// count has already been reported.
    fn take_unreported_stream_id(&self) -> Option<u64> {
        let mut state = self.state_guard();
        if state.last_stream_id_reported == Some(state.input_stream_id) {
            return None;
        }
        state.last_stream_id_reported = Some(state.input_stream_id);
        Some(state.input_stream_id)
    }

    pub(crate) fn last_message_age(&self) -> Option<Duration> {
        self.state_guard().last_message.map(|at| at.elapsed())
    }

    pub(crate) async fn send_message(&self, message: &McsMessage) -> Result<()> {
        if self.config.log_debug_verbose {
            tracing::debug!("Sending {:?}", message);
        }
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write_message(message).await,
            None => Err(PushError::Connection("no active connection".to_string())),
        }
    }

    /// Send the login request for the current connection.
    ///
    /// Resets the per-connection stream counters first; the pending
    /// persistent ids are replayed and only cleared once the server answers
    /// with a successful login response.
    pub(crate) async fn login(&self) -> Result<()> {
        self.set_run_state(RunState::StartingLogin);
        let persistent_ids = {
            let mut state = self.state_guard();
            state.input_stream_id = 0;
            state.last_stream_id_reported = None;
            state.last_login = Some(Instant::now());
            state.persistent_ids.clone()
        };
        let credentials = self.credentials_snapshot().ok_or_else(|| {
            PushError::InvalidState("no credentials to log in with".to_string())
        })?;
        let android_id = credentials.android_id()?;
        let security_token = credentials.security_token()?;
        let request = LoginRequest::new(
            android_id,
            security_token,
            persistent_ids,
            self.config.server_heartbeat_interval(),
        );
        tracing::debug!("Logging in as android-{:x}", android_id);
        self.send_message(&McsMessage::LoginRequest(Box::new(request)))
            .await
    }

    async fn install_connection(&self, connection: Connection) {
        let Connection {
            reader,
            writer,
            closed_tx,
            closed_rx,
        } = connection;
        *self.writer.lock().await = Some(writer);
        *self.conn_close_guard() = Some(closed_tx);
        *self.pending_reader_guard() = Some((reader, closed_rx));
    }

    /// Tear the current connection down. Idempotent; signals any in-flight
    /// read before shutting the writer so the listen loop never blocks on a
    /// dead socket. The close handshake is time bounded; when it expires the
    /// writer is dropped and the socket closes abortively.
    pub(crate) async fn close_connection(&self) {
        if let Some(closed) = self.conn_close_guard().take() {
            closed.send_replace(true);
        }
        let mut writer_slot = self.writer.lock().await;
        if let Some(mut writer) = writer_slot.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => match err.kind() {
                    std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe => {
                        tracing::debug!("Connection already gone on close: {}", err);
                    }
                    _ => tracing::warn!("Error closing connection: {}", err),
                },
                Err(_) => {
                    tracing::debug!("Close handshake timed out, dropping the connection");
                }
            }
        }
        drop(writer_slot);
        self.pending_reader_guard().take();
    }

    /// Dial and install a fresh connection. Exhausting the retry budget is
    /// fatal and terminates the client.
    pub(crate) async fn reconnect(&self) -> Result<()> {
        if !self.is_listening() {
            return Err(PushError::Connection("client is not listening".to_string()));
        }
        self.set_run_state(RunState::StartingConnection);
        let mut listening_rx = self.listening.subscribe();
        match connect_with_retry(self.connector.as_ref(), &self.config, &mut listening_rx).await
        {
            Ok(connection) => {
                self.install_connection(connection).await;
                Ok(())
            }
            Err(err) => {
                if self.is_listening() {
                    tracing::error!("Could not establish a connection, shutting down: {}", err);
                    self.terminate();
                }
                Err(err)
            }
        }
    }

    /// Replace the connection and log in again.
    ///
    /// No-op when a reset is already running on another task or the client
    /// is stopping. Reconnects are spaced at least `reset_interval` from the
    /// previous login so a flapping server cannot drive a tight spin.
    pub(crate) async fn reset(&self) -> Result<()> {
        let Ok(_reset_guard) = self.reset_gate.try_lock() else {
            return Ok(());
        };
        if self.stop_gate.try_lock().is_err() || !self.is_listening() {
            return Ok(());
        }
        self.set_run_state(RunState::Resetting);
        tracing::debug!("Resetting connection");

        let spacing = self.config.reset_interval();
        let since_login = self.state_guard().last_login.map(|at| at.elapsed());
        if let Some(elapsed) = since_login {
            if elapsed < spacing {
                tokio::time::sleep(spacing - elapsed).await;
            }
        }

        self.close_connection().await;
        tracing::debug!("Reestablishing connection");
        self.reconnect().await?;
        self.login().await
    }

    /// Flag the client for shutdown from inside a background task.
    ///
    /// Synchronous on purpose: flipping the liveness watch wakes both loops,
    /// which then unwind through their normal exits. The final `Stopped`
    /// state is only reached through an explicit [`Shared::stop`].
    pub(crate) fn terminate(&self) {
        self.set_run_state(RunState::Stopping);
        self.listening.send_replace(false);
        // Dropping the sender lets the delivery task drain and exit.
        self.dispatch_guard().take();
    }

    /// Orderly shutdown. Idempotent; concurrent calls are no-ops.
    pub(crate) async fn stop(&self) {
        let Ok(_stop_guard) = self.stop_gate.try_lock() else {
            return;
        };
        if matches!(self.run_state(), RunState::Stopping | RunState::Stopped) {
            return;
        }
        tracing::info!("Stopping push client");
        self.set_run_state(RunState::Stopping);
        self.listening.send_replace(false);
        self.dispatch_guard().take();
        // Abort before closing the connection: a task parked in a write
        // still holds the writer lock, and close_connection needs it.
        let handles: Vec<AbortHandle> = self.tasks_guard().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        self.close_connection().await;
        self.set_run_state(RunState::Stopped);
    }

    /// Receive loop: pick up connections, read frames, dispatch messages.
    pub(crate) async fn listen_loop(self: Arc<Self>) {
        if self.reconnect().await.is_err() {
            return;
        }
        if let Err(err) = self.login().await {
            self.handle_stream_error(err).await;
        }

        let mut reader: Option<(McsReader, watch::Receiver<bool>)> = None;
        let mut listening_rx = self.listening.subscribe();

        while self.is_listening() {
            if let Some(replacement) = self.pending_reader_guard().take() {
                reader = Some(replacement);
            }

            let resetting = self.run_state() == RunState::Resetting;
            let Some((frame_reader, closed_rx)) = reader.as_mut().filter(|_| !resetting)
            else {
                // Another task owns the connection churn right now; idle
                // until a new reader shows up or the client stops.
                tokio::select! {
                    () = tokio::time::sleep(RESETTING_POLL_INTERVAL) => {}
                    _ = listening_rx.changed() => {}
                }
                continue;
            };

            let outcome = tokio::select! {
                frame = frame_reader.read_frame() => Some(frame),
                _ = closed_rx.changed() => None,
                _ = listening_rx.changed() => None,
            };

            match outcome {
                None => {
                    // Connection was closed under us, by a reset or a stop.
                    reader = None;
                }
                Some(Ok(frame)) => {
                    if let Err(err) = self.handle_frame(frame).await {
                        self.handle_stream_error(err).await;
                    }
                }
                Some(Err(err)) => {
                    reader = None;
                    self.handle_stream_error(err).await;
                }
            }
        }

        self.close_connection().await;
        tracing::debug!("Listen loop exited");
    }

    /// Classify a failure from the read/handle path and recover or shut
    /// down accordingly.
    async fn handle_stream_error(&self, err: PushError) {
        if !self.is_listening() {
            tracing::debug!("Error after shutdown began: {}", err);
            return;
        }
        if err.is_transport() {
            let state = self.run_state();
            if matches!(state, RunState::Resetting | RunState::Stopping) {
                // Reads racing a teardown fail by design.
                if self.config.log_debug_verbose {
                    tracing::debug!("Expected stream error during {:?}: {}", state, err);
                }
                return;
            }
            tracing::error!("Stream error while listening: {}", err);
            if self.try_increment_error_count(ErrorKind::Connection) {
                if let Err(reset_err) = self.reset().await {
                    tracing::error!("Reset after stream error failed: {}", reset_err);
                }
            }
        } else {
            tracing::error!("Protocol error while listening, shutting down: {}", err);
            self.terminate();
        }
    }

    async fn handle_frame(&self, frame: RawFrame) -> Result<()> {
        match decode_message(frame.tag, &frame.payload)? {
            Decoded::Message(message) => self.handle_message(message).await,
            Decoded::Unsupported(tag) => {
                // Skipped without counting toward the input stream id.
                if self.warn_budget("unsupported-tag") {
                    tracing::warn!("Ignoring unsupported message tag {:?}", tag);
                }
                Ok(())
            }
        }
    }

    async fn handle_message(&self, message: McsMessage) -> Result<()> {
        {
            let mut state = self.state_guard();
            state.last_message = Some(Instant::now());
            state.input_stream_id += 1;
        }
        if self.config.log_debug_verbose {
            tracing::debug!("Received {:?}", message);
        }

        match message {
            // Close and login responses manage the counters themselves and
            // must not fall through to the blanket resets below.
            McsMessage::Close(_) => {
                if self.warn_budget("server-close") {
                    tracing::warn!("Server requested connection close");
                }
                if self.try_increment_error_count(ErrorKind::Connection) {
                    self.reset().await?;
                }
                return Ok(());
            }
            McsMessage::LoginResponse(response) => {
                self.handle_login_response(response).await?;
                return Ok(());
            }
            McsMessage::DataMessage(data) => {
                if !self.handle_data_message(*data).await? {
                    return Ok(());
                }
            }
            McsMessage::HeartbeatPing(ping) => self.handle_heartbeat_ping(&ping).await?,
            McsMessage::HeartbeatAck(ack) => {
                tracing::debug!("Heartbeat ack received: {:?}", ack);
            }
            McsMessage::IqStanza(iq) => self.handle_iq_stanza(&iq),
            McsMessage::LoginRequest(_) => {
                if self.warn_budget("unexpected-login-request") {
                    tracing::warn!("Server sent a login request, ignoring");
                }
            }
        }

        self.reset_error_count(ErrorKind::Read);
        self.reset_error_count(ErrorKind::Connection);
        Ok(())
    }

    async fn handle_login_response(&self, response: LoginResponse) -> Result<()> {
        if let Some(error) = response.error {
            tracing::error!(
                "Login rejected: code {} {}",
                error.code,
                error.message.as_deref().unwrap_or("")
            );
            if self.try_increment_error_count(ErrorKind::Login) {
                self.reset().await?;
            }
        } else {
            self.set_run_state(RunState::Started);
            self.reset_error_count(ErrorKind::Login);
            self.state_guard().persistent_ids.clear();
            tracing::info!("Successfully logged in to MCS endpoint as {}", response.id);
        }
        Ok(())
    }

    /// Returns false when the message was skipped after a decrypt failure,
    /// which leaves the sequential read counter as this method set it.
    async fn handle_data_message(&self, message: DataMessageStanza) -> Result<bool> {
        if let (Some(subtype), Some(app_id)) =
            (message.app_data_value("subtype"), self.app_id_snapshot())
        {
            if subtype != app_id && self.warn_budget("app-id-mismatch") {
                tracing::warn!(
                    "Message subtype {} does not match app id {}",
                    subtype,
                    app_id
                );
            }
        }

        let plaintext = match self.decrypt_payload(&message) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                if self.warn_budget("decrypt-failed") {
                    tracing::warn!(
                        "Could not decrypt message {}: {}",
                        message.persistent_id,
                        err
                    );
                }
                // Skipped and left unacked so the server may redeliver it.
                self.try_increment_error_count(ErrorKind::Read);
                return Ok(false);
            }
        };
        if self.config.log_debug_verbose {
            tracing::debug!(
                "Decrypted {} byte payload for {}",
                plaintext.len(),
                message.category
            );
        }

        self.dispatch(Notification::from_plaintext(
            plaintext,
            message.persistent_id.clone(),
        ));
        self.state_guard()
            .persistent_ids
            .push(message.persistent_id.clone());
        if self.config.send_selective_acknowledgements {
            self.send_selective_ack(message.persistent_id).await?;
        }
        Ok(true)
    }

    fn decrypt_payload(
        &self,
        message: &DataMessageStanza,
    ) -> std::result::Result<Vec<u8>, DecryptError> {
        let params = EncryptionParams::from_message(message)?;
        let credentials = self
            .credentials_snapshot()
            .ok_or_else(|| DecryptError::InvalidKey("no credentials loaded".to_string()))?;
        self.decryptor.decrypt(
            &credentials,
            &params.salt,
            &params.sender_public_key,
            &message.raw_data,
        )
    }

    fn dispatch(&self, notification: Notification) {
        let sender = self.dispatch_guard().clone();
        match sender {
            Some(sender) => {
                if sender.send(notification).is_err() {
                    tracing::warn!("Delivery task is gone, dropping notification");
                    self.try_increment_error_count(ErrorKind::Notify);
                }
            }
            None => {
                tracing::warn!("No delivery channel, dropping notification");
            }
        }
    }

    async fn send_selective_ack(&self, persistent_id: String) -> Result<()> {
        tracing::debug!("Acknowledging message {}", persistent_id);
        let ack = IqStanza::selective_ack(vec![persistent_id])?;
        self.send_message(&McsMessage::IqStanza(ack)).await
    }

    async fn handle_heartbeat_ping(&self, ping: &HeartbeatPing) -> Result<()> {
        tracing::debug!("Heartbeat ping received: {:?}", ping);
        let ack = HeartbeatAck {
            stream_id: None,
            last_stream_id_received: self.take_unreported_stream_id(),
            status: None,
        };
        self.send_message(&McsMessage::HeartbeatAck(ack)).await
    }

    /// Client-initiated heartbeat, driven by the monitor task.
    pub(crate) async fn send_heartbeat_ping(&self) -> Result<()> {
        let ping = HeartbeatPing {
            stream_id: None,
            last_stream_id_received: self.take_unreported_stream_id(),
            status: None,
        };
        tracing::debug!("Sending heartbeat ping");
        self.send_message(&McsMessage::HeartbeatPing(ping)).await
    }

    fn handle_iq_stanza(&self, iq: &IqStanza) {
        match &iq.extension {
            Some(extension)
                if extension.id == SELECTIVE_ACK_EXTENSION_ID
                    || extension.id == STREAM_ACK_EXTENSION_ID =>
            {
                tracing::debug!("Ack extension {} received", extension.id);
            }
            Some(extension) => {
                if self.warn_budget("unexpected-iq-extension") {
                    tracing::warn!("Unexpected IQ extension id {}", extension.id);
                }
            }
            None => {
                if self.warn_budget("iq-without-extension") {
                    tracing::warn!("IQ stanza without extension");
                }
            }
        }
    }

    #[cfg(test)]
    fn error_count(&self, kind: ErrorKind) -> u32 {
        self.state_guard().counters.get(kind)
    }

    #[cfg(test)]
    fn pending_persistent_ids(&self) -> Vec<String> {
        self.state_guard().persistent_ids.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TcpConnector;
    use crate::credentials::{FcmCredentials, GcmCredentials, KeyBundle};
    use crate::wire::{AppData, ErrorInfo};

    struct NullDecryptor;

    impl PayloadDecryptor for NullDecryptor {
        fn decrypt(
            &self,
            _credentials: &Credentials,
            _salt: &[u8],
            _sender_public_key: &[u8],
            ciphertext: &[u8],
        ) -> std::result::Result<Vec<u8>, DecryptError> {
            Ok(ciphertext.to_vec())
        }
    }

    fn test_credentials() -> Credentials {
        Credentials {
            gcm: GcmCredentials {
                android_id: "12345".to_string(),
                security_token: "67890".to_string(),
                app_id: None,
                token: None,
            },
            fcm: FcmCredentials {
                token: "fcm-token".to_string(),
            },
            keys: KeyBundle {
                public: "p".to_string(),
                private: "q".to_string(),
                secret: "s".to_string(),
            },
        }
    }

    fn test_shared(config: PushClientConfig) -> Arc<Shared> {
        Arc::new(Shared::new(
            config,
            Arc::new(TcpConnector::new("127.0.0.1", 1)),
            Arc::new(NullDecryptor),
            None,
            Some(test_credentials()),
            None,
            Vec::new(),
        ))
    }

    fn encrypted_message(persistent_id: &str) -> DataMessageStanza {
        DataMessageStanza {
            id: "msg".to_string(),
            persistent_id: persistent_id.to_string(),
            category: "org.example".to_string(),
            app_data: vec![
                AppData {
                    key: "crypto-key".to_string(),
                    value: "dh=AAAA".to_string(),
                },
                AppData {
                    key: "encryption".to_string(),
                    value: "salt=AAAA".to_string(),
                },
            ],
            raw_data: b"{\"body\":\"hello\"}".to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_error_counter_threshold_terminates() {
        let shared = test_shared(PushClientConfig::default());
        assert!(shared.try_increment_error_count(ErrorKind::Connection));
        assert!(shared.try_increment_error_count(ErrorKind::Connection));
        // Third strike hits the default limit of 3.
        assert!(!shared.try_increment_error_count(ErrorKind::Connection));
        assert_eq!(shared.run_state(), RunState::Stopping);
        assert!(!shared.is_listening());
    }

    #[test]
    fn test_success_resets_counter() {
        let shared = test_shared(PushClientConfig::default());
        assert!(shared.try_increment_error_count(ErrorKind::Read));
        assert!(shared.try_increment_error_count(ErrorKind::Read));
        shared.reset_error_count(ErrorKind::Read);

        assert!(shared.try_increment_error_count(ErrorKind::Read));
        assert!(shared.try_increment_error_count(ErrorKind::Read));
        assert!(!shared.try_increment_error_count(ErrorKind::Read));
    }

    #[test]
    fn test_counters_are_independent() {
        let shared = test_shared(PushClientConfig::default());
        assert!(shared.try_increment_error_count(ErrorKind::Connection));
        assert!(shared.try_increment_error_count(ErrorKind::Connection));
        assert!(shared.try_increment_error_count(ErrorKind::Login));
        assert!(shared.try_increment_error_count(ErrorKind::Login));
        // Neither class reached the limit on its own.
        assert_eq!(shared.run_state(), RunState::Created);
    }

    #[test]
    fn test_no_limit_never_terminates() {
        let config = PushClientConfig {
            abort_on_sequential_error_count: None,
            ..Default::default()
        };
        let shared = test_shared(config);
        for _ in 0..50 {
            assert!(shared.try_increment_error_count(ErrorKind::Connection));
        }
        assert_eq!(shared.run_state(), RunState::Created);
    }

    #[test]
    fn test_warn_budget() {
        let config = PushClientConfig {
            log_warn_limit: Some(2),
            ..Default::default()
        };
        let shared = test_shared(config);
        assert!(shared.warn_budget("key-a"));
        assert!(shared.warn_budget("key-a"));
        assert!(!shared.warn_budget("key-a"));
        // Budgets are per key.
        assert!(shared.warn_budget("key-b"));

        let silent = test_shared(PushClientConfig {
            log_warn_limit: None,
            ..Default::default()
        });
        assert!(!silent.warn_budget("key-a"));
    }

    #[test]
    fn test_take_unreported_stream_id() {
        let shared = test_shared(PushClientConfig::default());
        shared.state_guard().input_stream_id = 5;

        assert_eq!(shared.take_unreported_stream_id(), Some(5));
        assert_eq!(shared.take_unreported_stream_id(), None);

        shared.state_guard().input_stream_id = 6;
        assert_eq!(shared.take_unreported_stream_id(), Some(6));
    }

    #[tokio::test]
    async fn test_handled_message_resets_transport_counters() {
        let shared = test_shared(PushClientConfig::default());
        shared.try_increment_error_count(ErrorKind::Connection);
        shared.try_increment_error_count(ErrorKind::Read);

        shared
            .handle_message(McsMessage::HeartbeatAck(HeartbeatAck::default()))
            .await
            .unwrap();

        assert_eq!(shared.error_count(ErrorKind::Connection), 0);
        assert_eq!(shared.error_count(ErrorKind::Read), 0);
        assert_eq!(shared.state_guard().input_stream_id, 1);
        assert!(shared.last_message_age().is_some());
    }

    #[tokio::test]
    async fn test_close_message_counts_without_reset_of_counters() {
        let shared = test_shared(PushClientConfig::default());
        shared
            .handle_message(McsMessage::Close(crate::wire::Close {}))
            .await
            .unwrap();
        // The connection counter survives the handler; a fall-through reset
        // would have cleared it.
        assert_eq!(shared.error_count(ErrorKind::Connection), 1);
        assert_eq!(shared.state_guard().input_stream_id, 1);
    }

    #[tokio::test]
    async fn test_login_response_success() {
        let shared = test_shared(PushClientConfig::default());
        shared
            .state_guard()
            .persistent_ids
            .extend(["a".to_string(), "b".to_string()]);
        shared.try_increment_error_count(ErrorKind::Login);

        shared
            .handle_message(McsMessage::LoginResponse(LoginResponse {
                id: "1".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap();

        assert_eq!(shared.run_state(), RunState::Started);
        assert_eq!(shared.error_count(ErrorKind::Login), 0);
        assert!(shared.pending_persistent_ids().is_empty());
    }

    #[tokio::test]
    async fn test_login_response_error() {
        let shared = test_shared(PushClientConfig::default());
        shared
            .handle_message(McsMessage::LoginResponse(LoginResponse {
                error: Some(ErrorInfo {
                    code: 401,
                    message: Some("bad token".to_string()),
                }),
                ..Default::default()
            }))
            .await
            .unwrap();

        assert_ne!(shared.run_state(), RunState::Started);
        assert_eq!(shared.error_count(ErrorKind::Login), 1);
    }

    #[tokio::test]
    async fn test_data_message_dispatches_notification() {
        let config = PushClientConfig {
            // No writer is installed in this test, so keep acks off.
            send_selective_acknowledgements: false,
            ..Default::default()
        };
        let shared = test_shared(config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.set_dispatch(tx);

        shared
            .handle_message(McsMessage::DataMessage(Box::new(encrypted_message(
                "0:1%aa",
            ))))
            .await
            .unwrap();

        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.persistent_id, "0:1%aa");
        assert_eq!(shared.pending_persistent_ids(), vec!["0:1%aa"]);
        assert_eq!(shared.error_count(ErrorKind::Read), 0);
    }

    #[tokio::test]
    async fn test_undecryptable_message_skipped() {
        let shared = test_shared(PushClientConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.set_dispatch(tx);

        // No crypto attributes at all.
        let message = DataMessageStanza {
            persistent_id: "0:2%bb".to_string(),
            raw_data: b"opaque".to_vec(),
            ..Default::default()
        };
        shared
            .handle_message(McsMessage::DataMessage(Box::new(message)))
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert!(shared.pending_persistent_ids().is_empty());
        // Counted as a read failure and not cleared by the fall-through.
        assert_eq!(shared.error_count(ErrorKind::Read), 1);
    }

    #[tokio::test]
    async fn test_app_id_mismatch_consumes_warn_budget() {
        let config = PushClientConfig {
            send_selective_acknowledgements: false,
            ..Default::default()
        };
        let shared = test_shared(config);
        shared.set_app_id("org.example.app");
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.set_dispatch(tx);

        let mut message = encrypted_message("0:3%cc");
        message.app_data.push(AppData {
            key: "subtype".to_string(),
            value: "org.other.app".to_string(),
        });
        shared
            .handle_message(McsMessage::DataMessage(Box::new(message)))
            .await
            .unwrap();

        // Flagged, but still delivered.
        assert_eq!(
            shared.state_guard().warn_counts.get("app-id-mismatch"),
            Some(&1)
        );
        assert_eq!(rx.try_recv().unwrap().persistent_id, "0:3%cc");
    }

    #[tokio::test]
    async fn test_unsupported_tag_skips_stream_id() {
        let shared = test_shared(PushClientConfig::default());
        shared
            .handle_frame(RawFrame {
                tag: 9,
                payload: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(shared.state_guard().input_stream_id, 0);

        let err = shared
            .handle_frame(RawFrame {
                tag: 42,
                payload: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PushError::UnknownTag(42)));
    }

    #[tokio::test]
    async fn test_reset_noop_when_not_listening() {
        let shared = test_shared(PushClientConfig::default());
        // Never started; a reset must not try to dial anything.
        shared.reset().await.unwrap();
        assert_eq!(shared.run_state(), RunState::Created);
    }

    #[tokio::test]
    async fn test_reset_spaced_from_last_login() {
        let config = PushClientConfig {
            reset_interval_secs: 0.6,
            connection_retry_count: 1,
            retry_base_delay_secs: 0.0,
            ..Default::default()
        };
        let shared = test_shared(config);
        shared.listening.send_replace(true);
        // Last login 300ms ago; the reset owes the remaining ~300ms before
        // it may touch the connection.
        shared.state_guard().last_login = Some(Instant::now() - Duration::from_millis(300));

        let started = Instant::now();
        // The dial after the wait fails; only the spacing matters here.
        let _ = shared.reset().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "waited {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(600), "waited {:?}", elapsed);
    }

    #[test]
    fn test_terminate_idempotent() {
        let shared = test_shared(PushClientConfig::default());
        shared.listening.send_replace(true);
        shared.terminate();
        shared.terminate();
        assert_eq!(shared.run_state(), RunState::Stopping);
        assert!(!shared.is_listening());
    }

    #[tokio::test]
    async fn test_stop_from_created_reaches_stopped() {
        let shared = test_shared(PushClientConfig::default());
        shared.stop().await;
        assert_eq!(shared.run_state(), RunState::Stopped);
        shared.stop().await;
        assert_eq!(shared.run_state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_completes_while_write_is_stalled() {
        let shared = test_shared(PushClientConfig::default());
        // Tiny pipe the peer never drains, so the send below parks mid-write
        // while holding the writer lock.
        let (local, _remote) = tokio::io::duplex(64);
        shared
            .install_connection(Connection::from_stream(Box::new(local)))
            .await;

        let writer = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move {
                let message = McsMessage::DataMessage(Box::new(DataMessageStanza {
                    raw_data: vec![0u8; 512],
                    ..Default::default()
                }));
                let _ = shared.send_message(&message).await;
            }
        });
        shared.register_tasks(vec![writer.abort_handle()]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        tokio::time::timeout(Duration::from_secs(5), shared.stop())
            .await
            .expect("stop must not wait on the stalled write");
        assert_eq!(shared.run_state(), RunState::Stopped);
    }
}
