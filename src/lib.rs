//! # MCS Push - Persistent FCM/GCM Push Client
//!
//! Long-lived client for the MCS (Mobile Connection Server) push endpoint,
//! with automatic reconnection, heartbeat supervision, and decoupled
//! notification delivery.
//!
//! ## Features
//!
//! - **Persistent connection**: One TLS connection to `mtalk.google.com:5228`
//!   with quadratic backoff redial
//! - **Message acknowledgement**: Selective acks plus persistent id replay on
//!   reconnect, so no notification is lost between sessions
//! - **Heartbeat supervision**: Client pings and server interval tracking
//!   detect silent connection loss
//! - **Sequential error budget**: Independent failure counters abort the
//!   client instead of retrying forever
//! - **Isolated delivery**: Notifications are handed to the user callback on
//!   a separate task, so a slow or panicking handler never stalls the socket
//!
//! ## Protocol Overview
//!
//! MCS is a tagged binary protocol. After the TCP/TLS connect, each side
//! prefixes its very first message with a protocol version byte; every
//! message is a tag byte followed by a varint length and the payload.
//!
//! ```text
//! Client                                                 Server
//!    |                                                      |
//!    |-- [41][LoginRequest(android_id, token, acked ids)] ->|
//!    |<- [41][LoginResponse] -------------------------------|
//!    |                                                      |
//!    |<============ [DataMessageStanza] ====================|
//!    |-- [IqStanza(SelectiveAck)] ------------------------->|
//!    |                                                      |
//!    |-- [HeartbeatPing] ---------------------------------->|
//!    |<- [HeartbeatAck] ------------------------------------|
//! ```
//!
//! ### Frame Format
//!
//! | Field   | Size     | Notes                                     |
//! |---------|----------|-------------------------------------------|
//! | version | 1 byte   | Only on the first message per direction   |
//! | tag     | 1 byte   | Message type, see [`wire::MessageTag`]    |
//! | length  | varint   | Payload length, capped at 1 MiB           |
//! | payload | `length` | Encoded message                           |
//!
//! ### Client State Machine
//!
//! ```text
//!                 start()
//!   [Created] ──────────────> [StartingTasks]
//!                                   │
//!                                   v
//!              ┌────────> [StartingConnection]
//!              │                    │
//!              │                    v
//!        [Resetting]        [StartingLogin]
//!              ^                    │
//!              │                    v
//!              └── (failure) ── [Started]
//!
//!   any state ────> [Stopping] ────> [Stopped]
//!            terminate()      stop()
//! ```
//!
//! ## Quick Start
//!
//! ### Listening with stored credentials
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use mcs::{Credentials, Notification, PushClient, PushClientConfig};
//!
//! let credentials = Credentials::from_file("credentials.json")?;
//! let client = PushClient::new(PushClientConfig::default(), Arc::new(decryptor))
//!     .with_credentials(credentials)
//!     .on_credentials_updated(|creds| {
//!         let _ = creds.write_file("credentials.json");
//!     });
//!
//! client.start(|notification: Notification| {
//!     println!("received: {:?}", notification.payload);
//! })?;
//! ```
//!
//! ### Checking in first
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use mcs::{PushClient, PushClientConfig};
//!
//! let client = PushClient::new(PushClientConfig::default(), Arc::new(decryptor))
//!     .with_registrar(Arc::new(registrar));
//!
//! let token = client.check_in(sender_id, "org.example.app").await?;
//! println!("subscribe with FCM token {token}");
//! client.start(handler)?;
//! ```
//!
//! ### Running inside an existing runtime
//!
//! ```rust,ignore
//! client.start_with_runtime(
//!     Arc::new(handler),
//!     Some(tokio::runtime::Handle::current()),
//!     None,
//! )?;
//! // ...
//! client.stop().await;
//! ```
//!
//! ## Modules
//!
//! - [`client`]: The push client, its state machine and delivery pipeline
//! - [`wire`]: MCS framing, message types and the varint codec
//! - [`connection`]: TLS/TCP connectors and dial-with-retry
//! - [`crypto`]: Payload decryption seam and crypto header parsing
//! - [`credentials`]: Stored registration state
//! - [`registration`]: Check-in/registration seam
//! - [`config`]: Tuning knobs with TOML loading
//! - [`error`]: Error types and result alias

pub mod client;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod registration;
pub mod wire;

// Re-exports for convenience
pub use client::{
    Notification, NotificationHandler, NotificationPayload, PushClient, RunState,
};
pub use config::PushClientConfig;
pub use connection::{Connector, TcpConnector, TlsConnector};
pub use credentials::{Credentials, FcmCredentials, GcmCredentials, KeyBundle};
pub use crypto::{DecryptError, PayloadDecryptor};
pub use error::{PushError, Result};
pub use registration::Registrar;
pub use wire::{MCS_HOST, MCS_PORT, MCS_VERSION};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
