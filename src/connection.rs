//! Connection establishment.
//!
//! The MCS endpoint speaks TLS on a long-lived TCP connection. Dialing is
//! abstracted behind [`Connector`] so tests and local brokers can swap in a
//! plaintext transport; the production path is [`TlsConnector`] with the
//! webpki root store. [`connect_with_retry`] wraps a connector in the
//! quadratic-backoff retry policy used for both the initial connect and
//! every reconnect.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::config::PushClientConfig;
use crate::error::{PushError, Result};
use crate::wire::{framer_pair, FrameReader, FrameWriter};

/// Byte stream usable as an MCS transport.
pub trait McsStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> McsStream for T {}

/// An established transport, type-erased over TLS or plain TCP.
pub type BoxedStream = Box<dyn McsStream>;

pub(crate) type McsReader = FrameReader<ReadHalf<BoxedStream>>;
pub(crate) type McsWriter = FrameWriter<WriteHalf<BoxedStream>>;

/// Dials the MCS endpoint.
pub trait Connector: Send + Sync {
    /// Open a fresh transport to the endpoint.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<BoxedStream>> + Send + '_>>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}

/// TLS connector using the bundled webpki roots.
pub struct TlsConnector {
    host: String,
    port: u16,
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Build a connector for `host:port` trusting the webpki root set.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            host: host.into(),
            port,
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Connector for TlsConnector {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<BoxedStream>> + Send + '_>> {
        Box::pin(async move {
            let endpoint = self.endpoint();
            let tcp = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|e| PushError::Connection(format!("{}: {}", endpoint, e)))?;
            let server_name = ServerName::try_from(self.host.clone())
                .map_err(|e| PushError::Connection(format!("Invalid host {}: {}", self.host, e)))?;
            let tls = self
                .inner
                .connect(server_name, tcp)
                .await
                .map_err(|e| {
                    PushError::Connection(format!("TLS handshake with {}: {}", endpoint, e))
                })?;
            Ok(Box::new(tls) as BoxedStream)
        })
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Plaintext TCP connector, for tests and local brokers.
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    /// Build a connector for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<BoxedStream>> + Send + '_>> {
        Box::pin(async move {
            let tcp = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|e| PushError::Connection(format!("{}: {}", self.endpoint(), e)))?;
            Ok(Box::new(tcp) as BoxedStream)
        })
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A live connection split into framed halves, plus the close signal that
/// wakes an in-flight read when the session tears the link down.
pub(crate) struct Connection {
    pub(crate) reader: McsReader,
    pub(crate) writer: McsWriter,
    pub(crate) closed_tx: watch::Sender<bool>,
    pub(crate) closed_rx: watch::Receiver<bool>,
}

impl Connection {
    pub(crate) fn from_stream(stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (reader, writer) = framer_pair(read_half, write_half);
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            reader,
            writer,
            closed_tx,
            closed_rx,
        }
    }
}

/// Dial with the configured retry policy.
///
/// The delay after attempt `n` is `retry_base_delay * n^2`. The `listening`
/// watch aborts the cycle early when the client is being stopped, including
/// mid-backoff.
pub(crate) async fn connect_with_retry(
    connector: &dyn Connector,
    config: &PushClientConfig,
    listening: &mut watch::Receiver<bool>,
) -> Result<Connection> {
    let mut last_err = PushError::Connection("no attempts made".to_string());

    for attempt in 1..=config.connection_retry_count {
        if !*listening.borrow() {
            return Err(PushError::Connection(
                "connect aborted by stop".to_string(),
            ));
        }

        tracing::debug!(
            "Connecting to {} (attempt {}/{})",
            connector.endpoint(),
            attempt,
            config.connection_retry_count
        );
        match connector.connect().await {
            Ok(stream) => {
                tracing::info!("Connected to MCS endpoint {}", connector.endpoint());
                return Ok(Connection::from_stream(stream));
            }
            Err(err) => {
                tracing::warn!("Connection attempt {} failed: {}", attempt, err);
                last_err = err;
            }
        }

        if attempt < config.connection_retry_count {
            let delay = backoff_delay(config.retry_base_delay(), attempt);
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                changed = listening.changed() => {
                    if changed.is_err() || !*listening.borrow() {
                        return Err(PushError::Connection(
                            "connect aborted by stop".to_string(),
                        ));
                    }
                }
            }
        }
    }

    tracing::error!(
        "Unable to connect to {} after {} tries",
        connector.endpoint(),
        config.connection_retry_count
    );
    Err(last_err)
}

/// Quadratic backoff delay; the square saturates at `u32::MAX`.
fn backoff_delay(base: std::time::Duration, attempt: u32) -> std::time::Duration {
    base * attempt.saturating_mul(attempt)
}
