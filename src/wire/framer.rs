//! Frame encoding and decoding for the MCS stream.
//!
//! Wire format:
//!
//! ```text
//! +---------+-----+----------------+---------------------+
//! | version | tag | length         | payload             |
//! | 1 byte  | 1B  | varint         | `length` bytes      |
//! +---------+-----+----------------+---------------------+
//! ```
//!
//! The version byte appears exactly once per connection in each direction,
//! ahead of the first frame. [`FrameReader`] and [`FrameWriter`] share a
//! per-connection flag tracking that handshake: the writer prepends the
//! version while the flag is set, and a successful first read clears it.
//! The login exchange is the only traffic before the first inbound frame,
//! so the writer never observes a stale flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PushError, Result};
use crate::wire::varint::{read_varint, varint_size, write_varint_vec};
use crate::wire::{McsMessage, MAX_PAYLOAD_LEN, MCS_LEGACY_VERSION, MCS_VERSION};

/// A tag byte and raw payload lifted off the stream, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Message tag byte.
    pub tag: u8,
    /// Undecoded payload bytes.
    pub payload: Vec<u8>,
}

/// Read one frame from the stream.
///
/// With `expect_version` the frame must be preceded by a protocol version
/// byte. Versions older than [`MCS_VERSION`] are rejected, except the legacy
/// [`MCS_LEGACY_VERSION`] which some servers still announce.
pub async fn read_frame<R>(reader: &mut R, expect_version: bool) -> Result<RawFrame>
where
    R: AsyncRead + Unpin,
{
    let tag = if expect_version {
        let mut header = [0u8; 2];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|e| map_read_err(e, "version header"))?;
        let version = header[0];
        if version < MCS_VERSION && version != MCS_LEGACY_VERSION {
            return Err(PushError::UnsupportedVersion(version));
        }
        header[1]
    } else {
        reader
            .read_u8()
            .await
            .map_err(|e| map_read_err(e, "message tag"))?
    };

    let length = read_varint(reader).await?;
    if length > MAX_PAYLOAD_LEN as u64 {
        return Err(PushError::InvalidLength(length));
    }

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| map_read_err(e, "message payload"))?;

    Ok(RawFrame { tag, payload })
}

/// Write one frame to the stream as a single contiguous write.
pub async fn write_frame<W>(
    writer: &mut W,
    tag: u8,
    payload: &[u8],
    include_version: bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(2 + varint_size(payload.len() as u64) + payload.len());
    if include_version {
        buf.push(MCS_VERSION);
    }
    buf.push(tag);
    write_varint_vec(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

fn map_read_err(err: std::io::Error, context: &str) -> PushError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => PushError::TruncatedStream(context.to_string()),
        _ => PushError::Io(err),
    }
}

/// Reading half of a framed connection.
pub struct FrameReader<R> {
    inner: R,
    first_message: Arc<AtomicBool>,
}

/// Writing half of a framed connection.
pub struct FrameWriter<W> {
    inner: W,
    first_message: Arc<AtomicBool>,
}

/// Wrap a stream's halves into a framer pair sharing one first-message flag.
pub fn framer_pair<R, W>(reader: R, writer: W) -> (FrameReader<R>, FrameWriter<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let first_message = Arc::new(AtomicBool::new(true));
    (
        FrameReader {
            inner: reader,
            first_message: Arc::clone(&first_message),
        },
        FrameWriter {
            inner: writer,
            first_message,
        },
    )
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read the next frame, consuming the version byte if this is the first
    /// read on the connection. The flag only clears on success so a failed
    /// handshake read stays diagnosable.
    pub async fn read_frame(&mut self) -> Result<RawFrame> {
        let expect_version = self.first_message.load(Ordering::Acquire);
        let frame = read_frame(&mut self.inner, expect_version).await?;
        if expect_version {
            self.first_message.store(false, Ordering::Release);
        }
        Ok(frame)
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Write a raw frame, prepending the version byte while the connection
    /// handshake is still outstanding.
    pub async fn write_frame(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        let include_version = self.first_message.load(Ordering::Acquire);
        write_frame(&mut self.inner, tag, payload, include_version).await
    }

    /// Encode and write a protocol message.
    pub async fn write_message(&mut self, message: &McsMessage) -> Result<()> {
        let payload = message.encode_payload()?;
        self.write_frame(message.tag() as u8, &payload).await
    }

    /// Shut down the underlying stream.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MessageTag;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_frame_with_version() {
        let mut wire = vec![MCS_VERSION, MessageTag::LoginResponse as u8, 2];
        wire.extend_from_slice(b"{}");
        let mut cursor = Cursor::new(wire);

        let frame = read_frame(&mut cursor, true).await.unwrap();
        assert_eq!(frame.tag, MessageTag::LoginResponse as u8);
        assert_eq!(frame.payload, b"{}");
    }

    #[tokio::test]
    async fn test_read_frame_without_version() {
        let wire = vec![MessageTag::HeartbeatAck as u8, 0];
        let mut cursor = Cursor::new(wire);

        let frame = read_frame(&mut cursor, false).await.unwrap();
        assert_eq!(frame.tag, MessageTag::HeartbeatAck as u8);
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_old_version() {
        let wire = vec![12u8, 0, 0];
        let mut cursor = Cursor::new(wire);

        let err = read_frame(&mut cursor, true).await.unwrap_err();
        assert!(matches!(err, PushError::UnsupportedVersion(12)));
    }

    #[tokio::test]
    async fn test_accepts_legacy_version() {
        let wire = vec![MCS_LEGACY_VERSION, 0, 0];
        let mut cursor = Cursor::new(wire);

        let frame = read_frame(&mut cursor, true).await.unwrap();
        assert_eq!(frame.tag, 0);
    }

    #[tokio::test]
    async fn test_rejects_oversized_payload() {
        let mut wire = vec![MessageTag::DataMessageStanza as u8];
        write_varint_vec(&mut wire, MAX_PAYLOAD_LEN as u64 + 1);
        let mut cursor = Cursor::new(wire);

        let err = read_frame(&mut cursor, false).await.unwrap_err();
        assert!(matches!(err, PushError::InvalidLength(_)));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        // Length prefix claims four bytes but only two follow.
        let wire = vec![MessageTag::DataMessageStanza as u8, 4, 0xAA, 0xBB];
        let mut cursor = Cursor::new(wire);

        let err = read_frame(&mut cursor, false).await.unwrap_err();
        assert!(matches!(err, PushError::TruncatedStream(_)));
    }

    #[tokio::test]
    async fn test_write_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, 7, b"abc", true).await.unwrap();
        assert_eq!(buf, vec![MCS_VERSION, 7, 3, b'a', b'b', b'c']);

        buf.clear();
        write_frame(&mut buf, 7, b"abc", false).await.unwrap();
        assert_eq!(buf, vec![7, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn test_frame_roundtrip_both_forms() {
        let payload = vec![0x55u8; 300];
        for include_version in [true, false] {
            let mut buf = Vec::new();
            write_frame(&mut buf, 8, &payload, include_version)
                .await
                .unwrap();
            let mut cursor = Cursor::new(buf);
            let frame = read_frame(&mut cursor, include_version).await.unwrap();
            assert_eq!(frame.tag, 8);
            assert_eq!(frame.payload, payload);
        }
    }

    #[tokio::test]
    async fn test_first_message_flag_lifecycle() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let (mut reader, mut writer) = framer_pair(client_read, client_write);

        // First outbound frame carries the version byte.
        writer.write_frame(2, b"login").await.unwrap();
        let mut raw = [0u8; 8];
        server_read.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw[0], MCS_VERSION);
        assert_eq!(raw[1], 2);
        assert_eq!(raw[2], 5);

        // Server answers with its own version byte; the read clears the flag.
        write_frame(&mut server_write, 3, b"ok", true).await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.tag, 3);
        assert_eq!(frame.payload, b"ok");

        // Second outbound frame is bare.
        writer.write_frame(1, b"").await.unwrap();
        let mut raw = [0u8; 2];
        server_read.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [1u8, 0]);

        // Second inbound frame is read without a version byte.
        write_frame(&mut server_write, 0, b"", false).await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.tag, 0);
    }
}
