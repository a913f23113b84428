//! Length-prefixed framing for TCP streams.
//!
//! The TCP transports carry whole messages as frames:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes. A length of 0 is an
//! empty message. The first frame a client sends is the transport hello
//! (`IDENTITY <u64>`), which asserts the remote identity before any gateway
//! traffic.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::identity::Identity;

/// Prefix of the transport hello frame.
pub const HELLO_PREFIX: &str = "IDENTITY ";

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 64 KiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 65_536,
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

async fn fill<R: AsyncReadExt + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::ConnectionClosed),
        Err(e) => Err(FrameError::Io(e)),
    }
}

/// Read one frame. EOF anywhere inside the frame is [`FrameError::ConnectionClosed`].
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0u8; 4];
    fill(reader, &mut prefix).await?;

    let declared = u32::from_be_bytes(prefix);
    if declared > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: declared as usize,
            max: config.max_payload_size,
        });
    }

    let mut payload = vec![0u8; declared as usize];
    fill(reader, &mut payload).await?;
    Ok(payload)
}

/// Write one frame and flush. Oversized payloads are refused before any
/// byte reaches the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    let len = match u32::try_from(payload.len()) {
        Ok(len) if len <= config.max_payload_size => len,
        _ => {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: config.max_payload_size,
            });
        }
    };

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Build the transport hello for `identity`.
pub fn encode_hello(identity: Identity) -> Vec<u8> {
    format!("{HELLO_PREFIX}{}", identity.0).into_bytes()
}

/// Parse a transport hello. Returns `None` for anything malformed or invalid.
pub fn parse_hello(frame: &[u8]) -> Option<Identity> {
    std::str::from_utf8(frame)
        .ok()?
        .strip_prefix(HELLO_PREFIX)?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Identity)
        .and_then(Identity::valid)
}
