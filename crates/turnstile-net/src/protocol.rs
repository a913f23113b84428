//! Gateway wire protocol: text tokens plus the one binary ticket frame.
//!
//! Every message except the ticket is plain UTF-8 text, matched by content.
//! The ticket travels as a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   ticket blob      |
//! | u32 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix itself and must be non-zero. The
//! transport already delivers whole messages, so the declared length has to
//! match the remaining bytes exactly.

/// Server → client: handshake cue, the client must answer with its ticket.
pub const WELCOME_SEND_AUTH_TICKET: &str = "WELCOME_SEND_AUTH_TICKET";
/// Server → client: the ticket validated, the session is usable.
pub const AUTH_SUCCESSFUL_WELCOME_PLAYER: &str = "AUTH_SUCCESSFUL_WELCOME_PLAYER";
/// Server → client: the ticket was rejected, the connection will close.
pub const AUTH_FAILED_VALIDATION: &str = "AUTH_FAILED_VALIDATION";
/// Server → client: reply to [`HELLO_SERVER`].
pub const SERVER_SAYS_HI_CLIENT: &str = "SERVER_SAYS_HI_CLIENT";
/// Client → server: application greeting.
pub const HELLO_SERVER: &str = "HELLO_SERVER";
/// Client → server: liveness marker.
pub const PING: &str = "PING";
/// Prefix the client uses to recognize the handshake cue.
pub const WELCOME_PREFIX: &str = "WELCOME";
/// Suffix appended to the success notice when the ticket owner differs.
pub const OWNER_MISMATCH_CAVEAT: &str = " (owner mismatch noted)";

/// Size of the ticket length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Reasons a ticket frame is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedFrame {
    /// Not even one byte of ticket after the prefix.
    #[error("frame of {len} bytes is too short to carry a ticket")]
    TooShort {
        /// Total message length.
        len: usize,
    },
    /// The prefix declares an empty ticket.
    #[error("frame declares a zero-length ticket")]
    ZeroLength,
    /// The prefix disagrees with the bytes that follow it.
    #[error("frame declares {declared} ticket bytes but carries {actual}")]
    LengthMismatch {
        /// Length read from the prefix.
        declared: u32,
        /// Bytes actually following the prefix.
        actual: usize,
    },
    /// The ticket is too large for a 32-bit length prefix.
    #[error("ticket of {len} bytes does not fit a 32-bit length prefix")]
    TooLarge {
        /// Ticket length.
        len: usize,
    },
}

/// Encode a ticket blob as `[u32 BE length][ticket]`.
pub fn encode_ticket_message(ticket: &[u8]) -> Result<Vec<u8>, MalformedFrame> {
    let len = u32::try_from(ticket.len())
        .map_err(|_| MalformedFrame::TooLarge { len: ticket.len() })?;

    let mut message = Vec::with_capacity(LENGTH_PREFIX_SIZE + ticket.len());
    message.extend_from_slice(&len.to_be_bytes());
    message.extend_from_slice(ticket);
    Ok(message)
}

/// Decode a ticket frame, returning the ticket bytes.
pub fn decode_ticket_message(message: &[u8]) -> Result<&[u8], MalformedFrame> {
    if message.len() <= LENGTH_PREFIX_SIZE {
        return Err(MalformedFrame::TooShort { len: message.len() });
    }

    let (prefix, ticket) = message.split_at(LENGTH_PREFIX_SIZE);
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);

    if declared == 0 {
        return Err(MalformedFrame::ZeroLength);
    }
    if declared as usize != ticket.len() {
        return Err(MalformedFrame::LengthMismatch {
            declared,
            actual: ticket.len(),
        });
    }

    Ok(ticket)
}
