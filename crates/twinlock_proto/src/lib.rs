//! Wire protocol for twinlock.
//!
//! - `frame`: length-prefixed payloads over a byte stream.
//! - `message`: typed messages, the connection handshake and lock table snapshots.
//! - `rpc`: correlation of asynchronous replies with their calls.

pub mod frame;
pub mod message;
pub mod rpc;

pub use frame::{decode_frame, encode_frame, FrameCodec, HEADER_KEY, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use message::{
    decode_message, decode_snapshot, encode_message, encode_snapshot, Command, Handshake,
    LinkMode, LockInfo, Message, SequenceGenerator, INFINITE_TIMEOUT,
};
pub use rpc::{
    send_only, spawn_sweeper, FrameSink, LinkId, RpcError, RpcOutcome, RpcTable, SWEEP_INTERVAL,
};

/// Decoding and encoding failures. Every variant except `Io` means the peer
/// sent something that cannot be trusted and the connection must be dropped.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bad frame header key 0x{0:02x}")]
    BadHeaderKey(u8),
    #[error("negative frame length {0}")]
    NegativeLength(i32),
    #[error("frame of {0} bytes exceeds the payload limit")]
    FrameTooLarge(usize),
    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("unknown link mode {0}")]
    UnknownLinkMode(u8),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("string of {0} bytes does not fit an i16 length")]
    StringTooLong(usize),
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// True when the bytes themselves were bad, as opposed to the socket.
    pub fn is_corruption(&self) -> bool {
        !matches!(self, WireError::Io(_))
    }
}
