use std::net::SocketAddr;

use twinlock_proto::{RpcError, WireError};

/// Failures surfaced by lock handles, the link manager and the server engine.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The link carrying the request went away. Always safe to retry.
    #[error("link aborted: {0}")]
    Aborted(String),
    /// The request outlived its deadline.
    #[error("timed out waiting for lock")]
    Timeout,
    /// The peer sent bytes that cannot be decoded; the connection is dropped.
    #[error("protocol error: {0}")]
    Protocol(WireError),
    /// Misuse: exit by a non-owner, reentrancy overflow, bad timeout.
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("{0} is not a private or loopback IPv4 address")]
    NonPrivateAddress(SocketAddr),
}

impl LockError {
    pub fn aborted(reason: impl Into<String>) -> Self {
        LockError::Aborted(reason.into())
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        LockError::InvalidState(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Aborted(_) | LockError::Timeout)
    }
}

impl From<WireError> for LockError {
    fn from(err: WireError) -> Self {
        if err.is_corruption() {
            LockError::Protocol(err)
        } else {
            LockError::Aborted(err.to_string())
        }
    }
}

impl From<RpcError> for LockError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Wire(err) => err.into(),
            dup @ RpcError::DuplicateSequence(_) => LockError::InvalidState(dup.to_string()),
        }
    }
}

impl From<std::io::Error> for LockError {
    fn from(err: std::io::Error) -> Self {
        LockError::Aborted(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_errors_are_aborts_and_bad_bytes_are_protocol() {
        let io = WireError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(LockError::from(io), LockError::Aborted(_)));
        assert!(matches!(
            LockError::from(WireError::BadHeaderKey(1)),
            LockError::Protocol(_)
        ));
        assert!(LockError::Timeout.is_retryable());
        assert!(!LockError::invalid_state("x").is_retryable());
    }
}
