use thiserror::Error;

use crate::message::MAX_MESSAGE_SIZE;

#[derive(Error, Debug)]
pub enum PrpcError {
    #[error("magic mismatch: {0:#06x}")]
    Magic(u16),

    #[error("version mismatch: {0:#04x}")]
    Version(u8),

    #[error("invalid total msg length: {0}")]
    InvalidLength(usize),

    #[error("message too large: {0} bytes (max {max} bytes)", max = MAX_MESSAGE_SIZE)]
    PayloadTooLarge(usize),

    #[error("unpack heartbeat to rpc")]
    UnpackHeartbeat,

    #[error("empty rpc payload")]
    EmptyPayload,

    #[error("response method mismatch: got {got}, expected {expected}")]
    MethodMismatch { got: String, expected: String },

    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("serialize type {0} not supported")]
    UnsupportedSerializer(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shut down")]
    Shutdown,

    #[error("connection closed by peer")]
    ClosedByPeer,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("call canceled")]
    Canceled,

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("no available rpc servers")]
    NoAvailableServers,

    #[error("specified index {0} not exist")]
    IndexNotFound(i64),

    #[error("circuit open: {0}")]
    CircuitOpen(String),

    #[error("max concurrency reached: {0}")]
    MaxConcurrency(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("registry error: {0}")]
    Registry(String),
}

impl PrpcError {
    /// Errors after which the connection that produced them is unusable.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            PrpcError::Shutdown
                | PrpcError::ClosedByPeer
                | PrpcError::Connection(_)
                | PrpcError::Io(_)
                | PrpcError::Magic(_)
                | PrpcError::Version(_)
                | PrpcError::InvalidLength(_)
        )
    }

    /// Errors worth another attempt by the service-level retry loop.
    ///
    /// Protocol, selection and breaker errors are final for the call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PrpcError::Shutdown
                | PrpcError::ClosedByPeer
                | PrpcError::Connection(_)
                | PrpcError::Io(_)
                | PrpcError::Timeout(_)
        )
    }

    /// Rejections issued by the circuit breaker without running the call.
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(self, PrpcError::CircuitOpen(_) | PrpcError::MaxConcurrency(_))
    }
}

pub type Result<T> = std::result::Result<T, PrpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PrpcError::ClosedByPeer.is_retryable());
        assert!(PrpcError::Timeout(100).is_retryable());
        assert!(!PrpcError::NoAvailableServers.is_retryable());
        assert!(!PrpcError::CircuitOpen("g.s.m".into()).is_retryable());
        assert!(!PrpcError::Remote("boom".into()).is_retryable());
    }

    #[test]
    fn test_breaker_rejection() {
        assert!(PrpcError::CircuitOpen("x".into()).is_breaker_rejection());
        assert!(PrpcError::MaxConcurrency("x".into()).is_breaker_rejection());
        assert!(!PrpcError::Timeout(5).is_breaker_rejection());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(PrpcError::Shutdown.to_string(), "shut down");
        assert_eq!(PrpcError::ClosedByPeer.to_string(), "connection closed by peer");
        assert_eq!(PrpcError::Magic(0x1234).to_string(), "magic mismatch: 0x1234");
        assert_eq!(
            PrpcError::PayloadTooLarge(70000).to_string(),
            "message too large: 70000 bytes (max 65535 bytes)"
        );
    }
}
