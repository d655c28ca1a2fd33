//! Protocol error types

use thiserror::Error;

/// Wire codec errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Buffer shorter than the structure it should contain
    #[error("Truncated message: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// Unknown message-type tag
    #[error("Unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    /// Payload does not fit the 16-bit length field
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Route table payload is not a whole number of tuples
    #[error("Route payload length {0} is not a multiple of 12")]
    UnevenRoutePayload(usize),
}

/// Result type for codec operations
pub type ProtoResult<T> = Result<T, ProtoError>;
