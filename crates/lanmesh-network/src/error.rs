//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN device error
    #[error("TUN device error: {0}")]
    Tun(String),

    /// Packet exceeds the device MTU
    #[error("Packet too large: {size} bytes (MTU {mtu})")]
    PacketTooLarge { size: usize, mtu: u16 },

    /// Transport send/receive error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer has left the lobby or was never a member
    #[error("Unknown peer: {0}")]
    UnknownPeer(u64),

    /// Component is not running
    #[error("Not running")]
    NotRunning,

    /// Platform not supported
    #[error("Platform not supported for this operation")]
    PlatformNotSupported,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
