//! LanMesh Overlay Protocol
//!
//! Shared primitives for the lobby-scoped mesh VPN:
//! - Wire message framing and control payload codecs
//! - Node identity derivation and total ordering
//! - IPv4 subnet arithmetic and packet header helpers

pub mod error;
pub mod ip;
pub mod message;
pub mod node_id;

pub use error::{ProtoError, ProtoResult};
pub use message::{
    AddressAnnounce, ControlMessage, ForcedRelease, Heartbeat, MessageType, ProbeRequest,
    ProbeResponse, RouteTuple, HEADER_SIZE,
};
pub use node_id::{NodeId, PeerId};

/// Protocol constants
pub mod constants {
    /// Node ID size (SHA-256 output = 32 bytes = 256 bits)
    pub const NODE_ID_SIZE: usize = 32;

    /// Default salt mixed into node ID derivation. Identities are only
    /// comparable between peers built with the same salt.
    pub const APP_SECRET_SALT: &str = "ConnectTool_VPN_Salt_v1";

    /// Payload budget of the transport's unreliable channel
    pub const UNRELIABLE_MSG_SIZE_LIMIT: usize = 1200;

    /// Per-datagram overhead: frame header (3 bytes) + sender node ID (32 bytes)
    pub const MESSAGE_OVERHEAD: usize = 35;

    /// Fallback TUN MTU when the transport cannot report its budget
    pub const RECOMMENDED_MTU: u16 = 1100;

    /// Lower clamp for the derived TUN MTU
    pub const MIN_TUN_MTU: u16 = 576;

    /// Upper clamp for the derived TUN MTU
    pub const MAX_TUN_MTU: u16 = 1500;

    /// Probe tie-break window
    pub const PROBE_TIMEOUT_MS: u64 = 500;

    /// Interval between liveness heartbeats
    pub const HEARTBEAT_INTERVAL_MS: u64 = 60_000;

    /// Lease grace value (configurable, no data-path behavior)
    pub const LEASE_TIME_MS: u64 = 120_000;

    /// Age after which a silent node's address lease is evicted
    pub const LEASE_EXPIRY_MS: u64 = 360_000;

    /// Age after which a conflict reporter's heartbeat is considered stale
    pub const HEARTBEAT_EXPIRY_MS: u64 = 180_000;

    /// Default virtual subnet
    pub const DEFAULT_SUBNET: &str = "10.0.0.0";

    /// Default subnet mask
    pub const DEFAULT_NETMASK: &str = "255.255.255.0";
}
