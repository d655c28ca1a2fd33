//! LanMesh Core
//!
//! Implements the overlay's control and data planes:
//! - Distributed IP self-assignment with collision arbitration
//! - Virtual-IP routing table with relay forwarding
//! - Heartbeat leases with expiry sweeping
//! - The VPN bridge tying TUN, transport, and protocol together

pub mod bridge;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod negotiator;
pub mod routes;

pub use bridge::{VpnBridge, VpnStats};
pub use config::{TimingConfig, VpnConfig};
pub use error::{CoreError, CoreResult};
pub use heartbeat::{HeartbeatManager, HeartbeatSink, NodeEntry};
pub use negotiator::{ConflictInfo, IpNegotiator, NegotiationState, NegotiatorSink};
pub use routes::{RouteEntry, RouteTable};
