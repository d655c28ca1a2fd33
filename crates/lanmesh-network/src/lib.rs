//! LanMesh Network Layer
//!
//! Network primitives for the overlay:
//! - Platform TUN adapters behind one async trait
//! - The abstract peer-message transport the host supplies
//! - The adaptive inbound message pump
//! - In-memory transport and TUN doubles for tests and simulation

pub mod error;
pub mod memory;
pub mod pump;
pub mod transport;
pub mod tun;

pub use error::{NetworkError, NetworkResult};
pub use memory::{LoopbackTun, MemoryHub, MemoryTransport};
pub use pump::{InboundHandler, MessagePump};
pub use transport::{Datagram, Delivery, LinkKind, PeerDirectory, SessionEvent, Transport};
pub use tun::{create_tun, TunDevice};
