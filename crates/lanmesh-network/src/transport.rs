//! Peer-message transport abstraction
//!
//! The overlay never opens sockets itself. The host supplies an
//! implementation of [`Transport`] backed by its P2P messaging service
//! (relay network plus NAT-traversed direct links) and a [`PeerDirectory`]
//! for display names. Lobby membership is the trust boundary: the member
//! set is whatever the host's lobby service currently reports.

use std::collections::HashSet;

use async_trait::async_trait;
use bytes::Bytes;

use lanmesh_proto::PeerId;

use crate::error::NetworkResult;

/// Delivery class for an outgoing message.
///
/// Reliable delivery is ordered per sender and must opportunistically
/// re-establish a broken session. Unreliable delivery is best-effort with
/// no-delay semantics; the data plane runs on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Reliable,
    Unreliable,
}

/// How a peer link is currently carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// NAT-traversed direct connection
    Direct,
    /// Via the transport's relay network
    Relayed,
}

/// A datagram received from the transport
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Sending peer
    pub from: PeerId,
    /// Opaque message bytes
    pub data: Bytes,
}

/// Session lifecycle notifications surfaced by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A peer wants to open a session with us
    Request(PeerId),
    /// An established session broke down
    Failed(PeerId),
}

/// Host-provided peer-to-peer message transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send bytes to one peer.
    async fn send_to(&self, peer: PeerId, data: Bytes, delivery: Delivery) -> NetworkResult<()>;

    /// Send the same bytes to every current lobby member except self.
    async fn broadcast(&self, data: Bytes, delivery: Delivery) -> NetworkResult<()>;

    /// Drain up to `max_batch` datagrams that arrived since the last poll.
    /// Never blocks.
    async fn poll_inbound(&self, max_batch: usize) -> Vec<Datagram>;

    /// Drain pending session events. Never blocks.
    async fn poll_session_events(&self) -> Vec<SessionEvent>;

    /// Accept an inbound session request.
    async fn accept_session(&self, peer: PeerId) -> NetworkResult<()>;

    /// Open (or re-open) a session toward a peer.
    async fn open_session(&self, peer: PeerId) -> NetworkResult<()>;

    /// Whether a session with the peer is currently established.
    async fn is_connected(&self, peer: PeerId) -> bool;

    /// Round-trip estimate to the peer, if connected.
    async fn ping_ms(&self, peer: PeerId) -> Option<u32>;

    /// Link class to the peer, if connected.
    async fn link_kind(&self, peer: PeerId) -> Option<LinkKind>;

    /// Current lobby member set, including self.
    async fn members(&self) -> HashSet<PeerId>;

    /// Payload budget of the unreliable channel, in bytes.
    fn unreliable_payload_limit(&self) -> usize;
}

/// Display-name lookup for peers. The only directory dependency the
/// overlay has.
pub trait PeerDirectory: Send + Sync {
    fn name_of(&self, peer: PeerId) -> String;
}
