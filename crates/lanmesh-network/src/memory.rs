//! In-memory transport and TUN doubles
//!
//! A [`MemoryHub`] is a single-process lobby: each joined peer gets a
//! [`MemoryTransport`] whose datagrams travel through shared queues. A
//! [`LoopbackTun`] stands in for the kernel device. Both are used by the
//! integration tests and the simulated-lobby demo; neither touches the OS.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use lanmesh_proto::constants::UNRELIABLE_MSG_SIZE_LIMIT;
use lanmesh_proto::PeerId;

use crate::error::{NetworkError, NetworkResult};
use crate::transport::{Datagram, Delivery, LinkKind, PeerDirectory, SessionEvent, Transport};
use crate::tun::TunDevice;

struct PeerSlot {
    name: String,
    inbox: VecDeque<Datagram>,
    events: VecDeque<SessionEvent>,
}

struct HubInner {
    peers: HashMap<PeerId, PeerSlot>,
    sessions: HashSet<(PeerId, PeerId)>,
    partitions: HashSet<(PeerId, PeerId)>,
}

fn pair(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A single-process lobby shared by several [`MemoryTransport`]s
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                peers: HashMap::new(),
                sessions: HashSet::new(),
                partitions: HashSet::new(),
            })),
        }
    }

    /// Add a peer to the lobby and hand back its transport endpoint.
    pub fn join(&self, peer: PeerId, name: &str) -> MemoryTransport {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.insert(
            peer,
            PeerSlot {
                name: name.to_string(),
                inbox: VecDeque::new(),
                events: VecDeque::new(),
            },
        );
        MemoryTransport {
            hub: self.clone(),
            local: peer,
        }
    }

    /// Remove a peer from the lobby. Pending messages are discarded.
    pub fn part(&self, peer: PeerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.peers.remove(&peer);
        inner.sessions.retain(|&(a, b)| a != peer && b != peer);
    }

    /// Queue a session request at `to`, as though `from` knocked.
    pub fn raise_session_request(&self, to: PeerId, from: PeerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.peers.get_mut(&to) {
            slot.events.push_back(SessionEvent::Request(from));
        }
    }

    /// Break the session between two peers and notify `at`.
    pub fn fail_session(&self, at: PeerId, peer: PeerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(&pair(at, peer));
        if let Some(slot) = inner.peers.get_mut(&at) {
            slot.events.push_back(SessionEvent::Failed(peer));
        }
    }

    /// Drop unreliable traffic between two peers from now on.
    pub fn partition(&self, a: PeerId, b: PeerId) {
        self.inner.lock().unwrap().partitions.insert(pair(a, b));
    }

    /// Undo a [`partition`](Self::partition).
    pub fn heal(&self, a: PeerId, b: PeerId) {
        self.inner.lock().unwrap().partitions.remove(&pair(a, b));
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerDirectory for MemoryHub {
    fn name_of(&self, peer: PeerId) -> String {
        self.inner
            .lock()
            .unwrap()
            .peers
            .get(&peer)
            .map(|slot| slot.name.clone())
            .unwrap_or_else(|| format!("peer-{}", peer))
    }
}

/// One peer's endpoint into a [`MemoryHub`]
pub struct MemoryTransport {
    hub: MemoryHub,
    local: PeerId,
}

impl MemoryTransport {
    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    fn deliver(&self, inner: &mut HubInner, to: PeerId, data: &Bytes, delivery: Delivery) -> bool {
        if delivery == Delivery::Unreliable && inner.partitions.contains(&pair(self.local, to)) {
            return false;
        }
        match inner.peers.get_mut(&to) {
            Some(slot) => {
                slot.inbox.push_back(Datagram {
                    from: self.local,
                    data: data.clone(),
                });
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, peer: PeerId, data: Bytes, delivery: Delivery) -> NetworkResult<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        if !self.deliver(&mut inner, peer, &data, delivery) && delivery == Delivery::Reliable {
            return Err(NetworkError::UnknownPeer(peer.0));
        }
        Ok(())
    }

    async fn broadcast(&self, data: Bytes, delivery: Delivery) -> NetworkResult<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        let targets: Vec<PeerId> = inner
            .peers
            .keys()
            .copied()
            .filter(|&p| p != self.local)
            .collect();
        for peer in targets {
            self.deliver(&mut inner, peer, &data, delivery);
        }
        Ok(())
    }

    async fn poll_inbound(&self, max_batch: usize) -> Vec<Datagram> {
        let mut inner = self.hub.inner.lock().unwrap();
        match inner.peers.get_mut(&self.local) {
            Some(slot) => {
                let take = slot.inbox.len().min(max_batch);
                slot.inbox.drain(..take).collect()
            }
            None => Vec::new(),
        }
    }

    async fn poll_session_events(&self) -> Vec<SessionEvent> {
        let mut inner = self.hub.inner.lock().unwrap();
        match inner.peers.get_mut(&self.local) {
            Some(slot) => slot.events.drain(..).collect(),
            None => Vec::new(),
        }
    }

    async fn accept_session(&self, peer: PeerId) -> NetworkResult<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        inner.sessions.insert(pair(self.local, peer));
        Ok(())
    }

    async fn open_session(&self, peer: PeerId) -> NetworkResult<()> {
        let mut inner = self.hub.inner.lock().unwrap();
        if !inner.peers.contains_key(&peer) {
            return Err(NetworkError::UnknownPeer(peer.0));
        }
        inner.sessions.insert(pair(self.local, peer));
        Ok(())
    }

    async fn is_connected(&self, peer: PeerId) -> bool {
        self.hub
            .inner
            .lock()
            .unwrap()
            .sessions
            .contains(&pair(self.local, peer))
    }

    async fn ping_ms(&self, peer: PeerId) -> Option<u32> {
        if self.is_connected(peer).await {
            Some(1)
        } else {
            None
        }
    }

    async fn link_kind(&self, peer: PeerId) -> Option<LinkKind> {
        if self.is_connected(peer).await {
            Some(LinkKind::Direct)
        } else {
            None
        }
    }

    async fn members(&self) -> HashSet<PeerId> {
        self.hub.inner.lock().unwrap().peers.keys().copied().collect()
    }

    fn unreliable_payload_limit(&self) -> usize {
        UNRELIABLE_MSG_SIZE_LIMIT
    }
}

/// In-memory TUN double.
///
/// The test injects packets the overlay should read with
/// [`inject`](Self::inject) and observes what the overlay delivered with
/// [`next_written`](Self::next_written) / [`drain_written`](Self::drain_written).
pub struct LoopbackTun {
    name: String,
    mtu: u16,
    up: AtomicBool,
    address: Mutex<Option<(Ipv4Addr, Ipv4Addr)>>,
    inject_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inject_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    written_tx: mpsc::UnboundedSender<Bytes>,
    written_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl LoopbackTun {
    pub fn new(name: &str, mtu: u16) -> Arc<Self> {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.to_string(),
            mtu,
            up: AtomicBool::new(false),
            address: Mutex::new(None),
            inject_tx: Mutex::new(Some(inject_tx)),
            inject_rx: tokio::sync::Mutex::new(inject_rx),
            written_tx,
            written_rx: tokio::sync::Mutex::new(written_rx),
        })
    }

    /// Feed a packet into the device as though the OS produced it.
    pub fn inject(&self, packet: Bytes) {
        if let Some(tx) = self.inject_tx.lock().unwrap().as_ref() {
            let _ = tx.send(packet);
        }
    }

    /// Await the next packet the overlay wrote toward the OS.
    pub async fn next_written(&self) -> Option<Bytes> {
        self.written_rx.lock().await.recv().await
    }

    /// Drain packets the overlay wrote so far without waiting.
    pub async fn drain_written(&self) -> Vec<Bytes> {
        let mut rx = self.written_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            out.push(packet);
        }
        out
    }

    /// Address assigned via `set_ip`, if any.
    pub fn assigned_address(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        *self.address.lock().unwrap()
    }

    /// Whether `set_up(true)` has been called.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TunDevice for LoopbackTun {
    async fn read(&self) -> NetworkResult<Bytes> {
        let mut rx = self.inject_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| NetworkError::Tun("device closed".into()))
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<()> {
        if packet.len() > usize::from(self.mtu) {
            return Err(NetworkError::PacketTooLarge {
                size: packet.len(),
                mtu: self.mtu,
            });
        }
        self.written_tx
            .send(Bytes::copy_from_slice(packet))
            .map_err(|_| NetworkError::Tun("device closed".into()))
    }

    async fn set_ip(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> NetworkResult<()> {
        *self.address.lock().unwrap() = Some((address, netmask));
        Ok(())
    }

    async fn set_up(&self, up: bool) -> NetworkResult<()> {
        self.up.store(up, Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn close(&self) -> NetworkResult<()> {
        // Dropping the inject sender unblocks any pending read
        self.inject_tx.lock().unwrap().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hub_unicast_and_broadcast() {
        let hub = MemoryHub::new();
        let a = hub.join(PeerId(1), "alice");
        let b = hub.join(PeerId(2), "bob");
        let c = hub.join(PeerId(3), "carol");

        a.send_to(PeerId(2), Bytes::from_static(b"x"), Delivery::Reliable)
            .await
            .unwrap();
        a.broadcast(Bytes::from_static(b"y"), Delivery::Unreliable)
            .await
            .unwrap();

        let b_in = b.poll_inbound(16).await;
        assert_eq!(b_in.len(), 2);
        assert!(b_in.iter().all(|d| d.from == PeerId(1)));

        // Broadcast excludes the sender
        assert!(a.poll_inbound(16).await.is_empty());
        assert_eq!(c.poll_inbound(16).await.len(), 1);
    }

    #[tokio::test]
    async fn test_partition_drops_unreliable_only() {
        let hub = MemoryHub::new();
        let a = hub.join(PeerId(1), "a");
        let b = hub.join(PeerId(2), "b");
        hub.partition(PeerId(1), PeerId(2));

        a.send_to(PeerId(2), Bytes::from_static(b"u"), Delivery::Unreliable)
            .await
            .unwrap();
        a.send_to(PeerId(2), Bytes::from_static(b"r"), Delivery::Reliable)
            .await
            .unwrap();

        let inbox = b.poll_inbound(16).await;
        assert_eq!(inbox.len(), 1);
        assert_eq!(&inbox[0].data[..], b"r");
    }

    #[tokio::test]
    async fn test_reliable_to_missing_peer_errors() {
        let hub = MemoryHub::new();
        let a = hub.join(PeerId(1), "a");

        let err = a
            .send_to(PeerId(9), Bytes::from_static(b"x"), Delivery::Reliable)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_loopback_tun_mtu_and_close() {
        let tun = LoopbackTun::new("lo-test", 100);

        assert!(tun.write(&[0u8; 101]).await.is_err());
        tun.write(&[0u8; 100]).await.unwrap();
        assert_eq!(tun.next_written().await.unwrap().len(), 100);

        tun.inject(Bytes::from_static(b"pkt"));
        assert_eq!(&tun.read().await.unwrap()[..], b"pkt");

        tun.close().await.unwrap();
        assert!(tun.read().await.is_err());
    }
}
