//! VPN bridge
//!
//! Ties the subsystems together: the TUN read loop frames outbound packets
//! and dispatches them by route, the inbound path demultiplexes data from
//! control traffic (forwarding on behalf of peers that lack a direct
//! route), and negotiation/heartbeat events feed back into the device and
//! the route table.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use lanmesh_proto::constants::{MAX_TUN_MTU, MESSAGE_OVERHEAD, MIN_TUN_MTU, NODE_ID_SIZE};
use lanmesh_proto::message::{self, AddressAnnounce, ControlMessage, MessageType};
use lanmesh_proto::{ip, NodeId, PeerId};

use lanmesh_network::{
    create_tun, Delivery, InboundHandler, LinkKind, PeerDirectory, Transport, TunDevice,
};

use crate::config::VpnConfig;
use crate::error::{CoreError, CoreResult};
use crate::heartbeat::{HeartbeatManager, HeartbeatSink};
use crate::negotiator::{IpNegotiator, NegotiationState, NegotiatorSink};
use crate::routes::{RouteEntry, RouteTable};

/// Data-plane counters
#[derive(Debug, Clone, Default)]
pub struct VpnStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
}

/// Cross-subsystem notifications routed through the bridge's event task
enum CoreEvent {
    Stable { addr: u32, node_id: NodeId },
    LeaseExpired { node_id: NodeId, addr: u32 },
}

/// Outbound side handed to the negotiator and heartbeat manager: control
/// messages go straight to the transport, state changes queue for the
/// bridge's event task.
struct ControlSink {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<CoreEvent>,
}

impl ControlSink {
    async fn dispatch(&self, peer: Option<PeerId>, message: ControlMessage) {
        let frame = message.encode_frame();
        let result = match peer {
            Some(peer) => self.transport.send_to(peer, frame, Delivery::Reliable).await,
            None => self.transport.broadcast(frame, Delivery::Reliable).await,
        };
        if let Err(e) = result {
            debug!("Control message send failed: {}", e);
        }
    }
}

#[async_trait]
impl NegotiatorSink for ControlSink {
    async fn send(&self, peer: PeerId, message: ControlMessage) {
        self.dispatch(Some(peer), message).await;
    }

    async fn broadcast(&self, message: ControlMessage) {
        self.dispatch(None, message).await;
    }

    async fn on_stable(&self, addr: u32, node_id: NodeId) {
        let _ = self.events.send(CoreEvent::Stable { addr, node_id });
    }
}

#[async_trait]
impl HeartbeatSink for ControlSink {
    async fn broadcast(&self, message: ControlMessage) {
        self.dispatch(None, message).await;
    }

    async fn on_expired(&self, node_id: NodeId, addr: u32) {
        let _ = self.events.send(CoreEvent::LeaseExpired { node_id, addr });
    }
}

/// The overlay's composition root
pub struct VpnBridge {
    transport: Arc<dyn Transport>,
    directory: Arc<dyn PeerDirectory>,
    local_peer: PeerId,
    config: VpnConfig,
    salt: Vec<u8>,

    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,

    tun: RwLock<Option<Arc<dyn TunDevice>>>,
    routes: Arc<RouteTable>,
    negotiator: RwLock<Option<Arc<IpNegotiator>>>,
    heartbeat: RwLock<Option<Arc<HeartbeatManager>>>,

    base_ip: AtomicU32,
    netmask: AtomicU32,
    local_ip: AtomicU32,

    stats: Mutex<VpnStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VpnBridge {
    pub fn new(
        transport: Arc<dyn Transport>,
        directory: Arc<dyn PeerDirectory>,
        local_peer: PeerId,
        config: VpnConfig,
    ) -> Arc<Self> {
        let salt = config.salt_bytes();
        Arc::new(Self {
            transport,
            directory,
            local_peer,
            config,
            salt,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            tun: RwLock::new(None),
            routes: Arc::new(RouteTable::new()),
            negotiator: RwLock::new(None),
            heartbeat: RwLock::new(None),
            base_ip: AtomicU32::new(0),
            netmask: AtomicU32::new(0),
            local_ip: AtomicU32::new(0),
            stats: Mutex::new(VpnStats::default()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open the platform TUN device and start the overlay.
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        self.config.validate().map_err(CoreError::Config)?;

        let mtu = derive_mtu(self.transport.unreliable_payload_limit(), self.config.mtu);
        let device = create_tun(&self.config.tun_name, mtu).await?;
        self.start_with_device(Arc::from(device)).await
    }

    /// Start the overlay on an already-open device. Used directly by the
    /// simulation harness; `start` delegates here.
    pub async fn start_with_device(self: &Arc<Self>, device: Arc<dyn TunDevice>) -> CoreResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CoreError::AlreadyRunning);
        }

        let (base, mask) = match self.config.subnet_pair() {
            Ok(pair) => pair,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(CoreError::Config(e));
            }
        };
        self.base_ip.store(base, Ordering::Relaxed);
        self.netmask.store(mask, Ordering::Relaxed);
        self.local_ip.store(0, Ordering::Relaxed);

        let node_id = NodeId::generate(self.local_peer, &self.salt);
        info!("Local node ID: {:?}", node_id);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(ControlSink {
            transport: Arc::clone(&self.transport),
            events: events_tx,
        });

        let negotiator = Arc::new(IpNegotiator::new(
            node_id,
            base,
            mask,
            &self.config.timing,
            sink.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatManager::new(&self.config.timing, sink));

        *self.tun.write().unwrap() = Some(device.clone());
        *self.negotiator.write().unwrap() = Some(negotiator.clone());
        *self.heartbeat.write().unwrap() = Some(heartbeat);

        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.push(self.spawn_event_task(events_rx));
            tasks.push(self.spawn_tun_loop(device.clone(), node_id));
            tasks.push(self.spawn_negotiation_ticker(negotiator.clone()));
        }

        negotiator.start().await;

        info!(
            "VPN bridge started (device {}, MTU {})",
            device.name(),
            device.mtu()
        );
        Ok(())
    }

    /// Stop the overlay and release every resource, in reverse order of
    /// acquisition. Safe to call twice.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        let heartbeat = self.heartbeat.write().unwrap().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }

        // Close the device first so a blocked TUN read wakes up
        let tun = self.tun.write().unwrap().take();
        if let Some(tun) = &tun {
            if let Err(e) = tun.close().await {
                warn!("Error closing TUN device: {}", e);
            }
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        *self.negotiator.write().unwrap() = None;
        self.routes.clear();
        self.local_ip.store(0, Ordering::Relaxed);

        info!("VPN bridge stopped");
    }

    // =====================
    // Background tasks
    // =====================

    fn spawn_tun_loop(self: &Arc<Self>, device: Arc<dyn TunDevice>, node_id: NodeId) -> JoinHandle<()> {
        let bridge = Arc::clone(self);

        tokio::spawn(async move {
            debug!("TUN loop started");
            let mut scratch =
                BytesMut::with_capacity(usize::from(device.mtu()) + MESSAGE_OVERHEAD);

            loop {
                if !bridge.running.load(Ordering::Relaxed) {
                    break;
                }

                tokio::select! {
                    _ = bridge.shutdown.notified() => break,
                    result = device.read() => match result {
                        Ok(packet) => bridge.handle_outbound(&mut scratch, node_id, &packet).await,
                        Err(e) => {
                            if !bridge.running.load(Ordering::Relaxed) {
                                break;
                            }
                            warn!("TUN read error: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
            debug!("TUN loop stopped");
        })
    }

    fn spawn_negotiation_ticker(self: &Arc<Self>, negotiator: Arc<IpNegotiator>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(50));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                if !bridge.running.load(Ordering::Relaxed) {
                    break;
                }
                tokio::select! {
                    _ = bridge.shutdown.notified() => break,
                    _ = ticker.tick() => negotiator.check_timeout().await,
                }
            }
        })
    }

    fn spawn_event_task(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<CoreEvent>,
    ) -> JoinHandle<()> {
        let bridge = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                if !bridge.running.load(Ordering::Relaxed) {
                    break;
                }
                tokio::select! {
                    _ = bridge.shutdown.notified() => break,
                    event = events.recv() => match event {
                        Some(CoreEvent::Stable { addr, node_id }) => {
                            bridge.finish_negotiation(addr, node_id).await;
                        }
                        Some(CoreEvent::LeaseExpired { node_id, addr }) => {
                            debug!("Evicting expired lease {} ({:?})", ip::format(addr), node_id);
                            bridge.routes.remove(addr);
                            if let Some(negotiator) = bridge.current_negotiator() {
                                negotiator.mark_ip_unused(addr);
                            }
                        }
                        None => break,
                    }
                }
            }
        })
    }

    // =====================
    // Outbound data plane
    // =====================

    /// One packet read from TUN: frame it and dispatch by destination.
    async fn handle_outbound(&self, scratch: &mut BytesMut, node_id: NodeId, packet: &[u8]) {
        let base = self.base_ip.load(Ordering::Relaxed);
        let mask = self.netmask.load(Ordering::Relaxed);

        let Some(dest) = ip::destination(packet) else {
            trace!("Dropping non-IPv4 packet from TUN");
            self.bump_dropped();
            return;
        };

        let frame = match message::frame_ip_packet(scratch, &node_id, packet) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("Cannot frame packet: {}", e);
                self.bump_dropped();
                return;
            }
        };

        if ip::is_broadcast(dest, base, mask) {
            if self
                .transport
                .broadcast(frame, Delivery::Unreliable)
                .await
                .is_ok()
            {
                let recipients = self.transport.members().await.len().saturating_sub(1) as u64;
                let mut stats = self.stats.lock().unwrap();
                stats.packets_sent += recipients;
                stats.bytes_sent += recipients * packet.len() as u64;
            }
            return;
        }

        match self.routes.lookup(dest) {
            Some(entry) if !entry.local => {
                if self
                    .transport
                    .send_to(entry.peer, frame, Delivery::Unreliable)
                    .await
                    .is_ok()
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.packets_sent += 1;
                    stats.bytes_sent += packet.len() as u64;
                }
            }
            Some(_) => {
                // Looped back to our own address; the OS handles that itself
            }
            None => {
                trace!("No route for {}", ip::format(dest));
                self.bump_dropped();
            }
        }
    }

    // =====================
    // Inbound dispatch
    // =====================

    /// One datagram from the transport: demultiplex data vs. control.
    pub async fn handle_datagram(&self, from: PeerId, data: Bytes) {
        let (ty, payload) = match message::decode_frame(&data) {
            Ok(parts) => parts,
            Err(e) => {
                trace!("Malformed datagram from {}: {}", from, e);
                self.bump_dropped();
                return;
            }
        };

        match ty {
            MessageType::IpPacket => self.handle_ip_packet(from, &data, payload).await,
            MessageType::RouteUpdate => self.handle_route_update(from, payload).await,
            _ => {
                let control = match ControlMessage::decode(ty, payload) {
                    Ok(control) => control,
                    Err(e) => {
                        trace!("Malformed {:?} from {}: {}", ty, from, e);
                        self.bump_dropped();
                        return;
                    }
                };
                self.handle_control(from, control).await;
            }
        }
    }

    /// Inbound encapsulated IP packet: deliver locally or relay onward.
    async fn handle_ip_packet(&self, from: PeerId, frame: &Bytes, payload: &[u8]) {
        if payload.len() <= NODE_ID_SIZE {
            self.bump_dropped();
            return;
        }
        let inner = &payload[NODE_ID_SIZE..];

        let Some(dest) = ip::destination(inner) else {
            self.bump_dropped();
            return;
        };

        let base = self.base_ip.load(Ordering::Relaxed);
        let mask = self.netmask.load(Ordering::Relaxed);
        let local = self.local_ip.load(Ordering::Relaxed);

        if (local != 0 && dest == local) || ip::is_broadcast(dest, base, mask) {
            let tun = self.tun.read().unwrap().clone();
            if let Some(tun) = tun {
                match tun.write(inner).await {
                    Ok(()) => {
                        let mut stats = self.stats.lock().unwrap();
                        stats.packets_received += 1;
                        stats.bytes_received += inner.len() as u64;
                    }
                    Err(e) => {
                        warn!("TUN write failed: {}", e);
                        self.bump_dropped();
                    }
                }
            }
            return;
        }

        // Not ours: relay toward the owner, but never back to the sender
        match self.routes.lookup(dest) {
            Some(entry) if !entry.local && entry.peer != from => {
                trace!("Relaying packet for {} to {}", ip::format(dest), entry.peer);
                if let Err(e) = self
                    .transport
                    .send_to(entry.peer, frame.clone(), Delivery::Unreliable)
                    .await
                {
                    debug!("Relay to {} failed: {}", entry.peer, e);
                }
            }
            Some(_) => {}
            None => self.bump_dropped(),
        }
    }

    /// Merge a peer's route export. Receiving one never triggers another
    /// export, which keeps table gossip from amplifying.
    async fn handle_route_update(&self, from: PeerId, payload: &[u8]) {
        let base = self.base_ip.load(Ordering::Relaxed);
        let mask = self.netmask.load(Ordering::Relaxed);

        let added = match self.routes.ingest(
            payload,
            base,
            mask,
            self.local_peer,
            &self.salt,
            &*self.directory,
        ) {
            Ok(added) => added,
            Err(e) => {
                trace!("Bad route update from {}: {}", from, e);
                self.bump_dropped();
                return;
            }
        };

        if !added.is_empty() {
            debug!("Learned {} routes from {}", added.len(), from);
            if let Some(negotiator) = self.current_negotiator() {
                for entry in &added {
                    negotiator.mark_ip_used(entry.ip);
                }
            }
        }
    }

    async fn handle_control(&self, from: PeerId, control: ControlMessage) {
        let Some(negotiator) = self.current_negotiator() else {
            return;
        };

        match control {
            ControlMessage::ProbeRequest(request) => {
                negotiator.handle_probe_request(request, from).await;
            }
            ControlMessage::ProbeResponse(response) => {
                negotiator.handle_probe_response(response, from).await;
            }
            ControlMessage::AddressAnnounce(announce) => {
                self.handle_address_announce(&negotiator, announce, from).await;
            }
            ControlMessage::ForcedRelease(release) => {
                negotiator.handle_forced_release(release, from).await;
            }
            ControlMessage::Heartbeat(heartbeat) => {
                let manager = self.heartbeat.read().unwrap().clone();
                if let Some(manager) = manager {
                    manager.handle_heartbeat(heartbeat, from, self.directory.name_of(from));
                }
            }
        }
    }

    /// An announcement both feeds arbitration and installs the route. A
    /// previously unknown address is news worth re-exporting.
    async fn handle_address_announce(
        &self,
        negotiator: &Arc<IpNegotiator>,
        announce: AddressAnnounce,
        from: PeerId,
    ) {
        let was_known = self.routes.contains(announce.ip);

        negotiator.handle_address_announce(announce, from).await;

        let name = self.directory.name_of(from);
        self.routes
            .upsert(announce.node_id, from, announce.ip, name, self.local_peer);
        negotiator.mark_ip_used(announce.ip);

        if !was_known {
            self.broadcast_route_table().await;
        }
    }

    // =====================
    // Negotiation / lease events
    // =====================

    /// Local address settled: configure the device, install the local
    /// route, start leasing, and export the table.
    async fn finish_negotiation(&self, addr: u32, node_id: NodeId) {
        let mask = self.netmask.load(Ordering::Relaxed);
        self.local_ip.store(addr, Ordering::Relaxed);

        let tun = self.tun.read().unwrap().clone();
        if let Some(tun) = tun {
            if let Err(e) = tun
                .set_ip(Ipv4Addr::from(addr), Ipv4Addr::from(mask))
                .await
            {
                error!("Failed to configure TUN address: {}", e);
                return;
            }
            if let Err(e) = tun.set_up(true).await {
                error!("Failed to bring TUN up: {}", e);
                return;
            }
        }

        let name = self.directory.name_of(self.local_peer);
        self.routes
            .upsert(node_id, self.local_peer, addr, name.clone(), self.local_peer);

        if let Some(negotiator) = self.current_negotiator() {
            negotiator.mark_ip_used(addr);
        }

        let heartbeat = self.heartbeat.read().unwrap().clone();
        if let Some(heartbeat) = heartbeat {
            heartbeat.initialize(node_id, addr);
            heartbeat.register(node_id, self.local_peer, addr, name);
            heartbeat.start();
        }

        self.broadcast_route_table().await;
    }

    // =====================
    // Lobby membership
    // =====================

    /// A peer entered the lobby: bring it up to date (reliable).
    pub async fn on_peer_joined(&self, peer: PeerId) {
        info!("Peer joined: {}", peer);
        let Some(negotiator) = self.current_negotiator() else {
            return;
        };
        if negotiator.state() == NegotiationState::Stable {
            negotiator.announce_to(peer).await;
            self.send_route_table_to(peer).await;
        }
    }

    /// A peer left the lobby: tear down everything it owned.
    pub async fn on_peer_left(&self, peer: PeerId) {
        info!("Peer left: {}", peer);

        let removed = self.routes.remove_all_for_peer(peer);
        let negotiator = self.current_negotiator();
        let heartbeat = self.heartbeat.read().unwrap().clone();

        for (addr, node_id) in removed {
            if let Some(heartbeat) = &heartbeat {
                heartbeat.unregister(node_id);
            }
            if let Some(negotiator) = &negotiator {
                negotiator.mark_ip_unused(addr);
            }
        }
    }

    /// A reconnecting peer greeted us: repeat our announcement.
    pub async fn on_session_hello(&self, peer: PeerId) {
        let Some(negotiator) = self.current_negotiator() else {
            return;
        };
        if negotiator.state() == NegotiationState::Stable {
            negotiator.announce_to(peer).await;
        }
    }

    // =====================
    // Route dissemination
    // =====================

    async fn broadcast_route_table(&self) {
        let payload = self.routes.encode_table();
        let frame = message::encode_frame(MessageType::RouteUpdate, &payload);
        if let Err(e) = self.transport.broadcast(frame, Delivery::Reliable).await {
            debug!("Route table broadcast failed: {}", e);
        }
    }

    async fn send_route_table_to(&self, peer: PeerId) {
        let payload = self.routes.encode_table();
        let frame = message::encode_frame(MessageType::RouteUpdate, &payload);
        if let Err(e) = self.transport.send_to(peer, frame, Delivery::Reliable).await {
            debug!("Route table send to {} failed: {}", peer, e);
        }
    }

    // =====================
    // Observation
    // =====================

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Locally held virtual address, once negotiation settled.
    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        match self.local_ip.load(Ordering::Relaxed) {
            0 => None,
            addr => Some(Ipv4Addr::from(addr)),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Name of the open TUN device, if any.
    pub fn device_name(&self) -> Option<String> {
        self.tun
            .read()
            .unwrap()
            .as_ref()
            .map(|tun| tun.name().to_string())
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.current_negotiator()
            .map(|n| n.state())
            .unwrap_or(NegotiationState::Idle)
    }

    pub fn routing_table_snapshot(&self) -> BTreeMap<u32, RouteEntry> {
        self.routes.snapshot()
    }

    /// Snapshot of known lease holders.
    pub fn lease_snapshot(&self) -> std::collections::HashMap<NodeId, crate::heartbeat::NodeEntry> {
        self.heartbeat
            .read()
            .unwrap()
            .as_ref()
            .map(|heartbeat| heartbeat.nodes())
            .unwrap_or_default()
    }

    pub fn statistics(&self) -> VpnStats {
        self.stats.lock().unwrap().clone()
    }

    /// Round-trip estimate to a peer, through the transport.
    pub async fn peer_ping_ms(&self, peer: PeerId) -> Option<u32> {
        self.transport.ping_ms(peer).await
    }

    /// Link class to a peer, through the transport.
    pub async fn peer_link_kind(&self, peer: PeerId) -> Option<LinkKind> {
        self.transport.link_kind(peer).await
    }

    fn current_negotiator(&self) -> Option<Arc<IpNegotiator>> {
        self.negotiator.read().unwrap().clone()
    }

    fn bump_dropped(&self) {
        self.stats.lock().unwrap().packets_dropped += 1;
    }
}

#[async_trait]
impl InboundHandler for VpnBridge {
    async fn on_datagram(&self, from: PeerId, data: Bytes) {
        self.handle_datagram(from, data).await;
    }
}

/// TUN MTU from the transport budget: frame overhead plus a safety margin
/// come off the unreliable limit, clamped to a sane range, then lowered to
/// a smaller configured MTU if one is set.
fn derive_mtu(transport_limit: usize, configured: u16) -> u16 {
    let derived = (transport_limit as i64 - MESSAGE_OVERHEAD as i64 - 15)
        .clamp(i64::from(MIN_TUN_MTU), i64::from(MAX_TUN_MTU)) as u16;

    if configured > 0 && configured < derived {
        configured
    } else {
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanmesh_network::MemoryHub;

    #[test]
    fn test_derive_mtu() {
        // 1200-byte budget leaves 1150 after overhead and margin
        assert_eq!(derive_mtu(1200, 0), 1150);
        // Clamped upward for tiny budgets
        assert_eq!(derive_mtu(100, 0), MIN_TUN_MTU);
        // Clamped downward for huge budgets
        assert_eq!(derive_mtu(100_000, 0), MAX_TUN_MTU);
        // Configured MTU only wins when smaller
        assert_eq!(derive_mtu(1200, 900), 900);
        assert_eq!(derive_mtu(1200, 9000), 1150);
    }

    #[tokio::test]
    async fn test_malformed_datagrams_bump_drop_counter() {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.join(PeerId(1), "a"));
        let bridge = VpnBridge::new(
            transport,
            Arc::new(hub.clone()),
            PeerId(1),
            VpnConfig::default(),
        );

        // Too short for a header
        bridge.handle_datagram(PeerId(2), Bytes::from_static(&[1])).await;
        // Unknown type tag
        bridge
            .handle_datagram(PeerId(2), Bytes::from_static(&[0x60, 0, 0]))
            .await;
        // Declared length beyond the buffer
        bridge
            .handle_datagram(PeerId(2), Bytes::from_static(&[10, 0x02, 0x00, 0xAA]))
            .await;

        assert_eq!(bridge.statistics().packets_dropped, 3);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let hub = MemoryHub::new();
        let transport = Arc::new(hub.join(PeerId(1), "a"));
        let bridge = VpnBridge::new(
            transport,
            Arc::new(hub.clone()),
            PeerId(1),
            VpnConfig::default(),
        );

        let tun = lanmesh_network::LoopbackTun::new("lo0", 1100);
        bridge.start_with_device(tun.clone()).await.unwrap();

        let second = bridge.start_with_device(tun).await;
        assert!(matches!(second, Err(CoreError::AlreadyRunning)));

        bridge.stop().await;
        assert!(!bridge.is_running());
    }
}
