//! Multi-peer lobby scenarios over the in-memory transport

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use lanmesh_core::{NegotiationState, TimingConfig, VpnBridge, VpnConfig};
use lanmesh_network::{
    Delivery, LoopbackTun, MemoryHub, MemoryTransport, MessagePump, Transport,
};
use lanmesh_proto::message::{self, AddressAnnounce, ControlMessage};
use lanmesh_proto::{ip, NodeId, PeerId};

struct Peer {
    id: PeerId,
    bridge: Arc<VpnBridge>,
    pump: Arc<MessagePump>,
    tun: Arc<LoopbackTun>,
    transport: Arc<MemoryTransport>,
}

impl Peer {
    async fn shutdown(&self) {
        self.pump.stop().await;
        self.bridge.stop().await;
    }
}

fn fast_config() -> VpnConfig {
    VpnConfig {
        timing: TimingConfig {
            probe_timeout_ms: 100,
            heartbeat_interval_ms: 100,
            lease_time_ms: 400,
            lease_expiry_ms: 500,
            heartbeat_expiry_ms: 60_000,
        },
        ..VpnConfig::default()
    }
}

async fn spawn_peer(hub: &MemoryHub, id: PeerId, name: &str) -> Peer {
    let transport = Arc::new(hub.join(id, name));
    let tun = LoopbackTun::new(&format!("lo-{}", name), 1100);

    let bridge = VpnBridge::new(
        transport.clone(),
        Arc::new(hub.clone()),
        id,
        fast_config(),
    );
    bridge.start_with_device(tun.clone()).await.unwrap();

    let pump = Arc::new(MessagePump::new(transport.clone(), bridge.clone()));
    pump.start();

    Peer {
        id,
        bridge,
        pump,
        tun,
        transport,
    }
}

async fn wait_for(what: &str, timeout_ms: u64, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_stable(peer: &Peer) -> u32 {
    let bridge = peer.bridge.clone();
    wait_for("negotiation to settle", 2_000, move || {
        bridge.local_ip().is_some()
    })
    .await;
    u32::from(peer.bridge.local_ip().unwrap())
}

fn ipv4_packet(src: u32, dest: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(20 + payload.len());
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16((20 + payload.len()) as u16);
    buf.put_u32(0);
    buf.put_u8(64);
    buf.put_u8(17);
    buf.put_u16(0);
    buf.put_u32(src);
    buf.put_u32(dest);
    buf.put_slice(payload);
    buf.freeze()
}

fn subnet() -> (u32, u32) {
    (
        ip::parse("10.0.0.0").unwrap(),
        ip::parse("255.255.255.0").unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_peer_cold_start() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, PeerId(1), "a").await;

    let addr = wait_stable(&a).await;
    let (base, mask) = subnet();

    assert!(ip::in_subnet(addr, base, mask));
    assert_ne!(addr & !mask, 0, "network address must not be assigned");
    assert_ne!(addr, ip::subnet_broadcast(base, mask));

    let table = a.bridge.routing_table_snapshot();
    assert_eq!(table.len(), 1);
    let entry = table.get(&addr).expect("own route present");
    assert!(entry.local);
    assert_eq!(entry.peer, PeerId(1));

    // The device was configured and brought up
    let (assigned, assigned_mask) = a.tun.assigned_address().unwrap();
    assert_eq!(u32::from(assigned), addr);
    assert_eq!(u32::from(assigned_mask), mask);
    assert!(a.tun.is_up());

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_peers_get_distinct_addresses() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, PeerId(1), "a").await;
    let b = spawn_peer(&hub, PeerId(2), "b").await;

    let addr_a = wait_stable(&a).await;
    let addr_b = wait_stable(&b).await;
    assert_ne!(addr_a, addr_b);

    // Route exchange converges to both entries on both sides
    let (bridge_a, bridge_b) = (a.bridge.clone(), b.bridge.clone());
    wait_for("route tables to converge", 2_000, move || {
        bridge_a.routing_table_snapshot().len() == 2
            && bridge_b.routing_table_snapshot().len() == 2
    })
    .await;

    for (peer, own) in [(&a, addr_a), (&b, addr_b)] {
        let table = peer.bridge.routing_table_snapshot();
        for entry in table.values() {
            assert_eq!(entry.local, entry.peer == peer.id);
            assert_eq!(entry.local, entry.ip == own);
        }
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_joiner_receives_state() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, PeerId(1), "a").await;
    let addr_a = wait_stable(&a).await;

    let c = spawn_peer(&hub, PeerId(3), "c").await;
    a.bridge.on_peer_joined(PeerId(3)).await;

    let bridge_c = c.bridge.clone();
    wait_for("late joiner to learn the table", 2_000, move || {
        bridge_c
            .routing_table_snapshot()
            .get(&addr_a)
            .is_some_and(|entry| entry.peer == PeerId(1))
    })
    .await;

    a.shutdown().await;
    c.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_higher_priority_announce_steals_address() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, PeerId(1), "a").await;
    let addr_a = wait_stable(&a).await;

    let salt = fast_config().salt_bytes();
    let a_node = NodeId::generate(PeerId(1), &salt);

    // Find an identity that outranks A
    let thief_peer = (100..)
        .map(PeerId)
        .find(|&p| NodeId::generate(p, &salt).has_priority(&a_node))
        .unwrap();
    let thief_node = NodeId::generate(thief_peer, &salt);

    let thief = hub.join(thief_peer, "thief");
    let announce = ControlMessage::AddressAnnounce(AddressAnnounce {
        ip: addr_a,
        node_id: thief_node,
    });
    thief
        .send_to(PeerId(1), announce.encode_frame(), Delivery::Reliable)
        .await
        .unwrap();

    // A walks away and settles somewhere else
    let bridge_a = a.bridge.clone();
    wait_for("stolen address to be released", 3_000, move || {
        bridge_a
            .local_ip()
            .is_some_and(|addr| u32::from(addr) != addr_a)
    })
    .await;

    assert_eq!(a.bridge.negotiation_state(), NegotiationState::Stable);

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_silent_peer_lease_expires() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, PeerId(1), "a").await;
    let b = spawn_peer(&hub, PeerId(2), "b").await;

    wait_stable(&a).await;
    let addr_b = wait_stable(&b).await;

    let bridge_a = a.bridge.clone();
    wait_for("A to learn B's route", 2_000, move || {
        bridge_a.routing_table_snapshot().contains_key(&addr_b)
    })
    .await;

    // Make sure A has seen at least one of B's heartbeats
    let bridge_a = a.bridge.clone();
    wait_for("A to record B's lease", 2_000, move || {
        bridge_a.lease_snapshot().values().any(|e| e.ip == addr_b)
    })
    .await;

    // B vanishes without a lobby departure
    b.shutdown().await;

    let bridge_a = a.bridge.clone();
    wait_for("B's lease to expire at A", 4_000, move || {
        !bridge_a.routing_table_snapshot().contains_key(&addr_b)
    })
    .await;

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relay_forwarding_path() {
    let hub = MemoryHub::new();
    let g = spawn_peer(&hub, PeerId(1), "g").await;
    let i = spawn_peer(&hub, PeerId(2), "i").await;
    let h = spawn_peer(&hub, PeerId(3), "h").await;

    let addr_g = wait_stable(&g).await;
    let _addr_i = wait_stable(&i).await;
    let addr_h = wait_stable(&h).await;

    let (bridge_g, bridge_i, bridge_h) = (g.bridge.clone(), i.bridge.clone(), h.bridge.clone());
    wait_for("all tables to converge", 3_000, move || {
        bridge_g.routing_table_snapshot().len() == 3
            && bridge_i.routing_table_snapshot().len() == 3
            && bridge_h.routing_table_snapshot().len() == 3
    })
    .await;

    // G and H cannot reach each other directly from here on
    hub.partition(PeerId(1), PeerId(3));

    // A frame from G lands at I, whose bridge owns neither end of it:
    // it must forward to H and keep its own counters untouched
    let packet = ipv4_packet(addr_g, addr_h, b"relayed");
    let salt = fast_config().salt_bytes();
    let g_node = NodeId::generate(PeerId(1), &salt);
    let mut scratch = BytesMut::new();
    let frame = message::frame_ip_packet(&mut scratch, &g_node, &packet).unwrap();

    g.transport
        .send_to(PeerId(2), frame, Delivery::Unreliable)
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(2), h.tun.next_written())
        .await
        .expect("relay did not reach H")
        .unwrap();
    assert_eq!(&delivered[..], &packet[..]);

    let i_stats = i.bridge.statistics();
    assert_eq!(i_stats.packets_received, 0);
    assert_eq!(i_stats.packets_sent, 0);
    assert!(i.tun.drain_written().await.is_empty());

    assert_eq!(h.bridge.statistics().packets_received, 1);

    // G's own outbound counter tracks packets it originates
    g.tun.inject(ipv4_packet(addr_g, addr_h, b"direct"));
    let bridge_g = g.bridge.clone();
    wait_for("G to count its send", 2_000, move || {
        bridge_g.statistics().packets_sent == 1
    })
    .await;

    g.shutdown().await;
    i.shutdown().await;
    h.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subnet_broadcast_reaches_everyone() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, PeerId(1), "a").await;
    let b = spawn_peer(&hub, PeerId(2), "b").await;
    let c = spawn_peer(&hub, PeerId(3), "c").await;

    let addr_a = wait_stable(&a).await;
    wait_stable(&b).await;
    wait_stable(&c).await;

    let (base, mask) = subnet();
    let packet = ipv4_packet(addr_a, ip::subnet_broadcast(base, mask), b"to-all");
    a.tun.inject(packet.clone());

    for peer in [&b, &c] {
        let delivered = tokio::time::timeout(Duration::from_secs(2), peer.tun.next_written())
            .await
            .expect("broadcast missing")
            .unwrap();
        assert_eq!(&delivered[..], &packet[..]);
    }

    // Two recipients, counted per member reached
    let bridge_a = a.bridge.clone();
    wait_for("broadcast counters", 2_000, move || {
        bridge_a.statistics().packets_sent == 2
    })
    .await;
    assert_eq!(
        a.bridge.statistics().bytes_sent,
        2 * packet.len() as u64
    );

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_destination_is_dropped() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, PeerId(1), "a").await;
    let addr_a = wait_stable(&a).await;

    // Pick an address that is guaranteed not to be A's own
    let mut unknown = ip::parse("10.0.0.77").unwrap();
    if unknown == addr_a {
        unknown = ip::parse("10.0.0.78").unwrap();
    }
    a.tun.inject(ipv4_packet(addr_a, unknown, b"lost"));

    let bridge_a = a.bridge.clone();
    wait_for("drop counter", 2_000, move || {
        bridge_a.statistics().packets_dropped >= 1
    })
    .await;
    assert_eq!(a.bridge.statistics().packets_sent, 0);

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unicast_to_local_address_hits_tun() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, PeerId(1), "a").await;
    let b = spawn_peer(&hub, PeerId(2), "b").await;

    let addr_a = wait_stable(&a).await;
    let addr_b = wait_stable(&b).await;

    let (bridge_b, bridge_a) = (b.bridge.clone(), a.bridge.clone());
    wait_for("tables to converge", 2_000, move || {
        bridge_b.routing_table_snapshot().len() == 2
            && bridge_a.routing_table_snapshot().len() == 2
    })
    .await;

    let packet = ipv4_packet(addr_b, addr_a, b"ping");
    b.tun.inject(packet.clone());

    let delivered = tokio::time::timeout(Duration::from_secs(2), a.tun.next_written())
        .await
        .expect("unicast missing")
        .unwrap();
    assert_eq!(&delivered[..], &packet[..]);
    assert_eq!(a.bridge.statistics().packets_received, 1);
    assert_eq!(a.bridge.statistics().bytes_received, packet.len() as u64);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_departure_clears_routes() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, PeerId(1), "a").await;
    let b = spawn_peer(&hub, PeerId(2), "b").await;

    wait_stable(&a).await;
    let addr_b = wait_stable(&b).await;

    let bridge_a = a.bridge.clone();
    wait_for("A to learn B", 2_000, move || {
        bridge_a.routing_table_snapshot().contains_key(&addr_b)
    })
    .await;

    b.shutdown().await;
    hub.part(PeerId(2));
    a.bridge.on_peer_left(PeerId(2)).await;

    assert!(!a.bridge.routing_table_snapshot().contains_key(&addr_b));

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_releases_everything_and_restart_works() {
    let hub = MemoryHub::new();
    let a = spawn_peer(&hub, PeerId(1), "a").await;
    wait_stable(&a).await;

    a.shutdown().await;

    assert!(!a.bridge.is_running());
    assert_eq!(a.bridge.local_ip(), None);
    assert!(a.bridge.routing_table_snapshot().is_empty());
    assert_eq!(a.bridge.device_name(), None);

    // A fresh device brings the same bridge back up
    let tun = LoopbackTun::new("lo-a2", 1100);
    a.bridge.start_with_device(tun).await.unwrap();

    let bridge = a.bridge.clone();
    wait_for("renegotiation after restart", 2_000, move || {
        bridge.local_ip().is_some()
    })
    .await;

    a.bridge.stop().await;
}
