//! Heartbeat leases
//!
//! A 1 Hz ticker broadcasts the local lease renewal every heartbeat
//! interval and sweeps the node table for leases that went silent past the
//! expiry window. The bridge learns about evictions through the sink and
//! frees the route and the used-address marker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use lanmesh_proto::message::{ControlMessage, Heartbeat};
use lanmesh_proto::{ip, NodeId, PeerId};

use crate::config::TimingConfig;
use crate::negotiator::now_ms;

/// One known lease holder
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Transport identity of the holder
    pub peer: PeerId,
    /// Held address (host order)
    pub ip: u32,
    /// When the last heartbeat (or registration) was seen
    pub last_heartbeat: Instant,
    /// Display name
    pub name: String,
    /// True for this process's own lease
    pub local: bool,
}

/// Outbound side of the heartbeat manager, supplied by the bridge.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    /// Broadcast a lease renewal (reliable).
    async fn broadcast(&self, message: ControlMessage);

    /// A non-local lease expired and was evicted.
    async fn on_expired(&self, node_id: NodeId, addr: u32);
}

struct LocalLease {
    node_id: Option<NodeId>,
    ip: u32,
    last_sent: Instant,
}

struct Tables {
    nodes: HashMap<NodeId, NodeEntry>,
    by_ip: HashMap<u32, NodeId>,
}

/// Lease heartbeat emitter and expiry sweeper
pub struct HeartbeatManager {
    local: Mutex<LocalLease>,
    tables: Mutex<Tables>,
    interval: Duration,
    lease_expiry: Duration,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<dyn HeartbeatSink>,
}

impl HeartbeatManager {
    pub fn new(timing: &TimingConfig, sink: Arc<dyn HeartbeatSink>) -> Self {
        Self {
            local: Mutex::new(LocalLease {
                node_id: None,
                ip: 0,
                last_sent: Instant::now(),
            }),
            tables: Mutex::new(Tables {
                nodes: HashMap::new(),
                by_ip: HashMap::new(),
            }),
            interval: Duration::from_millis(timing.heartbeat_interval_ms),
            lease_expiry: Duration::from_millis(timing.lease_expiry_ms),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            sink,
        }
    }

    /// Adopt the local lease. Called once negotiation settles; calling it
    /// again (after an address change) replaces the lease.
    pub fn initialize(&self, node_id: NodeId, addr: u32) {
        let mut local = self.local.lock().unwrap();
        local.node_id = Some(node_id);
        local.ip = addr;
        local.last_sent = Instant::now();
    }

    /// Update the address the local lease renews.
    pub fn update_local_ip(&self, addr: u32) {
        self.local.lock().unwrap().ip = addr;
    }

    /// Start the 1 Hz ticker. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            info!("Heartbeat manager started");
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while manager.running.load(Ordering::Relaxed) {
                ticker.tick().await;
                if !manager.running.load(Ordering::Relaxed) {
                    break;
                }
                manager.tick().await;
            }
            info!("Heartbeat manager stopped");
        });

        *self.task.lock().unwrap() = Some(task);
    }

    /// Stop the ticker and wait for it to exit.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                debug!("Heartbeat ticker did not exit in time");
            }
        }
    }

    /// One ticker cycle: emit the lease renewal when due, then sweep.
    async fn tick(&self) {
        let renewal = {
            let mut local = self.local.lock().unwrap();
            match local.node_id {
                Some(node_id) if local.ip != 0 && local.last_sent.elapsed() >= self.interval => {
                    local.last_sent = Instant::now();
                    Some(ControlMessage::Heartbeat(Heartbeat {
                        ip: local.ip,
                        node_id,
                        timestamp_ms: now_ms(),
                    }))
                }
                _ => None,
            }
        };
        if let Some(message) = renewal {
            self.sink.broadcast(message).await;
        }

        for (node_id, addr) in self.sweep_expired() {
            self.sink.on_expired(node_id, addr).await;
        }
    }

    /// Evict every non-local lease older than the expiry window.
    fn sweep_expired(&self) -> Vec<(NodeId, u32)> {
        let mut expired = Vec::new();
        let mut tables = self.tables.lock().unwrap();

        tables.nodes.retain(|&node_id, entry| {
            if !entry.local && entry.last_heartbeat.elapsed() >= self.lease_expiry {
                info!("Lease expired: {:?} at {}", node_id, ip::format(entry.ip));
                expired.push((node_id, entry.ip));
                false
            } else {
                true
            }
        });
        for (_, addr) in &expired {
            tables.by_ip.remove(addr);
        }
        expired
    }

    /// Refresh (or learn) a peer's lease from a received heartbeat.
    pub fn handle_heartbeat(&self, heartbeat: Heartbeat, from: PeerId, name: String) {
        let mut tables = self.tables.lock().unwrap();

        if let Some(entry) = tables.nodes.get_mut(&heartbeat.node_id) {
            entry.last_heartbeat = Instant::now();
            if entry.ip != heartbeat.ip {
                let old_ip = entry.ip;
                entry.ip = heartbeat.ip;
                tables.by_ip.remove(&old_ip);
                tables.by_ip.insert(heartbeat.ip, heartbeat.node_id);
            }
        } else {
            tables.nodes.insert(
                heartbeat.node_id,
                NodeEntry {
                    peer: from,
                    ip: heartbeat.ip,
                    last_heartbeat: Instant::now(),
                    name,
                    local: false,
                },
            );
            tables.by_ip.insert(heartbeat.ip, heartbeat.node_id);
        }
    }

    /// Add a lease entry directly (local registration, announcements).
    pub fn register(&self, node_id: NodeId, peer: PeerId, addr: u32, name: String) {
        let local = self.local.lock().unwrap().node_id == Some(node_id);
        let mut tables = self.tables.lock().unwrap();
        tables.nodes.insert(
            node_id,
            NodeEntry {
                peer,
                ip: addr,
                last_heartbeat: Instant::now(),
                name,
                local,
            },
        );
        tables.by_ip.insert(addr, node_id);
    }

    /// Drop a lease entry (peer departure).
    pub fn unregister(&self, node_id: NodeId) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(entry) = tables.nodes.remove(&node_id) {
            tables.by_ip.remove(&entry.ip);
        }
    }

    /// Resolve an address to its recorded lease holder.
    pub fn find_by_ip(&self, addr: u32) -> Option<NodeId> {
        self.tables.lock().unwrap().by_ip.get(&addr).copied()
    }

    /// Snapshot of all known leases.
    pub fn nodes(&self) -> HashMap<NodeId, NodeEntry> {
        self.tables.lock().unwrap().nodes.clone()
    }

    /// Packet-level conflict check: if the recorded holder of `source_ip`
    /// differs from the packet's sender, returns the lower-priority party
    /// `(peer, node_id)` that should be told to release. When the sender
    /// outranks the record, the index is rebound to the sender.
    pub fn detect_conflict(
        &self,
        source_ip: u32,
        sender_node: NodeId,
    ) -> Option<(PeerId, NodeId)> {
        let mut tables = self.tables.lock().unwrap();

        let recorded = *tables.by_ip.get(&source_ip)?;
        if recorded == sender_node {
            return None;
        }

        debug!("Packet-level conflict on {}", ip::format(source_ip));
        if recorded.has_priority(&sender_node) {
            let peer = tables.nodes.get(&sender_node)?.peer;
            Some((peer, sender_node))
        } else {
            let peer = tables.nodes.get(&recorded)?.peer;
            tables.by_ip.insert(source_ip, sender_node);
            Some((peer, recorded))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanmesh_proto::constants::NODE_ID_SIZE;

    struct RecordingSink {
        broadcasts: Mutex<Vec<ControlMessage>>,
        expired: Mutex<Vec<(NodeId, u32)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                broadcasts: Mutex::new(Vec::new()),
                expired: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HeartbeatSink for RecordingSink {
        async fn broadcast(&self, message: ControlMessage) {
            self.broadcasts.lock().unwrap().push(message);
        }

        async fn on_expired(&self, node_id: NodeId, addr: u32) {
            self.expired.lock().unwrap().push((node_id, addr));
        }
    }

    fn node(fill: u8) -> NodeId {
        NodeId::from_bytes([fill; NODE_ID_SIZE])
    }

    fn manager(interval_ms: u64, expiry_ms: u64, sink: Arc<RecordingSink>) -> Arc<HeartbeatManager> {
        let timing = TimingConfig {
            heartbeat_interval_ms: interval_ms,
            lease_expiry_ms: expiry_ms,
            ..TimingConfig::default()
        };
        Arc::new(HeartbeatManager::new(&timing, sink))
    }

    fn beat(ip: u32, id: NodeId) -> Heartbeat {
        Heartbeat {
            ip,
            node_id: id,
            timestamp_ms: now_ms(),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_learns_and_refreshes() {
        let sink = RecordingSink::new();
        let mgr = manager(60_000, 360_000, sink);

        mgr.handle_heartbeat(beat(100, node(1)), PeerId(5), "p".into());
        assert_eq!(mgr.find_by_ip(100), Some(node(1)));

        // Address move rebinds the index
        mgr.handle_heartbeat(beat(200, node(1)), PeerId(5), "p".into());
        assert_eq!(mgr.find_by_ip(100), None);
        assert_eq!(mgr.find_by_ip(200), Some(node(1)));
        assert_eq!(mgr.nodes().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_silent_nonlocal_leases() {
        let sink = RecordingSink::new();
        let mgr = manager(60_000, 50, sink.clone());

        mgr.initialize(node(9), 300);
        mgr.register(node(9), PeerId(1), 300, "me".into());
        mgr.handle_heartbeat(beat(100, node(1)), PeerId(5), "p".into());

        tokio::time::sleep(Duration::from_millis(80)).await;
        mgr.tick().await;

        let expired = sink.expired.lock().unwrap().clone();
        assert_eq!(expired, vec![(node(1), 100)]);
        assert_eq!(mgr.find_by_ip(100), None);

        // The local lease survives any silence
        assert!(mgr.nodes().contains_key(&node(9)));
    }

    #[tokio::test]
    async fn test_renewal_broadcast_when_due() {
        let sink = RecordingSink::new();
        let mgr = manager(50, 360_000, sink.clone());

        mgr.initialize(node(9), 300);
        mgr.tick().await;
        assert!(sink.broadcasts.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        mgr.tick().await;

        let broadcasts = sink.broadcasts.lock().unwrap();
        match broadcasts.last() {
            Some(ControlMessage::Heartbeat(hb)) => {
                assert_eq!(hb.ip, 300);
                assert_eq!(hb.node_id, node(9));
            }
            other => panic!("expected heartbeat broadcast, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_renewal_without_address() {
        let sink = RecordingSink::new();
        let mgr = manager(0, 360_000, sink.clone());

        mgr.initialize(node(9), 0);
        mgr.tick().await;
        assert!(sink.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detect_conflict_picks_lower_priority() {
        let sink = RecordingSink::new();
        let mgr = manager(60_000, 360_000, sink);

        mgr.register(node(5), PeerId(50), 400, "high".into());
        mgr.register(node(2), PeerId(20), 500, "low".into());

        // Same sender as recorded: no conflict
        assert!(mgr.detect_conflict(400, node(5)).is_none());

        // Recorded holder outranks the sender: sender must release
        assert_eq!(mgr.detect_conflict(400, node(2)), Some((PeerId(20), node(2))));

        // Sender outranks the recorded holder: record is evicted and rebound
        assert_eq!(mgr.detect_conflict(500, node(5)), Some((PeerId(20), node(2))));
        assert_eq!(mgr.find_by_ip(500), Some(node(5)));
    }

    #[tokio::test]
    async fn test_unregister_clears_both_maps() {
        let sink = RecordingSink::new();
        let mgr = manager(60_000, 360_000, sink);

        mgr.register(node(3), PeerId(30), 700, "p".into());
        mgr.unregister(node(3));

        assert!(mgr.nodes().is_empty());
        assert_eq!(mgr.find_by_ip(700), None);
    }
}
