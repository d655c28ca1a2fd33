//! Virtual-IP routing table
//!
//! Maps virtual addresses to the peers that own them. All mutations happen
//! under one mutex; related removals and the insert of an `upsert` share a
//! single critical section so readers never observe a peer with two
//! addresses.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use lanmesh_proto::message::{decode_route_tuples, encode_route_tuple};
use lanmesh_proto::{ip, NodeId, PeerId, ProtoResult};

use lanmesh_network::PeerDirectory;

/// One routing table entry
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// Owning peer
    pub peer: PeerId,
    /// Virtual address (host order)
    pub ip: u32,
    /// Display name of the peer
    pub name: String,
    /// True iff the owning peer is this process
    pub local: bool,
    /// Owner's node ID
    pub node_id: NodeId,
}

/// Thread-safe IP → peer routing table
pub struct RouteTable {
    inner: Mutex<BTreeMap<u32, RouteEntry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Insert or replace the route for `ip`. Any other address the same
    /// peer held is removed in the same critical section, so each peer
    /// owns at most one entry.
    pub fn upsert(&self, node_id: NodeId, peer: PeerId, addr: u32, name: String, local_peer: PeerId) {
        let entry = RouteEntry {
            peer,
            ip: addr,
            name,
            local: peer == local_peer,
            node_id,
        };

        {
            let mut table = self.inner.lock().unwrap();
            table.retain(|&existing, e| e.peer != peer || existing == addr);
            table.insert(addr, entry);
        }

        debug!("Route updated: {} -> {}", ip::format(addr), peer);
    }

    /// Remove the route for one address.
    pub fn remove(&self, addr: u32) {
        self.inner.lock().unwrap().remove(&addr);
    }

    /// Remove every route owned by `peer`, returning the removed
    /// `(address, node_id)` pairs.
    pub fn remove_all_for_peer(&self, peer: PeerId) -> Vec<(u32, NodeId)> {
        let mut removed = Vec::new();
        let mut table = self.inner.lock().unwrap();
        table.retain(|&ip, entry| {
            if entry.peer == peer {
                removed.push((ip, entry.node_id));
                false
            } else {
                true
            }
        });
        removed
    }

    /// Look up the route for an address.
    pub fn lookup(&self, addr: u32) -> Option<RouteEntry> {
        self.inner.lock().unwrap().get(&addr).cloned()
    }

    /// Whether an address is routed.
    pub fn contains(&self, addr: u32) -> bool {
        self.inner.lock().unwrap().contains_key(&addr)
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> BTreeMap<u32, RouteEntry> {
        self.inner.lock().unwrap().clone()
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Drop every route.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// Serialize the table as repeated 12-byte peer/address tuples.
    pub fn encode_table(&self) -> Bytes {
        let table = self.inner.lock().unwrap();
        let mut buf = BytesMut::with_capacity(table.len() * 12);
        for entry in table.values() {
            encode_route_tuple(&mut buf, entry.peer, entry.ip);
        }
        buf.freeze()
    }

    /// Merge a received route export into the table.
    ///
    /// Tuples naming this process, addresses already routed, and addresses
    /// outside the configured subnet are skipped. Returns the entries that
    /// were actually added so the caller can mark their addresses as used.
    /// Never triggers any re-broadcast.
    pub fn ingest(
        &self,
        payload: &[u8],
        base: u32,
        mask: u32,
        local_peer: PeerId,
        salt: &[u8],
        directory: &dyn PeerDirectory,
    ) -> ProtoResult<Vec<RouteEntry>> {
        let tuples = decode_route_tuples(payload)?;
        let mut added = Vec::new();

        for tuple in tuples {
            if tuple.peer == local_peer {
                continue;
            }
            if self.contains(tuple.ip) {
                continue;
            }
            if !ip::in_subnet(tuple.ip, base, mask) {
                continue;
            }

            let node_id = NodeId::generate(tuple.peer, salt);
            let name = directory.name_of(tuple.peer);
            self.upsert(node_id, tuple.peer, tuple.ip, name.clone(), local_peer);

            added.push(RouteEntry {
                peer: tuple.peer,
                ip: tuple.ip,
                name,
                local: false,
                node_id,
            });
        }

        Ok(added)
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
