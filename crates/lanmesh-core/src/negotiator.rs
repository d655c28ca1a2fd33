//! Distributed IP self-assignment
//!
//! Each peer picks a candidate address seeded from its node ID, probes the
//! lobby for conflicts, and claims the address after the tie-break window
//! if no higher-priority node objects. Arbitration is by node-ID order:
//! the larger ID keeps the address, the smaller one reselects with an
//! incremented offset. Negotiation never gives up; it walks the host space
//! until it converges.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use lanmesh_proto::message::{
    AddressAnnounce, ControlMessage, ForcedRelease, ProbeRequest, ProbeResponse,
};
use lanmesh_proto::{ip, NodeId, PeerId};

use crate::config::TimingConfig;

/// Negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NegotiationState {
    Idle = 0,
    Probing = 1,
    Stable = 2,
}

impl NegotiationState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Probing,
            2 => Self::Stable,
            _ => Self::Idle,
        }
    }
}

/// A conflict response collected during the current probe window
#[derive(Debug, Clone, Copy)]
pub struct ConflictInfo {
    /// Reporter's node ID
    pub node_id: NodeId,
    /// Reporter's last heartbeat, wall-clock milliseconds
    pub last_heartbeat_ms: i64,
    /// Reporting peer
    pub peer: PeerId,
}

/// Outbound side of the negotiator, supplied by the bridge.
#[async_trait]
pub trait NegotiatorSink: Send + Sync {
    /// Send a control message to one peer (reliable).
    async fn send(&self, peer: PeerId, message: ControlMessage);

    /// Send a control message to the whole lobby (reliable).
    async fn broadcast(&self, message: ControlMessage);

    /// The local address was claimed successfully.
    async fn on_stable(&self, addr: u32, node_id: NodeId);
}

struct Inner {
    state: NegotiationState,
    candidate: u32,
    probe_offset: u32,
    probe_start: Instant,
    local_ip: u32,
    conflicts: Vec<ConflictInfo>,
    used: BTreeSet<u32>,
}

enum Outgoing {
    Send(PeerId, ControlMessage),
    Broadcast(ControlMessage),
    Stable(u32, NodeId),
}

/// Distributed address negotiator
pub struct IpNegotiator {
    node_id: NodeId,
    base_ip: u32,
    mask: u32,
    probe_timeout: Duration,
    heartbeat_expiry_ms: i64,
    inner: Mutex<Inner>,
    state_cell: AtomicU8,
    ip_cell: AtomicU32,
    sink: Arc<dyn NegotiatorSink>,
}

impl IpNegotiator {
    pub fn new(
        node_id: NodeId,
        base_ip: u32,
        mask: u32,
        timing: &TimingConfig,
        sink: Arc<dyn NegotiatorSink>,
    ) -> Self {
        Self {
            node_id,
            base_ip,
            mask,
            probe_timeout: Duration::from_millis(timing.probe_timeout_ms),
            heartbeat_expiry_ms: timing.heartbeat_expiry_ms as i64,
            inner: Mutex::new(Inner {
                state: NegotiationState::Idle,
                candidate: 0,
                probe_offset: 0,
                probe_start: Instant::now(),
                local_ip: 0,
                conflicts: Vec::new(),
                used: BTreeSet::new(),
            }),
            state_cell: AtomicU8::new(NegotiationState::Idle as u8),
            ip_cell: AtomicU32::new(0),
            sink,
        }
    }

    /// Current phase (lock-free observation)
    pub fn state(&self) -> NegotiationState {
        NegotiationState::from_u8(self.state_cell.load(Ordering::Relaxed))
    }

    /// Claimed address, 0 until stable (lock-free observation)
    pub fn local_ip(&self) -> u32 {
        self.ip_cell.load(Ordering::Relaxed)
    }

    /// Address currently being probed
    pub fn candidate_ip(&self) -> u32 {
        self.inner.lock().unwrap().candidate
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Begin (or restart) negotiation.
    pub async fn start(&self) {
        let out = {
            let mut inner = self.inner.lock().unwrap();
            vec![self.begin_probe(&mut inner)]
        };
        self.flush(out).await;
    }

    /// Drive the probe window. Called at least every 50 ms while probing.
    pub async fn check_timeout(&self) {
        let out = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != NegotiationState::Probing {
                return;
            }
            if inner.probe_start.elapsed() < self.probe_timeout {
                return;
            }

            let conflicts = std::mem::take(&mut inner.conflicts);
            let now = now_ms();
            let mut losers = Vec::new();
            let mut can_claim = true;

            for conflict in &conflicts {
                let heartbeat_age = now - conflict.last_heartbeat_ms;
                if heartbeat_age >= self.heartbeat_expiry_ms {
                    debug!(
                        "Ignoring stale conflict from {:?} (heartbeat age {} ms)",
                        conflict.node_id, heartbeat_age
                    );
                    continue;
                }
                if self.node_id.has_priority(&conflict.node_id) {
                    losers.push(conflict.peer);
                } else {
                    can_claim = false;
                    break;
                }
            }

            let mut out = Vec::new();
            if can_claim {
                for peer in losers {
                    out.push(Outgoing::Send(
                        peer,
                        ControlMessage::ForcedRelease(ForcedRelease {
                            ip: inner.candidate,
                            winner: self.node_id,
                        }),
                    ));
                }

                inner.state = NegotiationState::Stable;
                inner.local_ip = inner.candidate;
                self.state_cell
                    .store(NegotiationState::Stable as u8, Ordering::Relaxed);
                self.ip_cell.store(inner.local_ip, Ordering::Relaxed);

                info!("Address negotiation settled: {}", ip::format(inner.local_ip));

                out.push(Outgoing::Broadcast(ControlMessage::AddressAnnounce(
                    AddressAnnounce {
                        ip: inner.local_ip,
                        node_id: self.node_id,
                    },
                )));
                out.push(Outgoing::Stable(inner.local_ip, self.node_id));
            } else {
                debug!("Lost address arbitration, reselecting");
                inner.probe_offset += 1;
                out.push(self.begin_probe(&mut inner));
            }
            out
        };
        self.flush(out).await;
    }

    /// Another peer probes an address.
    pub async fn handle_probe_request(&self, request: ProbeRequest, from: PeerId) {
        let out = {
            let mut inner = self.inner.lock().unwrap();

            let contested = match inner.state {
                NegotiationState::Stable => request.ip == inner.local_ip,
                NegotiationState::Probing => request.ip == inner.candidate,
                NegotiationState::Idle => false,
            };
            if !contested {
                Vec::new()
            } else if inner.state == NegotiationState::Stable
                || self.node_id.has_priority(&request.node_id)
            {
                vec![Outgoing::Send(
                    from,
                    ControlMessage::ProbeResponse(ProbeResponse {
                        ip: request.ip,
                        node_id: self.node_id,
                        last_heartbeat_ms: now_ms(),
                    }),
                )]
            } else {
                // Simultaneous probe for the same address, and they outrank us
                debug!("Lost probe contention, reselecting");
                inner.probe_offset += 1;
                vec![self.begin_probe(&mut inner)]
            }
        };
        self.flush(out).await;
    }

    /// A peer reports holding or contesting our candidate.
    pub async fn handle_probe_response(&self, response: ProbeResponse, from: PeerId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != NegotiationState::Probing || response.ip != inner.candidate {
            return;
        }
        debug!("Conflict response from {:?}", response.node_id);
        inner.conflicts.push(ConflictInfo {
            node_id: response.node_id,
            last_heartbeat_ms: response.last_heartbeat_ms,
            peer: from,
        });
    }

    /// A peer announces a claimed address.
    pub async fn handle_address_announce(&self, announce: AddressAnnounce, from: PeerId) {
        let out = {
            let mut inner = self.inner.lock().unwrap();
            let mut out = Vec::new();

            if inner.state == NegotiationState::Stable && announce.ip == inner.local_ip {
                if announce.node_id.has_priority(&self.node_id) {
                    warn!(
                        "Address {} claimed by higher-priority node, reselecting",
                        ip::format(announce.ip)
                    );
                    inner.probe_offset += 1;
                    out.push(self.begin_probe(&mut inner));
                } else {
                    out.push(Outgoing::Send(
                        from,
                        ControlMessage::ForcedRelease(ForcedRelease {
                            ip: announce.ip,
                            winner: self.node_id,
                        }),
                    ));
                }
            }

            inner.used.insert(announce.ip);
            out
        };
        self.flush(out).await;
    }

    /// A higher-priority winner orders us off an address.
    pub async fn handle_forced_release(&self, release: ForcedRelease, _from: PeerId) {
        let out = {
            let mut inner = self.inner.lock().unwrap();

            let targets_us = match inner.state {
                NegotiationState::Stable => release.ip == inner.local_ip,
                NegotiationState::Probing => release.ip == inner.candidate,
                NegotiationState::Idle => false,
            };
            if targets_us && release.winner.has_priority(&self.node_id) {
                info!("Forced to release {}, reselecting", ip::format(release.ip));
                inner.probe_offset += 1;
                vec![self.begin_probe(&mut inner)]
            } else {
                Vec::new()
            }
        };
        self.flush(out).await;
    }

    /// Announce our claimed address to one peer (late joiner).
    pub async fn announce_to(&self, peer: PeerId) {
        let announce = {
            let inner = self.inner.lock().unwrap();
            if inner.state != NegotiationState::Stable || inner.local_ip == 0 {
                return;
            }
            ControlMessage::AddressAnnounce(AddressAnnounce {
                ip: inner.local_ip,
                node_id: self.node_id,
            })
        };
        self.sink.send(peer, announce).await;
    }

    /// Record that an address is held by someone, so candidate walks skip it.
    pub fn mark_ip_used(&self, addr: u32) {
        self.inner.lock().unwrap().used.insert(addr);
    }

    /// Free an address for future candidate walks.
    pub fn mark_ip_unused(&self, addr: u32) {
        self.inner.lock().unwrap().used.remove(&addr);
    }

    /// Reset probe bookkeeping and emit the next probe. Caller holds the lock.
    fn begin_probe(&self, inner: &mut Inner) -> Outgoing {
        inner.conflicts.clear();
        let seeded = self.generate_candidate(inner.probe_offset);
        inner.candidate = self.next_free(seeded, &inner.used);
        inner.state = NegotiationState::Probing;
        inner.probe_start = Instant::now();
        self.state_cell
            .store(NegotiationState::Probing as u8, Ordering::Relaxed);

        info!(
            "Probing {} (offset {})",
            ip::format(inner.candidate),
            inner.probe_offset
        );

        Outgoing::Broadcast(ControlMessage::ProbeRequest(ProbeRequest {
            ip: inner.candidate,
            node_id: self.node_id,
        }))
    }

    /// Deterministic candidate: low 24 bits of the node ID plus the offset,
    /// folded into the subnet's usable host range.
    fn generate_candidate(&self, offset: u32) -> u32 {
        let seed = self.node_id.low24().wrapping_add(offset) & 0x00FF_FFFF;
        let hosts = ip::usable_hosts(self.mask);
        let host_part = (seed % hosts) + 1;
        (self.base_ip & self.mask) | host_part
    }

    /// Walk forward from `start`, skipping addresses believed used.
    /// Wraps at the end of the host range; the used set is advisory, so a
    /// full wrap falls back to the start address.
    fn next_free(&self, start: u32, used: &BTreeSet<u32>) -> u32 {
        let host_mask = !self.mask;
        let hosts = ip::usable_hosts(self.mask);

        let mut host = start & host_mask;
        if host == 0 || host >= host_mask {
            host = 1;
        }

        let mut candidate = (self.base_ip & self.mask) | host;
        let mut attempts = 0;
        while used.contains(&candidate) && attempts < hosts {
            host += 1;
            if host >= host_mask {
                host = 1;
            }
            candidate = (self.base_ip & self.mask) | host;
            attempts += 1;
        }
        candidate
    }

    async fn flush(&self, out: Vec<Outgoing>) {
        for item in out {
            match item {
                Outgoing::Send(peer, message) => self.sink.send(peer, message).await,
                Outgoing::Broadcast(message) => self.sink.broadcast(message).await,
                Outgoing::Stable(addr, node_id) => self.sink.on_stable(addr, node_id).await,
            }
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
