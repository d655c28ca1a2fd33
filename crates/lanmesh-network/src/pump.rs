//! Inbound message pump
//!
//! A single task polls the transport and hands every datagram to the
//! registered handler. Polling backs off adaptively: a batch with at least
//! one message resets the interval to the floor; an empty batch widens it
//! by one step up to the ceiling. Session events are drained on the same
//! task so membership checks and data dispatch never race.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use lanmesh_proto::PeerId;

use crate::transport::{SessionEvent, Transport};

/// Shortest polling interval
const POLL_MIN: Duration = Duration::from_micros(100);

/// Longest polling interval
const POLL_MAX: Duration = Duration::from_millis(1);

/// Back-off increment per empty poll
const POLL_STEP: Duration = Duration::from_micros(100);

/// Datagrams drained per poll cycle
const MAX_BATCH: usize = 32;

/// Consumer of inbound datagrams (the VPN bridge).
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_datagram(&self, from: PeerId, data: Bytes);
}

/// Adaptive transport poller
pub struct MessagePump {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn InboundHandler>,
    running: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MessagePump {
    /// Create a pump wired to a transport and a handler
    pub fn new(transport: Arc<dyn Transport>, handler: Arc<dyn InboundHandler>) -> Self {
        Self {
            transport,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Start the polling task. No-op if already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let transport = Arc::clone(&self.transport);
        let handler = Arc::clone(&self.handler);
        let running = Arc::clone(&self.running);

        let task = tokio::spawn(async move {
            debug!("Message pump started");
            let mut interval = POLL_MIN;

            while running.load(Ordering::Relaxed) {
                for event in transport.poll_session_events().await {
                    handle_session_event(&*transport, event).await;
                }

                let batch = transport.poll_inbound(MAX_BATCH).await;

                if batch.is_empty() {
                    interval = (interval + POLL_STEP).min(POLL_MAX);
                } else {
                    interval = POLL_MIN;
                    for datagram in batch {
                        handler.on_datagram(datagram.from, datagram.data).await;
                    }
                }

                tokio::time::sleep(interval).await;
            }

            debug!("Message pump stopped");
        });

        *self.task.lock().unwrap() = Some(task);
    }

    /// Stop the polling task and wait for it to exit.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
    }

    /// Whether the pump task is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Accept session requests from current members; retry the hello for
/// failed sessions of peers that are still present.
async fn handle_session_event(transport: &dyn Transport, event: SessionEvent) {
    match event {
        SessionEvent::Request(peer) => {
            if transport.members().await.contains(&peer) {
                trace!("Accepting session request from {}", peer);
                if let Err(e) = transport.accept_session(peer).await {
                    warn!("Failed to accept session from {}: {}", peer, e);
                }
            } else {
                debug!("Ignoring session request from non-member {}", peer);
            }
        }
        SessionEvent::Failed(peer) => {
            if transport.members().await.contains(&peer) {
                debug!("Session with {} failed, retrying hello", peer);
                if let Err(e) = transport.open_session(peer).await {
                    warn!("Session retry to {} failed: {}", peer, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHub;
    use crate::transport::Delivery;
    use std::sync::Mutex;

    struct Collector {
        seen: Mutex<Vec<(PeerId, Bytes)>>,
    }

    #[async_trait]
    impl InboundHandler for Collector {
        async fn on_datagram(&self, from: PeerId, data: Bytes) {
            self.seen.lock().unwrap().push((from, data));
        }
    }

    #[tokio::test]
    async fn test_pump_delivers_datagrams() {
        let hub = MemoryHub::new();
        let a = hub.join(PeerId(1), "a");
        let b = hub.join(PeerId(2), "b");

        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
        });
        let pump = MessagePump::new(Arc::new(b), collector.clone());
        pump.start();

        a.send_to(PeerId(2), Bytes::from_static(b"hello"), Delivery::Reliable)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        pump.stop().await;

        let seen = collector.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, PeerId(1));
        assert_eq!(&seen[0].1[..], b"hello");
    }

    #[tokio::test]
    async fn test_pump_accepts_member_sessions() {
        let hub = MemoryHub::new();
        let a = hub.join(PeerId(1), "a");
        let _b = hub.join(PeerId(2), "b");

        hub.raise_session_request(PeerId(1), PeerId(2));

        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
        });
        let a = Arc::new(a);
        let pump = MessagePump::new(a.clone(), collector);
        pump.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        pump.stop().await;

        assert!(a.is_connected(PeerId(2)).await);
    }
}
