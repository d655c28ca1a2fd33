//! Windows TUN device implementation using WinTun
//!
//! Requires wintun.dll next to the executable and Administrator
//! privileges. The adapter GUID is derived from a hash of the name hint so
//! repeated runs reuse the same OS-level interface instead of piling up
//! ghost adapters.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use lanmesh_proto::ip;

use super::TunDevice;
use crate::error::{NetworkError, NetworkResult};

/// Ring buffer size for WinTun (must be a power of 2)
const RING_CAPACITY: u32 = 0x40_0000;

/// Windows TUN device using WinTun
pub struct WindowsTun {
    session: Arc<wintun::Session>,
    // Kept so the adapter outlives the session
    _adapter: Arc<wintun::Adapter>,
    name: String,
    mtu: u16,
    running: Arc<AtomicBool>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    recv_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WindowsTun {
    /// Create (or reopen) the adapter identified by the name hint.
    pub async fn create(name_hint: &str, mtu: u16) -> NetworkResult<Self> {
        info!("Loading WinTun driver...");

        let wintun = unsafe { wintun::load() }.map_err(|e| {
            NetworkError::Tun(format!(
                "Failed to load wintun.dll: {}. \
                 Place wintun.dll next to the executable.",
                e
            ))
        })?;

        let guid = adapter_guid(name_hint);
        info!("Creating adapter '{}'...", name_hint);

        let adapter = match wintun::Adapter::open(&wintun, name_hint) {
            Ok(existing) => existing,
            Err(_) => wintun::Adapter::create(&wintun, name_hint, "LanMesh", Some(guid))
                .map_err(|e| NetworkError::Tun(format!("Failed to create adapter: {}", e)))?,
        };

        let session = adapter
            .start_session(RING_CAPACITY)
            .map_err(|e| NetworkError::Tun(format!("Failed to start session: {}", e)))?;

        let session = Arc::new(session);
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel::<Bytes>(1024);
        let recv_task = spawn_receive_task(session.clone(), running.clone(), tx);

        info!("WinTun adapter '{}' ready (MTU {})", name_hint, mtu);

        Ok(Self {
            session,
            _adapter: adapter,
            name: name_hint.to_string(),
            mtu,
            running,
            rx: Mutex::new(rx),
            recv_task: Mutex::new(Some(recv_task)),
        })
    }
}

#[async_trait]
impl TunDevice for WindowsTun {
    async fn read(&self) -> NetworkResult<Bytes> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| NetworkError::Tun("Receive channel closed".into()))
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<()> {
        if packet.len() > usize::from(self.mtu) {
            return Err(NetworkError::PacketTooLarge {
                size: packet.len(),
                mtu: self.mtu,
            });
        }
        if !self.running.load(Ordering::Relaxed) {
            return Err(NetworkError::Tun("Adapter is closed".into()));
        }

        let session = self.session.clone();
        let data = packet.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut send_packet = session
                .allocate_send_packet(data.len() as u16)
                .map_err(|e| NetworkError::Tun(format!("Failed to allocate packet: {}", e)))?;
            send_packet.bytes_mut().copy_from_slice(&data);
            session.send_packet(send_packet);
            Ok::<(), NetworkError>(())
        })
        .await
        .map_err(|e| NetworkError::Tun(format!("Task join error: {}", e)))??;

        Ok(())
    }

    async fn set_ip(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> NetworkResult<()> {
        let output = Command::new("netsh")
            .args([
                "interface",
                "ip",
                "set",
                "address",
                &self.name,
                "static",
                &address.to_string(),
                &netmask.to_string(),
            ])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::Tun(format!(
                "Failed to configure adapter IP: {}",
                stderr.trim()
            )));
        }

        let _ = Command::new("netsh")
            .args([
                "interface",
                "ipv4",
                "set",
                "subinterface",
                &self.name,
                &format!("mtu={}", self.mtu),
                "store=persistent",
            ])
            .output()
            .await;

        let prefix = ip::netmask_to_prefix(u32::from(netmask));
        info!("Adapter {} configured: {}/{}", self.name, address, prefix);
        Ok(())
    }

    async fn set_up(&self, _up: bool) -> NetworkResult<()> {
        // WinTun adapters are up while the session is active
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn close(&self) -> NetworkResult<()> {
        info!("Closing WinTun adapter: {}", self.name);
        self.running.store(false, Ordering::SeqCst);

        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for WindowsTun {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        debug!("WindowsTun dropped");
    }
}

/// Deterministic adapter GUID from the name hint, so every run of the same
/// configuration lands on the same OS interface.
fn adapter_guid(name_hint: &str) -> u128 {
    let digest = Sha256::digest(name_hint.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    u128::from_le_bytes(bytes)
}

/// Blocking receive loop feeding the async read channel
fn spawn_receive_task(
    session: Arc<wintun::Session>,
    running: Arc<AtomicBool>,
    tx: mpsc::Sender<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while running.load(Ordering::Relaxed) {
            match session.receive_blocking() {
                Ok(packet) => {
                    let bytes = Bytes::copy_from_slice(packet.bytes());
                    if tx.blocking_send(bytes).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if running.load(Ordering::Relaxed) {
                        warn!("WinTun receive error: {}", e);
                    }
                    break;
                }
            }
        }
        debug!("WinTun receive task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_guid_is_deterministic() {
        assert_eq!(adapter_guid("lanmesh0"), adapter_guid("lanmesh0"));
        assert_ne!(adapter_guid("lanmesh0"), adapter_guid("lanmesh1"));
    }
}
