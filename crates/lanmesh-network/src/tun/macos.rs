//! macOS utun device implementation

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use super::TunDevice;
use crate::error::{NetworkError, NetworkResult};

/// macOS utun device
pub struct MacOsTun {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    name: String,
    mtu: u16,
}

impl MacOsTun {
    /// Create an unconfigured utun device. The kernel only accepts
    /// `utunN` names, so other hints fall back to a fixed unit.
    pub async fn create(name_hint: &str, mtu: u16) -> NetworkResult<Self> {
        let name = if name_hint.starts_with("utun") {
            name_hint.to_string()
        } else {
            "utun7".to_string()
        };

        let mut config = tun::Configuration::default();
        config.name(&name).mtu(i32::from(mtu));

        let device = tun::create_as_async(&config)
            .map_err(|e| NetworkError::Tun(format!("Failed to create utun device: {}", e)))?;

        info!("Created utun device: {} (MTU {})", name, mtu);

        Ok(Self {
            device: tokio::sync::Mutex::new(device),
            name,
            mtu,
        })
    }
}

#[async_trait]
impl TunDevice for MacOsTun {
    async fn read(&self) -> NetworkResult<Bytes> {
        let mut buf = vec![0u8; usize::from(self.mtu) + 4];
        let mut device = self.device.lock().await;

        let n = device
            .read(&mut buf)
            .await
            .map_err(|e| NetworkError::Tun(format!("Failed to read from utun: {}", e)))?;

        // utun prefixes every packet with a 4-byte protocol-family header
        if n > 4 {
            Ok(Bytes::from(buf[4..n].to_vec()))
        } else {
            Ok(Bytes::new())
        }
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<()> {
        if packet.len() > usize::from(self.mtu) {
            return Err(NetworkError::PacketTooLarge {
                size: packet.len(),
                mtu: self.mtu,
            });
        }

        // Prepend the protocol-family header (AF_INET = 2)
        let mut buf = vec![0u8; packet.len() + 4];
        buf[3] = 2;
        buf[4..].copy_from_slice(packet);

        let mut device = self.device.lock().await;
        device
            .write_all(&buf)
            .await
            .map_err(|e| NetworkError::Tun(format!("Failed to write to utun: {}", e)))?;
        Ok(())
    }

    async fn set_ip(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> NetworkResult<()> {
        // utun is point-to-point: address doubles as the peer
        let output = Command::new("ifconfig")
            .args([
                &self.name,
                &address.to_string(),
                &address.to_string(),
                "netmask",
                &netmask.to_string(),
                "mtu",
                &self.mtu.to_string(),
                "up",
            ])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::Tun(format!(
                "ifconfig failed: {}",
                stderr.trim()
            )));
        }

        info!("utun {} configured: {}", self.name, address);
        Ok(())
    }

    async fn set_up(&self, _up: bool) -> NetworkResult<()> {
        // ifconfig in set_ip brings the interface up
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn close(&self) -> NetworkResult<()> {
        debug!("Closing utun device: {}", self.name);
        Ok(())
    }
}
