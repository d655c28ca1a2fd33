//! Linux TUN device implementation

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use lanmesh_proto::ip;

use super::TunDevice;
use crate::error::{NetworkError, NetworkResult};

/// Linux TUN device
pub struct LinuxTun {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    name: String,
    mtu: u16,
}

impl LinuxTun {
    /// Create an unconfigured TUN device
    pub async fn create(name_hint: &str, mtu: u16) -> NetworkResult<Self> {
        let mut config = tun::Configuration::default();
        config.name(name_hint).mtu(i32::from(mtu));

        #[cfg(target_os = "linux")]
        config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .map_err(|e| NetworkError::Tun(format!("Failed to create TUN device: {}", e)))?;

        info!("Created TUN device: {} (MTU {})", name_hint, mtu);

        Ok(Self {
            device: tokio::sync::Mutex::new(device),
            name: name_hint.to_string(),
            mtu,
        })
    }
}

#[async_trait]
impl TunDevice for LinuxTun {
    async fn read(&self) -> NetworkResult<Bytes> {
        let mut buf = vec![0u8; usize::from(self.mtu) + 4];
        let mut device = self.device.lock().await;

        let n = device
            .read(&mut buf)
            .await
            .map_err(|e| NetworkError::Tun(format!("Failed to read from TUN: {}", e)))?;

        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<()> {
        if packet.len() > usize::from(self.mtu) {
            return Err(NetworkError::PacketTooLarge {
                size: packet.len(),
                mtu: self.mtu,
            });
        }

        let mut device = self.device.lock().await;
        device
            .write_all(packet)
            .await
            .map_err(|e| NetworkError::Tun(format!("Failed to write to TUN: {}", e)))?;
        Ok(())
    }

    async fn set_ip(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> NetworkResult<()> {
        let prefix = ip::netmask_to_prefix(u32::from(netmask));

        run_ip(&["addr", "flush", "dev", &self.name]).await?;
        run_ip(&[
            "addr",
            "add",
            &format!("{}/{}", address, prefix),
            "dev",
            &self.name,
        ])
        .await?;
        run_ip(&["link", "set", "dev", &self.name, "mtu", &self.mtu.to_string()]).await?;

        info!("TUN {} configured: {}/{}", self.name, address, prefix);
        Ok(())
    }

    async fn set_up(&self, up: bool) -> NetworkResult<()> {
        let state = if up { "up" } else { "down" };
        run_ip(&["link", "set", "dev", &self.name, state]).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn close(&self) -> NetworkResult<()> {
        // The fd is released when the device drops
        debug!("Closing TUN device: {}", self.name);
        Ok(())
    }
}

async fn run_ip(args: &[&str]) -> NetworkResult<()> {
    let output = Command::new("ip").args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetworkError::Tun(format!(
            "ip {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}
