//! TUN Device Abstraction
//!
//! Platform-agnostic layer-3 virtual interface with implementations for:
//! - Linux (tun crate + iproute2)
//! - macOS (tun crate + ifconfig)
//! - Windows (wintun)
//!
//! Devices are created unconfigured; the overlay assigns the address once
//! negotiation settles.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::NetworkResult;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::MacOsTun;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::WindowsTun;

/// Platform-agnostic TUN device trait
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read exactly one IP packet. Blocks until a packet arrives or the
    /// device is closed; partial reads are not possible.
    async fn read(&self) -> NetworkResult<Bytes>;

    /// Submit exactly one IP packet. Packets larger than the MTU are
    /// rejected; there is no partial send.
    async fn write(&self, packet: &[u8]) -> NetworkResult<()>;

    /// Assign the interface address and netmask, and apply the MTU.
    async fn set_ip(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> NetworkResult<()>;

    /// Bring the interface up or down. No-op on platforms where the
    /// device comes up with the session.
    async fn set_up(&self, up: bool) -> NetworkResult<()>;

    /// Get device name
    fn name(&self) -> &str;

    /// Get device MTU
    fn mtu(&self) -> u16;

    /// Release all OS resources. Pending reads unblock with an error.
    async fn close(&self) -> NetworkResult<()>;
}

/// Create a TUN device for the current platform
pub async fn create_tun(name_hint: &str, mtu: u16) -> NetworkResult<Box<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        let tun = LinuxTun::create(name_hint, mtu).await?;
        Ok(Box::new(tun))
    }

    #[cfg(target_os = "macos")]
    {
        let tun = MacOsTun::create(name_hint, mtu).await?;
        Ok(Box::new(tun))
    }

    #[cfg(target_os = "windows")]
    {
        let tun = WindowsTun::create(name_hint, mtu).await?;
        Ok(Box::new(tun))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        let _ = (name_hint, mtu);
        Err(crate::error::NetworkError::PlatformNotSupported)
    }
}
