//! Overlay configuration

use serde::{Deserialize, Serialize};

use lanmesh_proto::constants;
use lanmesh_proto::ip;

/// VPN overlay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    /// Virtual subnet base address (e.g. "10.0.0.0")
    pub subnet: String,

    /// Subnet mask (e.g. "255.255.255.0")
    pub netmask: String,

    /// TUN device name hint
    pub tun_name: String,

    /// MTU override; 0 derives the MTU from the transport budget
    pub mtu: u16,

    /// Salt mixed into node ID derivation. Peers with different salts
    /// cannot arbitrate against each other.
    pub node_salt: String,

    /// Protocol timing
    pub timing: TimingConfig,
}

/// Protocol timing knobs (milliseconds)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Probe tie-break window
    pub probe_timeout_ms: u64,

    /// Interval between liveness heartbeats
    pub heartbeat_interval_ms: u64,

    /// Lease grace value; retained for configuration compatibility
    pub lease_time_ms: u64,

    /// Age at which a silent node's lease is evicted
    pub lease_expiry_ms: u64,

    /// Age at which a conflict reporter's heartbeat counts as stale
    pub heartbeat_expiry_ms: u64,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            subnet: constants::DEFAULT_SUBNET.to_string(),
            netmask: constants::DEFAULT_NETMASK.to_string(),
            tun_name: "lanmesh0".to_string(),
            mtu: 0,
            node_salt: constants::APP_SECRET_SALT.to_string(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: constants::PROBE_TIMEOUT_MS,
            heartbeat_interval_ms: constants::HEARTBEAT_INTERVAL_MS,
            lease_time_ms: constants::LEASE_TIME_MS,
            lease_expiry_ms: constants::LEASE_EXPIRY_MS,
            heartbeat_expiry_ms: constants::HEARTBEAT_EXPIRY_MS,
        }
    }
}

impl VpnConfig {
    /// Parse and check the subnet definition.
    /// Returns `(base_ip, netmask)` in host byte order.
    pub fn subnet_pair(&self) -> Result<(u32, u32), String> {
        let base = ip::parse(&self.subnet)
            .ok_or_else(|| format!("Invalid subnet address: {}", self.subnet))?;
        let mask = ip::parse(&self.netmask)
            .ok_or_else(|| format!("Invalid netmask: {}", self.netmask))?;
        Ok((base, mask))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let (_, mask) = self.subnet_pair()?;

        let prefix = ip::netmask_to_prefix(mask);
        if ip::prefix_to_netmask(prefix) != mask {
            return Err(format!("Netmask {} is not contiguous", self.netmask));
        }
        if ip::usable_hosts(mask) < 2 {
            return Err(format!("Subnet {}/{} has no room for peers", self.subnet, prefix));
        }
        if self.timing.probe_timeout_ms == 0 {
            return Err("Probe timeout must be non-zero".into());
        }
        if self.timing.heartbeat_interval_ms >= self.timing.lease_expiry_ms {
            return Err("Lease expiry must exceed the heartbeat interval".into());
        }
        Ok(())
    }

    /// Salt bytes for node ID derivation
    pub fn salt_bytes(&self) -> Vec<u8> {
        self.node_salt.as_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(VpnConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_subnet() {
        let mut config = VpnConfig::default();
        config.subnet = "not-an-ip".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_discontiguous_mask() {
        let mut config = VpnConfig::default();
        config.netmask = "255.0.255.0".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_subnet() {
        let mut config = VpnConfig::default();
        config.netmask = "255.255.255.255".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_lease_shorter_than_heartbeat() {
        let mut config = VpnConfig::default();
        config.timing.heartbeat_interval_ms = 10_000;
        config.timing.lease_expiry_ms = 5_000;
        assert!(config.validate().is_err());
    }
}
