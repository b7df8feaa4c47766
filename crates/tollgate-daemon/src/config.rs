// Copyright (C) 2026 tollgate developers
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::Path;
use std::time::Duration;

use ipnetwork::{Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::firewall::{FirewallBackend, ForwardingOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("at least one vpn subnet (cidr or cidr_v6) must be configured")]
    NoSubnet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub wireguard: WireGuardConfig,
    pub vpn: VpnConfig,
    pub devices: DevicesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WireGuardConfig {
    /// When off, the daemon runs against an in-memory peer table instead
    /// of a kernel interface. Useful for development off Linux.
    pub enabled: bool,
    pub interface: String,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: "wg0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VpnConfig {
    /// IPv4 client subnet. Set to none (and configure `cidr_v6`) for an
    /// IPv6-only deployment.
    pub cidr: Option<Ipv4Network>,
    pub cidr_v6: Option<Ipv6Network>,
    /// Destinations clients are allowed to reach through the VPN.
    pub allowed_ips: Vec<String>,
    /// Interface NATed client traffic leaves through.
    pub gateway_interface: Option<String>,
    pub nat44: bool,
    pub nat66: bool,
    /// Reject traffic between VPN clients.
    pub client_isolation: bool,
    /// Leave the host firewall completely alone.
    pub disable_firewall: bool,
    pub firewall_backend: FirewallBackend,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            cidr: Some("10.44.0.0/24".parse().expect("valid default subnet")),
            cidr_v6: Some("fd48:4c4:7aa9::/64".parse().expect("valid default subnet")),
            allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            gateway_interface: None,
            nat44: true,
            nat66: true,
            client_isolation: false,
            disable_firewall: false,
            firewall_backend: FirewallBackend::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevicesConfig {
    pub disable_metadata: bool,
    pub enable_inactive_eviction: bool,
    /// Devices with no activity for this long get deleted when eviction
    /// is enabled.
    pub inactive_grace_period_secs: u64,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            disable_metadata: false,
            enable_inactive_eviction: false,
            inactive_grace_period_secs: 365 * 24 * 3600,
        }
    }
}

impl AppConfig {
    /// Load the config file, or fall back to the defaults when it does
    /// not exist.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no config file found, using defaults");
                return Self::default().validated();
            }
            Err(e) => return Err(e.into()),
        };
        let config: Self = toml::from_str(&contents)?;
        config.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.vpn.cidr.is_none() && self.vpn.cidr_v6.is_none() {
            return Err(ConfigError::NoSubnet);
        }
        Ok(self)
    }

    pub fn inactive_grace_period(&self) -> Duration {
        Duration::from_secs(self.devices.inactive_grace_period_secs)
    }

    pub fn forwarding_options(&self) -> ForwardingOptions {
        ForwardingOptions {
            gateway_iface: self.vpn.gateway_interface.clone(),
            cidr_v4: self.vpn.cidr,
            cidr_v6: self.vpn.cidr_v6,
            nat44: self.vpn.nat44,
            nat66: self.vpn.nat66,
            client_isolation: self.vpn.client_isolation,
            allowed_ips: self.vpn.allowed_ips.clone(),
            disable_firewall: self.vpn.disable_firewall,
            backend: self.vpn.firewall_backend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_provide_dual_stack_full_tunnel() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.wireguard.enabled);
        assert_eq!(config.wireguard.interface, "wg0");
        assert_eq!(config.vpn.cidr.unwrap().to_string(), "10.44.0.0/24");
        assert_eq!(
            config.vpn.cidr_v6.unwrap().to_string(),
            "fd48:4c4:7aa9::/64"
        );
        assert_eq!(config.vpn.allowed_ips, vec!["0.0.0.0/0", "::/0"]);
        assert!(config.vpn.nat44 && config.vpn.nat66);
        assert!(!config.vpn.client_isolation);
        assert_eq!(config.vpn.firewall_backend, FirewallBackend::Auto);
        assert!(!config.devices.enable_inactive_eviction);
        assert_eq!(
            config.inactive_grace_period(),
            Duration::from_secs(365 * 24 * 3600)
        );
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let config = AppConfig::load(Path::new("/definitely/not/here.toml"))
            .await
            .unwrap();
        assert!(config.vpn.cidr.is_some());
    }

    #[tokio::test]
    async fn file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [wireguard]
            enabled = false
            interface = "wg7"

            [vpn]
            cidr = "192.168.99.0/24"
            client_isolation = true
            firewall_backend = "nftables"

            [devices]
            enable_inactive_eviction = true
            inactive_grace_period_secs = 86400
            "#
        )
        .unwrap();

        let config = AppConfig::load(file.path()).await.unwrap();
        assert!(!config.wireguard.enabled);
        assert_eq!(config.wireguard.interface, "wg7");
        assert_eq!(config.vpn.cidr.unwrap().to_string(), "192.168.99.0/24");
        // untouched fields keep their defaults
        assert!(config.vpn.cidr_v6.is_some());
        assert!(config.vpn.client_isolation);
        assert_eq!(config.vpn.firewall_backend, FirewallBackend::NfTables);
        assert_eq!(config.inactive_grace_period(), Duration::from_secs(86400));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<AppConfig>("[vpn]\nbogus_key = 1\n").is_err());
    }

    #[test]
    fn no_subnet_fails_validation() {
        let mut config = AppConfig::default();
        config.vpn.cidr = None;
        config.vpn.cidr_v6 = None;
        assert!(matches!(
            config.validated().unwrap_err(),
            ConfigError::NoSubnet
        ));
    }
}
