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

//! Host firewall programming for the VPN subnet.
//!
//! The forwarding policy (which destinations clients may reach, whether
//! clients see each other, whether traffic is masqueraded out a gateway
//! interface) compiles down to either iptables commands or one atomic
//! nftables script. Rule generation is pure; applying rules shells out to
//! the host tools, so the generation paths stay testable without root.

use std::process::Output;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

mod iptables;
mod nftables;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("invalid allowed ip entry {0:?}")]
    InvalidAllowedIp(String),

    #[error("{command:?} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to run {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("neither nftables nor iptables is usable on this host")]
    NoBackend,
}

/// Which rule engine to program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallBackend {
    /// Probe for nftables first, fall back to iptables.
    #[default]
    Auto,
    IpTables,
    NfTables,
}

/// Everything needed to derive the forwarding rule set.
#[derive(Debug, Clone, Default)]
pub struct ForwardingOptions {
    pub gateway_iface: Option<String>,
    pub cidr_v4: Option<Ipv4Network>,
    pub cidr_v6: Option<Ipv6Network>,
    pub nat44: bool,
    pub nat66: bool,
    pub client_isolation: bool,
    pub allowed_ips: Vec<String>,
    pub disable_firewall: bool,
    pub backend: FirewallBackend,
}

/// The per-address-family slice of the policy, after allowed-ips have been
/// partitioned by family.
#[derive(Debug, Clone)]
pub(crate) struct FamilyPolicy {
    pub(crate) cidr: String,
    pub(crate) allowed: Vec<String>,
    pub(crate) nat: bool,
    pub(crate) client_isolation: bool,
    pub(crate) gateway_iface: Option<String>,
}

/// Compile and apply the forwarding policy with the selected backend.
pub async fn configure_forwarding(options: &ForwardingOptions) -> Result<(), FirewallError> {
    if options.disable_firewall {
        info!("firewall rule management is disabled, leaving host rules untouched");
        return Ok(());
    }

    let (allowed_v4, allowed_v6) = partition_allowed_ips(&options.allowed_ips)?;

    let v4 = options.cidr_v4.map(|cidr| FamilyPolicy {
        cidr: cidr.to_string(),
        allowed: allowed_v4,
        nat: options.nat44,
        client_isolation: options.client_isolation,
        gateway_iface: options.gateway_iface.clone(),
    });
    let v6 = options.cidr_v6.map(|cidr| FamilyPolicy {
        cidr: cidr.to_string(),
        allowed: allowed_v6,
        nat: options.nat66,
        client_isolation: options.client_isolation,
        gateway_iface: options.gateway_iface.clone(),
    });

    match select_backend(options.backend).await? {
        FirewallBackend::NfTables => nftables::apply(v4.as_ref(), v6.as_ref()).await,
        FirewallBackend::IpTables => iptables::apply(v4.as_ref(), v6.as_ref()).await,
        FirewallBackend::Auto => unreachable!("select_backend resolves auto"),
    }
}

async fn select_backend(requested: FirewallBackend) -> Result<FirewallBackend, FirewallError> {
    match requested {
        FirewallBackend::NfTables | FirewallBackend::IpTables => Ok(requested),
        FirewallBackend::Auto => {
            if nftables::probe().await {
                info!("using nftables backend");
                Ok(FirewallBackend::NfTables)
            } else if iptables::probe().await {
                info!("using iptables backend");
                Ok(FirewallBackend::IpTables)
            } else {
                Err(FirewallError::NoBackend)
            }
        }
    }
}

/// Split the configured allowed-ips into per-family network lists.
///
/// Entries are normalized to their network address. IPv4-mapped IPv6
/// networks with a prefix of at least /96 describe IPv4 space and are
/// folded into the IPv4 list.
fn partition_allowed_ips(
    allowed_ips: &[String],
) -> Result<(Vec<String>, Vec<String>), FirewallError> {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for entry in allowed_ips {
        let net: IpNetwork = entry
            .trim()
            .parse()
            .map_err(|_| FirewallError::InvalidAllowedIp(entry.clone()))?;
        match net {
            IpNetwork::V4(net) => {
                let masked = Ipv4Network::new(net.network(), net.prefix())
                    .map_err(|_| FirewallError::InvalidAllowedIp(entry.clone()))?;
                v4.push(masked.to_string());
            }
            IpNetwork::V6(net) if net.prefix() >= 96 => {
                if let Some(mapped) = net.network().to_ipv4_mapped() {
                    let masked = Ipv4Network::new(mapped, net.prefix() - 96)
                        .map_err(|_| FirewallError::InvalidAllowedIp(entry.clone()))?;
                    v4.push(masked.to_string());
                } else {
                    let masked = Ipv6Network::new(net.network(), net.prefix())
                        .map_err(|_| FirewallError::InvalidAllowedIp(entry.clone()))?;
                    v6.push(masked.to_string());
                }
            }
            IpNetwork::V6(net) => {
                let masked = Ipv6Network::new(net.network(), net.prefix())
                    .map_err(|_| FirewallError::InvalidAllowedIp(entry.clone()))?;
                v6.push(masked.to_string());
            }
        }
    }
    Ok((v4, v6))
}

pub(crate) async fn run_command(
    program: &str,
    args: &[String],
) -> Result<Output, FirewallError> {
    let rendered = format!("{program} {}", args.join(" "));
    debug!(command = %rendered, "running firewall command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| FirewallError::Spawn {
            command: rendered.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(FirewallError::CommandFailed {
            command: rendered,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn partition_splits_families_and_unmaps_v4() {
        let allowed = vec![
            "0.0.0.0/0".to_string(),
            "::/0".to_string(),
            "::ffff:10.10.0.0/120".to_string(),
            "10.1.2.3/8".to_string(),
        ];
        let (v4, v6) = partition_allowed_ips(&allowed).unwrap();
        assert_eq!(v4, vec!["0.0.0.0/0", "10.10.0.0/24", "10.0.0.0/8"]);
        assert_eq!(v6, vec!["::/0"]);
    }

    #[test_case("garbage" ; "not an address")]
    #[test_case("10.0.0.0/33" ; "prefix too long")]
    fn partition_rejects_bad_entries(entry: &str) {
        let err = partition_allowed_ips(&[entry.to_string()]).unwrap_err();
        assert!(matches!(err, FirewallError::InvalidAllowedIp(_)));
    }

    #[test]
    fn short_mapped_prefix_stays_v6() {
        let (v4, v6) = partition_allowed_ips(&["::fffe:0:0/95".to_string()]).unwrap();
        assert!(v4.is_empty());
        assert_eq!(v6, vec!["::fffe:0:0/95"]);
    }

    #[tokio::test]
    async fn disabled_firewall_is_a_noop() {
        let options = ForwardingOptions {
            disable_firewall: true,
            ..Default::default()
        };
        configure_forwarding(&options).await.unwrap();
    }
}
