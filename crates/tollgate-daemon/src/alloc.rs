use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use tollgate_types::join_addresses;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("there are no free addresses left in the vpn subnet {subnet}")]
    ExhaustedPool { subnet: String },

    #[error("invalid manual address: {0}")]
    InvalidAddress(String),

    #[error("manual address {address} is not an {family} address")]
    WrongFamily { address: String, family: &'static str },

    #[error("manual address {address} is not in the configured subnet {subnet}")]
    OutsideSubnet { address: String, subnet: String },

    #[error("manual address {0} is reserved")]
    AddressReserved(String),

    #[error("manual address {0} is already in use")]
    AddressInUse(String),

    #[error("manual {family} assignment not possible, the {family} subnet is not configured")]
    FamilyNotConfigured { family: &'static str },

    #[error("manual assignment requested but no address provided")]
    NoManualAddress,
}

/// A manually requested address pair for [`AddressAllocator::validate_manual`].
#[derive(Debug, Clone, Default)]
pub struct ManualAddress {
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

/// Allocates client addresses out of the configured VPN subnet(s).
///
/// The first two addresses of each subnet (the network address and the
/// server's own address, network + 1) are permanently reserved. Automatic
/// allocation returns the numerically smallest free address at or above
/// network + 2 for each configured family.
///
/// The allocator owns the process-wide allocation lock. Callers must hold
/// the guard from [`AddressAllocator::serialize`] across the whole
/// read-used-addresses, pick/validate, persist sequence; recompute-then-
/// check is not atomic otherwise and two concurrent enrollments could be
/// handed the same address.
pub struct AddressAllocator {
    cidr_v4: Option<Ipv4Network>,
    cidr_v6: Option<Ipv6Network>,
    lock: Mutex<()>,
}

impl AddressAllocator {
    pub fn new(cidr_v4: Option<Ipv4Network>, cidr_v6: Option<Ipv6Network>) -> Self {
        Self {
            cidr_v4,
            cidr_v6,
            lock: Mutex::new(()),
        }
    }

    /// Serialize an allocation attempt. The guard must outlive the persist
    /// step that records the picked address.
    pub async fn serialize(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    pub fn cidr_v4(&self) -> Option<Ipv4Network> {
        self.cidr_v4
    }

    pub fn cidr_v6(&self) -> Option<Ipv6Network> {
        self.cidr_v6
    }

    /// The server's own address within each configured subnet
    /// (network + 1, with the subnet prefix). This is what gets assigned
    /// to the WireGuard interface.
    pub fn server_addresses(&self) -> Vec<IpNetwork> {
        let mut addresses = Vec::with_capacity(2);
        if let Some(net) = self.cidr_v4 {
            let server = Ipv4Addr::from(u32::from(net.network()).wrapping_add(1));
            if let Ok(prefix) = Ipv4Network::new(server, net.prefix()) {
                addresses.push(IpNetwork::V4(prefix));
            }
        }
        if let Some(net) = self.cidr_v6 {
            let server = Ipv6Addr::from(u128::from(net.network()).wrapping_add(1));
            if let Ok(prefix) = Ipv6Network::new(server, net.prefix()) {
                addresses.push(IpNetwork::V6(prefix));
            }
        }
        addresses
    }

    /// Pick the next free address in each configured family.
    ///
    /// If both families are configured, both must yield a free address or
    /// the whole call fails; a partial allocation is never returned.
    pub fn next_address(
        &self,
        used_v4: &HashSet<Ipv4Addr>,
        used_v6: &HashSet<Ipv6Addr>,
    ) -> Result<String, AllocError> {
        let mut picked = Vec::with_capacity(2);

        if let Some(net) = self.cidr_v4 {
            let addr = next_free_v4(net, used_v4).ok_or_else(|| AllocError::ExhaustedPool {
                subnet: net.to_string(),
            })?;
            debug!(address = %addr, "allocated ipv4 address");
            picked.push(format!("{addr}/32"));
        }

        if let Some(net) = self.cidr_v6 {
            let addr = next_free_v6(net, used_v6).ok_or_else(|| AllocError::ExhaustedPool {
                subnet: net.to_string(),
            })?;
            debug!(address = %addr, "allocated ipv6 address");
            picked.push(format!("{addr}/128"));
        }

        Ok(join_addresses(&picked))
    }

    /// Validate a manually requested address (pair) against the configured
    /// subnets and the set of addresses already in use.
    pub fn validate_manual(
        &self,
        manual: &ManualAddress,
        used_v4: &HashSet<Ipv4Addr>,
        used_v6: &HashSet<Ipv6Addr>,
    ) -> Result<String, AllocError> {
        if manual.ipv4.is_none() && manual.ipv6.is_none() {
            return Err(AllocError::NoManualAddress);
        }

        let mut picked = Vec::with_capacity(2);

        if let Some(requested) = manual.ipv4.as_deref() {
            let net = self
                .cidr_v4
                .ok_or(AllocError::FamilyNotConfigured { family: "ipv4" })?;
            let addr = parse_addr(requested)?;
            let IpAddr::V4(addr) = addr else {
                return Err(AllocError::WrongFamily {
                    address: requested.to_string(),
                    family: "ipv4",
                });
            };
            if !net.contains(addr) {
                return Err(AllocError::OutsideSubnet {
                    address: requested.to_string(),
                    subnet: net.to_string(),
                });
            }
            let network = u32::from(net.network());
            if u32::from(addr) == network || u32::from(addr) == network.wrapping_add(1) {
                return Err(AllocError::AddressReserved(requested.to_string()));
            }
            if used_v4.contains(&addr) {
                return Err(AllocError::AddressInUse(requested.to_string()));
            }
            picked.push(format!("{addr}/32"));
        }

        if let Some(requested) = manual.ipv6.as_deref() {
            let net = self
                .cidr_v6
                .ok_or(AllocError::FamilyNotConfigured { family: "ipv6" })?;
            let addr = parse_addr(requested)?;
            let IpAddr::V6(addr) = addr else {
                return Err(AllocError::WrongFamily {
                    address: requested.to_string(),
                    family: "ipv6",
                });
            };
            if !net.contains(addr) {
                return Err(AllocError::OutsideSubnet {
                    address: requested.to_string(),
                    subnet: net.to_string(),
                });
            }
            let network = u128::from(net.network());
            if u128::from(addr) == network || u128::from(addr) == network.wrapping_add(1) {
                return Err(AllocError::AddressReserved(requested.to_string()));
            }
            if used_v6.contains(&addr) {
                return Err(AllocError::AddressInUse(requested.to_string()));
            }
            picked.push(format!("{addr}/128"));
        }

        Ok(join_addresses(&picked))
    }
}

fn parse_addr(s: &str) -> Result<IpAddr, AllocError> {
    s.parse()
        .map_err(|_| AllocError::InvalidAddress(s.to_string()))
}

fn next_free_v4(net: Ipv4Network, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    // network and network+1 are reserved, start scanning at network+2
    let mut candidate = u32::from(net.network()).checked_add(2)?;
    loop {
        let addr = Ipv4Addr::from(candidate);
        if !net.contains(addr) {
            return None;
        }
        if !used.contains(&addr) {
            return Some(addr);
        }
        candidate = candidate.checked_add(1)?;
    }
}

fn next_free_v6(net: Ipv6Network, used: &HashSet<Ipv6Addr>) -> Option<Ipv6Addr> {
    let mut candidate = u128::from(net.network()).checked_add(2)?;
    loop {
        let addr = Ipv6Addr::from(candidate);
        if !net.contains(addr) {
            return None;
        }
        if !used.contains(&addr) {
            return Some(addr);
        }
        candidate = candidate.checked_add(1)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn v4(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn v6(s: &str) -> Ipv6Network {
        s.parse().unwrap()
    }

    fn allocator_v4(cidr: &str) -> AddressAllocator {
        AddressAllocator::new(Some(v4(cidr)), None)
    }

    #[test]
    fn first_allocation_skips_reserved_addresses() {
        let alloc = allocator_v4("10.44.0.0/24");
        let address = alloc.next_address(&HashSet::new(), &HashSet::new()).unwrap();
        assert_eq!(address, "10.44.0.2/32");
    }

    #[test]
    fn allocation_is_deterministic_smallest_free() {
        let alloc = allocator_v4("10.44.0.0/24");
        let used: HashSet<Ipv4Addr> = ["10.44.0.2", "10.44.0.4"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let address = alloc.next_address(&used, &HashSet::new()).unwrap();
        assert_eq!(address, "10.44.0.3/32");
        // same inputs, same answer
        let again = alloc.next_address(&used, &HashSet::new()).unwrap();
        assert_eq!(again, address);
    }

    #[test]
    fn sequential_allocations_are_distinct() {
        let alloc = allocator_v4("10.44.0.0/28");
        let mut used = HashSet::new();
        let mut seen = HashSet::new();
        for _ in 0..10 {
            let address = alloc.next_address(&used, &HashSet::new()).unwrap();
            let addr: Ipv4Addr = address.strip_suffix("/32").unwrap().parse().unwrap();
            assert!(seen.insert(addr), "duplicate allocation: {addr}");
            assert!(v4("10.44.0.0/28").contains(addr));
            assert_ne!(addr, "10.44.0.0".parse::<Ipv4Addr>().unwrap());
            assert_ne!(addr, "10.44.0.1".parse::<Ipv4Addr>().unwrap());
            used.insert(addr);
        }
    }

    #[test]
    fn exhausted_subnet_names_the_pool() {
        // /30 has network .0, server .1, and a lone client slot .2; .3 is
        // the broadcast address but the scan treats it as assignable, so
        // exhaust both.
        let alloc = allocator_v4("10.44.0.0/30");
        let used: HashSet<Ipv4Addr> = ["10.44.0.2", "10.44.0.3"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let err = alloc.next_address(&used, &HashSet::new()).unwrap_err();
        match err {
            AllocError::ExhaustedPool { subnet } => assert_eq!(subnet, "10.44.0.0/30"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dual_stack_allocates_both_or_fails() {
        let alloc = AddressAllocator::new(Some(v4("10.44.0.0/30")), Some(v6("fd48::/64")));
        let address = alloc.next_address(&HashSet::new(), &HashSet::new()).unwrap();
        assert_eq!(address, "10.44.0.2/32, fd48::2/128");

        // v4 pool exhausted: no partial v6-only result
        let used: HashSet<Ipv4Addr> = ["10.44.0.2", "10.44.0.3"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let err = alloc.next_address(&used, &HashSet::new()).unwrap_err();
        assert!(matches!(err, AllocError::ExhaustedPool { .. }));
    }

    #[test]
    fn v6_only_configuration() {
        let alloc = AddressAllocator::new(None, Some(v6("fd48:4c4:7aa9::/64")));
        let address = alloc.next_address(&HashSet::new(), &HashSet::new()).unwrap();
        assert_eq!(address, "fd48:4c4:7aa9::2/128");
    }

    fn manual_v4(addr: &str) -> ManualAddress {
        ManualAddress {
            ipv4: Some(addr.to_string()),
            ipv6: None,
        }
    }

    #[test_case("10.44.0.9", Ok(()) ; "free address accepted")]
    #[test_case("not-an-ip", Err("invalid") ; "garbage rejected")]
    #[test_case("10.45.0.9", Err("outside") ; "outside subnet rejected")]
    #[test_case("10.44.0.0", Err("reserved") ; "network address rejected")]
    #[test_case("10.44.0.1", Err("reserved") ; "server address rejected")]
    #[test_case("10.44.0.2", Err("in use") ; "used address rejected")]
    fn manual_v4_validation(requested: &str, expected: Result<(), &str>) {
        let alloc = allocator_v4("10.44.0.0/24");
        let used: HashSet<Ipv4Addr> = ["10.44.0.2".parse().unwrap()].into_iter().collect();
        let result = alloc.validate_manual(&manual_v4(requested), &used, &HashSet::new());
        match expected {
            Ok(()) => assert_eq!(result.unwrap(), format!("{requested}/32")),
            Err(kind) => {
                let err = result.unwrap_err();
                match (kind, &err) {
                    ("invalid", AllocError::InvalidAddress(_))
                    | ("outside", AllocError::OutsideSubnet { .. })
                    | ("reserved", AllocError::AddressReserved(_))
                    | ("in use", AllocError::AddressInUse(_)) => {}
                    _ => panic!("unexpected error for {requested}: {err}"),
                }
            }
        }
    }

    #[test]
    fn manual_v6_on_v4_only_subnet_rejected() {
        let alloc = allocator_v4("10.44.0.0/24");
        let manual = ManualAddress {
            ipv4: None,
            ipv6: Some("fd48::5".to_string()),
        };
        let err = alloc
            .validate_manual(&manual, &HashSet::new(), &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, AllocError::FamilyNotConfigured { family: "ipv6" }));
    }

    #[test]
    fn manual_with_no_addresses_rejected() {
        let alloc = allocator_v4("10.44.0.0/24");
        let err = alloc
            .validate_manual(&ManualAddress::default(), &HashSet::new(), &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, AllocError::NoManualAddress));
    }

    #[test]
    fn manual_wrong_family_rejected() {
        let alloc = AddressAllocator::new(Some(v4("10.44.0.0/24")), Some(v6("fd48::/64")));
        let manual = ManualAddress {
            ipv4: Some("fd48::5".to_string()),
            ipv6: None,
        };
        let err = alloc
            .validate_manual(&manual, &HashSet::new(), &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, AllocError::WrongFamily { family: "ipv4", .. }));
    }

    #[test]
    fn server_addresses_carry_subnet_prefix() {
        let alloc = AddressAllocator::new(Some(v4("10.44.0.0/24")), Some(v6("fd48::/64")));
        let addresses: Vec<String> = alloc
            .server_addresses()
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(addresses, vec!["10.44.0.1/24", "fd48::1/64"]);
    }
}
