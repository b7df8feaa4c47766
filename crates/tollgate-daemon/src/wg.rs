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

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;

use tollgate_types::PeerSnapshot;

#[derive(Debug, Error)]
pub enum WgError {
    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("failed to decode base64 key: {0}")]
    KeyDecode(#[from] base64::DecodeError),

    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid allowed ip: {0}")]
    InvalidAllowedIp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control surface over a kernel WireGuard interface.
pub trait WgControl: Send + Sync + 'static {
    /// Add or update a peer. Existing allowed-ips for the peer are
    /// replaced, not merged.
    fn add_peer(
        &self,
        public_key: &str,
        preshared_key: Option<&str>,
        allowed_ips: &[String],
    ) -> impl Future<Output = Result<(), WgError>> + Send;

    fn remove_peer(&self, public_key: &str) -> impl Future<Output = Result<(), WgError>> + Send;

    fn list_peers(&self) -> impl Future<Output = Result<Vec<PeerSnapshot>, WgError>> + Send;

    fn ping(&self) -> impl Future<Output = Result<(), WgError>> + Send;
}

pub fn decode_key(b64: &str) -> Result<[u8; 32], WgError> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD.decode(b64)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| WgError::InvalidKeyLength(len))
}

#[cfg(target_os = "linux")]
pub use kernel::KernelWg;

// -- In-memory fake --

struct MemoryPeer {
    snapshot: PeerSnapshot,
    allowed_ips: Vec<String>,
}

/// In-process WireGuard stand-in, used when the kernel interface is
/// disabled (development mode) and by tests. Peers never handshake on
/// their own; tests drive traffic through [`MemoryWg::set_peer_traffic`].
#[derive(Clone)]
pub struct MemoryWg {
    peers: Arc<Mutex<HashMap<String, MemoryPeer>>>,
}

impl MemoryWg {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn contains_peer(&self, public_key: &str) -> bool {
        self.peers.lock().unwrap().contains_key(public_key)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn allowed_ips(&self, public_key: &str) -> Option<Vec<String>> {
        self.peers
            .lock()
            .unwrap()
            .get(public_key)
            .map(|p| p.allowed_ips.clone())
    }

    /// Simulate kernel-observed peer activity.
    pub fn set_peer_traffic(
        &self,
        public_key: &str,
        endpoint: Option<SocketAddr>,
        last_handshake: Option<DateTime<Utc>>,
        receive_bytes: i64,
        transmit_bytes: i64,
    ) {
        let mut peers = self.peers.lock().unwrap();
        let peer = peers
            .entry(public_key.to_string())
            .or_insert_with(|| MemoryPeer {
                snapshot: PeerSnapshot {
                    public_key: public_key.to_string(),
                    endpoint: None,
                    last_handshake: None,
                    receive_bytes: 0,
                    transmit_bytes: 0,
                },
                allowed_ips: Vec::new(),
            });
        peer.snapshot.endpoint = endpoint;
        peer.snapshot.last_handshake = last_handshake;
        peer.snapshot.receive_bytes = receive_bytes;
        peer.snapshot.transmit_bytes = transmit_bytes;
    }
}

impl Default for MemoryWg {
    fn default() -> Self {
        Self::new()
    }
}

impl WgControl for MemoryWg {
    async fn add_peer(
        &self,
        public_key: &str,
        _preshared_key: Option<&str>,
        allowed_ips: &[String],
    ) -> Result<(), WgError> {
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(public_key) {
            // upsert must not reset observed traffic
            Some(existing) => existing.allowed_ips = allowed_ips.to_vec(),
            None => {
                peers.insert(
                    public_key.to_string(),
                    MemoryPeer {
                        snapshot: PeerSnapshot {
                            public_key: public_key.to_string(),
                            endpoint: None,
                            last_handshake: None,
                            receive_bytes: 0,
                            transmit_bytes: 0,
                        },
                        allowed_ips: allowed_ips.to_vec(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<(), WgError> {
        self.peers.lock().unwrap().remove(public_key);
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerSnapshot>, WgError> {
        let peers = self.peers.lock().unwrap();
        let mut snapshots: Vec<PeerSnapshot> =
            peers.values().map(|p| p.snapshot.clone()).collect();
        snapshots.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        Ok(snapshots)
    }

    async fn ping(&self) -> Result<(), WgError> {
        Ok(())
    }
}

// -- Stub for non-Linux builds --

/// Placeholder control surface for platforms without kernel WireGuard.
pub struct StubWg;

impl WgControl for StubWg {
    async fn add_peer(
        &self,
        _public_key: &str,
        _preshared_key: Option<&str>,
        _allowed_ips: &[String],
    ) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }

    async fn remove_peer(&self, _public_key: &str) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }

    async fn list_peers(&self) -> Result<Vec<PeerSnapshot>, WgError> {
        Err(WgError::Unsupported)
    }

    async fn ping(&self) -> Result<(), WgError> {
        Err(WgError::Unsupported)
    }
}

// -- Linux implementation --

#[cfg(target_os = "linux")]
pub mod kernel {
    use std::net::IpAddr;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use futures::TryStreamExt;
    use ipnetwork::IpNetwork;
    use tracing::{debug, info};
    use wireguard_uapi::{DeviceInterface, RouteSocket, WgSocket, set};

    use tollgate_types::PeerSnapshot;

    use super::{WgControl, WgError, decode_key};

    /// Kernel WireGuard interface driven over netlink.
    ///
    /// Sockets are connected per call; the netlink sockets are not
    /// shareable across threads and every operation is a single
    /// request/response exchange anyway.
    pub struct KernelWg {
        interface: String,
    }

    impl KernelWg {
        pub fn new(interface: impl Into<String>) -> Self {
            Self {
                interface: interface.into(),
            }
        }

        pub fn interface(&self) -> &str {
            &self.interface
        }

        /// Create the interface if it does not exist yet.
        pub async fn ensure_interface(&self) -> Result<(), WgError> {
            let mut route =
                RouteSocket::connect().map_err(|e| WgError::Interface(e.to_string()))?;
            let existing = route
                .list_device_names()
                .map_err(|e| WgError::Interface(e.to_string()))?;

            if existing.iter().any(|n| n == &self.interface) {
                debug!(interface = %self.interface, "interface already exists");
                return Ok(());
            }

            info!(interface = %self.interface, "creating wireguard interface");
            route
                .add_device(&self.interface)
                .map_err(|e| WgError::Interface(e.to_string()))?;
            Ok(())
        }

        /// Assign the server's VPN address(es) to the interface and bring
        /// the link up. Existing addresses are flushed first so re-applying
        /// a changed subnet configuration converges.
        pub async fn configure_addresses(&self, addresses: &[IpNetwork]) -> Result<(), WgError> {
            let (conn, handle, _) = rtnetlink::new_connection().map_err(WgError::Io)?;
            tokio::spawn(conn);

            let index = link_index(&handle, &self.interface).await?;

            let existing: Vec<_> = handle
                .address()
                .get()
                .set_link_index_filter(index)
                .execute()
                .try_collect()
                .await
                .map_err(|e| WgError::Interface(e.to_string()))?;
            for addr_msg in existing {
                handle
                    .address()
                    .del(addr_msg)
                    .execute()
                    .await
                    .map_err(|e| WgError::Interface(e.to_string()))?;
            }
            debug!(interface = %self.interface, "flushed existing addresses");

            for network in addresses {
                handle
                    .address()
                    .add(index, network.ip(), network.prefix())
                    .execute()
                    .await
                    .map_err(|e| WgError::Interface(e.to_string()))?;
                info!(interface = %self.interface, address = %network, "assigned address");
            }

            let msg = rtnetlink::LinkUnspec::new_with_index(index).up().build();
            handle
                .link()
                .set(msg)
                .execute()
                .await
                .map_err(|e| WgError::Interface(e.to_string()))?;
            info!(interface = %self.interface, "set link up");
            Ok(())
        }
    }

    async fn link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32, WgError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| WgError::Interface(e.to_string()))?
            .ok_or_else(|| WgError::Interface(format!("interface {name} not found")))?;
        Ok(link.header.index)
    }

    fn parse_allowed_ip(cidr: &str) -> Result<(IpAddr, u8), WgError> {
        let network: IpNetwork = cidr
            .parse()
            .map_err(|_| WgError::InvalidAllowedIp(cidr.to_string()))?;
        Ok((network.ip(), network.prefix()))
    }

    impl WgControl for KernelWg {
        async fn add_peer(
            &self,
            public_key: &str,
            preshared_key: Option<&str>,
            allowed_ips: &[String],
        ) -> Result<(), WgError> {
            let pub_key = decode_key(public_key)?;
            let psk = preshared_key.map(decode_key).transpose()?;
            let parsed: Vec<(IpAddr, u8)> = allowed_ips
                .iter()
                .map(|ip| parse_allowed_ip(ip))
                .collect::<Result<_, _>>()?;

            let allowed: Vec<set::AllowedIp<'_>> = parsed
                .iter()
                .map(|(addr, cidr)| {
                    let mut aip = set::AllowedIp::from_ipaddr(addr);
                    aip.cidr_mask = Some(*cidr);
                    aip
                })
                .collect();

            let mut peer = set::Peer::from_public_key(&pub_key)
                .flags(vec![set::WgPeerF::ReplaceAllowedIps])
                .allowed_ips(allowed);
            if let Some(ref psk) = psk {
                peer = peer.preshared_key(psk);
            }

            let dev = set::Device::from_ifname(&self.interface).peers(vec![peer]);

            let mut wg = WgSocket::connect().map_err(|e| WgError::Interface(e.to_string()))?;
            wg.set_device(dev)
                .map_err(|e| WgError::Interface(e.to_string()))?;
            debug!(interface = %self.interface, public_key, "upserted peer");
            Ok(())
        }

        async fn remove_peer(&self, public_key: &str) -> Result<(), WgError> {
            let pub_key = decode_key(public_key)?;
            let peer = set::Peer::from_public_key(&pub_key).flags(vec![set::WgPeerF::RemoveMe]);
            let dev = set::Device::from_ifname(&self.interface).peers(vec![peer]);

            let mut wg = WgSocket::connect().map_err(|e| WgError::Interface(e.to_string()))?;
            wg.set_device(dev)
                .map_err(|e| WgError::Interface(e.to_string()))?;
            debug!(interface = %self.interface, public_key, "removed peer");
            Ok(())
        }

        async fn list_peers(&self) -> Result<Vec<PeerSnapshot>, WgError> {
            let mut wg = WgSocket::connect().map_err(|e| WgError::Interface(e.to_string()))?;
            let device = wg
                .get_device(DeviceInterface::from_name(self.interface.clone()))
                .map_err(|e| WgError::Interface(e.to_string()))?;

            let peers = device
                .peers
                .iter()
                .map(|peer| {
                    let secs = peer.last_handshake_time.as_secs();
                    let nanos = peer.last_handshake_time.subsec_nanos();
                    let last_handshake = if secs == 0 && nanos == 0 {
                        None
                    } else {
                        chrono::DateTime::from_timestamp(secs as i64, nanos)
                    };
                    PeerSnapshot {
                        public_key: BASE64.encode(peer.public_key),
                        endpoint: peer.endpoint,
                        last_handshake,
                        receive_bytes: peer.rx_bytes as i64,
                        transmit_bytes: peer.tx_bytes as i64,
                    }
                })
                .collect();
            Ok(peers)
        }

        async fn ping(&self) -> Result<(), WgError> {
            let mut wg = WgSocket::connect().map_err(|e| WgError::Interface(e.to_string()))?;
            wg.get_device(DeviceInterface::from_name(self.interface.clone()))
                .map_err(|e| WgError::Interface(e.to_string()))?;
            Ok(())
        }
    }
}
