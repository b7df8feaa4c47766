//! tollgate-types: Shared data model for the tollgate VPN access service.
//!
//! This crate contains the persisted device record, the owner identity it
//! is attributed to, and the live peer snapshot reported by the kernel
//! WireGuard interface. The daemon and any embedding API surface share
//! these shapes.

#![warn(missing_docs)]

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authenticated identity a device is enrolled under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier from the auth provider.
    pub subject: String,
    /// Display name.
    pub name: String,
    /// Email address, may be empty for anonymous providers.
    pub email: String,
    /// Which auth provider asserted this identity.
    pub provider: String,
}

/// A distinct device owner, derived from the device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Subject identifier.
    pub name: String,
    /// Display name recorded when the user's first device was enrolled.
    pub display_name: String,
}

/// A persisted device record representing one client enrollment.
///
/// `(owner, name)` is unique. The address field holds the allocated
/// address(es) as a comma-separated list of CIDR singletons (`/32` for
/// IPv4, `/128` for IPv6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier assigned when the device is first saved.
    pub id: Uuid,
    /// Owner subject identifier.
    pub owner: String,
    /// Owner display name.
    pub owner_name: String,
    /// Owner email.
    pub owner_email: String,
    /// Auth provider that asserted the owner identity.
    pub owner_provider: String,
    /// Device name, unique per owner.
    pub name: String,
    /// WireGuard public key (base64).
    pub public_key: String,
    /// Optional WireGuard preshared key (base64).
    pub preshared_key: Option<String>,
    /// Allocated address(es), comma-separated CIDR singletons.
    pub address: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last seen remote endpoint, updated by metadata collection.
    pub endpoint: Option<String>,
    /// Last WireGuard handshake, if one has ever completed.
    pub last_handshake: Option<DateTime<Utc>>,
    /// Cumulative bytes received from this device.
    pub receive_bytes: i64,
    /// Cumulative bytes transmitted to this device.
    pub transmit_bytes: i64,
}

impl Device {
    /// The allocated addresses as individual CIDR strings.
    pub fn addresses(&self) -> Vec<String> {
        split_addresses(&self.address)
    }
}

/// Split a comma-separated address list into individual CIDR strings.
pub fn split_addresses(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join individual CIDR strings into the persisted comma-separated form.
pub fn join_addresses(addresses: &[String]) -> String {
    addresses.join(", ")
}

/// A live peer entry from the kernel WireGuard interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    /// WireGuard public key (base64).
    pub public_key: String,
    /// Remote endpoint, present only while the peer is associated with
    /// this interface.
    pub endpoint: Option<SocketAddr>,
    /// Last completed handshake.
    pub last_handshake: Option<DateTime<Utc>>,
    /// Cumulative bytes received from the peer.
    pub receive_bytes: i64,
    /// Cumulative bytes transmitted to the peer.
    pub transmit_bytes: i64,
}
