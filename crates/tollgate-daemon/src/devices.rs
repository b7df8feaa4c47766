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

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use tollgate_types::{Device, Identity, User};

use crate::alloc::{AddressAllocator, AllocError, ManualAddress};
use crate::metadata::{self, PeerByteStats};
use crate::storage::{DeviceStore, StoreError, StoreEvent};
use crate::wg::{WgControl, WgError};

/// A peer counts as connected while its last handshake is younger than
/// this. Metadata collection and inactivity eviction share the threshold.
pub const HANDSHAKE_TIMEOUT: TimeDelta = TimeDelta::minutes(3);

pub fn is_connected(last_handshake: Option<DateTime<Utc>>) -> bool {
    match last_handshake {
        Some(at) => at > Utc::now() - HANDSHAKE_TIMEOUT,
        None => false,
    }
}

// https://lists.zx2c4.com/pipermail/wireguard/2020-December/006222.html
const KEY_TRAILING_CHARS: &[u8] = b"AEIMQUYcgkosw048";

/// Check the WireGuard base64 key format: 44 characters, of which the
/// first 42 are plain base64 alphabet, the 43rd is constrained by the
/// 256-bit key length, and the last is padding.
pub fn is_valid_wg_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 44
        && bytes[43] == b'='
        && KEY_TRAILING_CHARS.contains(&bytes[42])
        && bytes[..42]
            .iter()
            .all(|c| c.is_ascii_alphanumeric() || *c == b'+' || *c == b'/')
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device name must not be empty")]
    NameEmpty,

    #[error("device name already taken")]
    NameTaken,

    #[error("{0} has invalid format")]
    InvalidKeyFormat(&'static str),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("wireguard error: {0}")]
    Wg(#[from] WgError),
}

pub(crate) struct Inner<S, W> {
    pub(crate) store: S,
    pub(crate) wg: W,
    pub(crate) allocator: AddressAllocator,
    pub(crate) peer_stats: DashMap<String, PeerByteStats>,
}

/// Orchestrates the device lifecycle: enrollment with address allocation,
/// reconciliation between the persisted device set and the live peer set,
/// and the background metadata/eviction loops.
pub struct DeviceManager<S, W> {
    pub(crate) inner: Arc<Inner<S, W>>,
}

impl<S, W> Clone for DeviceManager<S, W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Owns the background tasks started by [`DeviceManager::start_sync`].
pub struct SyncHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Stop the event task and background loops and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl<S: DeviceStore, W: WgControl> DeviceManager<S, W> {
    pub fn new(store: S, wg: W, allocator: AddressAllocator) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                wg,
                allocator,
                peer_stats: DashMap::new(),
            }),
        }
    }

    /// Enroll a new device for `identity`.
    ///
    /// Validates the device name and key formats, allocates an address
    /// (or validates the manually requested one) under the allocation
    /// lock, and persists the record. The store's add event then brings
    /// the WireGuard peer up.
    #[tracing::instrument(skip_all, fields(owner = %identity.subject, device = %name))]
    pub async fn add_device(
        &self,
        identity: &Identity,
        name: &str,
        public_key: &str,
        preshared_key: Option<&str>,
        manual: Option<&ManualAddress>,
    ) -> Result<Device, DeviceError> {
        if name.is_empty() {
            return Err(DeviceError::NameEmpty);
        }

        let owned = self.inner.store.list(Some(&identity.subject)).await?;
        if owned.iter().any(|d| d.name == name) {
            return Err(DeviceError::NameTaken);
        }

        if !is_valid_wg_key(public_key) {
            return Err(DeviceError::InvalidKeyFormat("public key"));
        }
        if let Some(psk) = preshared_key {
            if !is_valid_wg_key(psk) {
                return Err(DeviceError::InvalidKeyFormat("preshared key"));
            }
        }

        // hold the allocation lock across read-used -> pick -> persist
        let _guard = self.inner.allocator.serialize().await;

        let (used_v4, used_v6) = self.used_addresses().await?;
        let address = match manual {
            Some(manual) => self
                .inner
                .allocator
                .validate_manual(manual, &used_v4, &used_v6)?,
            None => self.inner.allocator.next_address(&used_v4, &used_v6)?,
        };

        let device = Device {
            id: Uuid::new_v4(),
            owner: identity.subject.clone(),
            owner_name: identity.name.clone(),
            owner_email: identity.email.clone(),
            owner_provider: identity.provider.clone(),
            name: name.to_string(),
            public_key: public_key.to_string(),
            preshared_key: preshared_key.map(str::to_string),
            address,
            created_at: Utc::now(),
            endpoint: None,
            last_handshake: None,
            receive_bytes: 0,
            transmit_bytes: 0,
        };

        let device = self.inner.store.save(device).await?;
        info!(address = %device.address, "enrolled device");
        Ok(device)
    }

    async fn used_addresses(
        &self,
    ) -> Result<(HashSet<Ipv4Addr>, HashSet<Ipv6Addr>), DeviceError> {
        let devices = self.list_all_devices().await?;
        let mut used_v4 = HashSet::with_capacity(devices.len());
        let mut used_v6 = HashSet::with_capacity(devices.len());
        for device in &devices {
            for address in device.addresses() {
                let Some((addr, _)) = address.split_once('/') else {
                    continue;
                };
                if let Ok(v4) = addr.parse::<Ipv4Addr>() {
                    used_v4.insert(v4);
                } else if let Ok(v6) = addr.parse::<Ipv6Addr>() {
                    used_v6.insert(v6);
                }
            }
        }
        Ok((used_v4, used_v6))
    }

    pub async fn save_device(&self, device: Device) -> Result<Device, DeviceError> {
        Ok(self.inner.store.save(device).await?)
    }

    pub async fn get_by_public_key(&self, public_key: &str) -> Result<Device, DeviceError> {
        Ok(self.inner.store.get_by_public_key(public_key).await?)
    }

    pub async fn list_devices(&self, owner: &str) -> Result<Vec<Device>, DeviceError> {
        Ok(self.inner.store.list(Some(owner)).await?)
    }

    pub async fn list_all_devices(&self) -> Result<Vec<Device>, DeviceError> {
        Ok(self.inner.store.list(None).await?)
    }

    /// Distinct owners, derived from the device list.
    pub async fn list_users(&self) -> Result<Vec<User>, DeviceError> {
        let devices = self.list_all_devices().await?;
        let mut seen = HashSet::new();
        let mut users = Vec::new();
        for device in devices {
            if seen.insert(device.owner.clone()) {
                users.push(User {
                    name: device.owner,
                    display_name: device.owner_name,
                });
            }
        }
        Ok(users)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_device(&self, owner: &str, name: &str) -> Result<(), DeviceError> {
        let device = self.inner.store.get(owner, name).await?;
        self.inner.store.delete(&device).await?;
        Ok(())
    }

    /// Delete every device belonging to `owner`, one at a time. Not
    /// atomic as a batch: an error leaves earlier deletions in place.
    #[tracing::instrument(skip(self))]
    pub async fn delete_devices_for_user(&self, owner: &str) -> Result<(), DeviceError> {
        let devices = self.list_devices(owner).await?;
        for device in devices {
            self.delete_device(owner, &device.name).await?;
        }
        Ok(())
    }

    /// Liveness check across both collaborators.
    pub async fn ping(&self) -> Result<(), DeviceError> {
        self.inner.store.ping().await?;
        self.inner.wg.ping().await?;
        Ok(())
    }

    /// One full reconciliation pass: make the live peer set converge
    /// toward the persisted device set. Per-peer failures are logged and
    /// skipped; the next sync or store event heals them.
    pub async fn sync(&self) -> Result<(), DeviceError> {
        let devices = self.list_all_devices().await?;
        let peers = self.inner.wg.list_peers().await?;

        for peer in &peers {
            if !devices.iter().any(|d| d.public_key == peer.public_key) {
                if let Err(e) = self.inner.wg.remove_peer(&peer.public_key).await {
                    error!(public_key = %peer.public_key, error = %e, "failed to remove peer during sync");
                }
            }
        }

        for device in &devices {
            if let Err(e) = self
                .inner
                .wg
                .add_peer(
                    &device.public_key,
                    device.preshared_key.as_deref(),
                    &device.addresses(),
                )
                .await
            {
                warn!(device = %device.name, error = %e, "failed to add device during sync");
            }
        }

        Ok(())
    }

    /// Subscribe to store events, run one synchronous reconciliation, and
    /// launch the background loops. The initial sync failing is fatal;
    /// everything afterwards is best-effort.
    pub async fn start_sync(
        &self,
        disable_metadata: bool,
        enable_inactive_eviction: bool,
        grace_period: Duration,
    ) -> Result<SyncHandle, DeviceError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // subscribe before the initial sync so no event is missed
        let events = self.inner.store.subscribe();

        self.sync().await?;

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(event_task(
            self.clone(),
            events,
            shutdown_rx.clone(),
        )));

        if !disable_metadata {
            info!("start collecting device metadata");
            tasks.push(tokio::spawn(metadata::run(
                self.clone(),
                shutdown_rx.clone(),
            )));
        }

        if enable_inactive_eviction {
            if disable_metadata {
                info!(
                    "ignoring inactive device eviction because metadata collection \
                     is disabled and eviction decisions depend on it"
                );
            } else {
                info!(
                    grace_period_secs = grace_period.as_secs(),
                    "start looking for inactive devices"
                );
                tasks.push(tokio::spawn(eviction_loop(
                    self.clone(),
                    grace_period,
                    shutdown_rx,
                )));
            }
        }

        Ok(SyncHandle {
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

async fn event_task<S: DeviceStore, W: WgControl>(
    mgr: DeviceManager<S, W>,
    mut events: broadcast::Receiver<StoreEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Ok(StoreEvent::Added(device)) => {
                    info!(owner = %device.owner, device = %device.name, public_key = %device.public_key, "storage event: add device");
                    if let Err(e) = mgr
                        .inner
                        .wg
                        .add_peer(&device.public_key, device.preshared_key.as_deref(), &device.addresses())
                        .await
                    {
                        error!(error = %e, "failed to add wireguard peer");
                    }
                }
                Ok(StoreEvent::Deleted(device)) => {
                    info!(owner = %device.owner, device = %device.name, public_key = %device.public_key, "storage event: remove device");
                    if let Err(e) = mgr.inner.wg.remove_peer(&device.public_key).await {
                        error!(error = %e, "failed to remove wireguard peer");
                    }
                }
                Ok(StoreEvent::Reconnected) => {
                    info!("storage event: backend reconnected, resyncing devices");
                    if let Err(e) = mgr.sync().await {
                        error!(error = %e, "device sync after storage reconnect failed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "storage event stream lagged, resyncing devices");
                    if let Err(e) = mgr.sync().await {
                        error!(error = %e, "device sync after event lag failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn eviction_loop<S: DeviceStore, W: WgControl>(
    mgr: DeviceManager<S, W>,
    grace_period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // check on a cadence derived from the grace period, but never finer
    // than a minute or coarser than an hour
    let tick = grace_period
        .min(Duration::from_secs(3600))
        .max(Duration::from_secs(60));
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => evict_inactive(&mgr, grace_period).await,
        }
    }
}

/// Delete devices whose last activity is older than the grace period.
/// A device that never completed a handshake ages from its creation time.
/// Deletion here is destructive and irreversible.
async fn evict_inactive<S: DeviceStore, W: WgControl>(
    mgr: &DeviceManager<S, W>,
    grace_period: Duration,
) {
    let devices = match mgr.list_all_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            warn!(error = %e, "failed to list devices, skipping eviction pass");
            return;
        }
    };

    let grace = TimeDelta::from_std(grace_period).unwrap_or(TimeDelta::MAX);
    let now = Utc::now();
    for device in devices {
        let last_active = device.last_handshake.unwrap_or(device.created_at);
        if now - last_active > grace {
            info!(
                owner = %device.owner,
                device = %device.name,
                last_active = %last_active,
                "deleting inactive device"
            );
            if let Err(e) = mgr.delete_device(&device.owner, &device.name).await {
                error!(device = %device.name, error = %e, "failed to delete inactive device");
            }
        }
    }
}
