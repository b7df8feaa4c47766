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
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use tollgate_types::Device;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("device not found")]
    NotFound,

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// A change emitted by the store after the mutation is visible to reads.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A new device record was created.
    Added(Device),
    /// A device record was deleted.
    Deleted(Device),
    /// The backend re-established its connection; subscribers should
    /// resynchronize any state derived from the device list.
    Reconnected,
}

/// The persistence contract the device manager depends on.
///
/// Individual writes are atomic from the caller's point of view;
/// cross-record transactions are not offered. `add_byte_counts` must be
/// additive so that multiple replicas can record traffic deltas without
/// coordinating.
pub trait DeviceStore: Send + Sync + 'static {
    /// Insert or update a device. Returns the stored record.
    fn save(&self, device: Device) -> impl Future<Output = Result<Device, StoreError>> + Send;

    fn get(
        &self,
        owner: &str,
        name: &str,
    ) -> impl Future<Output = Result<Device, StoreError>> + Send;

    fn get_by_public_key(
        &self,
        public_key: &str,
    ) -> impl Future<Output = Result<Device, StoreError>> + Send;

    /// List devices for one owner, or all devices when `owner` is `None`.
    fn list(
        &self,
        owner: Option<&str>,
    ) -> impl Future<Output = Result<Vec<Device>, StoreError>> + Send;

    fn delete(&self, device: &Device) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomically add traffic deltas to a device's cumulative totals.
    /// Fails with [`StoreError::NotFound`] for an unknown public key.
    fn add_byte_counts(
        &self,
        public_key: &str,
        rx_delta: i64,
        tx_delta: i64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Subscribe to change events. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// In-memory reference store, also the default backend for single-node
/// deployments and tests.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<(String, String), Device>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    fn emit(&self, event: StoreEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStore for MemoryStore {
    async fn save(&self, device: Device) -> Result<Device, StoreError> {
        let key = (device.owner.clone(), device.name.clone());
        let created = {
            let mut devices = self.inner.write().await;
            devices.insert(key, device.clone()).is_none()
        };
        if created {
            debug!(owner = %device.owner, device = %device.name, "created device");
            self.emit(StoreEvent::Added(device.clone()));
        }
        Ok(device)
    }

    async fn get(&self, owner: &str, name: &str) -> Result<Device, StoreError> {
        let devices = self.inner.read().await;
        devices
            .get(&(owner.to_string(), name.to_string()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_by_public_key(&self, public_key: &str) -> Result<Device, StoreError> {
        let devices = self.inner.read().await;
        devices
            .values()
            .find(|d| d.public_key == public_key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list(&self, owner: Option<&str>) -> Result<Vec<Device>, StoreError> {
        let devices = self.inner.read().await;
        let mut result: Vec<Device> = devices
            .values()
            .filter(|d| owner.is_none_or(|o| d.owner == o))
            .cloned()
            .collect();
        result.sort_by(|a, b| (&a.owner, &a.name).cmp(&(&b.owner, &b.name)));
        Ok(result)
    }

    async fn delete(&self, device: &Device) -> Result<(), StoreError> {
        let removed = {
            let mut devices = self.inner.write().await;
            devices.remove(&(device.owner.clone(), device.name.clone()))
        };
        match removed {
            Some(removed) => {
                debug!(owner = %removed.owner, device = %removed.name, "deleted device");
                self.emit(StoreEvent::Deleted(removed));
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn add_byte_counts(
        &self,
        public_key: &str,
        rx_delta: i64,
        tx_delta: i64,
    ) -> Result<(), StoreError> {
        let mut devices = self.inner.write().await;
        let device = devices
            .values_mut()
            .find(|d| d.public_key == public_key)
            .ok_or(StoreError::NotFound)?;
        // deltas are applied as-is; callers own any reset correction
        device.receive_bytes += rx_delta;
        device.transmit_bytes += tx_delta;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn device(owner: &str, name: &str, public_key: &str) -> Device {
        Device {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            owner_name: format!("{owner} name"),
            owner_email: format!("{owner}@example.com"),
            owner_provider: "oidc".to_string(),
            name: name.to_string(),
            public_key: public_key.to_string(),
            preshared_key: None,
            address: "10.44.0.2/32".to_string(),
            created_at: Utc::now(),
            endpoint: None,
            last_handshake: None,
            receive_bytes: 1000,
            transmit_bytes: 2000,
        }
    }

    #[tokio::test]
    async fn add_byte_counts_is_additive() {
        let store = MemoryStore::new();
        store.save(device("user1", "device1", "pk-1")).await.unwrap();

        store.add_byte_counts("pk-1", 500, 750).await.unwrap();
        let updated = store.get_by_public_key("pk-1").await.unwrap();
        assert_eq!(updated.receive_bytes, 1500);
        assert_eq!(updated.transmit_bytes, 2750);

        store.add_byte_counts("pk-1", 250, 100).await.unwrap();
        let updated = store.get_by_public_key("pk-1").await.unwrap();
        assert_eq!(updated.receive_bytes, 1750);
        assert_eq!(updated.transmit_bytes, 2850);
    }

    #[tokio::test]
    async fn add_byte_counts_unknown_key_fails_without_creating() {
        let store = MemoryStore::new();
        let err = store.add_byte_counts("missing", 100, 200).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
        assert!(store.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_byte_counts_zero_delta_is_a_noop() {
        let store = MemoryStore::new();
        store.save(device("user1", "device1", "pk-1")).await.unwrap();
        store.add_byte_counts("pk-1", 0, 0).await.unwrap();
        let updated = store.get_by_public_key("pk-1").await.unwrap();
        assert_eq!(updated.receive_bytes, 1000);
        assert_eq!(updated.transmit_bytes, 2000);
    }

    #[tokio::test]
    async fn add_byte_counts_applies_negative_deltas() {
        // the store does not second-guess deltas; reset handling lives in
        // the metadata reconciler
        let store = MemoryStore::new();
        store.save(device("user1", "device1", "pk-1")).await.unwrap();
        store.add_byte_counts("pk-1", -100, -200).await.unwrap();
        let updated = store.get_by_public_key("pk-1").await.unwrap();
        assert_eq!(updated.receive_bytes, 900);
        assert_eq!(updated.transmit_bytes, 1800);
    }

    #[tokio::test]
    async fn list_filters_by_owner() {
        let store = MemoryStore::new();
        store.save(device("alice", "laptop", "pk-a")).await.unwrap();
        store.save(device("alice", "phone", "pk-b")).await.unwrap();
        store.save(device("bob", "laptop", "pk-c")).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 3);
        let alice = store.list(Some("alice")).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|d| d.owner == "alice"));
    }

    #[tokio::test]
    async fn events_fire_after_change_is_visible() {
        let store = MemoryStore::new();
        let mut events = store.subscribe();

        store.save(device("alice", "laptop", "pk-a")).await.unwrap();
        match events.recv().await.unwrap() {
            StoreEvent::Added(added) => {
                // the record must already be readable
                let read = store.get(&added.owner, &added.name).await.unwrap();
                assert_eq!(read.public_key, "pk-a");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let stored = store.get("alice", "laptop").await.unwrap();
        store.delete(&stored).await.unwrap();
        match events.recv().await.unwrap() {
            StoreEvent::Deleted(deleted) => {
                assert_eq!(deleted.name, "laptop");
                assert!(matches!(
                    store.get("alice", "laptop").await.unwrap_err(),
                    StoreError::NotFound
                ));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn metadata_update_does_not_refire_added() {
        let store = MemoryStore::new();
        store.save(device("alice", "laptop", "pk-a")).await.unwrap();

        let mut events = store.subscribe();
        let mut stored = store.get("alice", "laptop").await.unwrap();
        stored.endpoint = Some("203.0.113.9".to_string());
        store.save(stored).await.unwrap();

        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn delete_missing_device_fails() {
        let store = MemoryStore::new();
        let ghost = device("alice", "laptop", "pk-a");
        assert!(matches!(
            store.delete(&ghost).await.unwrap_err(),
            StoreError::NotFound
        ));
    }
}
