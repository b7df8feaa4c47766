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

//! End-to-end flows over the public crate API, with the in-memory store
//! and peer table standing in for the real backends.

use std::time::Duration;

use tollgate_daemon::{
    AddressAllocator, DeviceError, DeviceManager, MemoryStore, MemoryWg, WgControl,
};
use tollgate_types::Identity;

fn identity(subject: &str) -> Identity {
    Identity {
        subject: subject.to_string(),
        name: format!("{subject} example"),
        email: format!("{subject}@example.com"),
        provider: "oidc".to_string(),
    }
}

fn key(tag: u8) -> String {
    let mut k = String::new();
    k.push((b'A' + (tag % 26)) as char);
    k.push_str(&"b".repeat(41));
    k.push('E');
    k.push('=');
    k
}

fn manager() -> (DeviceManager<MemoryStore, MemoryWg>, MemoryStore, MemoryWg) {
    let store = MemoryStore::new();
    let wg = MemoryWg::new();
    let allocator = AddressAllocator::new(
        Some("10.44.0.0/24".parse().unwrap()),
        Some("fd48:4c4:7aa9::/64".parse().unwrap()),
    );
    (DeviceManager::new(store.clone(), wg.clone(), allocator), store, wg)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn enrollment_assigns_sequential_dual_stack_addresses() {
    let (mgr, _, _) = manager();
    let alice = identity("alice");

    let first = mgr
        .add_device(&alice, "laptop", &key(0), None, None)
        .await
        .unwrap();
    let second = mgr
        .add_device(&alice, "phone", &key(1), None, None)
        .await
        .unwrap();

    assert_eq!(first.address, "10.44.0.2/32, fd48:4c4:7aa9::2/128");
    assert_eq!(second.address, "10.44.0.3/32, fd48:4c4:7aa9::3/128");
    assert_eq!(
        first.addresses(),
        vec!["10.44.0.2/32", "fd48:4c4:7aa9::2/128"]
    );
}

#[tokio::test]
async fn device_names_are_scoped_per_owner() {
    let (mgr, _, _) = manager();

    mgr.add_device(&identity("alice"), "laptop", &key(0), None, None)
        .await
        .unwrap();

    let err = mgr
        .add_device(&identity("alice"), "laptop", &key(1), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::NameTaken));

    mgr.add_device(&identity("bob"), "laptop", &key(2), None, None)
        .await
        .unwrap();

    let users = mgr.list_users().await.unwrap();
    assert_eq!(users.len(), 2);
}

#[tokio::test]
async fn initial_sync_converges_stale_peer_table() {
    let (mgr, _, wg) = manager();
    let alice = identity("alice");

    let device = mgr
        .add_device(&alice, "laptop", &key(0), None, None)
        .await
        .unwrap();
    // a leftover peer from a previous run, unknown to the store
    wg.add_peer(&key(9), None, &["10.44.0.99/32".to_string()])
        .await
        .unwrap();

    let handle = mgr
        .start_sync(true, false, Duration::from_secs(3600))
        .await
        .unwrap();

    assert!(wg.contains_peer(&device.public_key));
    assert!(!wg.contains_peer(&key(9)));
    assert_eq!(wg.allowed_ips(&device.public_key).unwrap(), device.addresses());

    handle.shutdown().await;
}

#[tokio::test]
async fn store_events_drive_the_peer_table() {
    let (mgr, _, wg) = manager();
    let alice = identity("alice");

    let handle = mgr
        .start_sync(true, false, Duration::from_secs(3600))
        .await
        .unwrap();

    mgr.add_device(&alice, "laptop", &key(0), None, None)
        .await
        .unwrap();
    wait_for(|| wg.contains_peer(&key(0))).await;

    mgr.delete_device("alice", "laptop").await.unwrap();
    wait_for(|| !wg.contains_peer(&key(0))).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn deleting_a_user_removes_all_their_peers() {
    let (mgr, store, wg) = manager();

    let handle = mgr
        .start_sync(true, false, Duration::from_secs(3600))
        .await
        .unwrap();

    mgr.add_device(&identity("alice"), "laptop", &key(0), None, None)
        .await
        .unwrap();
    mgr.add_device(&identity("alice"), "phone", &key(1), None, None)
        .await
        .unwrap();
    mgr.add_device(&identity("bob"), "laptop", &key(2), None, None)
        .await
        .unwrap();
    wait_for(|| wg.peer_count() == 3).await;

    mgr.delete_devices_for_user("alice").await.unwrap();
    wait_for(|| wg.peer_count() == 1).await;
    assert!(wg.contains_peer(&key(2)));

    use tollgate_daemon::DeviceStore;
    assert!(store.list(Some("alice")).await.unwrap().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn ping_reports_healthy_backends() {
    let (mgr, _, _) = manager();
    mgr.ping().await.unwrap();
}
