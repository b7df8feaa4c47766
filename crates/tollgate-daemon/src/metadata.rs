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

//! Periodic peer metadata collection.
//!
//! Every tick the reconciler reads the live peer list, turns the kernel's
//! cumulative transfer counters into deltas against a per-key cache, and
//! folds endpoint, handshake and traffic updates back into the store.
//! Working with deltas rather than absolute values keeps stored totals
//! monotonic across interface restarts and lets several replicas account
//! traffic against a shared store.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, warn};

use crate::devices::{DeviceManager, is_connected};
use crate::storage::DeviceStore;
use crate::wg::WgControl;

const COLLECTION_INTERVAL: Duration = Duration::from_secs(30);

/// Last observed cumulative counters for one peer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerByteStats {
    pub(crate) receive_bytes: i64,
    pub(crate) transmit_bytes: i64,
}

pub(crate) async fn run<S: DeviceStore, W: WgControl>(
    mgr: DeviceManager<S, W>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(COLLECTION_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => reconcile(&mgr).await,
        }
    }
}

/// One metadata pass over all live peers. Failures are confined to the
/// peer (or the tick) they occur in.
pub(crate) async fn reconcile<S: DeviceStore, W: WgControl>(mgr: &DeviceManager<S, W>) {
    let peers = match mgr.inner.wg.list_peers().await {
        Ok(peers) => peers,
        Err(e) => {
            warn!(error = %e, "failed to list peers, skipping metadata tick");
            return;
        }
    };

    let mut live_keys = HashSet::with_capacity(peers.len());

    for peer in &peers {
        // a peer that never had an endpoint never exchanged data
        let Some(endpoint) = peer.endpoint else {
            continue;
        };
        live_keys.insert(peer.public_key.clone());

        let mut device = match mgr.get_by_public_key(&peer.public_key).await {
            Ok(device) => device,
            Err(_) => continue,
        };

        // only track peers that are connected now or were at the last pass
        if !is_connected(peer.last_handshake) && !is_connected(device.last_handshake) {
            continue;
        }

        match mgr.inner.peer_stats.get_mut(&peer.public_key) {
            None => {
                // first sighting: seed the cache, don't account any bytes.
                // the counters seen now may predate this process.
                mgr.inner.peer_stats.insert(
                    peer.public_key.clone(),
                    PeerByteStats {
                        receive_bytes: peer.receive_bytes,
                        transmit_bytes: peer.transmit_bytes,
                    },
                );
            }
            Some(mut cached) => {
                let rx_delta = counter_delta(
                    peer.receive_bytes - cached.receive_bytes,
                    peer.receive_bytes,
                    "rx",
                    &peer.public_key,
                );
                let tx_delta = counter_delta(
                    peer.transmit_bytes - cached.transmit_bytes,
                    peer.transmit_bytes,
                    "tx",
                    &peer.public_key,
                );
                cached.receive_bytes = peer.receive_bytes;
                cached.transmit_bytes = peer.transmit_bytes;
                drop(cached);

                if rx_delta > 0 || tx_delta > 0 {
                    if let Err(e) = mgr
                        .inner
                        .store
                        .add_byte_counts(&peer.public_key, rx_delta, tx_delta)
                        .await
                    {
                        error!(public_key = %peer.public_key, error = %e, "failed to record byte counts");
                    }
                }
            }
        }

        device.endpoint = Some(endpoint.ip().to_string());
        device.last_handshake = peer.last_handshake;
        if let Err(e) = mgr.save_device(device).await {
            error!(public_key = %peer.public_key, error = %e, "failed to save device metadata");
        }
    }

    // drop cache entries for peers that disappeared or lost their endpoint
    mgr.inner
        .peer_stats
        .retain(|key, _| live_keys.contains(key));
}

/// A negative delta means the kernel counter was reset (interface bounce,
/// peer re-add). Substitute the current absolute value so the traffic seen
/// since the reset is still accounted.
fn counter_delta(delta: i64, current: i64, counter: &str, public_key: &str) -> i64 {
    if delta < 0 {
        warn!(
            public_key,
            counter, current, "negative counter delta, assuming counter reset"
        );
        current
    } else {
        delta
    }
}
