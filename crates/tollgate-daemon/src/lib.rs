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

//! WireGuard access daemon: device enrollment with address allocation,
//! continuous reconciliation of the kernel peer table against the device
//! store, peer metadata collection, and host firewall programming.

pub mod alloc;
pub mod config;
pub mod devices;
pub mod firewall;
mod metadata;
pub mod storage;
pub mod wg;

pub use alloc::{AddressAllocator, AllocError, ManualAddress};
pub use config::{AppConfig, ConfigError};
pub use devices::{DeviceError, DeviceManager, SyncHandle, is_connected, is_valid_wg_key};
pub use firewall::{FirewallBackend, FirewallError, ForwardingOptions, configure_forwarding};
pub use storage::{DeviceStore, MemoryStore, StoreError, StoreEvent};
pub use wg::{MemoryWg, WgControl, WgError};
