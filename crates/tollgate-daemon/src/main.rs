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

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use tollgate_daemon::{
    AddressAllocator, AppConfig, DeviceManager, DeviceStore, MemoryStore, MemoryWg, WgControl,
    configure_forwarding,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "WireGuard VPN access daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/tollgate/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    info!(config = %args.config.display(), "starting tollgate-daemon");
    let config = AppConfig::load(&args.config).await?;

    let store = MemoryStore::new();
    let allocator = AddressAllocator::new(config.vpn.cidr, config.vpn.cidr_v6);

    if config.wireguard.enabled {
        #[cfg(target_os = "linux")]
        {
            let wg = tollgate_daemon::wg::KernelWg::new(config.wireguard.interface.clone());
            wg.ensure_interface().await?;
            wg.configure_addresses(&allocator.server_addresses()).await?;
            return run(config, store, wg, allocator).await;
        }

        #[cfg(not(target_os = "linux"))]
        {
            return Err("kernel wireguard requires linux; set wireguard.enabled = false \
                        to run with the in-memory backend"
                .into());
        }
    }

    info!("wireguard is disabled, using the in-memory peer table");
    run(config, store, MemoryWg::new(), allocator).await
}

async fn run<S: DeviceStore, W: WgControl>(
    config: AppConfig,
    store: S,
    wg: W,
    allocator: AddressAllocator,
) -> Result<(), Box<dyn std::error::Error>> {
    let manager = DeviceManager::new(store, wg, allocator);

    let handle = manager
        .start_sync(
            config.devices.disable_metadata,
            config.devices.enable_inactive_eviction,
            config.inactive_grace_period(),
        )
        .await?;

    configure_forwarding(&config.forwarding_options()).await?;

    info!("tollgate-daemon is up");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
