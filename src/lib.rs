//! Print shop order sync.
//!
//! Keeps the shop's order list in a hosted Supabase project when credentials
//! are available and falls back to a local SQLite key-value store when they
//! are not. [`SyncController`] is the single entry point: it picks the mode
//! at startup, publishes the order snapshot on a watch channel, and routes
//! every mutation to whichever store is active.

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub mod api;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod remote;
pub mod sync;
#[cfg(test)]
mod test_support;

pub use api::{SupabaseClient, SupabaseConnector};
pub use catalog::{Catalog, ColorSwatch, StockTexture};
pub use config::{RemoteConfig, SyncConfig};
pub use db::{LocalStore, SqliteStore};
pub use error::{RemoteError, Result, StoreError, SyncError};
pub use logging::{init_logging, prune_old_logs};
pub use models::{
    Customer, NewOrder, Order, OrderStatus, PartColors, ProductConfig, Texture,
};
pub use remote::{ChangeEvent, ChangeKind, Connector, EventMask, RemoteStore, SelectQuery, Subscription};
pub use sync::{Snapshot, SyncController};

/// Render the build epoch embedded by the build script as RFC 3339.
fn build_time(epoch: &str) -> String {
    epoch
        .parse::<i64>()
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Run the sync daemon until Ctrl-C.
pub async fn run() -> anyhow::Result<()> {
    let data_dir = std::env::var_os("PRINTSHOP_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| SyncConfig::default().data_dir);

    let _guard = logging::init_logging(&data_dir)
        .map_err(anyhow::Error::msg)
        .context("initialize logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        revision = env!("PRINTSHOP_BUILD_REVISION"),
        built = %build_time(env!("PRINTSHOP_BUILD_EPOCH")),
        "Starting printshop-sync"
    );

    let config = SyncConfig::from_env();
    let store = SqliteStore::open(&config.data_dir)
        .with_context(|| format!("open local store in {}", config.data_dir.display()))?;
    info!(path = %store.path().display(), "local store ready");

    let controller = SyncController::with_supabase(config, Arc::new(store));
    let online = controller.init().await;
    info!(online, orders = controller.snapshot().len(), "sync controller started");

    let mut snapshots = controller.subscribe_snapshot();
    let mut online_rx = controller.subscribe_online();
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("Ctrl-C handler failed: {e}");
                }
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let orders = snapshots.borrow_and_update().clone();
                let unpaid = orders.iter().filter(|o| !o.paid).count();
                info!(orders = orders.len(), unpaid, "order snapshot updated");
            }
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow_and_update();
                info!(online, "sync mode changed");
            }
        }
    }

    controller.teardown();
    info!("printshop-sync stopped");
    Ok(())
}
