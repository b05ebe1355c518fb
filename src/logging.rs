//! Structured logging: console plus a daily-rolling file under
//! `<data_dir>/logs`.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum number of rolled log files to keep.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling appender.
pub const LOG_FILE_PREFIX: &str = "printshop";

const DEFAULT_FILTER: &str = "info,printshop_sync_lib=debug,printshop_sync=debug";

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Install the global subscriber. The returned guard flushes the file writer
/// when dropped, so the caller keeps it alive for the life of the process.
///
/// `RUST_LOG` overrides the default filter. `PRINTSHOP_LOG_JSON=1` writes the
/// file layer as JSON lines.
pub fn init_logging(data_dir: &Path) -> Result<WorkerGuard, String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir)
        .map_err(|e| format!("create log dir {}: {e}", dir.display()))?;
    prune_old_logs(&dir);

    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let json = std::env::var("PRINTSHOP_LOG_JSON")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);

    let text_file_layer = (!json).then(|| {
        fmt::layer()
            .with_writer(non_blocking.clone())
            .with_ansi(false)
            .with_target(true)
    });
    let json_file_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
    });
    let console_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_file_layer)
        .with(json_file_layer)
        .try_init()
        .map_err(|e| format!("install tracing subscriber: {e}"))?;

    Ok(guard)
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) {
                return None;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            Some((path, modified))
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
