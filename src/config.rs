//! Sync configuration and persisted remote credentials.
//!
//! All configuration the controller needs is carried by [`SyncConfig`] and
//! passed in explicitly. Remote credentials are persisted in the local store
//! under [`KEY_REMOTE_CONFIG`] so a restart comes back in the same mode.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::Url;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::db::LocalStore;
use crate::error::SyncError;

// Local store keys
pub const KEY_REMOTE_CONFIG: &str = "remote_config";
pub const KEY_ORDERS: &str = "orders";
pub const KEY_CUSTOMERS: &str = "customers";
pub const KEY_COLORS: &str = "colors";
pub const KEY_TEXTURES: &str = "textures";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote project URL:
/// - add a scheme when none is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_remote_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.contains("://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Remote credentials
// ---------------------------------------------------------------------------

/// Credentials for the hosted backend. The key is wiped from memory on drop.
#[derive(Clone)]
pub struct RemoteConfig {
    url: String,
    key: Zeroizing<String>,
}

impl RemoteConfig {
    /// Validate and build credentials from a project URL and API key.
    pub fn new(url: &str, key: &str) -> Result<Self, SyncError> {
        if url.trim().is_empty() {
            return Err(SyncError::ConfigInvalid("missing remote URL".into()));
        }
        let url = normalize_remote_url(url);
        let parsed = Url::parse(&url)
            .map_err(|e| SyncError::ConfigInvalid(format!("invalid remote URL {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(SyncError::ConfigInvalid(format!(
                "remote URL must be http(s) with a host: {url}"
            )));
        }

        let key = key.trim();
        if key.is_empty() {
            return Err(SyncError::ConfigInvalid("missing remote API key".into()));
        }

        Ok(Self {
            url,
            key: Zeroizing::new(key.to_string()),
        })
    }

    /// Parse a persisted credentials blob.
    ///
    /// Accepts a JSON object (`{"url": ..., "key": ...}`, with the
    /// `supabaseUrl` / `anonKey` spellings as aliases) or the same object
    /// encoded as a base64 connection string.
    pub fn parse(raw: &str) -> Result<Self, SyncError> {
        let payload = decode_connection_payload(raw)
            .ok_or_else(|| SyncError::ConfigInvalid("credentials blob is not JSON".into()))?;
        if !payload.is_object() {
            return Err(SyncError::ConfigInvalid(
                "credentials blob is not an object".into(),
            ));
        }

        let url = str_any(&payload, &["url", "supabaseUrl", "supabase_url"])
            .ok_or_else(|| SyncError::ConfigInvalid("missing field: url".into()))?;
        let key = str_any(
            &payload,
            &["key", "anonKey", "anon_key", "supabaseAnonKey", "supabase_anon_key"],
        )
        .ok_or_else(|| SyncError::ConfigInvalid("missing field: key".into()))?;

        Self::new(&url, &key)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialize for persistence. The result contains the secret key.
    pub fn to_blob(&self) -> String {
        serde_json::json!({ "url": self.url, "key": self.key.as_str() }).to_string()
    }
}

impl PartialEq for RemoteConfig {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.key.as_str() == other.key.as_str()
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .finish()
    }
}

fn decode_connection_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 8 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64.trim_end_matches('='),
        "=".repeat((4 - base64.trim_end_matches('=').len() % 4) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn str_any(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| v.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Read the persisted credentials. Absent or invalid blobs are
/// `ConfigInvalid`.
pub fn load_remote_config(store: &dyn LocalStore) -> Result<RemoteConfig, SyncError> {
    match store.get(KEY_REMOTE_CONFIG)? {
        Some(raw) if !raw.trim().is_empty() => RemoteConfig::parse(&raw),
        _ => Err(SyncError::ConfigInvalid("no remote credentials stored".into())),
    }
}

/// Persist credentials, or clear them with `None`.
pub fn save_remote_config(
    store: &dyn LocalStore,
    remote: Option<&RemoteConfig>,
) -> Result<(), SyncError> {
    match remote {
        Some(cfg) => {
            store.set(KEY_REMOTE_CONFIG, &cfg.to_blob())?;
            info!(url = %cfg.url(), "remote credentials saved");
        }
        None => {
            store.remove(KEY_REMOTE_CONFIG)?;
            info!("remote credentials cleared");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

/// Explicit configuration for the sync controller.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory holding the SQLite store and log files.
    pub data_dir: PathBuf,
    /// Credentials that take precedence over the persisted blob.
    pub remote: Option<RemoteConfig>,
    pub orders_table: String,
    pub customers_table: String,
    /// How often the remote change feed polls for changes.
    pub poll_interval: Duration,
    /// Store customers as their own records and reference them by id.
    pub normalized_customers: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("printshop-data"),
            remote: None,
            orders_table: "orders".to_string(),
            customers_table: "customers".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            normalized_customers: false,
        }
    }
}

impl SyncConfig {
    /// Build configuration from `PRINTSHOP_*` environment variables, falling
    /// back to defaults. Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env_str("PRINTSHOP_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        match (
            env_str("PRINTSHOP_SUPABASE_URL"),
            env_str("PRINTSHOP_SUPABASE_KEY"),
        ) {
            (Some(url), Some(key)) => match RemoteConfig::new(&url, &key) {
                Ok(remote) => config.remote = Some(remote),
                Err(e) => warn!("ignoring remote credentials from environment: {e}"),
            },
            (Some(_), None) | (None, Some(_)) => {
                warn!("PRINTSHOP_SUPABASE_URL and PRINTSHOP_SUPABASE_KEY must be set together");
            }
            (None, None) => {}
        }

        if let Some(raw) = env_str("PRINTSHOP_POLL_SECS") {
            match raw
                .parse::<f64>()
                .ok()
                .filter(|secs| *secs > 0.0)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            {
                Some(interval) => config.poll_interval = interval.max(MIN_POLL_INTERVAL),
                None => warn!(value = %raw, "invalid PRINTSHOP_POLL_SECS"),
            }
        }

        if let Some(raw) = env_str("PRINTSHOP_NORMALIZED_CUSTOMERS") {
            match parse_flag(&raw) {
                Some(flag) => config.normalized_customers = flag,
                None => warn!(value = %raw, "invalid PRINTSHOP_NORMALIZED_CUSTOMERS"),
            }
        }

        config
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
