//! Supabase REST client.
//!
//! Implements [`RemoteStore`] over the PostgREST endpoint at
//! `{url}/rest/v1/{table}`, authenticated with the project's anon key. The
//! change feed polls the table and diffs per-row digests, emitting one
//! [`ChangeEvent`] per inserted, updated, or deleted row.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::remote::{
    ChangeEvent, ChangeKind, Connector, EventMask, RemoteStore, SelectQuery, Subscription,
};

/// Default timeout for REST requests (20 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Buffered change events per subscription.
const EVENT_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly error.
fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    let message = if err.is_connect() {
        "cannot reach server".to_string()
    } else if err.is_timeout() {
        "request timed out".to_string()
    } else {
        err.to_string()
    };
    RemoteError::Network {
        url: url.to_string(),
        message,
    }
}

/// Convert an HTTP status code into a user-friendly message.
fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Access denied by row-level security".to_string(),
        404 => "Table not found".to_string(),
        409 => "Record conflicts with an existing row".to_string(),
        s if s >= 500 => "Remote server error".to_string(),
        _ => "Unexpected response from remote store".to_string(),
    }
}

/// Table names are interpolated into the URL path.
fn validate_table(table: &str) -> Result<(), RemoteError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RemoteError::Rejected(format!("invalid table name: {table}")))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct Inner {
    http: Client,
    rest_base: Url,
    key: zeroize::Zeroizing<String>,
    poll_interval: Duration,
}

/// Handle to a Supabase project. Cheap to clone.
#[derive(Clone)]
pub struct SupabaseClient {
    inner: Arc<Inner>,
}

impl SupabaseClient {
    /// Build a client. Performs no I/O.
    pub fn new(config: &RemoteConfig, poll_interval: Duration) -> Result<Self, RemoteError> {
        let rest_base = Url::parse(&format!("{}/rest/v1/", config.url())).map_err(|e| {
            RemoteError::InvalidUrl {
                url: config.url().to_string(),
                reason: e.to_string(),
            }
        })?;

        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Client(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                rest_base,
                key: zeroize::Zeroizing::new(config.key().to_string()),
                poll_interval,
            }),
        })
    }

    /// Build the URL for a table with PostgREST query parameters.
    pub(crate) fn table_url(&self, table: &str, query: &SelectQuery) -> Result<Url, RemoteError> {
        validate_table(table)?;
        let mut url = self
            .inner
            .rest_base
            .join(table)
            .map_err(|e| RemoteError::InvalidUrl {
                url: self.inner.rest_base.to_string(),
                reason: e.to_string(),
            })?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("select", "*");
            for (column, value) in &query.filters {
                qp.append_pair(column, &format!("eq.{value}"));
            }
            if let Some(order) = &query.order_by {
                let dir = if order.descending { "desc" } else { "asc" };
                qp.append_pair("order", &format!("{}.{dir}", order.column));
            }
        }
        Ok(url)
    }

    fn id_url(&self, table: &str, id: &str) -> Result<Url, RemoteError> {
        validate_table(table)?;
        let mut url = self
            .inner
            .rest_base
            .join(table)
            .map_err(|e| RemoteError::InvalidUrl {
                url: self.inner.rest_base.to_string(),
                reason: e.to_string(),
            })?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let key = self.inner.key.as_str();
        self.inner
            .http
            .request(method, url)
            .header("apikey", key)
            .header("Authorization", format!("Bearer {key}"))
            .header("Content-Type", "application/json")
    }

    /// Send a request and return the JSON body, or `Null` for empty bodies.
    async fn send(&self, req: RequestBuilder, url: &Url) -> Result<Value, RemoteError> {
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(url.as_str(), &e))?;
        let status = resp.status();

        if !status.is_success() {
            // Preserve PostgREST error details for diagnostics.
            let body_text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|json| {
                    json.get("message")
                        .or_else(|| json.get("error"))
                        .and_then(Value::as_str)
                        .map(ToString::to_string)
                })
                .unwrap_or_else(|| status_message(status));
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body_text = resp.text().await.unwrap_or_default();
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteStore for SupabaseClient {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>, RemoteError> {
        let url = self.table_url(table, query)?;
        let body = self.send(self.request(Method::GET, url.clone()), &url).await?;
        match body {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(RemoteError::Decode(format!(
                "expected an array of rows, got {other}"
            ))),
        }
    }

    async fn insert(&self, table: &str, record: Value) -> Result<(), RemoteError> {
        let url = self.table_url(table, &SelectQuery::default())?;
        let req = self
            .request(Method::POST, url.clone())
            .header("Prefer", "return=minimal")
            .json(&record);
        self.send(req, &url).await?;
        debug!(table, "remote insert ok");
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<(), RemoteError> {
        let url = self.id_url(table, id)?;
        let req = self
            .request(Method::PATCH, url.clone())
            .header("Prefer", "return=minimal")
            .json(&patch);
        self.send(req, &url).await?;
        debug!(table, id, "remote update ok");
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let url = self.id_url(table, id)?;
        self.send(self.request(Method::DELETE, url.clone()), &url)
            .await?;
        debug!(table, id, "remote delete ok");
        Ok(())
    }

    async fn subscribe(&self, table: &str, mask: EventMask) -> Result<Subscription, RemoteError> {
        validate_table(table)?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let client = self.clone();
        let table = table.to_string();
        let token = cancel.clone();
        tokio::spawn(async move {
            poll_changes(client, table, mask, tx, token).await;
        });

        Ok(Subscription::new(rx, cancel))
    }
}

// ---------------------------------------------------------------------------
// Change feed
// ---------------------------------------------------------------------------

/// Per-row digests keyed by record id.
fn row_digests(rows: &[Value]) -> HashMap<String, u64> {
    rows.iter()
        .filter_map(|row| {
            let id = match row.get("id")? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let mut hasher = DefaultHasher::new();
            row.to_string().hash(&mut hasher);
            Some((id, hasher.finish()))
        })
        .collect()
}

/// Changes between two digest maps, inserts and updates first, then deletes.
fn diff_digests(
    table: &str,
    previous: &HashMap<String, u64>,
    current: &HashMap<String, u64>,
) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    let mut ids: Vec<&String> = current.keys().collect();
    ids.sort();
    for id in ids {
        let kind = match previous.get(id) {
            None => ChangeKind::Insert,
            Some(old) if old != &current[id] => ChangeKind::Update,
            Some(_) => continue,
        };
        events.push(ChangeEvent {
            table: table.to_string(),
            kind,
            record_id: Some(id.clone()),
        });
    }
    let mut gone: Vec<&String> = previous.keys().filter(|id| !current.contains_key(*id)).collect();
    gone.sort();
    for id in gone {
        events.push(ChangeEvent {
            table: table.to_string(),
            kind: ChangeKind::Delete,
            record_id: Some(id.clone()),
        });
    }
    events
}

async fn poll_changes(
    client: SupabaseClient,
    table: String,
    mask: EventMask,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
) {
    info!(table = %table, interval_ms = client.inner.poll_interval.as_millis() as u64, "change feed started");
    let mut baseline: Option<HashMap<String, u64>> = None;

    loop {
        match client.select(&table, &SelectQuery::all()).await {
            Ok(rows) => {
                let current = row_digests(&rows);
                if let Some(previous) = baseline.as_ref() {
                    for event in diff_digests(&table, previous, &current) {
                        if !mask.matches(event.kind) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            info!(table = %table, "change feed receiver dropped");
                            return;
                        }
                    }
                }
                baseline = Some(current);
            }
            Err(e) => warn!(table = %table, "change feed poll failed: {e}"),
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(table = %table, "change feed stopped");
                return;
            }
            _ = tokio::time::sleep(client.inner.poll_interval) => {}
        }
    }
}

/// [`Connector`] producing [`SupabaseClient`] handles.
#[derive(Debug, Clone)]
pub struct SupabaseConnector {
    pub poll_interval: Duration,
}

impl Connector for SupabaseConnector {
    fn connect(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        let client = SupabaseClient::new(config, self.poll_interval)?;
        info!(url = %config.url(), "Supabase client ready");
        Ok(Arc::new(client))
    }
}
