//! In-memory remote store used by the controller tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RemoteConfig;
use crate::error::RemoteError;
use crate::remote::{
    ChangeEvent, ChangeKind, Connector, EventMask, RemoteStore, SelectQuery, Subscription,
};

type Subscriber = (String, EventMask, mpsc::Sender<ChangeEvent>);

/// Table rows held in memory. Writes notify subscribers the way a realtime
/// backend would.
#[derive(Default)]
pub(crate) struct MockRemote {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    pub fail_select: AtomicBool,
    pub fail_insert: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_delete: AtomicBool,
    rejected_insert_table: Mutex<Option<String>>,
    pub select_calls: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace table contents without notifying anyone.
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        self.tables.lock().unwrap().insert(table.to_string(), rows);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn live_subscribers(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, tx)| !tx.is_closed())
            .count()
    }

    /// Fail inserts into `table` only.
    pub fn reject_inserts_into(&self, table: &str) {
        *self.rejected_insert_table.lock().unwrap() = Some(table.to_string());
    }

    pub fn selects(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }

    /// Push a change event to matching subscribers.
    pub fn emit(&self, table: &str, kind: ChangeKind, record_id: Option<&str>) {
        let subs = self.subscribers.lock().unwrap();
        for (sub_table, mask, tx) in subs.iter() {
            if sub_table == table && mask.matches(kind) {
                let _ = tx.try_send(ChangeEvent {
                    table: table.to_string(),
                    kind,
                    record_id: record_id.map(ToString::to_string),
                });
            }
        }
    }
}

fn field_as_string(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn mock_failure(op: &str) -> RemoteError {
    RemoteError::Status {
        status: 503,
        message: format!("simulated {op} failure"),
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>, RemoteError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_select.load(Ordering::SeqCst) {
            return Err(mock_failure("select"));
        }
        let mut rows: Vec<Value> = self
            .rows(table)
            .into_iter()
            .filter(|row| {
                query
                    .filters
                    .iter()
                    .all(|(col, val)| field_as_string(row, col).as_deref() == Some(val.as_str()))
            })
            .collect();
        if let Some(order) = &query.order_by {
            rows.sort_by(|a, b| {
                let ka = field_as_string(a, &order.column);
                let kb = field_as_string(b, &order.column);
                if order.descending {
                    kb.cmp(&ka)
                } else {
                    ka.cmp(&kb)
                }
            });
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, record: Value) -> Result<(), RemoteError> {
        let rejected = self.rejected_insert_table.lock().unwrap().as_deref() == Some(table);
        if rejected || self.fail_insert.load(Ordering::SeqCst) {
            return Err(mock_failure("insert"));
        }
        let id = field_as_string(&record, "id");
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(record);
        self.emit(table, ChangeKind::Insert, id.as_deref());
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<(), RemoteError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(mock_failure("update"));
        }
        {
            let mut tables = self.tables.lock().unwrap();
            let rows = tables.entry(table.to_string()).or_default();
            for row in rows.iter_mut() {
                if field_as_string(row, "id").as_deref() == Some(id) {
                    if let (Value::Object(target), Value::Object(changes)) = (row, &patch) {
                        for (k, v) in changes {
                            target.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
        }
        self.emit(table, ChangeKind::Update, Some(id));
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(mock_failure("delete"));
        }
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .retain(|row| field_as_string(row, "id").as_deref() != Some(id));
        self.emit(table, ChangeKind::Delete, Some(id));
        Ok(())
    }

    async fn subscribe(&self, table: &str, mask: EventMask) -> Result<Subscription, RemoteError> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .lock()
            .unwrap()
            .push((table.to_string(), mask, tx));
        Ok(Subscription::new(rx, CancellationToken::new()))
    }
}

/// Hands out a shared [`MockRemote`], or fails construction on demand.
pub(crate) struct MockConnector {
    pub remote: Arc<MockRemote>,
    pub fail: bool,
    pub connects: AtomicUsize,
}

impl MockConnector {
    pub fn new(remote: Arc<MockRemote>) -> Arc<Self> {
        Arc::new(Self {
            remote,
            fail: false,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            remote: MockRemote::new(),
            fail: true,
            connects: AtomicUsize::new(0),
        })
    }
}

impl Connector for MockConnector {
    fn connect(&self, _config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(RemoteError::Client("simulated construction failure".into()));
        }
        Ok(self.remote.clone())
    }
}
