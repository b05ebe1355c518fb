//! Remote store seam.
//!
//! The controller only talks to the hosted backend through [`RemoteStore`]
//! and builds handles through a [`Connector`], so mode selection can be
//! exercised without a network.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RemoteConfig;
use crate::error::RemoteError;

/// Kind of row change reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Which change kinds a subscription wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventMask {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

impl EventMask {
    pub const ALL: Self = Self {
        insert: true,
        update: true,
        delete: true,
    };

    pub fn matches(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Insert => self.insert,
            ChangeKind::Update => self.update,
            ChangeKind::Delete => self.delete,
        }
    }
}

/// One notification from the change feed. `record_id` is `None` when the
/// feed cannot tell which row changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub record_id: Option<String>,
}

/// Ordering for a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// Parameters for a collection read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectQuery {
    /// Equality filters as `(column, value)` pairs.
    pub filters: Vec<(String, String)>,
    pub order_by: Option<OrderBy>,
}

impl SelectQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn newest_first(mut self, column: &str) -> Self {
        self.order_by = Some(OrderBy {
            column: column.to_string(),
            descending: true,
        });
        self
    }
}

/// A live change-feed registration. Dropping it, or calling
/// [`Subscription::cancel`], stops delivery.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Next event, or `None` once the feed has ended or been cancelled.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Discard events already queued, returning how many were dropped. A
    /// consumer that refetches everything on any event calls this so a burst
    /// of changes costs one read.
    pub fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        while self.events.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Collection-style CRUD plus a change feed over the hosted backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, query: &SelectQuery) -> Result<Vec<Value>, RemoteError>;

    async fn insert(&self, table: &str, record: Value) -> Result<(), RemoteError>;

    /// Apply `patch` to the record with `id`.
    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<(), RemoteError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError>;

    async fn subscribe(&self, table: &str, mask: EventMask) -> Result<Subscription, RemoteError>;
}

/// Builds remote handles from credentials. Construction must not need a
/// network round-trip.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &RemoteConfig) -> Result<Arc<dyn RemoteStore>, RemoteError>;
}
