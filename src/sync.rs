//! Order sync controller.
//!
//! Decides at startup whether orders live in the remote store (online) or in
//! the local store (offline), owns the canonical in-memory order snapshot,
//! and routes every mutation to the active store.
//!
//! Online, the snapshot is whatever the last completed full read of the
//! `orders` table returned: every change-feed event triggers a fresh sorted
//! read that replaces the whole snapshot. Offline, the snapshot is
//! authoritative and every mutation writes the entire collection back to the
//! local store before returning.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::SupabaseConnector;
use crate::catalog::Catalog;
use crate::config::{self, RemoteConfig, SyncConfig, KEY_CUSTOMERS, KEY_ORDERS};
use crate::db::{self, LocalStore};
use crate::error::{Result, SyncError};
use crate::models::{
    decode_orders, encode_order, sort_newest_first, Customer, CustomerDirectory,
    CustomerEncoding, NewOrder, Order, OrderStatus,
};
use crate::remote::{Connector, EventMask, RemoteStore, SelectQuery};

/// Published order snapshot.
pub type Snapshot = Arc<Vec<Order>>;

// ---------------------------------------------------------------------------
// Online reconciliation
// ---------------------------------------------------------------------------

/// Everything needed to re-read the remote collection and publish it.
/// Cloned into the change listener task.
#[derive(Clone)]
struct Reconciler {
    remote: Arc<dyn RemoteStore>,
    orders_table: String,
    customers_table: String,
    snapshot_tx: Arc<watch::Sender<Snapshot>>,
}

impl Reconciler {
    /// Full sorted read of the orders table; replaces the snapshot.
    async fn refetch(&self) -> Result<usize> {
        let query = SelectQuery::all().newest_first("created_at");
        let rows = self.remote.select(&self.orders_table, &query).await?;
        let decoded = decode_orders(rows);

        let directory = if decoded.iter().any(|o| o.is_normalized()) {
            let customers = self
                .remote
                .select(&self.customers_table, &SelectQuery::all())
                .await?;
            CustomerDirectory::from_records(&customers)
        } else {
            CustomerDirectory::default()
        };

        let mut orders: Vec<Order> = decoded
            .into_iter()
            .map(|o| o.resolve(&directory))
            .collect();
        sort_newest_first(&mut orders);

        let count = orders.len();
        self.snapshot_tx.send_replace(Arc::new(orders));
        debug!(count, "order snapshot refreshed from remote");
        Ok(count)
    }
}

/// Customer record change made on behalf of an order being created.
#[derive(Debug)]
enum CustomerWrite {
    Untouched,
    Created(String),
    Updated { id: String, previous: Value },
}

impl CustomerWrite {
    fn id(&self) -> Option<&str> {
        match self {
            Self::Untouched => None,
            Self::Created(id) | Self::Updated { id, .. } => Some(id),
        }
    }
}

fn customer_patch(customer: &Customer) -> Result<Value> {
    let mut patch =
        serde_json::to_value(customer).map_err(|e| SyncError::LocalParse(e.to_string()))?;
    if let Value::Object(ref mut map) = patch {
        map.remove("id");
    }
    Ok(patch)
}

struct Listener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Offline load
// ---------------------------------------------------------------------------

/// Read and decode the local order collection. Never fails: an unreadable
/// blob is logged and treated as no orders.
pub fn load_offline_orders(store: &dyn LocalStore) -> Vec<Order> {
    let records = match db::read_json_array(store, KEY_ORDERS) {
        Ok(records) => records,
        Err(e) => {
            warn!("local orders unreadable, starting empty: {e}");
            return Vec::new();
        }
    };

    let decoded = decode_orders(records);
    let migrated = decoded.iter().filter(|o| o.migrated).count();
    if migrated > 0 {
        info!(migrated, "migrated legacy single-product orders");
    }

    let directory = if decoded.iter().any(|o| o.is_normalized()) {
        load_local_customers(store)
    } else {
        CustomerDirectory::default()
    };

    decoded.into_iter().map(|o| o.resolve(&directory)).collect()
}

fn load_local_customers(store: &dyn LocalStore) -> CustomerDirectory {
    match db::read_json_array(store, KEY_CUSTOMERS) {
        Ok(records) => CustomerDirectory::from_records(&records),
        Err(e) => {
            warn!("local customers unreadable: {e}");
            CustomerDirectory::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Owner of the order snapshot and router for order mutations.
pub struct SyncController {
    config: RwLock<SyncConfig>,
    local: Arc<dyn LocalStore>,
    connector: Arc<dyn Connector>,
    catalog: RwLock<Catalog>,
    online: RwLock<Option<Reconciler>>,
    offline_orders: Mutex<Vec<Order>>,
    listener: Mutex<Option<Listener>>,
    snapshot_tx: Arc<watch::Sender<Snapshot>>,
    online_tx: watch::Sender<bool>,
}

impl SyncController {
    pub fn new(
        config: SyncConfig,
        local: Arc<dyn LocalStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (online_tx, _) = watch::channel(false);
        let catalog = Catalog::load(local.as_ref());
        Self {
            config: RwLock::new(config),
            local,
            connector,
            catalog: RwLock::new(catalog),
            online: RwLock::new(None),
            offline_orders: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
            snapshot_tx: Arc::new(snapshot_tx),
            online_tx,
        }
    }

    /// Controller backed by the Supabase REST client.
    pub fn with_supabase(config: SyncConfig, local: Arc<dyn LocalStore>) -> Self {
        let connector = Arc::new(SupabaseConnector {
            poll_interval: config.poll_interval,
        });
        Self::new(config, local, connector)
    }

    // -- observation ---------------------------------------------------------

    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn catalog(&self) -> Catalog {
        self.catalog
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// Replace the catalog and persist it.
    pub fn set_catalog(&self, catalog: Catalog) -> Result<()> {
        catalog.save(self.local.as_ref())?;
        if let Ok(mut guard) = self.catalog.write() {
            *guard = catalog;
        }
        Ok(())
    }

    fn config(&self) -> SyncConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn reconciler(&self) -> Option<Reconciler> {
        self.online.read().ok().and_then(|g| g.clone())
    }

    fn customer_encoding(&self, config: &SyncConfig) -> CustomerEncoding {
        if config.normalized_customers {
            CustomerEncoding::ForeignKey
        } else {
            CustomerEncoding::Embedded
        }
    }

    // -- lifecycle -----------------------------------------------------------

    /// Select the operating mode and load the initial snapshot.
    ///
    /// Returns `true` when online. Any previous listener is torn down first,
    /// so this doubles as the re-initialization path.
    pub async fn init(&self) -> bool {
        self.teardown();

        let config = self.config();
        if let Ok(mut guard) = self.catalog.write() {
            *guard = Catalog::load(self.local.as_ref());
        }

        let remote_config = match config.remote.clone() {
            Some(cfg) => Ok(cfg),
            None => config::load_remote_config(self.local.as_ref()),
        };

        let remote = remote_config.and_then(|cfg| {
            self.connector
                .connect(&cfg)
                .map_err(SyncError::RemoteConstruct)
        });

        match remote {
            Ok(remote) => {
                self.start_online(remote, &config).await;
                true
            }
            Err(SyncError::ConfigInvalid(reason)) => {
                info!("no usable remote configuration ({reason}), running offline");
                self.start_offline();
                false
            }
            Err(e) => {
                warn!("remote unavailable, running offline: {e}");
                self.start_offline();
                false
            }
        }
    }

    async fn start_online(&self, remote: Arc<dyn RemoteStore>, config: &SyncConfig) {
        let reconciler = Reconciler {
            remote: remote.clone(),
            orders_table: config.orders_table.clone(),
            customers_table: config.customers_table.clone(),
            snapshot_tx: self.snapshot_tx.clone(),
        };

        if let Ok(mut guard) = self.offline_orders.lock() {
            guard.clear();
        }
        if let Ok(mut guard) = self.online.write() {
            *guard = Some(reconciler.clone());
        }
        self.online_tx.send_replace(true);
        self.snapshot_tx.send_replace(Arc::new(Vec::new()));

        match remote.subscribe(&config.orders_table, EventMask::ALL).await {
            Ok(mut subscription) => {
                let cancel = CancellationToken::new();
                let token = cancel.clone();
                let task_reconciler = reconciler.clone();
                let task = tokio::spawn(async move {
                    loop {
                        let event = tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            event = subscription.recv() => event,
                        };
                        let Some(event) = event else {
                            info!("order change feed ended");
                            break;
                        };
                        // One full read covers every change already queued
                        let coalesced = subscription.drain_pending();
                        debug!(
                            kind = ?event.kind,
                            record_id = ?event.record_id,
                            coalesced,
                            "order change received, refetching"
                        );
                        if let Err(e) = task_reconciler.refetch().await {
                            warn!("order refetch after change failed: {e}");
                        }
                    }
                });
                if let Ok(mut guard) = self.listener.lock() {
                    *guard = Some(Listener { cancel, task });
                }
            }
            Err(e) => warn!("order change feed unavailable, snapshot will not auto-refresh: {e}"),
        }

        match reconciler.refetch().await {
            Ok(count) => info!(count, "online mode: initial order snapshot loaded"),
            Err(e) => error!("online mode: initial order fetch failed: {e}"),
        }
    }

    fn start_offline(&self) {
        if let Ok(mut guard) = self.online.write() {
            *guard = None;
        }
        self.online_tx.send_replace(false);

        let orders = load_offline_orders(self.local.as_ref());
        info!(count = orders.len(), "offline mode: orders loaded from local store");
        if let Ok(mut guard) = self.offline_orders.lock() {
            *guard = orders.clone();
        }
        self.snapshot_tx.send_replace(Arc::new(orders));
    }

    /// Stop listening for remote changes. Safe to call repeatedly.
    pub fn teardown(&self) {
        let listener = self.listener.lock().ok().and_then(|mut g| g.take());
        if let Some(listener) = listener {
            listener.cancel.cancel();
            listener.task.abort();
            info!("order change listener stopped");
        }
    }

    /// Persist new remote credentials (or clear them) and re-initialize.
    pub async fn reconfigure(&self, remote: Option<RemoteConfig>) -> Result<bool> {
        config::save_remote_config(self.local.as_ref(), remote.as_ref())?;
        if let Ok(mut guard) = self.config.write() {
            guard.remote = remote;
        }
        Ok(self.init().await)
    }

    /// Re-read the active store and republish the snapshot.
    pub async fn refresh(&self) -> Result<usize> {
        match self.reconciler() {
            Some(reconciler) => reconciler.refetch().await,
            None => {
                let orders = self
                    .offline_orders
                    .lock()
                    .map(|g| g.clone())
                    .unwrap_or_default();
                let count = orders.len();
                self.snapshot_tx.send_replace(Arc::new(orders));
                Ok(count)
            }
        }
    }

    // -- offline write-through ------------------------------------------------

    /// Apply `change` to a copy of the offline snapshot, persist the whole
    /// collection, then publish. Nothing changes if either step fails.
    fn mutate_offline<T>(&self, change: impl FnOnce(&mut Vec<Order>) -> Result<T>) -> Result<T> {
        let config = self.config();
        let encoding = self.customer_encoding(&config);

        let mut guard = self
            .offline_orders
            .lock()
            .map_err(|_| SyncError::LocalStore(crate::error::StoreError::Poisoned))?;
        let mut next = guard.clone();
        let out = change(&mut next)?;

        let blob = Value::Array(next.iter().map(|o| encode_order(o, encoding)).collect());
        db::write_json(self.local.as_ref(), KEY_ORDERS, &blob)?;

        *guard = next.clone();
        drop(guard);
        self.snapshot_tx.send_replace(Arc::new(next));
        Ok(out)
    }

    fn upsert_local_customer(&self, mut customer: Customer) -> Result<Customer> {
        if customer.tax_key().is_empty() {
            return Ok(customer);
        }
        let mut directory = load_local_customers(self.local.as_ref());
        match directory.find_by_tax_id(&customer.tax_id) {
            Some(existing) => {
                customer.id = existing.id.clone();
                debug!(customer_id = ?customer.id, "updating local customer by tax id");
            }
            None => {
                customer.id = Some(Uuid::new_v4().to_string());
                debug!(customer_id = ?customer.id, "creating local customer");
            }
        }
        directory.insert(customer.clone());
        let blob = serde_json::to_value(directory.customers())
            .map_err(|e| SyncError::LocalParse(e.to_string()))?;
        db::write_json(self.local.as_ref(), KEY_CUSTOMERS, &blob)?;
        Ok(customer)
    }

    async fn upsert_remote_customer(
        &self,
        remote: &dyn RemoteStore,
        table: &str,
        mut customer: Customer,
    ) -> Result<(Customer, CustomerWrite)> {
        if customer.tax_key().is_empty() {
            return Ok((customer, CustomerWrite::Untouched));
        }
        let existing = remote
            .select(table, &SelectQuery::all().eq("tax_id", customer.tax_id.clone()))
            .await?;
        let previous = existing.into_iter().find_map(|row| {
            let id = row.get("id").and_then(Value::as_str)?.to_string();
            Some((id, row))
        });

        match previous {
            Some((id, previous)) => {
                customer.id = Some(id.clone());
                let patch = customer_patch(&customer)?;
                remote.update(table, &id, patch).await?;
                debug!(customer_id = %id, "updated remote customer by tax id");
                Ok((customer, CustomerWrite::Updated { id, previous }))
            }
            None => {
                let id = Uuid::new_v4().to_string();
                customer.id = Some(id.clone());
                let record = serde_json::to_value(&customer)
                    .map_err(|e| SyncError::LocalParse(e.to_string()))?;
                remote.insert(table, record).await?;
                debug!(customer_id = %id, "created remote customer");
                Ok((customer, CustomerWrite::Created(id)))
            }
        }
    }

    /// Undo a customer write whose order never made it to the remote.
    async fn rollback_remote_customer(
        &self,
        remote: &dyn RemoteStore,
        table: &str,
        write: CustomerWrite,
    ) {
        let result = match &write {
            CustomerWrite::Untouched => return,
            CustomerWrite::Created(id) => remote.delete(table, id).await,
            CustomerWrite::Updated { id, previous } => {
                let mut restore = previous.clone();
                if let Value::Object(ref mut map) = restore {
                    map.remove("id");
                }
                remote.update(table, id, restore).await
            }
        };
        match result {
            Ok(()) => info!(customer_id = ?write.id(), "customer write rolled back after failed order insert"),
            Err(e) => error!(customer_id = ?write.id(), "customer rollback failed, record left behind: {e}"),
        }
    }

    // -- mutations ------------------------------------------------------------

    /// Create an order. Online, a rejected insert is returned as an error and
    /// the snapshot is left alone; there is no local fallback write.
    pub async fn create_order(&self, new_order: NewOrder) -> Result<Order> {
        if new_order.products.is_empty() {
            return Err(SyncError::InvalidProduct(
                "an order needs at least one product".into(),
            ));
        }
        {
            let catalog = self.catalog();
            for product in &new_order.products {
                catalog.validate_product(product)?;
            }
        }

        let config = self.config();
        let mut order = Order {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            customer: new_order.customer,
            products: new_order.products,
            status: OrderStatus::default(),
            price: new_order.price,
            paid: false,
        };

        match self.reconciler() {
            Some(online) => {
                let mut customer_write = CustomerWrite::Untouched;
                if config.normalized_customers {
                    let (customer, write) = self
                        .upsert_remote_customer(
                            online.remote.as_ref(),
                            &config.customers_table,
                            order.customer,
                        )
                        .await
                        .inspect_err(|e| error!("customer upsert failed, order not created: {e}"))?;
                    order.customer = customer;
                    customer_write = write;
                }
                let record = encode_order(&order, self.customer_encoding(&config));
                if let Err(e) = online.remote.insert(&config.orders_table, record).await {
                    error!(order_id = %order.id, "remote order insert failed: {e}");
                    self.rollback_remote_customer(
                        online.remote.as_ref(),
                        &config.customers_table,
                        customer_write,
                    )
                    .await;
                    return Err(SyncError::RemoteCall(e));
                }
                info!(order_id = %order.id, "order created (remote)");
            }
            None => {
                if config.normalized_customers {
                    order.customer = self.upsert_local_customer(order.customer)?;
                }
                let created = order.clone();
                self.mutate_offline(move |orders| {
                    orders.push(created);
                    Ok(())
                })?;
                info!(order_id = %order.id, "order created (local)");
            }
        }
        Ok(order)
    }

    /// Change an order's lifecycle status.
    pub async fn update_status(&self, id: &str, status: OrderStatus) -> Result<()> {
        self.update_field(id, "status", Value::String(status.as_str().into()), |o| {
            o.status = status
        })
        .await
    }

    /// Change an order's paid flag.
    pub async fn set_paid(&self, id: &str, paid: bool) -> Result<()> {
        self.update_field(id, "paid", Value::Bool(paid), |o| o.paid = paid)
            .await
    }

    async fn update_field(
        &self,
        id: &str,
        field: &str,
        value: Value,
        apply: impl FnOnce(&mut Order),
    ) -> Result<()> {
        match self.reconciler() {
            Some(online) => {
                let mut patch = serde_json::Map::new();
                patch.insert(field.to_string(), value);
                online
                    .remote
                    .update(&online.orders_table, id, Value::Object(patch))
                    .await
                    .map_err(|e| {
                        warn!(order_id = %id, field, "remote order update failed: {e}");
                        SyncError::RemoteCall(e)
                    })?;
                debug!(order_id = %id, field, "order updated (remote)");
                Ok(())
            }
            None => self.mutate_offline(|orders| {
                let order = orders
                    .iter_mut()
                    .find(|o| o.id == id)
                    .ok_or_else(|| SyncError::OrderNotFound(id.to_string()))?;
                apply(order);
                debug!(order_id = %id, field, "order updated (local)");
                Ok(())
            }),
        }
    }

    /// Delete an order.
    pub async fn delete_order(&self, id: &str) -> Result<()> {
        match self.reconciler() {
            Some(online) => {
                online
                    .remote
                    .delete(&online.orders_table, id)
                    .await
                    .map_err(|e| {
                        warn!(order_id = %id, "remote order delete failed: {e}");
                        SyncError::RemoteCall(e)
                    })?;
                info!(order_id = %id, "order deleted (remote)");
                Ok(())
            }
            None => self.mutate_offline(|orders| {
                let before = orders.len();
                orders.retain(|o| o.id != id);
                if orders.len() == before {
                    return Err(SyncError::OrderNotFound(id.to_string()));
                }
                info!(order_id = %id, "order deleted (local)");
                Ok(())
            }),
        }
    }
}

impl Drop for SyncController {
    fn drop(&mut self) {
        self.teardown();
    }
}
