//! Order data model and the stored-record codec.
//!
//! Orders are stored as JSON records, both in the local `orders` blob and in
//! the remote `orders` table. Two historical record shapes are accepted on
//! read:
//!
//! - a single embedded `product` object (legacy) instead of a `products` array
//! - an embedded `customer` object (legacy) or a `customer_id` foreign key
//!
//! Both are resolved once, in [`decode_order`] and [`DecodedOrder::resolve`],
//! into the canonical [`Order`]. Nothing downstream branches on record shape.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Production lifecycle of an order. `Pending` is the state every new order
/// starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    InProduction,
    Ready,
    Delivered,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProduction => "in_production",
            Self::Ready => "ready",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_production" | "in-production" | "printing" => Ok(Self::InProduction),
            "ready" => Ok(Self::Ready),
            "delivered" => Ok(Self::Delivered),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Customer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Customer {
    /// Present once the customer has been normalized into its own record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub tax_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub social: Option<String>,
}

impl Customer {
    /// Tax identifier stripped of punctuation, used as the upsert key.
    pub fn tax_key(&self) -> String {
        normalize_tax_id(&self.tax_id)
    }
}

pub(crate) fn normalize_tax_id(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Foreign-key reference to a normalized customer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomerRef {
    pub id: String,
}

/// How a stored order carries its customer.
#[derive(Debug, Clone, PartialEq)]
pub enum CustomerShape {
    Legacy(Customer),
    Normalized(CustomerRef),
}

/// Normalized customers keyed by id.
#[derive(Debug, Clone, Default)]
pub struct CustomerDirectory {
    by_id: HashMap<String, Customer>,
}

impl CustomerDirectory {
    pub fn from_customers(customers: impl IntoIterator<Item = Customer>) -> Self {
        let by_id = customers
            .into_iter()
            .filter_map(|c| c.id.clone().map(|id| (id, c)))
            .collect();
        Self { by_id }
    }

    /// Build a directory from raw JSON records, skipping malformed entries.
    pub fn from_records(records: &[Value]) -> Self {
        let customers = records.iter().filter_map(|raw| {
            match serde_json::from_value::<Customer>(raw.clone()) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(error = %e, "skipping malformed customer record");
                    None
                }
            }
        });
        Self::from_customers(customers)
    }

    pub fn get(&self, id: &str) -> Option<&Customer> {
        self.by_id.get(id)
    }

    pub fn find_by_tax_id(&self, tax_id: &str) -> Option<&Customer> {
        let key = normalize_tax_id(tax_id);
        if key.is_empty() {
            return None;
        }
        self.by_id.values().find(|c| c.tax_key() == key)
    }

    pub fn insert(&mut self, customer: Customer) {
        if let Some(id) = customer.id.clone() {
            self.by_id.insert(id, customer);
        }
    }

    pub fn customers(&self) -> Vec<Customer> {
        let mut all: Vec<Customer> = self.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

// ---------------------------------------------------------------------------
// Product configuration
// ---------------------------------------------------------------------------

/// One color per physical part of the printed piece.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartColors {
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub detail: String,
}

impl PartColors {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        [self.base.as_str(), self.body.as_str(), self.detail.as_str()].into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Texture {
    /// Reference into the stock texture catalog.
    Stock { texture_id: String },
    /// Free-text description of a one-off texture.
    Custom { description: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductConfig {
    pub id: String,
    pub colors: PartColors,
    pub texture: Texture,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personalization: Option<String>,
    #[serde(default)]
    pub notes: String,
}

impl ProductConfig {
    pub fn new(colors: PartColors, texture: Texture) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            colors,
            texture,
            personalization: None,
            notes: String::new(),
        }
    }

    pub fn with_personalization(mut self, text: impl Into<String>) -> Self {
        self.personalization = Some(text.into());
        self
    }
}

/// Product as found in storage; legacy records may lack an id.
#[derive(Debug, Deserialize)]
struct StoredProduct {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    colors: PartColors,
    texture: Texture,
    #[serde(default)]
    personalization: Option<String>,
    #[serde(default)]
    notes: String,
}

impl StoredProduct {
    fn into_config(self) -> ProductConfig {
        ProductConfig {
            id: self
                .id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            colors: self.colors,
            texture: self.texture,
            personalization: self.personalization,
            notes: self.notes,
        }
    }
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub created_at: String,
    pub customer: Customer,
    pub products: Vec<ProductConfig>,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(with = "price")]
    pub price: Decimal,
    #[serde(default)]
    pub paid: bool,
}

/// Intake payload for a new order. Identity, timestamp, status, and paid
/// flag are assigned by the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub customer: Customer,
    pub products: Vec<ProductConfig>,
    pub price: Decimal,
}

/// How orders write their customer when encoded for storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CustomerEncoding {
    #[default]
    Embedded,
    ForeignKey,
}

/// Encode an order as a storage record.
///
/// With `ForeignKey`, orders whose customer has an id are written with
/// `customer_id` instead of the embedded object.
pub fn encode_order(order: &Order, encoding: CustomerEncoding) -> Value {
    let mut record = serde_json::json!({
        "id": order.id,
        "created_at": order.created_at,
        "products": order.products,
        "status": order.status,
        "price": price::to_value(&order.price),
        "paid": order.paid,
    });
    let customer_id = match encoding {
        CustomerEncoding::ForeignKey => order.customer.id.as_deref(),
        CustomerEncoding::Embedded => None,
    };
    if let Value::Object(ref mut map) = record {
        match customer_id {
            Some(id) => {
                map.insert("customer_id".into(), Value::String(id.to_string()));
            }
            None => {
                map.insert(
                    "customer".into(),
                    serde_json::to_value(&order.customer).unwrap_or(Value::Null),
                );
            }
        }
    }
    record
}

/// Stored order record with every historical variation accepted.
#[derive(Debug, Deserialize)]
struct StoredOrder {
    id: String,
    created_at: String,
    #[serde(default)]
    customer: Option<Customer>,
    #[serde(default)]
    customer_id: Option<String>,
    #[serde(default)]
    products: Option<Vec<StoredProduct>>,
    #[serde(default)]
    product: Option<StoredProduct>,
    #[serde(default)]
    status: OrderStatus,
    #[serde(with = "price")]
    price: Decimal,
    #[serde(default)]
    paid: bool,
}

/// An order decoded from storage whose customer has not been resolved yet.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedOrder {
    pub id: String,
    pub created_at: String,
    pub customer: CustomerShape,
    pub products: Vec<ProductConfig>,
    pub status: OrderStatus,
    pub price: Decimal,
    pub paid: bool,
    /// True when the record was in the single-product legacy shape.
    pub migrated: bool,
}

impl DecodedOrder {
    pub fn is_normalized(&self) -> bool {
        matches!(self.customer, CustomerShape::Normalized(_))
    }

    /// Produce the canonical order, looking up normalized customers.
    pub fn resolve(self, directory: &CustomerDirectory) -> Order {
        let customer = match self.customer {
            CustomerShape::Legacy(c) => c,
            CustomerShape::Normalized(r) => match directory.get(&r.id) {
                Some(c) => c.clone(),
                None => {
                    warn!(order_id = %self.id, customer_id = %r.id, "customer reference not found");
                    Customer {
                        id: Some(r.id),
                        ..Customer::default()
                    }
                }
            },
        };
        Order {
            id: self.id,
            created_at: self.created_at,
            customer,
            products: self.products,
            status: self.status,
            price: self.price,
            paid: self.paid,
        }
    }
}

/// Decode a stored record, migrating the legacy single-product shape.
pub fn decode_order(raw: Value) -> Result<DecodedOrder, String> {
    let stored: StoredOrder =
        serde_json::from_value(raw).map_err(|e| format!("malformed order record: {e}"))?;

    if stored.id.trim().is_empty() {
        return Err("order record has an empty id".into());
    }

    let (products, migrated) = match (stored.products, stored.product) {
        (Some(list), _) if !list.is_empty() => (
            list.into_iter().map(StoredProduct::into_config).collect(),
            false,
        ),
        (_, Some(single)) => (vec![single.into_config()], true),
        _ => return Err(format!("order {} has no product configuration", stored.id)),
    };

    let customer = match (stored.customer_id, stored.customer) {
        (Some(id), _) if !id.trim().is_empty() => CustomerShape::Normalized(CustomerRef { id }),
        (_, Some(c)) => CustomerShape::Legacy(c),
        _ => CustomerShape::Legacy(Customer::default()),
    };

    Ok(DecodedOrder {
        id: stored.id,
        created_at: stored.created_at,
        customer,
        products,
        status: stored.status,
        price: stored.price,
        paid: stored.paid,
        migrated,
    })
}

/// Decode a batch of records. Malformed records are skipped with a warning.
pub fn decode_orders(records: Vec<Value>) -> Vec<DecodedOrder> {
    let mut decoded = Vec::with_capacity(records.len());
    for raw in records {
        match decode_order(raw) {
            Ok(order) => decoded.push(order),
            Err(e) => warn!("skipping order record: {e}"),
        }
    }
    decoded
}

/// Newest first by creation timestamp. RFC 3339 strings are compared as
/// instants; unparseable timestamps sort after all parseable ones, newest
/// string first among themselves.
pub fn sort_newest_first(orders: &mut [Order]) {
    orders.sort_by_cached_key(|o| {
        let instant = chrono::DateTime::parse_from_rfc3339(&o.created_at).ok();
        (
            instant.is_none(),
            instant.map(std::cmp::Reverse),
            std::cmp::Reverse(o.created_at.clone()),
        )
    });
}

/// Price serde: written as a decimal string so no precision is lost, read
/// from a number or a numeric string.
mod price {
    use std::str::FromStr;

    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Decimal, serializer: S) -> Result<S::Ok, S::Error> {
        rust_decimal::serde::str::serialize(value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(serde_json::Number),
            Text(String),
        }

        let text = match Raw::deserialize(deserializer)? {
            Raw::Num(n) => n.to_string(),
            Raw::Text(s) => s.trim().replace(',', "."),
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|e| {
                <D::Error as serde::de::Error>::custom(format!("invalid price {text:?}: {e}"))
            })
    }

    pub fn to_value(value: &Decimal) -> Value {
        Value::String(value.to_string())
    }
}
