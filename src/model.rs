//! Domain model for orders, order items, and their sync bookkeeping.
//!
//! Every record carries RFC3339 TEXT timestamps and string status columns;
//! the enums here parse those columns tolerantly (unknown values coerce to
//! a safe default rather than poisoning a whole result set).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    DineIn,
    Takeaway,
    Delivery,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::DineIn => "dine_in",
            OrderType::Takeaway => "takeaway",
            OrderType::Delivery => "delivery",
        }
    }

    pub fn parse(s: &str) -> OrderType {
        match s.trim().to_lowercase().as_str() {
            "takeaway" | "take_away" | "pickup" => OrderType::Takeaway,
            "delivery" => OrderType::Delivery,
            _ => OrderType::DineIn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Preparing,
    Ready,
    Served,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Served => "served",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> OrderStatus {
        match s.trim().to_lowercase().as_str() {
            "preparing" | "in_progress" => OrderStatus::Preparing,
            "ready" => OrderStatus::Ready,
            "served" => OrderStatus::Served,
            "completed" | "complete" | "paid" => OrderStatus::Completed,
            "cancelled" | "canceled" | "voided" => OrderStatus::Cancelled,
            _ => OrderStatus::Pending,
        }
    }
}

/// Per-item preparation status. Ordering is meaningful: the lifecycle state
/// machine only ever advances one step forward (see `lifecycle`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Preparing,
    Ready,
    Served,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Preparing => "preparing",
            ItemStatus::Ready => "ready",
            ItemStatus::Served => "served",
        }
    }

    pub fn parse(s: &str) -> ItemStatus {
        match s.trim().to_lowercase().as_str() {
            "preparing" | "in_progress" => ItemStatus::Preparing,
            "ready" => ItemStatus::Ready,
            "served" | "delivered" => ItemStatus::Served,
            _ => ItemStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> PaymentStatus {
        match s.trim().to_lowercase().as_str() {
            "paid" | "completed" => PaymentStatus::Paid,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Pending,
        }
    }
}

/// Whether a record's latest local state has reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> SyncStatus {
        match s.trim().to_lowercase().as_str() {
            "synced" => SyncStatus::Synced,
            "conflict" | "failed" => SyncStatus::Conflict,
            _ => SyncStatus::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Orders and items
// ---------------------------------------------------------------------------

/// Exactly one upstream catalog reference per line: a plated dish, a buffet
/// seat, or a combo meal. The enum makes the mutual exclusivity structural
/// instead of a three-nullable-columns convention leaking everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemRef {
    FoodItem(String),
    Buffet(String),
    ComboMeal(String),
}

impl ItemRef {
    /// Split into the three nullable columns the store persists.
    pub fn as_columns(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        match self {
            ItemRef::FoodItem(id) => (Some(id), None, None),
            ItemRef::Buffet(id) => (None, Some(id), None),
            ItemRef::ComboMeal(id) => (None, None, Some(id)),
        }
    }

    /// Rebuild from the three nullable columns. Exactly one must be set.
    pub fn from_columns(
        food_item_id: Option<String>,
        buffet_id: Option<String>,
        combo_meal_id: Option<String>,
    ) -> Result<ItemRef, SyncError> {
        match (food_item_id, buffet_id, combo_meal_id) {
            (Some(id), None, None) => Ok(ItemRef::FoodItem(id)),
            (None, Some(id), None) => Ok(ItemRef::Buffet(id)),
            (None, None, Some(id)) => Ok(ItemRef::ComboMeal(id)),
            (None, None, None) => Err(SyncError::Invalid(
                "order item references no catalog entry".to_string(),
            )),
            _ => Err(SyncError::Invalid(
                "order item references more than one catalog entry".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addon {
    pub name: String,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    #[serde(flatten)]
    pub item_ref: ItemRef,
    pub name: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub subtotal: f64,
    #[serde(default)]
    pub variation: Option<String>,
    #[serde(default)]
    pub addons: Vec<Addon>,
    #[serde(default)]
    pub special_instructions: Option<String>,
    pub status: ItemStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub tenant_id: String,
    #[serde(default)]
    pub branch_id: Option<String>,
    #[serde(default)]
    pub table_number: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub tax_amount: f64,
    pub delivery_fee: f64,
    pub total_amount: f64,
    #[serde(default)]
    pub special_instructions: Option<String>,
    pub order_date: String,
    pub created_at: String,
    pub updated_at: String,
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl Order {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An order together with its line items, in kitchen FIFO order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order: Order,
    pub items: Vec<OrderItem>,
}

// ---------------------------------------------------------------------------
// Monetary invariant
// ---------------------------------------------------------------------------

/// The one place the order total formula lives.
pub fn compute_total(subtotal: f64, discount: f64, tax: f64, delivery_fee: f64) -> f64 {
    subtotal - discount + tax + delivery_fee
}

const MONEY_EPSILON: f64 = 0.005;

pub fn totals_match(expected: f64, actual: f64) -> bool {
    (expected - actual).abs() < MONEY_EPSILON
}

// ---------------------------------------------------------------------------
// Drafts and patches
// ---------------------------------------------------------------------------

/// Input for creating an order. The engine assigns id, order number,
/// timestamps, and the computed total; the caller supplies the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDraft {
    #[serde(default)]
    pub branch_id: Option<String>,
    #[serde(default)]
    pub table_number: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub order_type: OrderType,
    #[serde(default)]
    pub payment_status: Option<PaymentStatus>,
    pub subtotal: f64,
    #[serde(default)]
    pub discount_amount: f64,
    #[serde(default)]
    pub tax_amount: f64,
    #[serde(default)]
    pub delivery_fee: f64,
    #[serde(default)]
    pub special_instructions: Option<String>,
    pub items: Vec<ItemDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDraft {
    pub item_ref: ItemRef,
    pub name: String,
    pub quantity: i64,
    pub unit_price: f64,
    #[serde(default)]
    pub variation: Option<String>,
    #[serde(default)]
    pub addons: Vec<Addon>,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

impl OrderDraft {
    /// Local validation run before any write. Monetary fields must be
    /// non-negative, every line needs a positive quantity, and an order
    /// without lines is meaningless.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.items.is_empty() {
            return Err(SyncError::Invalid("order has no items".to_string()));
        }
        for (label, value) in [
            ("subtotal", self.subtotal),
            ("discount_amount", self.discount_amount),
            ("tax_amount", self.tax_amount),
            ("delivery_fee", self.delivery_fee),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SyncError::Invalid(format!(
                    "{label} must be a non-negative amount, got {value}"
                )));
            }
        }
        for item in &self.items {
            if item.quantity < 1 {
                return Err(SyncError::Invalid(format!(
                    "item '{}' quantity must be at least 1",
                    item.name
                )));
            }
            if !item.unit_price.is_finite() || item.unit_price < 0.0 {
                return Err(SyncError::Invalid(format!(
                    "item '{}' unit price must be non-negative",
                    item.name
                )));
            }
        }
        Ok(())
    }

    /// Materialize the draft into persistable rows. `order_number` comes from
    /// the local per-tenant counter; the total is always recomputed so the
    /// monetary invariant holds by construction.
    pub fn into_record(
        self,
        tenant_id: &str,
        order_number: String,
        now: DateTime<Utc>,
    ) -> OrderRecord {
        let order_id = Uuid::new_v4().to_string();
        let ts = now.to_rfc3339();
        let items = self
            .items
            .into_iter()
            .map(|draft| OrderItem {
                id: Uuid::new_v4().to_string(),
                order_id: order_id.clone(),
                subtotal: draft.unit_price * draft.quantity as f64
                    + draft.addons.iter().map(|a| a.price).sum::<f64>()
                        * draft.quantity as f64,
                item_ref: draft.item_ref,
                name: draft.name,
                quantity: draft.quantity,
                unit_price: draft.unit_price,
                variation: draft.variation,
                addons: draft.addons,
                special_instructions: draft.special_instructions,
                status: ItemStatus::Pending,
                created_at: ts.clone(),
                updated_at: ts.clone(),
            })
            .collect();
        let order = Order {
            id: order_id,
            order_number,
            tenant_id: tenant_id.to_string(),
            branch_id: self.branch_id,
            table_number: self.table_number,
            customer_name: self.customer_name,
            order_type: self.order_type,
            status: OrderStatus::Pending,
            payment_status: self.payment_status.unwrap_or(PaymentStatus::Pending),
            subtotal: self.subtotal,
            discount_amount: self.discount_amount,
            tax_amount: self.tax_amount,
            delivery_fee: self.delivery_fee,
            total_amount: compute_total(
                self.subtotal,
                self.discount_amount,
                self.tax_amount,
                self.delivery_fee,
            ),
            special_instructions: self.special_instructions,
            order_date: ts.clone(),
            created_at: ts.clone(),
            updated_at: ts,
            sync_status: SyncStatus::Pending,
            remote_id: None,
            deleted_at: None,
        };
        OrderRecord { order, items }
    }
}

/// Partial update for order header fields. `None` leaves a field untouched.
/// Monetary fields travel together so the total can be recomputed once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderPatch {
    #[serde(default)]
    pub table_number: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub order_type: Option<OrderType>,
    #[serde(default)]
    pub payment_status: Option<PaymentStatus>,
    #[serde(default)]
    pub subtotal: Option<f64>,
    #[serde(default)]
    pub discount_amount: Option<f64>,
    #[serde(default)]
    pub tax_amount: Option<f64>,
    #[serde(default)]
    pub delivery_fee: Option<f64>,
    #[serde(default)]
    pub special_instructions: Option<String>,
}

impl OrderPatch {
    pub fn is_empty(&self) -> bool {
        self.table_number.is_none()
            && self.customer_name.is_none()
            && self.order_type.is_none()
            && self.payment_status.is_none()
            && self.subtotal.is_none()
            && self.discount_amount.is_none()
            && self.tax_amount.is_none()
            && self.delivery_fee.is_none()
            && self.special_instructions.is_none()
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        for (label, value) in [
            ("subtotal", self.subtotal),
            ("discount_amount", self.discount_amount),
            ("tax_amount", self.tax_amount),
            ("delivery_fee", self.delivery_fee),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(SyncError::Invalid(format!(
                        "{label} must be a non-negative amount, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Query filters
// ---------------------------------------------------------------------------

/// Filter for listing orders locally and for scoping server snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderFilter {
    /// Empty means any status.
    #[serde(default)]
    pub statuses: Vec<OrderStatus>,
    #[serde(default)]
    pub order_type: Option<OrderType>,
    #[serde(default)]
    pub branch_id: Option<String>,
    /// Soft-deleted orders are hidden unless explicitly requested.
    #[serde(default)]
    pub include_deleted: bool,
}

impl OrderFilter {
    /// The working set a kitchen or list view cares about: everything not
    /// yet completed or cancelled.
    pub fn active() -> OrderFilter {
        OrderFilter {
            statuses: vec![
                OrderStatus::Pending,
                OrderStatus::Preparing,
                OrderStatus::Ready,
                OrderStatus::Served,
            ],
            ..OrderFilter::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Remote change notifications
// ---------------------------------------------------------------------------

/// Wire shape of a push notification from the admin dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEntity {
    Order,
    OrderItem,
}

/// A change notification as pushed by the server. Treated as a hint to
/// refetch, never as authoritative data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub entity: ChangeEntity,
    pub id: String,
}
