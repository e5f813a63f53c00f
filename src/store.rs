//! Order and order item CRUD against the local database.
//!
//! The store is the single durable source of truth on the terminal. Every
//! mutation bumps `updated_at` and flips the record's `sync_status` back to
//! pending so the outbound queue and the view merge both see the record as
//! locally dirty. Reads are tenant-scoped without exception.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::db::{self, DbState};
use crate::error::SyncError;
use crate::model::{
    ItemRef, ItemStatus, Order, OrderFilter, OrderItem, OrderPatch, OrderRecord, OrderStatus,
    PaymentStatus, SyncStatus,
};

const ORDER_COLUMNS: &str = "id, order_number, tenant_id, branch_id, table_number, customer_name, \
     order_type, status, payment_status, subtotal, discount_amount, tax_amount, delivery_fee, \
     total_amount, special_instructions, order_date, created_at, updated_at, sync_status, \
     remote_id, deleted_at";

const ITEM_COLUMNS: &str = "id, order_id, food_item_id, buffet_id, combo_meal_id, name, quantity, \
     unit_price, subtotal, variation, addons, special_instructions, status, created_at, updated_at";

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn order_from_row(row: &Row) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        order_number: row.get(1)?,
        tenant_id: row.get(2)?,
        branch_id: row.get(3)?,
        table_number: row.get(4)?,
        customer_name: row.get(5)?,
        order_type: crate::model::OrderType::parse(&row.get::<_, String>(6)?),
        status: OrderStatus::parse(&row.get::<_, String>(7)?),
        payment_status: PaymentStatus::parse(&row.get::<_, String>(8)?),
        subtotal: row.get(9)?,
        discount_amount: row.get(10)?,
        tax_amount: row.get(11)?,
        delivery_fee: row.get(12)?,
        total_amount: row.get(13)?,
        special_instructions: row.get(14)?,
        order_date: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
        sync_status: SyncStatus::parse(&row.get::<_, String>(18)?),
        remote_id: row.get(19)?,
        deleted_at: row.get(20)?,
    })
}

fn item_from_row(row: &Row) -> rusqlite::Result<OrderItem> {
    let item_ref = ItemRef::from_columns(row.get(2)?, row.get(3)?, row.get(4)?).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })?;
    let addons_json: String = row.get(10)?;
    Ok(OrderItem {
        id: row.get(0)?,
        order_id: row.get(1)?,
        item_ref,
        name: row.get(5)?,
        quantity: row.get(6)?,
        unit_price: row.get(7)?,
        subtotal: row.get(8)?,
        variation: row.get(9)?,
        addons: serde_json::from_str(&addons_json).unwrap_or_default(),
        special_instructions: row.get(11)?,
        status: ItemStatus::parse(&row.get::<_, String>(12)?),
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

// ---------------------------------------------------------------------------
// Order numbers
// ---------------------------------------------------------------------------

/// Allocate the next local order number for a tenant: `ORD-DDMMYYYY-NNNNN`.
/// The counter lives in local_settings and restarts each day; uniqueness
/// comes from the date embedded in the number.
pub fn next_order_number(db: &DbState, tenant_id: &str) -> Result<String, SyncError> {
    let conn = db.conn.lock()?;
    let date_part = chrono::Local::now().format("%d%m%Y").to_string();

    let counter_key = format!("order_counter:{tenant_id}");
    let date_key = format!("order_counter_date:{tenant_id}");

    let last_date = db::setting_get(&conn, "orders", &date_key)?;
    let count = if last_date.as_deref() == Some(date_part.as_str()) {
        db::setting_get(&conn, "orders", &counter_key)?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + 1
    } else {
        1
    };

    db::setting_set(&conn, "orders", &counter_key, &count.to_string())?;
    db::setting_set(&conn, "orders", &date_key, &date_part)?;

    Ok(format!("ORD-{date_part}-{count:05}"))
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Insert an order and its items in one transaction.
pub fn insert_order_record(db: &DbState, record: &OrderRecord) -> Result<(), SyncError> {
    let mut guard = db.conn.lock()?;
    let tx = guard.transaction()?;
    insert_order_tx(&tx, &record.order)?;
    for item in &record.items {
        insert_item_tx(&tx, item)?;
    }
    tx.commit()?;
    debug!(order_id = %record.order.id, order_number = %record.order.order_number,
        items = record.items.len(), "Order inserted");
    Ok(())
}

fn insert_order_tx(conn: &Connection, order: &Order) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO orders (id, order_number, tenant_id, branch_id, table_number, customer_name,
             order_type, status, payment_status, subtotal, discount_amount, tax_amount,
             delivery_fee, total_amount, special_instructions, order_date, created_at,
             updated_at, sync_status, remote_id, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             ?18, ?19, ?20, ?21)",
        params![
            order.id,
            order.order_number,
            order.tenant_id,
            order.branch_id,
            order.table_number,
            order.customer_name,
            order.order_type.as_str(),
            order.status.as_str(),
            order.payment_status.as_str(),
            order.subtotal,
            order.discount_amount,
            order.tax_amount,
            order.delivery_fee,
            order.total_amount,
            order.special_instructions,
            order.order_date,
            order.created_at,
            order.updated_at,
            order.sync_status.as_str(),
            order.remote_id,
            order.deleted_at,
        ],
    )?;
    Ok(())
}

fn insert_item_tx(conn: &Connection, item: &OrderItem) -> Result<(), SyncError> {
    let (food_item_id, buffet_id, combo_meal_id) = item.item_ref.as_columns();
    conn.execute(
        "INSERT INTO order_items (id, order_id, food_item_id, buffet_id, combo_meal_id, name,
             quantity, unit_price, subtotal, variation, addons, special_instructions, status,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            item.id,
            item.order_id,
            food_item_id,
            buffet_id,
            combo_meal_id,
            item.name,
            item.quantity,
            item.unit_price,
            item.subtotal,
            item.variation,
            serde_json::to_string(&item.addons)?,
            item.special_instructions,
            item.status.as_str(),
            item.created_at,
            item.updated_at,
        ],
    )?;
    Ok(())
}

/// Apply a partial header update. Monetary changes recompute the total so the
/// invariant holds no matter which components moved.
pub fn apply_order_patch(
    db: &DbState,
    tenant_id: &str,
    order_id: &str,
    patch: &OrderPatch,
    now: DateTime<Utc>,
) -> Result<Order, SyncError> {
    patch.validate()?;
    let mut order = get_order(db, tenant_id, order_id)?
        .ok_or_else(|| SyncError::NotFound(format!("order {order_id}")))?;

    if let Some(v) = &patch.table_number {
        order.table_number = Some(v.clone());
    }
    if let Some(v) = &patch.customer_name {
        order.customer_name = Some(v.clone());
    }
    if let Some(v) = patch.order_type {
        order.order_type = v;
    }
    if let Some(v) = patch.payment_status {
        order.payment_status = v;
    }
    if let Some(v) = patch.subtotal {
        order.subtotal = v;
    }
    if let Some(v) = patch.discount_amount {
        order.discount_amount = v;
    }
    if let Some(v) = patch.tax_amount {
        order.tax_amount = v;
    }
    if let Some(v) = patch.delivery_fee {
        order.delivery_fee = v;
    }
    if let Some(v) = &patch.special_instructions {
        order.special_instructions = Some(v.clone());
    }
    order.total_amount = crate::model::compute_total(
        order.subtotal,
        order.discount_amount,
        order.tax_amount,
        order.delivery_fee,
    );
    order.updated_at = now.to_rfc3339();
    order.sync_status = SyncStatus::Pending;

    put_order(db, &order)?;
    Ok(order)
}

/// Set the order-level status, bumping timestamps and re-dirtying the record.
pub fn set_order_status(
    db: &DbState,
    tenant_id: &str,
    order_id: &str,
    status: OrderStatus,
    now: DateTime<Utc>,
) -> Result<Order, SyncError> {
    let conn = db.conn.lock()?;
    let n = conn.execute(
        "UPDATE orders SET status = ?1, updated_at = ?2, sync_status = 'pending'
         WHERE id = ?3 AND tenant_id = ?4",
        params![status.as_str(), now.to_rfc3339(), order_id, tenant_id],
    )?;
    if n == 0 {
        return Err(SyncError::NotFound(format!("order {order_id}")));
    }
    order_by_id(&conn, tenant_id, order_id)?
        .ok_or_else(|| SyncError::NotFound(format!("order {order_id}")))
}

/// Advance a single item, bumping the parent order's `updated_at` in the same
/// transaction. That bump is what anchors the reconciliation grace window.
pub fn set_item_status(
    db: &DbState,
    order_id: &str,
    item_id: &str,
    status: ItemStatus,
    now: DateTime<Utc>,
) -> Result<OrderItem, SyncError> {
    let ts = now.to_rfc3339();
    let mut guard = db.conn.lock()?;
    let tx = guard.transaction()?;
    let n = tx.execute(
        "UPDATE order_items SET status = ?1, updated_at = ?2 WHERE id = ?3 AND order_id = ?4",
        params![status.as_str(), ts, item_id, order_id],
    )?;
    if n == 0 {
        return Err(SyncError::NotFound(format!("item {item_id} in order {order_id}")));
    }
    tx.execute(
        "UPDATE orders SET updated_at = ?1, sync_status = 'pending' WHERE id = ?2",
        params![ts, order_id],
    )?;
    tx.commit()?;

    item_by_id(&guard, order_id, item_id)?
        .ok_or_else(|| SyncError::NotFound(format!("item {item_id}")))
}

/// Advance several items of one order at once. One transaction, one parent
/// timestamp bump.
pub fn set_items_status(
    db: &DbState,
    order_id: &str,
    item_ids: &[String],
    status: ItemStatus,
    now: DateTime<Utc>,
) -> Result<usize, SyncError> {
    if item_ids.is_empty() {
        return Ok(0);
    }
    let ts = now.to_rfc3339();
    let mut guard = db.conn.lock()?;
    let tx = guard.transaction()?;
    let mut updated = 0;
    for item_id in item_ids {
        updated += tx.execute(
            "UPDATE order_items SET status = ?1, updated_at = ?2 WHERE id = ?3 AND order_id = ?4",
            params![status.as_str(), ts, item_id, order_id],
        )?;
    }
    tx.execute(
        "UPDATE orders SET updated_at = ?1, sync_status = 'pending' WHERE id = ?2",
        params![ts, order_id],
    )?;
    tx.commit()?;
    Ok(updated)
}

/// Void an order: soft delete so history and reconciliation still see it.
pub fn soft_delete_order(
    db: &DbState,
    tenant_id: &str,
    order_id: &str,
    now: DateTime<Utc>,
) -> Result<Order, SyncError> {
    let ts = now.to_rfc3339();
    let conn = db.conn.lock()?;
    let n = conn.execute(
        "UPDATE orders SET deleted_at = ?1, status = 'cancelled', updated_at = ?1,
             sync_status = 'pending'
         WHERE id = ?2 AND tenant_id = ?3 AND deleted_at IS NULL",
        params![ts, order_id, tenant_id],
    )?;
    if n == 0 {
        return Err(SyncError::NotFound(format!("order {order_id}")));
    }
    order_by_id(&conn, tenant_id, order_id)?
        .ok_or_else(|| SyncError::NotFound(format!("order {order_id}")))
}

/// Remove an order and its items outright. Only used to unwind an optimistic
/// create that the server rejected.
pub fn hard_delete_order(db: &DbState, order_id: &str) -> Result<(), SyncError> {
    let conn = db.conn.lock()?;
    conn.execute("DELETE FROM orders WHERE id = ?1", [order_id])?;
    Ok(())
}

/// Upsert a full order row. Used for snapshot restore on rollback.
pub fn put_order(db: &DbState, order: &Order) -> Result<(), SyncError> {
    let conn = db.conn.lock()?;
    put_order_tx(&conn, order)
}

fn put_order_tx(conn: &Connection, order: &Order) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO orders (id, order_number, tenant_id, branch_id, table_number, customer_name,
             order_type, status, payment_status, subtotal, discount_amount, tax_amount,
             delivery_fee, total_amount, special_instructions, order_date, created_at,
             updated_at, sync_status, remote_id, deleted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             ?18, ?19, ?20, ?21)
         ON CONFLICT(id) DO UPDATE SET
             order_number = excluded.order_number,
             branch_id = excluded.branch_id,
             table_number = excluded.table_number,
             customer_name = excluded.customer_name,
             order_type = excluded.order_type,
             status = excluded.status,
             payment_status = excluded.payment_status,
             subtotal = excluded.subtotal,
             discount_amount = excluded.discount_amount,
             tax_amount = excluded.tax_amount,
             delivery_fee = excluded.delivery_fee,
             total_amount = excluded.total_amount,
             special_instructions = excluded.special_instructions,
             order_date = excluded.order_date,
             created_at = excluded.created_at,
             updated_at = excluded.updated_at,
             sync_status = excluded.sync_status,
             remote_id = excluded.remote_id,
             deleted_at = excluded.deleted_at",
        params![
            order.id,
            order.order_number,
            order.tenant_id,
            order.branch_id,
            order.table_number,
            order.customer_name,
            order.order_type.as_str(),
            order.status.as_str(),
            order.payment_status.as_str(),
            order.subtotal,
            order.discount_amount,
            order.tax_amount,
            order.delivery_fee,
            order.total_amount,
            order.special_instructions,
            order.order_date,
            order.created_at,
            order.updated_at,
            order.sync_status.as_str(),
            order.remote_id,
            order.deleted_at,
        ],
    )?;
    Ok(())
}

/// Restore an order and its items to an exact snapshot in one transaction.
/// Items not present in the snapshot are removed.
pub fn restore_record(db: &DbState, record: &OrderRecord) -> Result<(), SyncError> {
    let mut guard = db.conn.lock()?;
    let tx = guard.transaction()?;
    put_order_tx(&tx, &record.order)?;
    tx.execute(
        "DELETE FROM order_items WHERE order_id = ?1",
        [&record.order.id],
    )?;
    for item in &record.items {
        insert_item_tx(&tx, item)?;
    }
    tx.commit()?;
    debug!(order_id = %record.order.id, "Order restored from snapshot");
    Ok(())
}

/// Record that a server acknowledged this order, storing its remote id.
pub fn set_remote_id(db: &DbState, order_id: &str, remote_id: &str) -> Result<(), SyncError> {
    let conn = db.conn.lock()?;
    conn.execute(
        "UPDATE orders SET remote_id = ?1 WHERE id = ?2 AND remote_id IS NULL",
        params![remote_id, order_id],
    )?;
    Ok(())
}

pub fn set_order_sync_status(
    db: &DbState,
    order_id: &str,
    status: SyncStatus,
) -> Result<(), SyncError> {
    let conn = db.conn.lock()?;
    conn.execute(
        "UPDATE orders SET sync_status = ?1 WHERE id = ?2",
        params![status.as_str(), order_id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

fn order_by_id(
    conn: &Connection,
    tenant_id: &str,
    order_id: &str,
) -> Result<Option<Order>, SyncError> {
    let order = conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1 AND tenant_id = ?2"),
            [order_id, tenant_id],
            order_from_row,
        )
        .optional()?;
    Ok(order)
}

fn item_by_id(
    conn: &Connection,
    order_id: &str,
    item_id: &str,
) -> Result<Option<OrderItem>, SyncError> {
    let item = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM order_items WHERE id = ?1 AND order_id = ?2"),
            [item_id, order_id],
            item_from_row,
        )
        .optional()?;
    Ok(item)
}

fn items_for_order(conn: &Connection, order_id: &str) -> Result<Vec<OrderItem>, SyncError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = ?1
         ORDER BY created_at ASC, id ASC"
    ))?;
    let items = stmt
        .query_map([order_id], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn get_order(
    db: &DbState,
    tenant_id: &str,
    order_id: &str,
) -> Result<Option<Order>, SyncError> {
    let conn = db.conn.lock()?;
    order_by_id(&conn, tenant_id, order_id)
}

pub fn get_order_by_number(
    db: &DbState,
    tenant_id: &str,
    order_number: &str,
) -> Result<Option<Order>, SyncError> {
    let conn = db.conn.lock()?;
    let order = conn
        .query_row(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE order_number = ?1 AND tenant_id = ?2"
            ),
            [order_number, tenant_id],
            order_from_row,
        )
        .optional()?;
    Ok(order)
}

pub fn get_item(
    db: &DbState,
    order_id: &str,
    item_id: &str,
) -> Result<Option<OrderItem>, SyncError> {
    let conn = db.conn.lock()?;
    item_by_id(&conn, order_id, item_id)
}

pub fn get_order_record(
    db: &DbState,
    tenant_id: &str,
    order_id: &str,
) -> Result<Option<OrderRecord>, SyncError> {
    let conn = db.conn.lock()?;
    let Some(order) = order_by_id(&conn, tenant_id, order_id)? else {
        return Ok(None);
    };
    let items = items_for_order(&conn, &order.id)?;
    Ok(Some(OrderRecord { order, items }))
}

/// List orders with items, newest first, honoring the filter.
pub fn list_order_records(
    db: &DbState,
    tenant_id: &str,
    filter: &OrderFilter,
) -> Result<Vec<OrderRecord>, SyncError> {
    let conn = db.conn.lock()?;

    let mut sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE tenant_id = ?1");
    let mut bind: Vec<String> = vec![tenant_id.to_string()];
    if !filter.statuses.is_empty() {
        let list = filter
            .statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND status IN ({list})"));
    }
    if let Some(order_type) = filter.order_type {
        sql.push_str(&format!(" AND order_type = '{}'", order_type.as_str()));
    }
    if let Some(branch) = &filter.branch_id {
        bind.push(branch.clone());
        sql.push_str(&format!(" AND branch_id = ?{}", bind.len()));
    }
    if !filter.include_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    sql.push_str(" ORDER BY order_date DESC, created_at DESC");

    let mut stmt = conn.prepare(&sql)?;
    let orders = stmt
        .query_map(params_from_iter(bind.iter()), order_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(orders.len());
    for order in orders {
        let items = items_for_order(&conn, &order.id)?;
        records.push(OrderRecord { order, items });
    }
    Ok(records)
}

/// Orders whose latest local state has not reached the server. These are the
/// local-only candidates reconciliation may keep alongside server records.
pub fn pending_order_records(
    db: &DbState,
    tenant_id: &str,
) -> Result<Vec<OrderRecord>, SyncError> {
    let conn = db.conn.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         WHERE tenant_id = ?1 AND sync_status = 'pending' AND deleted_at IS NULL
         ORDER BY order_date DESC, created_at DESC"
    ))?;
    let orders = stmt
        .query_map([tenant_id], order_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(orders.len());
    for order in orders {
        let items = items_for_order(&conn, &order.id)?;
        records.push(OrderRecord { order, items });
    }
    Ok(records)
}

pub fn count_unsynced_orders(db: &DbState, tenant_id: &str) -> Result<i64, SyncError> {
    let conn = db.conn.lock()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM orders WHERE tenant_id = ?1 AND sync_status != 'synced'",
        [tenant_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_conflict_orders(db: &DbState, tenant_id: &str) -> Result<i64, SyncError> {
    let conn = db.conn.lock()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM orders WHERE tenant_id = ?1 AND sync_status = 'conflict'",
        [tenant_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::model::{Addon, ItemDraft, OrderDraft, OrderType};

    /// A two-line dine-in draft used across test modules.
    pub fn sample_draft() -> OrderDraft {
        OrderDraft {
            branch_id: Some("branch-1".to_string()),
            table_number: Some("T7".to_string()),
            customer_name: Some("Walk-in".to_string()),
            order_type: OrderType::DineIn,
            payment_status: None,
            subtotal: 31.0,
            discount_amount: 1.0,
            tax_amount: 3.0,
            delivery_fee: 0.0,
            special_instructions: None,
            items: vec![
                ItemDraft {
                    item_ref: ItemRef::FoodItem("food-1".to_string()),
                    name: "Pad Thai".to_string(),
                    quantity: 2,
                    unit_price: 11.0,
                    variation: None,
                    addons: vec![Addon {
                        name: "Extra peanuts".to_string(),
                        price: 0.5,
                    }],
                    special_instructions: None,
                },
                ItemDraft {
                    item_ref: ItemRef::ComboMeal("combo-9".to_string()),
                    name: "Lunch Set B".to_string(),
                    quantity: 1,
                    unit_price: 9.0,
                    variation: None,
                    addons: vec![],
                    special_instructions: Some("no cilantro".to_string()),
                },
            ],
        }
    }

    /// Insert a ready-made record for `tenant-1` and return it.
    pub fn seed_order(db: &DbState, order_number: &str) -> OrderRecord {
        let record = sample_draft().into_record("tenant-1", order_number.to_string(), Utc::now());
        insert_order_record(db, &record).expect("seed order");
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::model::OrderType;
    use test_support::{sample_draft, seed_order};

    #[test]
    fn test_insert_and_read_back_round_trip() {
        let db = test_db();
        let record = seed_order(&db, "ORD-22082026-00001");

        let loaded = get_order_record(&db, "tenant-1", &record.order.id)
            .unwrap()
            .expect("order exists");
        assert_eq!(loaded.order, record.order);
        assert_eq!(loaded.items, record.items);
        // Tenant scoping: another tenant sees nothing.
        assert!(get_order_record(&db, "tenant-2", &record.order.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_order_number_counter_increments_and_is_daily() {
        let db = test_db();
        let n1 = next_order_number(&db, "tenant-1").unwrap();
        let n2 = next_order_number(&db, "tenant-1").unwrap();
        assert!(n1.starts_with("ORD-"));
        assert!(n1.ends_with("-00001"));
        assert!(n2.ends_with("-00002"));

        // Separate tenants count independently.
        let other = next_order_number(&db, "tenant-2").unwrap();
        assert!(other.ends_with("-00001"));

        // A stale counter date restarts the sequence.
        {
            let conn = db.conn.lock().unwrap();
            crate::db::setting_set(&conn, "orders", "order_counter_date:tenant-1", "01011999")
                .unwrap();
        }
        let after_reset = next_order_number(&db, "tenant-1").unwrap();
        assert!(after_reset.ends_with("-00001"));
    }

    #[test]
    fn test_item_status_update_bumps_parent_order() {
        let db = test_db();
        let record = seed_order(&db, "ORD-22082026-00001");
        let item_id = record.items[0].id.clone();

        // Pretend the order was synced earlier.
        set_order_sync_status(&db, &record.order.id, SyncStatus::Synced).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(5);
        let item =
            set_item_status(&db, &record.order.id, &item_id, ItemStatus::Preparing, later).unwrap();
        assert_eq!(item.status, ItemStatus::Preparing);

        let order = get_order(&db, "tenant-1", &record.order.id).unwrap().unwrap();
        assert_eq!(order.updated_at, later.to_rfc3339());
        assert_eq!(order.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_missing_item_is_not_found() {
        let db = test_db();
        let record = seed_order(&db, "ORD-22082026-00001");
        let err = set_item_status(
            &db,
            &record.order.id,
            "no-such-item",
            ItemStatus::Preparing,
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn test_patch_recomputes_total() {
        let db = test_db();
        let record = seed_order(&db, "ORD-22082026-00001");
        let patch = OrderPatch {
            discount_amount: Some(5.0),
            ..OrderPatch::default()
        };
        let updated =
            apply_order_patch(&db, "tenant-1", &record.order.id, &patch, Utc::now()).unwrap();
        assert_eq!(updated.discount_amount, 5.0);
        assert_eq!(updated.total_amount, 31.0 - 5.0 + 3.0);
        assert_eq!(updated.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_patch_rejects_negative_amounts() {
        let db = test_db();
        let record = seed_order(&db, "ORD-22082026-00001");
        let patch = OrderPatch {
            tax_amount: Some(-2.0),
            ..OrderPatch::default()
        };
        let err =
            apply_order_patch(&db, "tenant-1", &record.order.id, &patch, Utc::now()).unwrap_err();
        assert!(matches!(err, SyncError::Invalid(_)));
    }

    #[test]
    fn test_soft_delete_hides_from_listing() {
        let db = test_db();
        let record = seed_order(&db, "ORD-22082026-00001");
        soft_delete_order(&db, "tenant-1", &record.order.id, Utc::now()).unwrap();

        let visible = list_order_records(&db, "tenant-1", &OrderFilter::default()).unwrap();
        assert!(visible.is_empty());

        let all = list_order_records(
            &db,
            "tenant-1",
            &OrderFilter {
                include_deleted: true,
                ..OrderFilter::default()
            },
        )
        .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].order.status, OrderStatus::Cancelled);
        assert!(all[0].order.is_deleted());

        // Voiding twice is NotFound, not a second write.
        assert!(soft_delete_order(&db, "tenant-1", &record.order.id, Utc::now()).is_err());
    }

    #[test]
    fn test_restore_record_rewinds_items() {
        let db = test_db();
        let record = seed_order(&db, "ORD-22082026-00001");
        let snapshot = get_order_record(&db, "tenant-1", &record.order.id)
            .unwrap()
            .unwrap();

        set_item_status(
            &db,
            &record.order.id,
            &record.items[0].id,
            ItemStatus::Served,
            Utc::now(),
        )
        .unwrap();

        restore_record(&db, &snapshot).unwrap();
        let restored = get_order_record(&db, "tenant-1", &record.order.id)
            .unwrap()
            .unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_filter_by_status_and_type() {
        let db = test_db();
        let a = seed_order(&db, "ORD-22082026-00001");
        let mut takeaway = sample_draft();
        takeaway.order_type = OrderType::Takeaway;
        let b = takeaway.into_record("tenant-1", "ORD-22082026-00002".to_string(), Utc::now());
        insert_order_record(&db, &b).unwrap();
        set_order_status(&db, "tenant-1", &b.order.id, OrderStatus::Preparing, Utc::now()).unwrap();

        let preparing = list_order_records(
            &db,
            "tenant-1",
            &OrderFilter {
                statuses: vec![OrderStatus::Preparing],
                ..OrderFilter::default()
            },
        )
        .unwrap();
        assert_eq!(preparing.len(), 1);
        assert_eq!(preparing[0].order.id, b.order.id);

        let dine_in = list_order_records(
            &db,
            "tenant-1",
            &OrderFilter {
                order_type: Some(OrderType::DineIn),
                ..OrderFilter::default()
            },
        )
        .unwrap();
        assert_eq!(dine_in.len(), 1);
        assert_eq!(dine_in[0].order.id, a.order.id);
    }

    #[test]
    fn test_pending_records_exclude_synced_and_deleted() {
        let db = test_db();
        let a = seed_order(&db, "ORD-22082026-00001");
        let b = seed_order(&db, "ORD-22082026-00002");
        let c = seed_order(&db, "ORD-22082026-00003");

        set_order_sync_status(&db, &a.order.id, SyncStatus::Synced).unwrap();
        soft_delete_order(&db, "tenant-1", &b.order.id, Utc::now()).unwrap();

        let pending = pending_order_records(&db, "tenant-1").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order.id, c.order.id);

        assert_eq!(count_unsynced_orders(&db, "tenant-1").unwrap(), 2);
    }
}
