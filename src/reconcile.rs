//! Reconciliation of server snapshots with local pending state.
//!
//! The merge is read-only: it computes the view a screen should display and
//! never writes the store. Server records win wherever both sides hold the
//! same order (matched by remote id, then by order number). Local records
//! survive only while genuinely unknown to the server; item statuses changed
//! locally moments ago are preferred for a short grace window so a just-
//! tapped status does not flicker back while its sync is in flight.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::api::{OrdersApi, Page};
use crate::db::DbState;
use crate::error::SyncError;
use crate::lifecycle::board_sections;
use crate::model::{ItemStatus, OrderFilter, OrderItem, OrderRecord};
use crate::queue::SyncQueue;
use crate::store;

/// How long a local item status outranks the server's copy.
pub const GRACE_WINDOW_MS: i64 = 3_000;

const SNAPSHOT_PAGE_LIMIT: u32 = 100;
const SNAPSHOT_MAX_ROWS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    /// Order list screens: newest first.
    List,
    /// Kitchen boards: oldest first, matching preparation order.
    Kitchen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Server,
    LocalPending,
}

/// One display-ready order: merged rows plus derived board membership.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderView {
    #[serde(flatten)]
    pub record: OrderRecord,
    pub origin: RecordOrigin,
    pub sections: Vec<ItemStatus>,
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Pure merge
// ---------------------------------------------------------------------------

/// Merge a server snapshot with local pending records into one view list.
///
/// `pushed_markers` holds order ids the queue already delivered (or is
/// delivering): a marked order missing from the snapshot was deleted on the
/// server and must not resurrect from the local copy.
pub fn merge_orders(
    server: Vec<OrderRecord>,
    local_pending: Vec<OrderRecord>,
    pushed_markers: &HashSet<String>,
    now: DateTime<Utc>,
    grace: Duration,
    view: ViewKind,
) -> Vec<OrderView> {
    let server_ids: HashSet<String> = server.iter().map(|r| r.order.id.clone()).collect();
    let server_numbers: HashSet<String> =
        server.iter().map(|r| r.order.order_number.clone()).collect();

    let mut local_by_remote: HashMap<&str, &OrderRecord> = HashMap::new();
    let mut local_by_number: HashMap<&str, &OrderRecord> = HashMap::new();
    for record in &local_pending {
        if let Some(remote_id) = &record.order.remote_id {
            local_by_remote.insert(remote_id.as_str(), record);
        }
        local_by_number.insert(record.order.order_number.as_str(), record);
    }

    let mut views: Vec<OrderView> = Vec::with_capacity(server.len() + local_pending.len());

    // Server records win; a dirty local twin only contributes recent item
    // statuses through the grace merge.
    for mut record in server {
        let twin = local_by_remote
            .get(record.order.id.as_str())
            .or_else(|| local_by_number.get(record.order.order_number.as_str()))
            .copied();
        if let Some(twin) = twin {
            record.items = merge_items(
                record.items,
                &twin.items,
                parse_ts(&twin.order.updated_at),
                now,
                grace,
            );
        }
        let sections = board_sections(&record.items);
        views.push(OrderView {
            record,
            origin: RecordOrigin::Server,
            sections,
        });
    }

    // Local-only candidates: unknown to the server and never pushed.
    for record in local_pending {
        if server_numbers.contains(record.order.order_number.as_str()) {
            continue;
        }
        if let Some(remote_id) = &record.order.remote_id {
            if server_ids.contains(remote_id.as_str()) {
                continue;
            }
        }
        if pushed_markers.contains(&record.order.id) {
            debug!(order_id = %record.order.id,
                "Dropping local record the server no longer returns");
            continue;
        }
        if record.order.is_deleted() {
            continue;
        }
        let sections = board_sections(&record.items);
        views.push(OrderView {
            record,
            origin: RecordOrigin::LocalPending,
            sections,
        });
    }

    match view {
        ViewKind::List => views.sort_by(|a, b| {
            (&b.record.order.order_date, &b.record.order.created_at, &b.record.order.id).cmp(&(
                &a.record.order.order_date,
                &a.record.order.created_at,
                &a.record.order.id,
            ))
        }),
        ViewKind::Kitchen => views.sort_by(|a, b| {
            (&a.record.order.order_date, &a.record.order.created_at, &a.record.order.id).cmp(&(
                &b.record.order.order_date,
                &b.record.order.created_at,
                &b.record.order.id,
            ))
        }),
    }
    views
}

/// Per-item grace merge. `local_anchor` is the local order's last touch; only
/// while it is within the grace window do local statuses and transient
/// local-only items outrank the snapshot.
fn merge_items(
    server_items: Vec<OrderItem>,
    local_items: &[OrderItem],
    local_anchor: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: Duration,
) -> Vec<OrderItem> {
    let within_grace = local_anchor
        .map(|anchor| now.signed_duration_since(anchor) <= grace)
        .unwrap_or(false);
    if !within_grace {
        return server_items;
    }

    let local_by_id: HashMap<&str, &OrderItem> =
        local_items.iter().map(|i| (i.id.as_str(), i)).collect();
    let server_ids: HashSet<String> = server_items.iter().map(|i| i.id.clone()).collect();

    let mut merged: Vec<OrderItem> = server_items
        .into_iter()
        .map(|mut item| {
            if let Some(local) = local_by_id.get(item.id.as_str()) {
                if local.status != item.status {
                    item.status = local.status;
                }
            }
            item
        })
        .collect();

    // Items the server has not seen yet stay visible while fresh.
    for local in local_items {
        if !server_ids.contains(local.id.as_str()) {
            merged.push(local.clone());
        }
    }

    merged.sort_by(|a, b| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id)));
    merged
}

fn record_matches_filter(record: &OrderRecord, filter: &OrderFilter) -> bool {
    if !filter.statuses.is_empty() && !filter.statuses.contains(&record.order.status) {
        return false;
    }
    if let Some(order_type) = filter.order_type {
        if record.order.order_type != order_type {
            return false;
        }
    }
    if let Some(branch) = &filter.branch_id {
        if record.order.branch_id.as_deref() != Some(branch.as_str()) {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Fetch and merge
// ---------------------------------------------------------------------------

/// Fetch the server snapshot for `filter`, page by page, and merge it with
/// local pending state. This is what every reconciling refresh runs; it
/// performs no writes.
pub async fn reconciled_view(
    db: &DbState,
    queue: &SyncQueue,
    api: &dyn OrdersApi,
    tenant_id: &str,
    filter: &OrderFilter,
    view: ViewKind,
    grace: Duration,
) -> Result<Vec<OrderView>, SyncError> {
    let mut server: Vec<OrderRecord> = Vec::new();
    let mut page = Page {
        limit: SNAPSHOT_PAGE_LIMIT,
        offset: 0,
    };
    loop {
        let snapshot = api.fetch_orders(filter, page).await?;
        let got = snapshot.orders.len();
        server.extend(snapshot.orders);
        if !snapshot.has_more || got == 0 {
            break;
        }
        page.offset += page.limit;
        if page.offset >= SNAPSHOT_MAX_ROWS {
            warn!(rows = server.len(), "Snapshot page limit reached, truncating view");
            break;
        }
    }

    let local_pending: Vec<OrderRecord> = store::pending_order_records(db, tenant_id)?
        .into_iter()
        .filter(|r| record_matches_filter(r, filter))
        .collect();
    let markers = queue.synced_or_syncing_order_ids()?;

    Ok(merge_orders(
        server,
        local_pending,
        &markers,
        Utc::now(),
        grace,
        view,
    ))
}
