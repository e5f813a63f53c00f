//! Outbound sync queue.
//!
//! Every deferred write travels through here; nothing else in the engine
//! retries network work. Entries are durable rows keyed by an idempotency
//! key, coalesced so a record holds at most one undelivered entry per
//! operation, and drained oldest-first per order so creates always land
//! before updates. Failed deliveries back off per entry with bounded
//! exponential delay plus deterministic jitter.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::db::DbState;
use crate::error::{classify, FailureClass, SyncError};
use crate::model::SyncStatus;
use crate::store;

pub const DEFAULT_MAX_RETRIES: i64 = 5;
pub const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
pub const MIN_RETRY_DELAY_MS: i64 = 1_000;
pub const MAX_RETRY_DELAY_MS: i64 = 300_000;
pub const DEFAULT_DRAIN_CONCURRENCY: usize = 4;

const DRAIN_BATCH_LIMIT: i64 = 50;

// ---------------------------------------------------------------------------
// Entry model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Orders,
    OrderItems,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Orders => "orders",
            EntityKind::OrderItems => "order_items",
        }
    }

    fn parse(s: &str) -> Option<EntityKind> {
        match s {
            "orders" => Some(EntityKind::Orders),
            "order_items" => Some(EntityKind::OrderItems),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Option<Operation> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Synced => "synced",
            QueueStatus::Failed => "failed",
        }
    }
}

/// One durable queue row.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    /// Raw JSON payload, parsed only by the delivery implementation.
    pub payload: String,
    pub idempotency_key: String,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub retry_delay_ms: i64,
    pub next_retry_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub synced_at: Option<String>,
}

impl QueueEntry {
    /// The order this entry belongs to. Item entries carry their parent
    /// order id inside the payload.
    pub fn order_scope(&self) -> String {
        match self.entity_type {
            EntityKind::Orders => self.entity_id.clone(),
            EntityKind::OrderItems => serde_json::from_str::<serde_json::Value>(&self.payload)
                .ok()
                .and_then(|v| v.get("order_id").and_then(|o| o.as_str().map(String::from)))
                .unwrap_or_else(|| self.entity_id.clone()),
        }
    }
}

const ENTRY_COLUMNS: &str = "id, entity_type, entity_id, operation, payload, idempotency_key, \
     status, retry_count, max_retries, retry_delay_ms, next_retry_at, last_error, created_at, \
     updated_at, synced_at";

fn entry_from_row(row: &Row) -> rusqlite::Result<QueueEntry> {
    let entity_raw: String = row.get(1)?;
    let op_raw: String = row.get(3)?;
    let status_raw: String = row.get(6)?;
    let entity_type = EntityKind::parse(&entity_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown entity type '{entity_raw}'").into(),
        )
    })?;
    let operation = Operation::parse(&op_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown operation '{op_raw}'").into(),
        )
    })?;
    let status = match status_raw.as_str() {
        "syncing" => QueueStatus::Syncing,
        "synced" => QueueStatus::Synced,
        "failed" => QueueStatus::Failed,
        _ => QueueStatus::Pending,
    };
    Ok(QueueEntry {
        id: row.get(0)?,
        entity_type,
        entity_id: row.get(2)?,
        operation,
        payload: row.get(4)?,
        idempotency_key: row.get(5)?,
        status,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        retry_delay_ms: row.get(9)?,
        next_retry_at: row.get(10)?,
        last_error: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        synced_at: row.get(14)?,
    })
}

// ---------------------------------------------------------------------------
// Delivery seam
// ---------------------------------------------------------------------------

/// What the server handed back for a delivered entry.
#[derive(Debug, Clone, Default)]
pub struct DeliveryReceipt {
    pub remote_id: Option<String>,
}

/// Transport used to deliver queue entries. The engine wires this to the
/// orders API; tests script it.
#[async_trait]
pub trait SyncDelivery: Send + Sync {
    async fn deliver(&self, entry: &QueueEntry) -> Result<DeliveryReceipt, SyncError>;
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TerminalFailure {
    pub entry_id: i64,
    pub entity_id: String,
    pub operation: Operation,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    /// Entries that failed with a retryable error and were rescheduled.
    pub retried: usize,
    /// Entries that ran out of retry budget this drain.
    pub exhausted: usize,
    pub terminal: Vec<TerminalFailure>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.retried == 0 && self.exhausted == 0 && self.terminal.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub syncing: i64,
    pub synced: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct EnqueueOutcome {
    pub entry_id: i64,
    /// True when an existing undelivered entry absorbed this write.
    pub coalesced: bool,
}

// ---------------------------------------------------------------------------
// Retry pacing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: i64,
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_DELAY_MS,
            max_delay_ms: MAX_RETRY_DELAY_MS,
        }
    }
}

/// Spread retries without per-entry randomness so tests stay deterministic.
fn deterministic_jitter_ms(seed: i64) -> i64 {
    (seed.abs() % 700) + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(MIN_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS);
    let total = bounded + deterministic_jitter_ms(seed);
    (Utc::now() + chrono::Duration::milliseconds(total)).to_rfc3339()
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Durable outbound queue over the shared database.
#[derive(Clone)]
pub struct SyncQueue {
    db: Arc<DbState>,
    policy: RetryPolicy,
    concurrency: usize,
}

impl SyncQueue {
    pub fn new(db: Arc<DbState>, policy: RetryPolicy, concurrency: usize) -> Self {
        SyncQueue {
            db,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    /// Record a deferred write. If an undelivered entry already exists for
    /// the same (entity, id, operation), its payload is replaced instead of
    /// inserting a duplicate, so replaying the queue cannot double-apply.
    pub fn enqueue(
        &self,
        entity: EntityKind,
        operation: Operation,
        entity_id: &str,
        payload: &serde_json::Value,
    ) -> Result<EnqueueOutcome, SyncError> {
        let payload_text = serde_json::to_string(payload)?;
        let now = Utc::now();
        let conn = self.db.conn.lock()?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM sync_queue
                 WHERE entity_type = ?1 AND entity_id = ?2 AND operation = ?3
                   AND (status = 'pending'
                        OR (status = 'failed' AND retry_count < max_retries))
                 ORDER BY id ASC LIMIT 1",
                params![entity.as_str(), entity_id, operation.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                "UPDATE sync_queue SET payload = ?1, updated_at = ?2 WHERE id = ?3",
                params![payload_text, now.to_rfc3339(), id],
            )?;
            debug!(entry_id = id, entity = entity.as_str(), entity_id,
                op = operation.as_str(), "Coalesced into existing queue entry");
            return Ok(EnqueueOutcome {
                entry_id: id,
                coalesced: true,
            });
        }

        let key = format!(
            "{}:{}:{}:{}",
            entity.as_str(),
            entity_id,
            operation.as_str(),
            now.timestamp_millis()
        );
        conn.execute(
            "INSERT INTO sync_queue (entity_type, entity_id, operation, payload,
                 idempotency_key, status, max_retries, retry_delay_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?8)",
            params![
                entity.as_str(),
                entity_id,
                operation.as_str(),
                payload_text,
                key,
                self.policy.max_retries,
                self.policy.base_delay_ms,
                now.to_rfc3339(),
            ],
        )?;
        let entry_id = conn.last_insert_rowid();
        debug!(entry_id, entity = entity.as_str(), entity_id, op = operation.as_str(),
            "Queued for sync");
        Ok(EnqueueOutcome {
            entry_id,
            coalesced: false,
        })
    }

    /// Flip failed entries whose backoff has expired back to pending.
    /// Entries that spent their retry budget stay failed for manual review.
    pub fn requeue_due(&self) -> Result<usize, SyncError> {
        let conn = self.db.conn.lock()?;
        let n = conn.execute(
            "UPDATE sync_queue SET status = 'pending', updated_at = ?1
             WHERE status = 'failed' AND retry_count < max_retries
               AND (next_retry_at IS NULL OR julianday(next_retry_at) <= julianday('now'))",
            [Utc::now().to_rfc3339()],
        )?;
        Ok(n)
    }

    /// Give terminally failed entries one more chance. Called once at engine
    /// start: what the server rejected yesterday may pass today.
    pub fn requeue_exhausted(&self) -> Result<usize, SyncError> {
        let conn = self.db.conn.lock()?;
        let n = conn.execute(
            "UPDATE sync_queue
             SET status = 'pending', retry_count = 0, retry_delay_ms = ?1,
                 next_retry_at = NULL, updated_at = ?2
             WHERE status = 'failed' AND retry_count >= max_retries",
            params![self.policy.base_delay_ms, Utc::now().to_rfc3339()],
        )?;
        if n > 0 {
            info!(requeued = n, "Requeued terminally failed entries for one more attempt");
        }
        Ok(n)
    }

    /// Entries stuck in 'syncing' from a crashed process go back to pending.
    pub fn reset_stale_syncing(&self) -> Result<usize, SyncError> {
        let conn = self.db.conn.lock()?;
        let n = conn.execute(
            "UPDATE sync_queue SET status = 'pending', updated_at = ?1 WHERE status = 'syncing'",
            [Utc::now().to_rfc3339()],
        )?;
        if n > 0 {
            warn!(reset = n, "Reset stale syncing entries from previous run");
        }
        Ok(n)
    }

    pub fn counts(&self) -> Result<QueueCounts, SyncError> {
        let conn = self.db.conn.lock()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")?;
        let mut rows = stmt.query([])?;
        let mut counts = QueueCounts::default();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match status.as_str() {
                "pending" => counts.pending = count,
                "syncing" => counts.syncing = count,
                "synced" => counts.synced = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Earliest scheduled retry among undelivered entries, if any are
    /// waiting out a backoff.
    pub fn oldest_next_retry_at(&self) -> Result<Option<String>, SyncError> {
        let conn = self.db.conn.lock()?;
        let oldest: Option<String> = conn.query_row(
            "SELECT MIN(next_retry_at) FROM sync_queue
             WHERE status IN ('pending', 'failed') AND next_retry_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(oldest)
    }

    /// Pending entries whose backoff (if any) has expired, oldest first.
    fn due_entries(&self, limit: i64) -> Result<Vec<QueueEntry>, SyncError> {
        let conn = self.db.conn.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM sync_queue
             WHERE status = 'pending'
               AND (next_retry_at IS NULL OR julianday(next_retry_at) <= julianday('now'))
             ORDER BY id ASC LIMIT ?1"
        ))?;
        let entries = stmt
            .query_map([limit], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// True when an older undelivered entry for the same order exists below
    /// `first_id`. Such a group must wait so creates land before updates.
    fn scope_blocked_before(&self, scope: &str, first_id: i64) -> Result<bool, SyncError> {
        let conn = self.db.conn.lock()?;
        let like = format!("%\"order_id\":\"{scope}\"%");
        let blocked: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue
             WHERE id < ?1
               AND ((entity_type = 'orders' AND entity_id = ?2)
                    OR (entity_type = 'order_items' AND payload LIKE ?3))
               AND (status IN ('pending', 'syncing')
                    OR (status = 'failed' AND retry_count < max_retries))",
            params![first_id, scope, like],
            |row| row.get(0),
        )?;
        Ok(blocked > 0)
    }

    /// Deliver every due entry. Entries are grouped per order, groups run
    /// with bounded concurrency, and each group is strictly FIFO: a failure
    /// stops the rest of that group until the next drain.
    pub async fn drain(&self, delivery: Arc<dyn SyncDelivery>) -> Result<DrainReport, SyncError> {
        let requeued = self.requeue_due()?;
        if requeued > 0 {
            debug!(requeued, "Requeued entries whose backoff expired");
        }

        let mut report = DrainReport::default();
        loop {
            let batch = self.due_entries(DRAIN_BATCH_LIMIT)?;
            if batch.is_empty() {
                break;
            }

            let mut groups: Vec<(String, Vec<QueueEntry>)> = Vec::new();
            for entry in batch {
                let scope = entry.order_scope();
                match groups.iter_mut().find(|(s, _)| *s == scope) {
                    Some((_, entries)) => entries.push(entry),
                    None => groups.push((scope, vec![entry])),
                }
            }

            let mut join_set: JoinSet<GroupOutcome> = JoinSet::new();
            let mut iter = groups.into_iter();
            let mut progressed = false;

            loop {
                while join_set.len() < self.concurrency {
                    let Some((scope, entries)) = iter.next() else {
                        break;
                    };
                    if self.scope_blocked_before(&scope, entries[0].id)? {
                        debug!(scope = %scope, "Order has an older undelivered entry, deferring group");
                        continue;
                    }
                    let queue = self.clone();
                    let delivery = Arc::clone(&delivery);
                    join_set.spawn(async move { queue.deliver_group(delivery, entries).await });
                }
                match join_set.join_next().await {
                    Some(Ok(outcome)) => {
                        report.attempted += outcome.attempted;
                        report.delivered += outcome.delivered;
                        report.retried += outcome.retried;
                        report.exhausted += outcome.exhausted;
                        report.terminal.extend(outcome.terminal);
                        if outcome.delivered > 0 {
                            progressed = true;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Sync delivery task aborted");
                    }
                    None => break,
                }
            }

            if !progressed {
                // Everything left is waiting out a backoff or blocked.
                break;
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                delivered = report.delivered,
                retried = report.retried,
                exhausted = report.exhausted,
                terminal = report.terminal.len(),
                "Sync queue drained"
            );
        }
        Ok(report)
    }

    async fn deliver_group(
        &self,
        delivery: Arc<dyn SyncDelivery>,
        entries: Vec<QueueEntry>,
    ) -> GroupOutcome {
        let mut outcome = GroupOutcome::default();
        for entry in entries {
            if let Err(e) = self.mark_syncing(entry.id) {
                error!(entry_id = entry.id, error = %e, "Could not mark entry syncing");
                break;
            }
            outcome.attempted += 1;
            match delivery.deliver(&entry).await {
                Ok(receipt) => {
                    if let Err(e) = self.mark_synced(&entry, &receipt) {
                        error!(entry_id = entry.id, error = %e, "Could not record delivery");
                        break;
                    }
                    outcome.delivered += 1;
                }
                Err(err) => {
                    match classify(&err) {
                        FailureClass::Rejected => {
                            error!(entry_id = entry.id, entity_id = %entry.entity_id,
                                error = %err, "Server rejected queued entry");
                            if let Err(e) = self.mark_failed_terminal(&entry, &err) {
                                error!(entry_id = entry.id, error = %e,
                                    "Could not record terminal failure");
                            }
                            outcome.terminal.push(TerminalFailure {
                                entry_id: entry.id,
                                entity_id: entry.entity_id.clone(),
                                operation: entry.operation,
                                error: err.to_string(),
                            });
                        }
                        _ => {
                            warn!(entry_id = entry.id, entity_id = %entry.entity_id,
                                retry = entry.retry_count + 1, error = %err,
                                "Delivery failed, will retry");
                            match self.mark_failed_retry(&entry, &err) {
                                Ok(exhausted) => {
                                    if exhausted {
                                        outcome.exhausted += 1;
                                    } else {
                                        outcome.retried += 1;
                                    }
                                }
                                Err(e) => error!(entry_id = entry.id, error = %e,
                                    "Could not record retry"),
                            }
                        }
                    }
                    // Later entries for this order wait for the next drain.
                    break;
                }
            }
        }
        outcome
    }

    // -- entry bookkeeping --------------------------------------------------

    fn mark_syncing(&self, entry_id: i64) -> Result<(), SyncError> {
        let conn = self.db.conn.lock()?;
        conn.execute(
            "UPDATE sync_queue SET status = 'syncing', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), entry_id],
        )?;
        Ok(())
    }

    fn mark_synced(&self, entry: &QueueEntry, receipt: &DeliveryReceipt) -> Result<(), SyncError> {
        {
            let conn = self.db.conn.lock()?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE sync_queue
                 SET status = 'synced', synced_at = ?1, updated_at = ?1, last_error = NULL
                 WHERE id = ?2",
                params![now, entry.id],
            )?;
        }
        let scope = entry.order_scope();
        if entry.entity_type == EntityKind::Orders {
            if let Some(remote_id) = &receipt.remote_id {
                store::set_remote_id(&self.db, &entry.entity_id, remote_id)?;
            }
        }
        self.refresh_record_sync_status(&scope)?;
        debug!(entry_id = entry.id, entity_id = %entry.entity_id, "Entry delivered");
        Ok(())
    }

    /// Returns true when this failure spent the entry's retry budget.
    fn mark_failed_retry(&self, entry: &QueueEntry, err: &SyncError) -> Result<bool, SyncError> {
        let attempts = entry.retry_count + 1;
        let exhausted = attempts >= entry.max_retries;
        {
            let conn = self.db.conn.lock()?;
            let now = Utc::now().to_rfc3339();
            if exhausted {
                conn.execute(
                    "UPDATE sync_queue
                     SET status = 'failed', retry_count = ?1, last_error = ?2,
                         next_retry_at = NULL, updated_at = ?3
                     WHERE id = ?4",
                    params![attempts, err.to_string(), now, entry.id],
                )?;
            } else {
                let delay = entry
                    .retry_delay_ms
                    .clamp(MIN_RETRY_DELAY_MS, self.policy.max_delay_ms);
                let next_retry_at = schedule_next_retry(delay, entry.id);
                let doubled = (delay * 2).min(self.policy.max_delay_ms);
                conn.execute(
                    "UPDATE sync_queue
                     SET status = 'failed', retry_count = ?1, last_error = ?2,
                         next_retry_at = ?3, retry_delay_ms = ?4, updated_at = ?5
                     WHERE id = ?6",
                    params![attempts, err.to_string(), next_retry_at, doubled, now, entry.id],
                )?;
            }
        }
        if exhausted {
            warn!(entry_id = entry.id, entity_id = %entry.entity_id,
                "Entry spent its retry budget, leaving for manual review");
            store::set_order_sync_status(&self.db, &entry.order_scope(), SyncStatus::Conflict)?;
        }
        Ok(exhausted)
    }

    fn mark_failed_terminal(&self, entry: &QueueEntry, err: &SyncError) -> Result<(), SyncError> {
        {
            let conn = self.db.conn.lock()?;
            conn.execute(
                "UPDATE sync_queue
                 SET status = 'failed', retry_count = max_retries, last_error = ?1,
                     next_retry_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![err.to_string(), Utc::now().to_rfc3339(), entry.id],
            )?;
        }
        store::set_order_sync_status(&self.db, &entry.order_scope(), SyncStatus::Conflict)?;
        Ok(())
    }

    /// Once no undelivered entries remain for an order, its record is synced.
    fn refresh_record_sync_status(&self, order_id: &str) -> Result<(), SyncError> {
        let open = {
            let conn = self.db.conn.lock()?;
            let like = format!("%\"order_id\":\"{order_id}\"%");
            conn.query_row(
                "SELECT COUNT(*) FROM sync_queue
                 WHERE ((entity_type = 'orders' AND entity_id = ?1)
                        OR (entity_type = 'order_items' AND payload LIKE ?2))
                   AND (status IN ('pending', 'syncing')
                        OR (status = 'failed' AND retry_count < max_retries))",
                params![order_id, like],
                |row| row.get::<_, i64>(0),
            )?
        };
        if open == 0 {
            store::set_order_sync_status(&self.db, order_id, SyncStatus::Synced)?;
        }
        Ok(())
    }

    /// True if the order still has undelivered queue entries. The mutation
    /// coordinator checks this before attempting a direct call so queued
    /// writes keep their order.
    pub fn has_undelivered(&self, order_id: &str) -> Result<bool, SyncError> {
        let conn = self.db.conn.lock()?;
        let like = format!("%\"order_id\":\"{order_id}\"%");
        let open: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_queue
             WHERE ((entity_type = 'orders' AND entity_id = ?1)
                    OR (entity_type = 'order_items' AND payload LIKE ?2))
               AND (status IN ('pending', 'syncing')
                    OR (status = 'failed' AND retry_count < max_retries))",
            params![order_id, like],
            |row| row.get(0),
        )?;
        Ok(open > 0)
    }

    /// Order ids with an entry that is delivered or in flight. Reconciliation
    /// uses this to drop local records the server should know about but does
    /// not yet return.
    pub fn synced_or_syncing_order_ids(&self) -> Result<std::collections::HashSet<String>, SyncError> {
        let conn = self.db.conn.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT entity_id FROM sync_queue
             WHERE entity_type = 'orders' AND status IN ('synced', 'syncing')",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<std::collections::HashSet<_>, _>>()?;
        Ok(ids)
    }
}

#[derive(Debug, Default)]
struct GroupOutcome {
    attempted: usize,
    delivered: usize,
    retried: usize,
    exhausted: usize,
    terminal: Vec<TerminalFailure>,
}
