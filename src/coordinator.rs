//! Optimistic mutation coordinator.
//!
//! [`Coordinator::apply`] writes the change to the local store first and
//! hands back the optimistic state immediately; the remote attempt settles in
//! a spawned task. How a failed attempt resolves depends solely on its
//! [`FailureClass`](crate::error::FailureClass):
//!
//! - network class keeps the optimistic state and queues the change,
//! - server rejections restore the pre-mutation snapshot,
//! - persistence failures while queueing also restore, since without a
//!   durable queue entry the intent would be silently lost.
//!
//! Capability and lifecycle checks run before any write, so a denial needs
//! no rollback. When the order already has undelivered queue entries the
//! direct attempt is skipped and the change joins the queue behind them,
//! keeping per-order delivery in submission order.

use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::api::OrdersApi;
use crate::bus::{BusEvent, EventBus};
use crate::db::DbState;
use crate::error::{classify, FailureClass, Notice, SyncError};
use crate::lifecycle::{authorize_transition, plan_bulk_transition, Actor, BulkPlan, CapabilityGate};
use crate::model::{
    ItemStatus, OrderDraft, OrderPatch, OrderRecord, OrderStatus, SyncStatus,
};
use crate::queue::{EntityKind, Operation, SyncQueue};
use crate::store;

const QUEUED_ORDER_NOTICE: &str = "No connection to admin dashboard. Order saved locally and queued for sync.";
const QUEUED_CHANGE_NOTICE: &str = "No connection to admin dashboard. Change saved locally and queued for sync.";

// ---------------------------------------------------------------------------
// Mutations and outcomes
// ---------------------------------------------------------------------------

/// One user-initiated change. Item transitions carry the acting user so the
/// capability gate can rule on them.
#[derive(Debug, Clone)]
pub enum Mutation {
    CreateOrder {
        draft: OrderDraft,
    },
    UpdateOrder {
        order_id: String,
        patch: OrderPatch,
    },
    UpdateOrderStatus {
        order_id: String,
        status: OrderStatus,
    },
    UpdateItemStatus {
        order_id: String,
        item_id: String,
        status: ItemStatus,
        actor: Actor,
    },
    /// Advance every item currently in `from` one step to `to`.
    AdvanceItems {
        order_id: String,
        from: ItemStatus,
        to: ItemStatus,
        actor: Actor,
    },
    VoidOrder {
        order_id: String,
    },
}

/// How the remote side settled. For bulk transitions the variants aggregate:
/// any queued item makes the whole mutation `Queued`, otherwise any restored
/// item makes it `RolledBack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The server accepted the change directly.
    Committed,
    /// The server was unreachable; the change is queued and will replay.
    Queued,
    /// The server rejected the change; local state was restored.
    RolledBack { error: String },
}

/// Returned from [`Coordinator::apply`] as soon as the local write lands.
pub struct Applied {
    /// The record as visible immediately after the optimistic write.
    pub record: OrderRecord,
    /// Gate denials that excluded items from a bulk advance.
    pub plan: Option<BulkPlan>,
    /// Resolves once the remote attempt settles.
    pub remote: oneshot::Receiver<MutationOutcome>,
}

/// The remote half of a mutation, captured after the optimistic write.
enum RemoteWork {
    Create {
        record: OrderRecord,
    },
    Update {
        record: OrderRecord,
        snapshot: OrderRecord,
    },
    ItemStatus {
        order_id: String,
        item_id: String,
        status: ItemStatus,
        snapshot: OrderRecord,
    },
    Advance {
        order_id: String,
        to: ItemStatus,
        item_ids: Vec<String>,
        snapshot: OrderRecord,
    },
    Delete {
        order_id: String,
        snapshot: OrderRecord,
    },
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    db: Arc<DbState>,
    queue: SyncQueue,
    api: Arc<dyn OrdersApi>,
    gate: Arc<dyn CapabilityGate>,
    bus: EventBus,
    tenant_id: String,
    /// Shared with the engine's health loop; false short-circuits straight
    /// to the queue.
    online: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(
        db: Arc<DbState>,
        queue: SyncQueue,
        api: Arc<dyn OrdersApi>,
        gate: Arc<dyn CapabilityGate>,
        bus: EventBus,
        tenant_id: impl Into<String>,
        online: Arc<AtomicBool>,
    ) -> Coordinator {
        Coordinator {
            db,
            queue,
            api,
            gate,
            bus,
            tenant_id: tenant_id.into(),
            online,
        }
    }

    /// Apply a mutation optimistically. Validation and capability failures
    /// return an error with nothing written; otherwise the local store holds
    /// the new state when this returns, and `Applied::remote` reports how the
    /// server attempt ended.
    pub fn apply(self: &Arc<Self>, mutation: Mutation) -> Result<Applied, SyncError> {
        let now = Utc::now();
        let (record, plan, work) = match mutation {
            Mutation::CreateOrder { draft } => {
                draft.validate()?;
                let order_number = store::next_order_number(&self.db, &self.tenant_id)?;
                let record = draft.into_record(&self.tenant_id, order_number, now);
                store::insert_order_record(&self.db, &record)?;
                info!(order_id = %record.order.id, order_number = %record.order.order_number,
                    "Order created locally");
                self.bus.emit(BusEvent::OrderCreated {
                    order: record.clone(),
                });
                let work = RemoteWork::Create {
                    record: record.clone(),
                };
                (record, None, work)
            }

            Mutation::UpdateOrder { order_id, patch } => {
                let snapshot = self.require_record(&order_id)?;
                let order =
                    store::apply_order_patch(&self.db, &self.tenant_id, &order_id, &patch, now)?;
                let record = OrderRecord {
                    order,
                    items: snapshot.items.clone(),
                };
                self.bus.emit(BusEvent::OrderUpdated {
                    order_id: order_id.clone(),
                });
                let work = RemoteWork::Update {
                    record: record.clone(),
                    snapshot,
                };
                (record, None, work)
            }

            Mutation::UpdateOrderStatus { order_id, status } => {
                let snapshot = self.require_record(&order_id)?;
                let order =
                    store::set_order_status(&self.db, &self.tenant_id, &order_id, status, now)?;
                let record = OrderRecord {
                    order,
                    items: snapshot.items.clone(),
                };
                self.bus.emit(BusEvent::OrderUpdated {
                    order_id: order_id.clone(),
                });
                let work = RemoteWork::Update {
                    record: record.clone(),
                    snapshot,
                };
                (record, None, work)
            }

            Mutation::UpdateItemStatus {
                order_id,
                item_id,
                status,
                actor,
            } => {
                let snapshot = self.require_record(&order_id)?;
                let item = store::get_item(&self.db, &order_id, &item_id)?
                    .ok_or_else(|| SyncError::NotFound(format!("item {item_id}")))?;
                authorize_transition(self.gate.as_ref(), &actor, &item, status)?;

                store::set_item_status(&self.db, &order_id, &item_id, status, now)?;
                self.bus.emit(BusEvent::ItemStatusChanged {
                    order_id: order_id.clone(),
                    item_id: item_id.clone(),
                    status,
                });
                let record = self.require_record(&order_id)?;
                let work = RemoteWork::ItemStatus {
                    order_id,
                    item_id,
                    status,
                    snapshot,
                };
                (record, None, work)
            }

            Mutation::AdvanceItems {
                order_id,
                from,
                to,
                actor,
            } => {
                let snapshot = self.require_record(&order_id)?;
                let plan =
                    plan_bulk_transition(self.gate.as_ref(), &actor, &snapshot.items, from, to)?;
                if plan.is_empty() {
                    return Err(SyncError::NotFound(format!(
                        "no items in status '{}' on order {order_id}",
                        from.as_str()
                    )));
                }
                if plan.allowed.is_empty() {
                    return Err(SyncError::Permission(plan.rejected[0].reason.clone()));
                }

                store::set_items_status(&self.db, &order_id, &plan.allowed, to, now)?;
                for item_id in &plan.allowed {
                    self.bus.emit(BusEvent::ItemStatusChanged {
                        order_id: order_id.clone(),
                        item_id: item_id.clone(),
                        status: to,
                    });
                }
                let record = self.require_record(&order_id)?;
                let work = RemoteWork::Advance {
                    order_id,
                    to,
                    item_ids: plan.allowed.clone(),
                    snapshot,
                };
                (record, Some(plan), work)
            }

            Mutation::VoidOrder { order_id } => {
                let snapshot = self.require_record(&order_id)?;
                let order = store::soft_delete_order(&self.db, &self.tenant_id, &order_id, now)?;
                let record = OrderRecord {
                    order,
                    items: snapshot.items.clone(),
                };
                self.bus.emit(BusEvent::OrderDeleted {
                    order_id: order_id.clone(),
                });
                let work = RemoteWork::Delete { order_id, snapshot };
                (record, None, work)
            }
        };

        let (tx, rx) = oneshot::channel();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.settle(work).await;
            let _ = tx.send(outcome);
        });

        Ok(Applied {
            record,
            plan,
            remote: rx,
        })
    }

    fn require_record(&self, order_id: &str) -> Result<OrderRecord, SyncError> {
        store::get_order_record(&self.db, &self.tenant_id, order_id)?
            .ok_or_else(|| SyncError::NotFound(format!("order {order_id}")))
    }

    /// True when the direct attempt must be skipped: the terminal knows it is
    /// offline, or older entries for this order are still waiting and a
    /// direct call would overtake them.
    fn must_defer(&self, order_id: &str) -> Result<bool, SyncError> {
        if !self.online.load(Ordering::Relaxed) {
            return Ok(true);
        }
        self.queue.has_undelivered(order_id)
    }

    /// After a direct success the record is fully synced unless something
    /// else queued for it in the meantime.
    fn mark_record_synced(&self, order_id: &str) {
        match self.queue.has_undelivered(order_id) {
            Ok(false) => {
                if let Err(e) = store::set_order_sync_status(&self.db, order_id, SyncStatus::Synced)
                {
                    warn!(order_id, error = %e, "Failed to mark record synced");
                }
            }
            Ok(true) => {}
            Err(e) => warn!(order_id, error = %e, "Failed to check queue state"),
        }
    }

    fn notify_queued(&self, message: &str) {
        self.bus.emit(BusEvent::Notice {
            notice: Notice::queued(message),
        });
    }

    fn notify_error(&self, message: &str) {
        self.bus.emit(BusEvent::Notice {
            notice: Notice::error(message),
        });
    }

    // -- deferred-path helpers ---------------------------------------------

    fn enqueue_order(&self, op: Operation, record: &OrderRecord) -> Result<(), SyncError> {
        let payload = serde_json::to_value(record)?;
        self.queue
            .enqueue(EntityKind::Orders, op, &record.order.id, &payload)?;
        Ok(())
    }

    fn enqueue_delete(&self, order_id: &str, remote_id: Option<&str>) -> Result<(), SyncError> {
        let payload = json!({ "order_id": order_id, "remote_id": remote_id });
        self.queue
            .enqueue(EntityKind::Orders, Operation::Delete, order_id, &payload)?;
        Ok(())
    }

    fn enqueue_item(
        &self,
        order_id: &str,
        item_id: &str,
        status: ItemStatus,
    ) -> Result<(), SyncError> {
        let payload = json!({
            "order_id": order_id,
            "item_id": item_id,
            "status": status.as_str(),
        });
        self.queue
            .enqueue(EntityKind::OrderItems, Operation::Update, item_id, &payload)?;
        Ok(())
    }

    /// Restore the pre-mutation snapshot after a rejection. A restore that
    /// itself fails is logged loudly; the next reconciliation will converge
    /// the record to the server's copy anyway.
    fn restore(&self, snapshot: &OrderRecord) {
        if let Err(e) = store::restore_record(&self.db, snapshot) {
            error!(order_id = %snapshot.order.id, error = %e, "Rollback restore failed");
        }
        self.bus.emit(BusEvent::OrderUpdated {
            order_id: snapshot.order.id.clone(),
        });
    }

    // -- remote settlement --------------------------------------------------

    async fn settle(self: Arc<Self>, work: RemoteWork) -> MutationOutcome {
        match work {
            RemoteWork::Create { record } => self.settle_create(record).await,
            RemoteWork::Update { record, snapshot } => self.settle_update(record, snapshot).await,
            RemoteWork::ItemStatus {
                order_id,
                item_id,
                status,
                snapshot,
            } => {
                self.settle_item_status(order_id, item_id, status, snapshot)
                    .await
            }
            RemoteWork::Advance {
                order_id,
                to,
                item_ids,
                snapshot,
            } => self.settle_advance(order_id, to, item_ids, snapshot).await,
            RemoteWork::Delete { order_id, snapshot } => {
                self.settle_delete(order_id, snapshot).await
            }
        }
    }

    /// Queue the order mutation; if even that fails there is no durable
    /// record of the intent, so the snapshot comes back.
    fn queue_or_rollback(
        &self,
        enqueue: impl FnOnce() -> Result<(), SyncError>,
        rollback: impl FnOnce(),
        notice: &str,
    ) -> MutationOutcome {
        match enqueue() {
            Ok(()) => {
                self.notify_queued(notice);
                MutationOutcome::Queued
            }
            Err(e) => {
                error!(error = %e, "Could not queue change, rolling back");
                rollback();
                let message = e.to_string();
                self.notify_error(&message);
                MutationOutcome::RolledBack { error: message }
            }
        }
    }

    async fn settle_create(&self, record: OrderRecord) -> MutationOutcome {
        let order_id = record.order.id.clone();
        let rollback = || {
            if let Err(e) = store::hard_delete_order(&self.db, &order_id) {
                error!(order_id = %order_id, error = %e, "Rollback delete failed");
            }
            self.bus.emit(BusEvent::OrderDeleted {
                order_id: order_id.clone(),
            });
        };

        match self.must_defer(&order_id) {
            Ok(true) => {
                return self.queue_or_rollback(
                    || self.enqueue_order(Operation::Create, &record),
                    rollback,
                    QUEUED_ORDER_NOTICE,
                );
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Queue check failed, deferring order create");
                return self.queue_or_rollback(
                    || self.enqueue_order(Operation::Create, &record),
                    rollback,
                    QUEUED_ORDER_NOTICE,
                );
            }
        }

        match self.api.create_order(&record).await {
            Ok(ack) => {
                if let Err(e) = store::set_remote_id(&self.db, &order_id, &ack.id) {
                    warn!(order_id = %order_id, error = %e, "Failed to store server id");
                }
                self.mark_record_synced(&order_id);
                MutationOutcome::Committed
            }
            Err(e) => match classify(&e) {
                FailureClass::Network => self.queue_or_rollback(
                    || self.enqueue_order(Operation::Create, &record),
                    rollback,
                    QUEUED_ORDER_NOTICE,
                ),
                FailureClass::Rejected | FailureClass::Persistence => {
                    let message = e.to_string();
                    warn!(order_id = %order_id, error = %message, "Order rejected by server");
                    rollback();
                    self.notify_error(&message);
                    MutationOutcome::RolledBack { error: message }
                }
            },
        }
    }

    async fn settle_update(&self, record: OrderRecord, snapshot: OrderRecord) -> MutationOutcome {
        let order_id = record.order.id.clone();
        let defer = self.must_defer(&order_id).unwrap_or(true);
        if defer {
            return self.queue_or_rollback(
                || self.enqueue_order(Operation::Update, &record),
                || self.restore(&snapshot),
                QUEUED_CHANGE_NOTICE,
            );
        }

        match self.api.update_order(&record).await {
            Ok(_ack) => {
                self.mark_record_synced(&order_id);
                MutationOutcome::Committed
            }
            Err(e) => match classify(&e) {
                FailureClass::Network => self.queue_or_rollback(
                    || self.enqueue_order(Operation::Update, &record),
                    || self.restore(&snapshot),
                    QUEUED_CHANGE_NOTICE,
                ),
                FailureClass::Rejected | FailureClass::Persistence => {
                    let message = e.to_string();
                    warn!(order_id = %order_id, error = %message, "Update rejected by server");
                    self.restore(&snapshot);
                    self.notify_error(&message);
                    MutationOutcome::RolledBack { error: message }
                }
            },
        }
    }

    async fn settle_item_status(
        &self,
        order_id: String,
        item_id: String,
        status: ItemStatus,
        snapshot: OrderRecord,
    ) -> MutationOutcome {
        let defer = self.must_defer(&order_id).unwrap_or(true);
        if defer {
            return self.queue_or_rollback(
                || self.enqueue_item(&order_id, &item_id, status),
                || self.restore(&snapshot),
                QUEUED_CHANGE_NOTICE,
            );
        }

        let target = snapshot
            .order
            .remote_id
            .clone()
            .unwrap_or_else(|| order_id.clone());
        match self.api.update_item_status(&target, &item_id, status).await {
            Ok(()) => {
                self.mark_record_synced(&order_id);
                MutationOutcome::Committed
            }
            Err(e) => match classify(&e) {
                FailureClass::Network => self.queue_or_rollback(
                    || self.enqueue_item(&order_id, &item_id, status),
                    || self.restore(&snapshot),
                    QUEUED_CHANGE_NOTICE,
                ),
                FailureClass::Rejected | FailureClass::Persistence => {
                    let message = e.to_string();
                    warn!(order_id = %order_id, item_id = %item_id, error = %message,
                        "Item status rejected by server");
                    self.restore(&snapshot);
                    self.notify_error(&message);
                    MutationOutcome::RolledBack { error: message }
                }
            },
        }
    }

    /// Each allowed item settles with the single-item contract; the first
    /// network failure flips the rest of the batch onto the queue.
    async fn settle_advance(
        &self,
        order_id: String,
        to: ItemStatus,
        item_ids: Vec<String>,
        snapshot: OrderRecord,
    ) -> MutationOutcome {
        let mut queued = 0usize;
        let mut rolled_back: Vec<String> = Vec::new();
        let mut offline = self.must_defer(&order_id).unwrap_or(true);
        let target = snapshot
            .order
            .remote_id
            .clone()
            .unwrap_or_else(|| order_id.clone());

        for item_id in &item_ids {
            if offline {
                match self.enqueue_item(&order_id, item_id, to) {
                    Ok(()) => queued += 1,
                    Err(e) => {
                        error!(item_id = %item_id, error = %e, "Could not queue item change");
                        self.restore_item(&snapshot, item_id);
                        rolled_back.push(e.to_string());
                    }
                }
                continue;
            }

            match self.api.update_item_status(&target, item_id, to).await {
                Ok(()) => {}
                Err(e) => match classify(&e) {
                    FailureClass::Network => {
                        offline = true;
                        match self.enqueue_item(&order_id, item_id, to) {
                            Ok(()) => queued += 1,
                            Err(e) => {
                                error!(item_id = %item_id, error = %e, "Could not queue item change");
                                self.restore_item(&snapshot, item_id);
                                rolled_back.push(e.to_string());
                            }
                        }
                    }
                    FailureClass::Rejected | FailureClass::Persistence => {
                        let message = e.to_string();
                        warn!(order_id = %order_id, item_id = %item_id, error = %message,
                            "Bulk item status rejected by server");
                        self.restore_item(&snapshot, item_id);
                        self.notify_error(&message);
                        rolled_back.push(message);
                    }
                },
            }
        }

        if queued > 0 {
            self.notify_queued(QUEUED_CHANGE_NOTICE);
            return MutationOutcome::Queued;
        }
        if let Some(error) = rolled_back.into_iter().next() {
            return MutationOutcome::RolledBack { error };
        }
        self.mark_record_synced(&order_id);
        MutationOutcome::Committed
    }

    /// Put one item of a bulk advance back to its snapshot status.
    fn restore_item(&self, snapshot: &OrderRecord, item_id: &str) {
        let Some(prev) = snapshot.items.iter().find(|i| i.id == item_id) else {
            return;
        };
        if let Err(e) =
            store::set_item_status(&self.db, &snapshot.order.id, item_id, prev.status, Utc::now())
        {
            error!(item_id, error = %e, "Rollback of item status failed");
        }
        self.bus.emit(BusEvent::ItemStatusChanged {
            order_id: snapshot.order.id.clone(),
            item_id: item_id.to_string(),
            status: prev.status,
        });
    }

    async fn settle_delete(&self, order_id: String, snapshot: OrderRecord) -> MutationOutcome {
        let remote_id = snapshot.order.remote_id.clone();

        // An order the server has never seen and that has nothing queued is
        // settled by the local soft delete alone.
        if remote_id.is_none() {
            match self.queue.has_undelivered(&order_id) {
                Ok(false) => return MutationOutcome::Committed,
                Ok(true) => {
                    return self.queue_or_rollback(
                        || self.enqueue_delete(&order_id, None),
                        || self.restore(&snapshot),
                        QUEUED_CHANGE_NOTICE,
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Queue check failed, deferring order delete");
                    return self.queue_or_rollback(
                        || self.enqueue_delete(&order_id, None),
                        || self.restore(&snapshot),
                        QUEUED_CHANGE_NOTICE,
                    );
                }
            }
        }

        let defer = self.must_defer(&order_id).unwrap_or(true);
        if defer {
            return self.queue_or_rollback(
                || self.enqueue_delete(&order_id, remote_id.as_deref()),
                || self.restore(&snapshot),
                QUEUED_CHANGE_NOTICE,
            );
        }

        let target = remote_id.clone().unwrap_or_else(|| order_id.clone());
        match self.api.delete_order(&target).await {
            Ok(()) => {
                self.mark_record_synced(&order_id);
                MutationOutcome::Committed
            }
            Err(e) => match classify(&e) {
                FailureClass::Network => self.queue_or_rollback(
                    || self.enqueue_delete(&order_id, remote_id.as_deref()),
                    || self.restore(&snapshot),
                    QUEUED_CHANGE_NOTICE,
                ),
                FailureClass::Rejected | FailureClass::Persistence => {
                    let message = e.to_string();
                    warn!(order_id = %order_id, error = %message, "Delete rejected by server");
                    self.restore(&snapshot);
                    self.notify_error(&message);
                    MutationOutcome::RolledBack { error: message }
                }
            },
        }
    }
}
