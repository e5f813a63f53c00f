//! Engine assembly and the periodic sync loop.
//!
//! [`SyncEngine`] wires the store, queue, coordinator, and realtime
//! distributor together and owns their background tasks. Consumers apply
//! mutations through it, subscribe to the event bus, and read reconciled
//! views; everything else happens on the engine's own schedule.
//!
//! The sync loop runs one cycle per tick: a health probe decides the shared
//! online flag, a reachable server gets the queue drained through
//! [`ApiDelivery`], and a status summary goes out on the bus either way.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ConnectivityResult, HttpOrdersApi, OrdersApi};
use crate::bus::{BusEvent, EventBus, SyncSummary};
use crate::config::EngineConfig;
use crate::coordinator::{Applied, Coordinator, Mutation};
use crate::db::{self, DbState};
use crate::error::SyncError;
use crate::lifecycle::{AllowAll, CapabilityGate};
use crate::model::{ItemStatus, OrderFilter, OrderRecord};
use crate::queue::{
    DeliveryReceipt, DrainReport, EntityKind, Operation, QueueEntry, SyncDelivery, SyncQueue,
};
use crate::realtime::{ChannelState, Distributor, PollOnlyChannel, PushChannel};
use crate::reconcile::{OrderView, ViewKind};
use crate::store;

// ---------------------------------------------------------------------------
// Queue delivery over the orders API
// ---------------------------------------------------------------------------

/// Replays queue entries against the admin dashboard.
///
/// Payloads were written by the mutation coordinator at enqueue time, which
/// can be before the order ever reached the server. Server-side ids are
/// therefore re-resolved against the store at delivery time, where the
/// receipt of an earlier create has already landed.
struct ApiDelivery {
    db: Arc<DbState>,
    api: Arc<dyn OrdersApi>,
    tenant_id: String,
}

impl ApiDelivery {
    fn payload(entry: &QueueEntry) -> Result<Value, SyncError> {
        serde_json::from_str(&entry.payload).map_err(|e| {
            SyncError::Rejected(format!(
                "Queue entry {} has an unreadable payload: {e}",
                entry.id
            ))
        })
    }

    fn record(entry: &QueueEntry) -> Result<OrderRecord, SyncError> {
        serde_json::from_str(&entry.payload).map_err(|e| {
            SyncError::Rejected(format!(
                "Queue entry {} has an unreadable payload: {e}",
                entry.id
            ))
        })
    }

    /// Server id for an order, preferring what the store knows now over
    /// what was known when the entry was enqueued.
    fn resolve_remote_id(&self, order_id: &str, enqueued: Option<String>) -> Option<String> {
        match store::get_order(&self.db, &self.tenant_id, order_id) {
            Ok(Some(order)) => order.remote_id.or(enqueued),
            _ => enqueued,
        }
    }

    async fn deliver_order(&self, entry: &QueueEntry) -> Result<DeliveryReceipt, SyncError> {
        match entry.operation {
            Operation::Create => {
                let record = Self::record(entry)?;
                let ack = self.api.create_order(&record).await?;
                debug!(order_id = %entry.entity_id, remote_id = %ack.id, "Queued create delivered");
                Ok(DeliveryReceipt {
                    remote_id: Some(ack.id),
                })
            }
            Operation::Update => {
                let mut record = Self::record(entry)?;
                if record.order.remote_id.is_none() {
                    record.order.remote_id = self.resolve_remote_id(&entry.entity_id, None);
                }
                let ack = self.api.update_order(&record).await?;
                Ok(DeliveryReceipt {
                    remote_id: Some(ack.id),
                })
            }
            Operation::Delete => {
                let payload = Self::payload(entry)?;
                let enqueued = payload
                    .get("remote_id")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                let target = self
                    .resolve_remote_id(&entry.entity_id, enqueued)
                    .unwrap_or_else(|| entry.entity_id.clone());
                self.api.delete_order(&target).await?;
                Ok(DeliveryReceipt::default())
            }
        }
    }

    async fn deliver_item(&self, entry: &QueueEntry) -> Result<DeliveryReceipt, SyncError> {
        let payload = Self::payload(entry)?;
        let order_id = payload
            .get("order_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SyncError::Rejected(format!("Queue entry {} is missing order_id", entry.id))
            })?;
        let status = payload
            .get("status")
            .and_then(|v| v.as_str())
            .map(ItemStatus::parse)
            .ok_or_else(|| {
                SyncError::Rejected(format!("Queue entry {} is missing status", entry.id))
            })?;
        let item_id = payload
            .get("item_id")
            .and_then(|v| v.as_str())
            .unwrap_or(entry.entity_id.as_str());

        let target = self
            .resolve_remote_id(order_id, None)
            .unwrap_or_else(|| order_id.to_string());
        self.api.update_item_status(&target, item_id, status).await?;
        Ok(DeliveryReceipt::default())
    }
}

#[async_trait]
impl SyncDelivery for ApiDelivery {
    async fn deliver(&self, entry: &QueueEntry) -> Result<DeliveryReceipt, SyncError> {
        match entry.entity_type {
            EntityKind::Orders => self.deliver_order(entry).await,
            EntityKind::OrderItems => self.deliver_item(entry).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The assembled sync engine. Construct with [`SyncEngine::new`], call
/// [`start`](SyncEngine::start) once, then interact through the public
/// methods; [`shutdown`](SyncEngine::shutdown) stops the background tasks.
pub struct SyncEngine {
    config: EngineConfig,
    db: Arc<DbState>,
    queue: SyncQueue,
    api: Arc<dyn OrdersApi>,
    delivery: Arc<dyn SyncDelivery>,
    coordinator: Arc<Coordinator>,
    distributor: Arc<Distributor>,
    bus: EventBus,
    online: Arc<AtomicBool>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl SyncEngine {
    /// Open the database under the configured data directory and build an
    /// engine against the HTTP API, with no push transport and no capability
    /// restrictions.
    pub fn new(config: EngineConfig) -> Result<Arc<SyncEngine>, SyncError> {
        SyncEngine::with_transports(config, Arc::new(PollOnlyChannel), Arc::new(AllowAll))
    }

    /// Like [`SyncEngine::new`] with a caller-supplied push transport and
    /// capability gate.
    pub fn with_transports(
        config: EngineConfig,
        channel: Arc<dyn PushChannel>,
        gate: Arc<dyn CapabilityGate>,
    ) -> Result<Arc<SyncEngine>, SyncError> {
        config.validate()?;
        let db = Arc::new(db::init(&config.data_dir)?);
        let api: Arc<dyn OrdersApi> = Arc::new(HttpOrdersApi::new(
            &config.admin_url,
            &config.api_key,
            &config.tenant_id,
        )?);
        Ok(SyncEngine::boot(config, db, api, channel, gate))
    }

    /// Assemble the engine around an existing database and API client.
    fn boot(
        config: EngineConfig,
        db: Arc<DbState>,
        api: Arc<dyn OrdersApi>,
        channel: Arc<dyn PushChannel>,
        gate: Arc<dyn CapabilityGate>,
    ) -> Arc<SyncEngine> {
        let bus = EventBus::default();
        let queue = SyncQueue::new(Arc::clone(&db), config.retry, config.drain_concurrency);
        // Optimistic until the first health probe says otherwise; a wrong
        // guess costs one direct attempt that then queues.
        let online = Arc::new(AtomicBool::new(true));

        let delivery: Arc<dyn SyncDelivery> = Arc::new(ApiDelivery {
            db: Arc::clone(&db),
            api: Arc::clone(&api),
            tenant_id: config.tenant_id.clone(),
        });
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&db),
            queue.clone(),
            Arc::clone(&api),
            gate,
            bus.clone(),
            config.tenant_id.clone(),
            Arc::clone(&online),
        ));
        let distributor = Arc::new(Distributor::new(
            &config,
            Arc::clone(&api),
            channel,
            Arc::clone(&db),
            queue.clone(),
            bus.clone(),
        ));

        Arc::new(SyncEngine {
            config,
            db,
            queue,
            api,
            delivery,
            coordinator,
            distributor,
            bus,
            online,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Recover queue state left behind by a previous run, then launch the
    /// realtime distributor and the periodic sync loop. Idempotent; later
    /// calls are no-ops.
    pub fn start(self: &Arc<Self>) -> Result<(), SyncError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Entries stuck in 'syncing' were in flight when the process died;
        // exhausted entries get a fresh retry budget on restart.
        let reset = self.queue.reset_stale_syncing()?;
        let revived = self.queue.requeue_exhausted()?;
        if reset > 0 || revived > 0 {
            info!(reset, revived, "Recovered queue state from previous run");
        }

        let distributor = Arc::clone(&self.distributor);
        tokio::spawn(distributor.run(self.shutdown.clone()));

        let engine = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { engine.run_sync_loop(shutdown).await });
        Ok(())
    }

    /// Stop the background tasks. In-flight deliveries finish their current
    /// entry; everything else is picked up again on the next start.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    async fn run_sync_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = self.config.drain_interval();
        info!(interval_secs = interval.as_secs(), "Sync loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_cycle().await {
                        error!(error = %e, "Sync cycle failed");
                    }
                }
            }
        }
    }

    /// One full cycle: probe the server, drain the queue if it is reachable,
    /// publish the resulting status.
    async fn sync_cycle(&self) -> Result<DrainReport, SyncError> {
        let health = self.api.check_health().await;
        let was_online = self.online.swap(health.success, Ordering::Relaxed);
        if was_online != health.success {
            if health.success {
                info!(latency_ms = ?health.latency_ms, "Admin dashboard reachable again");
            } else {
                warn!(error = ?health.error, "Admin dashboard unreachable, changes will queue");
            }
            self.bus.emit(BusEvent::NetworkStatus {
                online: health.success,
                latency_ms: health.latency_ms,
            });
        }

        let report = if health.success {
            let report = self.queue.drain(Arc::clone(&self.delivery)).await?;
            if report.attempted > 0 {
                self.bus.emit(BusEvent::QueueDrained {
                    report: report.clone(),
                });
            }
            if report.delivered > 0 {
                // Delivered entries may have shifted what the server returns.
                if let Err(e) = self.distributor.refresh_now().await {
                    debug!(error = %e, "View refresh after drain failed");
                }
            }
            if report.is_clean() {
                self.record_last_sync()?;
            }
            report
        } else {
            DrainReport::default()
        };

        self.publish_status()?;
        Ok(report)
    }

    fn record_last_sync(&self) -> Result<(), SyncError> {
        let conn = self.db.conn.lock()?;
        db::setting_set(&conn, "sync", "last_sync_at", &Utc::now().to_rfc3339())
    }

    fn publish_status(&self) -> Result<(), SyncError> {
        let summary = self.sync_status()?;
        self.bus.emit(BusEvent::SyncStatus { summary });
        Ok(())
    }

    // -- public surface ------------------------------------------------------

    /// Apply a mutation through the optimistic coordinator. The local write
    /// is visible when this returns; `Applied::remote` resolves once the
    /// server attempt settles.
    pub fn apply(&self, mutation: Mutation) -> Result<Applied, SyncError> {
        self.coordinator.apply(mutation)
    }

    /// Run a sync cycle now instead of waiting for the next tick. This is
    /// the "Sync now" button.
    pub async fn flush(&self) -> Result<DrainReport, SyncError> {
        self.sync_cycle().await
    }

    /// Current queue and connectivity summary, as also published on the bus
    /// after every cycle.
    pub fn sync_status(&self) -> Result<SyncSummary, SyncError> {
        let counts = self.queue.counts()?;
        let last_sync_at = {
            let conn = self.db.conn.lock()?;
            db::setting_get(&conn, "sync", "last_sync_at")?
        };
        Ok(SyncSummary {
            is_online: self.online.load(Ordering::Relaxed),
            last_sync_at,
            pending_items: counts.pending + counts.syncing,
            sync_in_progress: counts.syncing > 0,
            sync_errors: counts.failed,
            conflict_orders: store::count_conflict_orders(&self.db, &self.config.tenant_id)?,
            unsynced_orders: store::count_unsynced_orders(&self.db, &self.config.tenant_id)?,
            oldest_next_retry_at: self.queue.oldest_next_retry_at()?,
        })
    }

    /// Point the live view at a filter and return the reconciled result.
    /// Subsequent pushes and polls keep refreshing this view.
    pub async fn view(
        &self,
        filter: OrderFilter,
        kind: ViewKind,
    ) -> Result<Vec<OrderView>, SyncError> {
        self.distributor.set_view(filter, kind).await
    }

    /// The most recently published reconciled view, without fetching.
    pub fn latest_view(&self) -> Result<Vec<OrderView>, SyncError> {
        self.distributor.latest_view()
    }

    /// A single order with its items, straight from the local store.
    pub fn order(&self, order_id: &str) -> Result<Option<OrderRecord>, SyncError> {
        store::get_order_record(&self.db, &self.config.tenant_id, order_id)
    }

    /// Local records matching a filter, without reconciliation. Useful when
    /// the server is known to be unreachable.
    pub fn local_orders(&self, filter: &OrderFilter) -> Result<Vec<OrderRecord>, SyncError> {
        store::list_order_records(&self.db, &self.config.tenant_id, filter)
    }

    /// Subscribe to engine events. Each receiver sees every event emitted
    /// after this call.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    /// Watch the realtime channel state.
    pub fn channel_state(&self) -> watch::Receiver<ChannelState> {
        self.distributor.state()
    }

    /// Probe the admin dashboard once. Does not touch the online flag; the
    /// sync loop owns that.
    pub async fn check_connectivity(&self) -> ConnectivityResult {
        self.api.check_health().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrderAck, Page, SnapshotPage};
    use crate::coordinator::MutationOutcome;
    use crate::lifecycle::Actor;
    use crate::model::SyncStatus;
    use crate::store::test_support::sample_draft;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Ok,
        NetworkFail,
    }

    struct FakeApi {
        behavior: Mutex<Behavior>,
        create_calls: AtomicUsize,
        item_targets: Mutex<Vec<String>>,
        delete_targets: Mutex<Vec<String>>,
    }

    impl Default for FakeApi {
        fn default() -> FakeApi {
            FakeApi {
                behavior: Mutex::new(Behavior::Ok),
                create_calls: AtomicUsize::new(0),
                item_targets: Mutex::new(Vec::new()),
                delete_targets: Mutex::new(Vec::new()),
            }
        }
    }

    impl FakeApi {
        fn set(&self, behavior: Behavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        fn answer(&self) -> Result<(), SyncError> {
            match *self.behavior.lock().unwrap() {
                Behavior::Ok => Ok(()),
                Behavior::NetworkFail => {
                    Err(SyncError::Network("connection refused".to_string()))
                }
            }
        }
    }

    #[async_trait]
    impl OrdersApi for FakeApi {
        async fn fetch_orders(
            &self,
            _filter: &OrderFilter,
            _page: Page,
        ) -> Result<SnapshotPage, SyncError> {
            self.answer()?;
            Ok(SnapshotPage {
                orders: Vec::new(),
                has_more: false,
                sync_timestamp: None,
            })
        }

        async fn create_order(&self, record: &OrderRecord) -> Result<OrderAck, SyncError> {
            self.answer()?;
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            Ok(OrderAck {
                id: format!("srv-{}", record.order.order_number),
                order_number: Some(record.order.order_number.clone()),
                token_number: Some(1),
                total_amount: Some(record.order.total_amount),
            })
        }

        async fn update_order(&self, record: &OrderRecord) -> Result<OrderAck, SyncError> {
            self.answer()?;
            Ok(OrderAck {
                id: record
                    .order
                    .remote_id
                    .clone()
                    .unwrap_or_else(|| record.order.id.clone()),
                order_number: Some(record.order.order_number.clone()),
                token_number: None,
                total_amount: Some(record.order.total_amount),
            })
        }

        async fn update_item_status(
            &self,
            order_id: &str,
            _item_id: &str,
            _status: ItemStatus,
        ) -> Result<(), SyncError> {
            self.answer()?;
            self.item_targets.lock().unwrap().push(order_id.to_string());
            Ok(())
        }

        async fn delete_order(&self, order_id: &str) -> Result<(), SyncError> {
            self.answer()?;
            self.delete_targets
                .lock()
                .unwrap()
                .push(order_id.to_string());
            Ok(())
        }

        async fn check_health(&self) -> ConnectivityResult {
            match self.answer() {
                Ok(()) => ConnectivityResult {
                    success: true,
                    latency_ms: Some(12),
                    error: None,
                },
                Err(e) => ConnectivityResult {
                    success: false,
                    latency_ms: None,
                    error: Some(e.to_string()),
                },
            }
        }
    }

    fn test_engine() -> (Arc<SyncEngine>, Arc<FakeApi>) {
        let db = Arc::new(crate::db::test_db());
        let api = Arc::new(FakeApi::default());
        let api_handle: Arc<dyn OrdersApi> = api.clone();
        let config = EngineConfig::new(
            "tenant-1",
            "https://admin.example.com",
            "test-key",
            std::env::temp_dir(),
        );
        let engine = SyncEngine::boot(
            config,
            db,
            api_handle,
            Arc::new(PollOnlyChannel),
            Arc::new(AllowAll),
        );
        (engine, api)
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_offline_changes_flush_in_submission_order() {
        let (engine, api) = test_engine();
        api.set(Behavior::NetworkFail);

        let applied = engine
            .apply(Mutation::CreateOrder {
                draft: sample_draft(),
            })
            .unwrap();
        let order_id = applied.record.order.id.clone();
        let order_number = applied.record.order.order_number.clone();
        let item_id = applied.record.items[0].id.clone();
        assert_eq!(applied.remote.await.unwrap(), MutationOutcome::Queued);

        let applied = engine
            .apply(Mutation::UpdateItemStatus {
                order_id: order_id.clone(),
                item_id,
                status: ItemStatus::Preparing,
                actor: Actor::default(),
            })
            .unwrap();
        assert_eq!(applied.remote.await.unwrap(), MutationOutcome::Queued);
        assert_eq!(engine.queue.counts().unwrap().pending, 2);

        api.set(Behavior::Ok);
        let report = engine.flush().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        assert!(report.is_clean());

        // The create landed first and its server id carried into the item
        // delivery that followed it.
        let remote_id = format!("srv-{order_number}");
        assert_eq!(
            api.item_targets.lock().unwrap().as_slice(),
            &[remote_id.clone()]
        );

        let order = engine.order(&order_id).unwrap().unwrap();
        assert_eq!(order.order.remote_id.as_deref(), Some(remote_id.as_str()));
        assert_eq!(order.order.sync_status, SyncStatus::Synced);
        assert_eq!(order.items[0].status, ItemStatus::Preparing);

        let status = engine.sync_status().unwrap();
        assert_eq!(status.pending_items, 0);
        assert!(status.last_sync_at.is_some());

        // Nothing left to replay.
        let creates = api.create_calls.load(Ordering::SeqCst);
        let report = engine.flush().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(api.create_calls.load(Ordering::SeqCst), creates);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_queued_delete_resolves_server_id_from_store() {
        let (engine, api) = test_engine();
        api.set(Behavior::NetworkFail);

        let applied = engine
            .apply(Mutation::CreateOrder {
                draft: sample_draft(),
            })
            .unwrap();
        let order_id = applied.record.order.id.clone();
        let order_number = applied.record.order.order_number.clone();
        assert_eq!(applied.remote.await.unwrap(), MutationOutcome::Queued);

        // Void while the create is still undelivered; the delete entry has
        // no server id yet.
        let applied = engine
            .apply(Mutation::VoidOrder {
                order_id: order_id.clone(),
            })
            .unwrap();
        assert_eq!(applied.remote.await.unwrap(), MutationOutcome::Queued);

        api.set(Behavior::Ok);
        let report = engine.flush().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(
            api.delete_targets.lock().unwrap().as_slice(),
            &[format!("srv-{order_number}")]
        );

        let order = engine.order(&order_id).unwrap().unwrap();
        assert!(order.order.deleted_at.is_some());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_health_transition_publishes_network_status() {
        let (engine, api) = test_engine();
        let mut events = engine.events();

        api.set(Behavior::NetworkFail);
        engine.sync_cycle().await.unwrap();
        let status = engine.sync_status().unwrap();
        assert!(!status.is_online);
        assert_eq!(status.last_sync_at, None);

        api.set(Behavior::Ok);
        engine.sync_cycle().await.unwrap();
        let status = engine.sync_status().unwrap();
        assert!(status.is_online);
        assert!(status.last_sync_at.is_some());

        // A cycle with no transition stays quiet.
        engine.sync_cycle().await.unwrap();

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BusEvent::NetworkStatus { online, .. } = event {
                transitions.push(online);
            }
        }
        assert_eq!(transitions, vec![false, true]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_start_recovers_abandoned_queue_state() {
        let (engine, api) = test_engine();
        api.set(Behavior::NetworkFail);

        engine
            .queue
            .enqueue(
                EntityKind::Orders,
                Operation::Create,
                "o-1",
                &serde_json::json!({"order_id": "o-1"}),
            )
            .unwrap();
        engine
            .queue
            .enqueue(
                EntityKind::Orders,
                Operation::Create,
                "o-2",
                &serde_json::json!({"order_id": "o-2"}),
            )
            .unwrap();
        {
            let conn = engine.db.conn.lock().unwrap();
            conn.execute(
                "UPDATE sync_queue SET status = 'syncing' WHERE entity_id = 'o-1'",
                [],
            )
            .unwrap();
            conn.execute(
                "UPDATE sync_queue SET status = 'failed', retry_count = max_retries
                 WHERE entity_id = 'o-2'",
                [],
            )
            .unwrap();
        }

        engine.start().unwrap();
        engine.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let counts = engine.queue.counts().unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.syncing, 0);
        assert_eq!(counts.failed, 0);
        engine.stop();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_unreadable_payload_fails_terminally() {
        let (engine, _api) = test_engine();
        {
            let conn = engine.db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
                 VALUES ('orders', 'o-x', 'create', 'not-json', 'k-1')",
                [],
            )
            .unwrap();
        }

        let report = engine.flush().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.terminal.len(), 1);
        assert!(report.terminal[0].error.contains("unreadable payload"));
        assert_eq!(engine.queue.counts().unwrap().failed, 1);
    }
}
