//! Realtime distribution: push subscription with polling fallback.
//!
//! One task owns the channel state machine end to end. It opens the push
//! subscription, waits a bounded time for confirmation, and escalates to a
//! periodic poll when the push side stays silent or fails. The poll is a
//! safety net, not a second source of truth: every trigger, push or poll,
//! funnels into the same reconciling refresh, which is idempotent and safe
//! to run redundantly. Overlapping refreshes are sequenced so an older
//! response can never replace a newer view.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::OrdersApi;
use crate::bus::{BusEvent, EventBus};
use crate::config::{AlertPrefs, EngineConfig};
use crate::db::DbState;
use crate::error::SyncError;
use crate::model::{ChangeEntity, ChangeEvent, ChangeKind, OrderFilter};
use crate::queue::SyncQueue;
use crate::reconcile::{reconciled_view, OrderView, ViewKind};

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Channel contract
// ---------------------------------------------------------------------------

/// Connection lifecycle as reported by the push transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushConnectionState {
    Subscribed,
    /// Transient drop, the transport retries internally.
    Reconnecting,
    /// Terminal for this subscription, a new subscribe is required.
    Failed,
}

#[derive(Debug, Clone)]
pub enum PushEvent {
    State(PushConnectionState),
    Change(ChangeEvent),
}

/// Server-initiated change feed. Implementations own the transport; the
/// engine only consumes the event stream. Dropping the receiver closes the
/// subscription.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(&self, tenant_id: &str) -> Result<mpsc::Receiver<PushEvent>, SyncError>;
}

/// Stand-in for deployments without a push transport. Every subscribe
/// attempt fails, so the distributor settles into permanent polling.
pub struct PollOnlyChannel;

#[async_trait]
impl PushChannel for PollOnlyChannel {
    async fn subscribe(&self, _tenant_id: &str) -> Result<mpsc::Receiver<PushEvent>, SyncError> {
        Err(SyncError::Network("No push channel configured".to_string()))
    }
}

/// Observable state of the realtime layer, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Connecting,
    Subscribed,
    /// Push unconfirmed within the deadline, periodic polling is active.
    EscalatedPolling,
    /// Push failed outright, polling carries the session while the
    /// subscription is retried.
    Error,
}

// ---------------------------------------------------------------------------
// Distributor
// ---------------------------------------------------------------------------

struct DisplayedView {
    filter: OrderFilter,
    kind: ViewKind,
}

/// Owns the push/poll state machine and the reconciled view cache.
pub struct Distributor {
    api: Arc<dyn OrdersApi>,
    channel: Arc<dyn PushChannel>,
    db: Arc<DbState>,
    queue: SyncQueue,
    bus: EventBus,
    tenant_id: String,
    poll_interval: Duration,
    subscribe_timeout: Duration,
    grace: chrono::Duration,
    alerts: AlertPrefs,
    state_tx: watch::Sender<ChannelState>,
    /// Monotonic refresh sequence; a completed fetch publishes only when it
    /// is still the newest one issued.
    fetch_seq: AtomicU64,
    displayed: Mutex<DisplayedView>,
    latest: Mutex<Vec<OrderView>>,
}

impl Distributor {
    pub fn new(
        config: &EngineConfig,
        api: Arc<dyn OrdersApi>,
        channel: Arc<dyn PushChannel>,
        db: Arc<DbState>,
        queue: SyncQueue,
        bus: EventBus,
    ) -> Distributor {
        let (state_tx, _) = watch::channel(ChannelState::Connecting);
        Distributor {
            api,
            channel,
            db,
            queue,
            bus,
            tenant_id: config.tenant_id.clone(),
            poll_interval: config.poll_interval(),
            subscribe_timeout: config.subscribe_timeout(),
            grace: config.grace_window(),
            alerts: config.alerts,
            state_tx,
            fetch_seq: AtomicU64::new(0),
            displayed: Mutex::new(DisplayedView {
                filter: OrderFilter::active(),
                kind: ViewKind::List,
            }),
            latest: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// The most recently published reconciled view.
    pub fn latest_view(&self) -> Result<Vec<OrderView>, SyncError> {
        Ok(self.latest.lock()?.clone())
    }

    /// Change which view reconciliation targets and refresh it right away.
    pub async fn set_view(
        &self,
        filter: OrderFilter,
        kind: ViewKind,
    ) -> Result<Vec<OrderView>, SyncError> {
        {
            let mut displayed = self.displayed.lock()?;
            displayed.filter = filter;
            displayed.kind = kind;
        }
        self.refresh("view_changed").await
    }

    pub async fn refresh_now(&self) -> Result<Vec<OrderView>, SyncError> {
        self.refresh("manual").await
    }

    fn set_state(&self, next: ChannelState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            info!(from = ?prev, to = ?next, "Realtime channel state changed");
            self.bus.emit(BusEvent::ChannelState { state: next });
        }
    }

    /// Drive the state machine until `shutdown` fires. This task is the only
    /// writer of [`ChannelState`].
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut reconnect_delay = RECONNECT_BASE_DELAY;
        let mut poll_guard: Option<CancellationToken> = None;

        'reconnect: loop {
            if shutdown.is_cancelled() {
                break;
            }
            // While the fallback poll is carrying the session the externally
            // visible state stays as it was; a fresh start shows Connecting.
            if poll_guard.is_none() {
                self.set_state(ChannelState::Connecting);
            }

            let mut rx = match self.channel.subscribe(&self.tenant_id).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "Push subscribe failed");
                    self.set_state(ChannelState::Error);
                    self.refresh_logged("push_error").await;
                    self.ensure_polling(&mut poll_guard, &shutdown);
                    tokio::select! {
                        _ = shutdown.cancelled() => break 'reconnect,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                    reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
                    continue;
                }
            };

            // Subscription opened; confirmation must arrive before the
            // deadline or polling starts while we keep listening.
            let deadline = tokio::time::sleep(self.subscribe_timeout);
            tokio::pin!(deadline);
            let mut escalated = poll_guard.is_some();
            let mut confirmed = false;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break 'reconnect,
                    _ = &mut deadline, if !confirmed && !escalated => {
                        escalated = true;
                        info!(
                            timeout_secs = self.subscribe_timeout.as_secs(),
                            "Push unconfirmed, escalating to polling"
                        );
                        self.set_state(ChannelState::EscalatedPolling);
                        self.ensure_polling(&mut poll_guard, &shutdown);
                    }
                    event = rx.recv() => match event {
                        Some(PushEvent::State(PushConnectionState::Subscribed)) => {
                            confirmed = true;
                            reconnect_delay = RECONNECT_BASE_DELAY;
                            self.set_state(ChannelState::Subscribed);
                            self.stop_polling(&mut poll_guard);
                            // Catch up on anything that happened before the
                            // subscription was live.
                            self.refresh_logged("subscribed").await;
                        }
                        Some(PushEvent::State(PushConnectionState::Reconnecting)) => {
                            debug!("Push channel reconnecting");
                        }
                        Some(PushEvent::State(PushConnectionState::Failed)) => {
                            warn!("Push channel failed");
                            self.set_state(ChannelState::Error);
                            self.refresh_logged("push_failed").await;
                            self.ensure_polling(&mut poll_guard, &shutdown);
                            break;
                        }
                        Some(PushEvent::Change(change)) => self.handle_change(change).await,
                        None => {
                            warn!("Push channel closed");
                            self.set_state(ChannelState::Error);
                            self.refresh_logged("push_closed").await;
                            self.ensure_polling(&mut poll_guard, &shutdown);
                            break;
                        }
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
            reconnect_delay = (reconnect_delay * 2).min(MAX_RECONNECT_DELAY);
        }

        self.stop_polling(&mut poll_guard);
        debug!("Realtime distributor stopped");
    }

    /// Start the fallback poll if it is not already running.
    fn ensure_polling(self: &Arc<Self>, guard: &mut Option<CancellationToken>, shutdown: &CancellationToken) {
        if guard.is_some() {
            return;
        }
        let token = shutdown.child_token();
        *guard = Some(token.clone());
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.poll_session(token).await;
        });
    }

    fn stop_polling(&self, guard: &mut Option<CancellationToken>) {
        if let Some(token) = guard.take() {
            token.cancel();
            debug!("Fallback polling cancelled");
        }
    }

    /// Poll immediately, then on every tick until cancelled.
    async fn poll_session(self: Arc<Self>, token: CancellationToken) {
        info!(interval_secs = self.poll_interval.as_secs(), "Fallback polling started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            self.refresh_logged("poll").await;
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Fallback polling stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
        }
    }

    async fn handle_change(&self, change: ChangeEvent) {
        debug!(kind = ?change.kind, entity = ?change.entity, id = %change.id, "Remote change received");
        self.bus.emit(BusEvent::RemoteChange {
            change: change.clone(),
        });

        let view = self.refresh_logged("push_change").await;

        if change.kind == ChangeKind::Created && change.entity == ChangeEntity::Order {
            let order_number = view
                .iter()
                .find(|v| {
                    v.record.order.remote_id.as_deref() == Some(change.id.as_str())
                        || v.record.order.id == change.id
                })
                .map(|v| v.record.order.order_number.clone())
                .unwrap_or_default();
            self.bus.emit(BusEvent::NewOrderAlert {
                order_id: change.id,
                order_number,
                play_sound: self.alerts.should_play_sound(),
            });
        }
    }

    async fn refresh_logged(&self, trigger: &str) -> Vec<OrderView> {
        match self.refresh(trigger).await {
            Ok(view) => view,
            Err(e) => {
                warn!(trigger, error = %e, "View refresh failed");
                Vec::new()
            }
        }
    }

    /// Rebuild the reconciled view for the displayed screen. When another
    /// refresh was issued while this one was in flight, its result is kept
    /// and ours is discarded.
    async fn refresh(&self, trigger: &str) -> Result<Vec<OrderView>, SyncError> {
        let seq = self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (filter, kind) = {
            let displayed = self.displayed.lock()?;
            (displayed.filter.clone(), displayed.kind)
        };

        let view = reconciled_view(
            &self.db,
            &self.queue,
            self.api.as_ref(),
            &self.tenant_id,
            &filter,
            kind,
            self.grace,
        )
        .await?;

        if self.fetch_seq.load(Ordering::SeqCst) != seq {
            debug!(trigger, seq, "Discarding stale view refresh");
            return Ok(self.latest.lock()?.clone());
        }

        *self.latest.lock()? = view.clone();
        debug!(trigger, orders = view.len(), "View refreshed");
        self.bus.emit(BusEvent::OrdersRefreshed {
            view: kind,
            count: view.len(),
        });
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Keeps a scripted channel's sender alive without producing events.
    async fn hold_open() {
        std::future::pending::<()>().await
    }
    use crate::api::{ConnectivityResult, OrderAck, Page, SnapshotPage};
    use crate::db::test_db;
    use crate::model::{ItemStatus, OrderRecord};
    use crate::store::test_support::sample_draft;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    // -- scripted API -------------------------------------------------------

    struct ScriptedApi {
        fetches: AtomicUsize,
        snapshot: Mutex<Vec<OrderRecord>>,
        fetch_delays: Mutex<VecDeque<Duration>>,
        page_sizes: Mutex<VecDeque<Vec<OrderRecord>>>,
    }

    impl ScriptedApi {
        fn empty() -> Arc<ScriptedApi> {
            Arc::new(ScriptedApi {
                fetches: AtomicUsize::new(0),
                snapshot: Mutex::new(Vec::new()),
                fetch_delays: Mutex::new(VecDeque::new()),
                page_sizes: Mutex::new(VecDeque::new()),
            })
        }

        fn with_snapshot(orders: Vec<OrderRecord>) -> Arc<ScriptedApi> {
            let api = ScriptedApi::empty();
            *api.snapshot.lock().unwrap() = orders;
            api
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OrdersApi for ScriptedApi {
        async fn fetch_orders(
            &self,
            _filter: &OrderFilter,
            _page: Page,
        ) -> Result<SnapshotPage, SyncError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            // Claim the scripted page up front so concurrent fetches keep
            // their issue order even when one of them sleeps.
            let scripted_page = self.page_sizes.lock().unwrap().pop_front();
            let delay = self.fetch_delays.lock().unwrap().pop_front();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let orders = match scripted_page {
                Some(orders) => orders,
                None => self.snapshot.lock().unwrap().clone(),
            };
            Ok(SnapshotPage {
                orders,
                has_more: false,
                sync_timestamp: None,
            })
        }

        async fn create_order(&self, _record: &OrderRecord) -> Result<OrderAck, SyncError> {
            unreachable!("not exercised here")
        }

        async fn update_order(&self, _record: &OrderRecord) -> Result<OrderAck, SyncError> {
            unreachable!("not exercised here")
        }

        async fn update_item_status(
            &self,
            _order_id: &str,
            _item_id: &str,
            _status: ItemStatus,
        ) -> Result<(), SyncError> {
            unreachable!("not exercised here")
        }

        async fn delete_order(&self, _order_id: &str) -> Result<(), SyncError> {
            unreachable!("not exercised here")
        }

        async fn check_health(&self) -> ConnectivityResult {
            ConnectivityResult {
                success: true,
                latency_ms: Some(1),
                error: None,
            }
        }
    }

    // -- scripted push channel ---------------------------------------------

    enum SubscribeOutcome {
        Fail,
        /// Open a stream and play `(delay, event)` pairs, then stay open.
        Open(Vec<(Duration, PushEvent)>),
        /// Open a stream that never confirms and never speaks.
        Silent,
    }

    struct ScriptedChannel {
        script: Mutex<VecDeque<SubscribeOutcome>>,
    }

    impl ScriptedChannel {
        fn new(outcomes: Vec<SubscribeOutcome>) -> Arc<ScriptedChannel> {
            Arc::new(ScriptedChannel {
                script: Mutex::new(outcomes.into()),
            })
        }
    }

    #[async_trait]
    impl PushChannel for ScriptedChannel {
        async fn subscribe(
            &self,
            _tenant_id: &str,
        ) -> Result<mpsc::Receiver<PushEvent>, SyncError> {
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(SubscribeOutcome::Silent);
            match outcome {
                SubscribeOutcome::Fail => {
                    Err(SyncError::network("Push endpoint unreachable"))
                }
                SubscribeOutcome::Silent => {
                    let (tx, rx) = mpsc::channel(8);
                    tokio::spawn(async move {
                        let _tx = tx;
                        hold_open().await;
                    });
                    Ok(rx)
                }
                SubscribeOutcome::Open(events) => {
                    let (tx, rx) = mpsc::channel(8);
                    tokio::spawn(async move {
                        for (delay, event) in events {
                            tokio::time::sleep(delay).await;
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        hold_open().await;
                    });
                    Ok(rx)
                }
            }
        }
    }

    fn distributor(
        api: Arc<ScriptedApi>,
        channel: Arc<ScriptedChannel>,
    ) -> (Arc<Distributor>, EventBus) {
        let db = Arc::new(test_db());
        let queue = SyncQueue::new(Arc::clone(&db), crate::queue::RetryPolicy::default(), 2);
        let bus = EventBus::default();
        let mut config = EngineConfig::new("tenant-1", "https://admin.example.com", "key", ".");
        config.subscribe_timeout_secs = 5;
        config.poll_interval_secs = 15;
        let dist = Arc::new(Distributor::new(
            &config,
            api,
            channel,
            db,
            queue,
            bus.clone(),
        ));
        (dist, bus)
    }

    fn server_order(remote_id: &str, number: &str) -> OrderRecord {
        let mut record =
            sample_draft().into_record("tenant-1", number.to_string(), chrono::Utc::now());
        record.order.remote_id = Some(remote_id.to_string());
        record
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_subscription_never_starts_polling() {
        let api = ScriptedApi::empty();
        let channel = ScriptedChannel::new(vec![SubscribeOutcome::Open(vec![(
            Duration::from_millis(10),
            PushEvent::State(PushConnectionState::Subscribed),
        )])]);
        let (dist, _bus) = distributor(Arc::clone(&api), channel);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&dist).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(*dist.state().borrow(), ChannelState::Subscribed);
        // Exactly the one catch-up fetch from confirmation, no poll traffic.
        assert_eq!(api.fetch_count(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_subscription_escalates_to_polling() {
        let api = ScriptedApi::empty();
        let channel = ScriptedChannel::new(vec![SubscribeOutcome::Silent]);
        let (dist, _bus) = distributor(Arc::clone(&api), channel);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&dist).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(*dist.state().borrow(), ChannelState::Connecting);
        assert_eq!(api.fetch_count(), 0);

        // Deadline is 5s; escalation polls immediately, then every 15s.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*dist.state().borrow(), ChannelState::EscalatedPolling);
        assert_eq!(api.fetch_count(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(api.fetch_count(), 3);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_confirmation_stops_the_poll() {
        let api = ScriptedApi::empty();
        // Confirms at t=18s, after the 5s deadline but before the second
        // poll tick at t=20s.
        let channel = ScriptedChannel::new(vec![SubscribeOutcome::Open(vec![(
            Duration::from_secs(18),
            PushEvent::State(PushConnectionState::Subscribed),
        )])]);
        let (dist, _bus) = distributor(Arc::clone(&api), channel);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&dist).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(17)).await;
        assert_eq!(*dist.state().borrow(), ChannelState::EscalatedPolling);
        let polled = api.fetch_count();
        assert!(polled >= 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*dist.state().borrow(), ChannelState::Subscribed);
        let after_confirm = api.fetch_count();
        assert_eq!(after_confirm, polled + 1);

        // No further poll ticks fire once subscribed.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.fetch_count(), after_confirm);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_failure_refreshes_immediately_and_keeps_polling() {
        let api = ScriptedApi::empty();
        let channel = ScriptedChannel::new(vec![
            SubscribeOutcome::Open(vec![
                (
                    Duration::from_millis(10),
                    PushEvent::State(PushConnectionState::Subscribed),
                ),
                (
                    Duration::from_secs(10),
                    PushEvent::State(PushConnectionState::Failed),
                ),
            ]),
            SubscribeOutcome::Silent,
        ]);
        let (dist, _bus) = distributor(Arc::clone(&api), channel);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&dist).run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(*dist.state().borrow(), ChannelState::Subscribed);
        assert_eq!(api.fetch_count(), 1);

        // Failure at t=10s triggers an immediate reconciling fetch plus the
        // first poll tick, without waiting for any timer.
        tokio::time::sleep(Duration::from_millis(5_200)).await;
        assert_eq!(*dist.state().borrow(), ChannelState::Error);
        assert!(api.fetch_count() >= 3);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_created_change_refreshes_and_raises_alert() {
        let order = server_order("srv-9", "ORD-22082026-00009");
        let api = ScriptedApi::with_snapshot(vec![order]);
        let channel = ScriptedChannel::new(vec![SubscribeOutcome::Open(vec![
            (
                Duration::from_millis(10),
                PushEvent::State(PushConnectionState::Subscribed),
            ),
            (
                Duration::from_millis(100),
                PushEvent::Change(ChangeEvent {
                    kind: ChangeKind::Created,
                    entity: ChangeEntity::Order,
                    id: "srv-9".to_string(),
                }),
            ),
        ])]);
        let (dist, bus) = distributor(Arc::clone(&api), channel);
        let mut rx = bus.subscribe();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&dist).run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap();

        let mut saw_remote_change = false;
        let mut alert: Option<(String, String, bool)> = None;
        let mut refreshes = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                BusEvent::RemoteChange { change } => {
                    saw_remote_change = change.id == "srv-9";
                }
                BusEvent::NewOrderAlert {
                    order_id,
                    order_number,
                    play_sound,
                } => alert = Some((order_id, order_number, play_sound)),
                BusEvent::OrdersRefreshed { .. } => refreshes += 1,
                _ => {}
            }
        }
        assert!(saw_remote_change);
        // Subscribe catch-up refresh plus the change-triggered one.
        assert_eq!(refreshes, 2);
        let (order_id, order_number, play_sound) = alert.expect("alert raised");
        assert_eq!(order_id, "srv-9");
        assert_eq!(order_number, "ORD-22082026-00009");
        // Sound stays off until the shell reports an unlocked audio output.
        assert!(!play_sound);

        let latest = dist.latest_view().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].record.order.order_number, "ORD-22082026-00009");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_refresh_cannot_replace_newer_view() {
        let api = ScriptedApi::empty();
        // First refresh answers slowly with one order, the second quickly
        // with two; the slow response must not win.
        api.fetch_delays
            .lock()
            .unwrap()
            .extend([Duration::from_millis(500), Duration::from_millis(10)]);
        api.page_sizes.lock().unwrap().extend([
            vec![server_order("srv-old", "ORD-22082026-00001")],
            vec![
                server_order("srv-new-1", "ORD-22082026-00002"),
                server_order("srv-new-2", "ORD-22082026-00003"),
            ],
        ]);
        let channel = ScriptedChannel::new(vec![SubscribeOutcome::Silent]);
        let (dist, bus) = distributor(Arc::clone(&api), channel);
        let mut rx = bus.subscribe();

        let slow = {
            let dist = Arc::clone(&dist);
            tokio::spawn(async move { dist.refresh_now().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fast = dist.refresh_now().await.unwrap();
        assert_eq!(fast.len(), 2);

        // The stale caller is handed the newer view, not its own result.
        let slow_view = slow.await.unwrap().unwrap();
        assert_eq!(slow_view.len(), 2);

        let mut published = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::OrdersRefreshed { count, .. } = event {
                published.push(count);
            }
        }
        assert_eq!(published, vec![2]);
        assert_eq!(dist.latest_view().unwrap().len(), 2);
    }
}
