//! In-process event fanout.
//!
//! Every state change the engine produces is published as a [`BusEvent`] on a
//! broadcast channel. Subscribers (UI shells, test harnesses) receive their
//! own copy; emission never blocks and never fails, a bus with no listeners
//! simply drops events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::Notice;
use crate::model::{ChangeEvent, ItemStatus, OrderRecord};
use crate::queue::DrainReport;
use crate::realtime::ChannelState;
use crate::reconcile::ViewKind;

const DEFAULT_CAPACITY: usize = 256;

/// Snapshot of sync health the engine publishes alongside every drain.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub is_online: bool,
    pub last_sync_at: Option<String>,
    /// Queue entries not yet delivered (pending plus in-flight).
    pub pending_items: i64,
    pub sync_in_progress: bool,
    pub sync_errors: i64,
    pub conflict_orders: i64,
    pub unsynced_orders: i64,
    pub oldest_next_retry_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum BusEvent {
    OrderCreated {
        order: OrderRecord,
    },
    OrderUpdated {
        order_id: String,
    },
    OrderDeleted {
        order_id: String,
    },
    ItemStatusChanged {
        order_id: String,
        item_id: String,
        status: ItemStatus,
    },
    /// A reconciled view was rebuilt (after a poll, push change, or flush).
    OrdersRefreshed {
        view: ViewKind,
        count: usize,
    },
    /// Raw change notification from the push channel, forwarded as-is.
    RemoteChange {
        change: ChangeEvent,
    },
    NewOrderAlert {
        order_id: String,
        order_number: String,
        play_sound: bool,
    },
    ChannelState {
        state: ChannelState,
    },
    NetworkStatus {
        online: bool,
        latency_ms: Option<u64>,
    },
    SyncStatus {
        summary: SyncSummary,
    },
    QueueDrained {
        report: DrainReport,
    },
    Notice {
        notice: Notice,
    },
}

impl BusEvent {
    /// Event name as subscribers see it on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::OrderCreated { .. } => "order_created",
            BusEvent::OrderUpdated { .. } => "order_updated",
            BusEvent::OrderDeleted { .. } => "order_deleted",
            BusEvent::ItemStatusChanged { .. } => "item_status_changed",
            BusEvent::OrdersRefreshed { .. } => "orders_refreshed",
            BusEvent::RemoteChange { .. } => "remote_change",
            BusEvent::NewOrderAlert { .. } => "new_order_alert",
            BusEvent::ChannelState { .. } => "channel_state",
            BusEvent::NetworkStatus { .. } => "network_status",
            BusEvent::SyncStatus { .. } => "sync_status",
            BusEvent::QueueDrained { .. } => "queue_drained",
            BusEvent::Notice { .. } => "notice",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> EventBus {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget publish. Send only errors when nobody is subscribed,
    /// which is a valid state (headless engine, tests).
    pub fn emit(&self, event: BusEvent) {
        trace!(event = event.name(), "Bus event");
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> EventBus {
        EventBus::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_every_subscriber() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(BusEvent::OrderDeleted {
            order_id: "o-1".to_string(),
        });

        for rx in [&mut a, &mut b] {
            match rx.try_recv().expect("event delivered") {
                BusEvent::OrderDeleted { order_id } => assert_eq!(order_id, "o-1"),
                other => panic!("unexpected event {}", other.name()),
            }
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(BusEvent::NetworkStatus {
            online: true,
            latency_ms: Some(12),
        });
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn test_wire_shape_is_tagged_snake_case() {
        let event = BusEvent::ItemStatusChanged {
            order_id: "o-1".to_string(),
            item_id: "it-1".to_string(),
            status: ItemStatus::Ready,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "item_status_changed");
        assert_eq!(json["payload"]["order_id"], "o-1");
        assert_eq!(json["payload"]["status"], "ready");
    }

    #[test]
    fn test_sync_summary_uses_camel_case_keys() {
        let summary = SyncSummary {
            is_online: true,
            pending_items: 3,
            ..SyncSummary::default()
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["isOnline"], true);
        assert_eq!(json["pendingItems"], 3);
        assert!(json["syncInProgress"].as_bool() == Some(false));
    }
}
