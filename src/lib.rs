//! DineSync: offline-first order synchronization for restaurant POS
//! terminals and kitchen displays.
//!
//! Orders are written to a local SQLite store first and reach the admin
//! dashboard in the background, either directly or through a durable
//! sync queue when the connection is down. Reads go the other way: the
//! server snapshot is merged with local pending state into one reconciled
//! view, without ever writing to the store.
//!
//! The pieces:
//!
//! - [`store`]: durable orders and line items over SQLite
//! - [`queue`]: outbound sync queue with idempotency keys and backoff
//! - [`reconcile`]: read-only merge of server snapshots with local state
//! - [`lifecycle`]: forward-only item status machine with capability gates
//! - [`coordinator`]: optimistic mutations with queue fallback and rollback
//! - [`realtime`]: push subscription with polling fallback
//! - [`engine`]: the assembled engine and its background loops
//!
//! ```no_run
//! use dinesync::{EngineConfig, SyncEngine};
//!
//! # async fn demo() -> Result<(), dinesync::SyncError> {
//! let config = EngineConfig::new("tenant-1", "https://admin.example.com", "api-key", "./data");
//! let engine = SyncEngine::new(config)?;
//! engine.start()?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod queue;
pub mod realtime;
pub mod reconcile;
pub mod store;

pub use bus::{BusEvent, EventBus, SyncSummary};
pub use config::{AlertPrefs, EngineConfig};
pub use coordinator::{Applied, Mutation, MutationOutcome};
pub use engine::SyncEngine;
pub use error::{Notice, SyncError};
pub use lifecycle::{Actor, BulkPlan, CapabilityGate};
pub use logging::init_logging;
pub use model::{
    ItemDraft, ItemStatus, Order, OrderDraft, OrderFilter, OrderItem, OrderPatch, OrderRecord,
    OrderStatus, OrderType, PaymentStatus, SyncStatus,
};
pub use queue::{DrainReport, RetryPolicy};
pub use realtime::{ChannelState, PushChannel, PushConnectionState, PushEvent};
pub use reconcile::{OrderView, ViewKind};
