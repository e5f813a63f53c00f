//! Error taxonomy for the sync engine.
//!
//! Every failure in the engine is expressed as a [`SyncError`] and collapses
//! into one of three failure classes via [`classify`]. The mutation
//! coordinator consumes that single classification everywhere instead of
//! re-deriving "is this retryable" per call site: network-class failures keep
//! the user's intent and queue it, while server rejections and persistence
//! failures roll the optimistic state back.

use serde::Serialize;
use thiserror::Error;

/// All errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The server could not be reached: connection refused, timeout, DNS
    /// failure, or the terminal knows it is offline. Also covers 5xx and
    /// 429 responses, which are treated as retryable outages.
    #[error("network error: {0}")]
    Network(String),

    /// The server received the request and refused it (validation failure,
    /// conflict, insufficient stock, revoked credentials). The message is
    /// surfaced to the user verbatim.
    #[error("{0}")]
    Rejected(String),

    /// The local durable store failed. The rarest and most serious class:
    /// without a durable record of the mutation there is nothing to retry.
    #[error("local persistence failure: {0}")]
    Persistence(String),

    /// A capability check denied the acting role before any mutation was
    /// attempted.
    #[error("permission denied: {0}")]
    Permission(String),

    /// An item status transition that the lifecycle state machine forbids.
    #[error("illegal status transition: {0}")]
    Transition(String),

    /// The referenced order or item does not exist in the local store.
    #[error("not found: {0}")]
    NotFound(String),

    /// Order or item data failed local validation before any write.
    #[error("invalid order data: {0}")]
    Invalid(String),
}

impl SyncError {
    pub fn persistence(msg: impl Into<String>) -> Self {
        SyncError::Persistence(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        SyncError::Network(msg.into())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        SyncError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        // A payload that cannot be (de)serialized cannot be durably queued.
        SyncError::Persistence(format!("payload serialization: {err}"))
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        SyncError::Persistence(format!("connection lock poisoned: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// The three failure classes the mutation coordinator acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Queue the mutation for later delivery; keep the optimistic state.
    Network,
    /// Roll back the optimistic state and surface the server's message.
    Rejected,
    /// Roll back; the local store could not durably record the intent.
    Persistence,
}

/// Collapse any [`SyncError`] into the class that decides commit-vs-queue-vs-
/// rollback. This is the only place that mapping lives.
pub fn classify(err: &SyncError) -> FailureClass {
    match err {
        SyncError::Network(_) => FailureClass::Network,
        SyncError::Persistence(_) => FailureClass::Persistence,
        SyncError::Rejected(_)
        | SyncError::Permission(_)
        | SyncError::Transition(_)
        | SyncError::NotFound(_)
        | SyncError::Invalid(_) => FailureClass::Rejected,
    }
}

/// Map an HTTP status (plus whatever message body the server sent) to a
/// [`SyncError`]. 4xx means the server looked at the request and said no;
/// 429 and 5xx are outages to retry.
pub fn from_status(status: reqwest::StatusCode, body: &str) -> SyncError {
    let detail = if body.trim().is_empty() {
        None
    } else {
        Some(body.trim().to_string())
    };
    match status.as_u16() {
        401 => SyncError::Rejected("API key is invalid or expired".to_string()),
        403 => SyncError::Rejected("Terminal not authorized".to_string()),
        404 => SyncError::Rejected("Admin dashboard endpoint not found".to_string()),
        429 => SyncError::Network(match detail {
            Some(d) => format!("Server is backed up, retry later (HTTP 429): {d}"),
            None => "Server is backed up, retry later (HTTP 429)".to_string(),
        }),
        s if s >= 500 => SyncError::Network(format!("Admin dashboard server error (HTTP {s})")),
        s => SyncError::Rejected(match detail {
            Some(d) => d,
            None => format!("Unexpected response from admin dashboard (HTTP {s})"),
        }),
    }
}

/// Convert a transport-level `reqwest::Error` into a user-friendly
/// [`SyncError`]. Anything without a response is network class.
pub fn from_reqwest(url: &str, err: &reqwest::Error) -> SyncError {
    if let Some(status) = err.status() {
        return from_status(status, "");
    }
    if err.is_connect() {
        return SyncError::Network(format!("Cannot reach admin dashboard at {url}"));
    }
    if err.is_timeout() {
        return SyncError::Network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return SyncError::Rejected(format!("Invalid admin dashboard URL: {url}"));
    }
    SyncError::Network(format!("Network error communicating with {url}: {err}"))
}

// ---------------------------------------------------------------------------
// User-visible notices
// ---------------------------------------------------------------------------

/// A user-visible notice with a classification-appropriate tone. "Queued"
/// means the action was kept and will sync later, and must not be presented
/// as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Queued { message: String },
    Error { message: String },
}

impl Notice {
    pub fn queued(message: impl Into<String>) -> Self {
        Notice::Queued {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Notice::Error {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Notice::Queued { message } | Notice::Error { message } => message,
        }
    }
}
