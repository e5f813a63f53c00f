//! Engine configuration.
//!
//! The embedding shell supplies one [`EngineConfig`] when it boots the
//! engine; nothing here is read from globals. Interval fields are stored raw
//! and clamped at the accessor so persisted configs with out-of-range values
//! degrade to the nearest safe setting instead of failing.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SyncError;
use crate::queue::{RetryPolicy, DEFAULT_DRAIN_CONCURRENCY};
use crate::reconcile::GRACE_WINDOW_MS;

pub const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 15;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;
pub const MAX_POLL_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_SUBSCRIBE_TIMEOUT_SECS: u64 = 5;
pub const MIN_SUBSCRIBE_TIMEOUT_SECS: u64 = 3;
pub const MAX_SUBSCRIBE_TIMEOUT_SECS: u64 = 10;

/// New-order alert preferences. Sound fires only when the user enabled it
/// and the shell reports the audio context as unlocked by a user gesture.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertPrefs {
    pub sound_enabled: bool,
    pub audio_unlocked: bool,
}

impl Default for AlertPrefs {
    fn default() -> AlertPrefs {
        AlertPrefs {
            sound_enabled: true,
            audio_unlocked: false,
        }
    }
}

impl AlertPrefs {
    pub fn should_play_sound(&self) -> bool {
        self.sound_enabled && self.audio_unlocked
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub tenant_id: String,
    pub branch_id: Option<String>,
    pub admin_url: String,
    pub api_key: String,
    /// Directory holding the SQLite database.
    pub data_dir: PathBuf,
    pub drain_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub subscribe_timeout_secs: u64,
    pub grace_window_ms: i64,
    pub drain_concurrency: usize,
    pub retry: RetryPolicy,
    pub alerts: AlertPrefs,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            tenant_id: String::new(),
            branch_id: None,
            admin_url: String::new(),
            api_key: String::new(),
            data_dir: PathBuf::from("."),
            drain_interval_secs: DEFAULT_DRAIN_INTERVAL_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            subscribe_timeout_secs: DEFAULT_SUBSCRIBE_TIMEOUT_SECS,
            grace_window_ms: GRACE_WINDOW_MS,
            drain_concurrency: DEFAULT_DRAIN_CONCURRENCY,
            retry: RetryPolicy::default(),
            alerts: AlertPrefs::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(
        tenant_id: impl Into<String>,
        admin_url: impl Into<String>,
        api_key: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> EngineConfig {
        EngineConfig {
            tenant_id: tenant_id.into(),
            admin_url: admin_url.into(),
            api_key: api_key.into(),
            data_dir: data_dir.into(),
            ..EngineConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.tenant_id.trim().is_empty() {
            return Err(SyncError::Invalid("Tenant id is required".to_string()));
        }
        if self.admin_url.trim().is_empty() {
            return Err(SyncError::Invalid(
                "Admin dashboard URL is required".to_string(),
            ));
        }
        if self.api_key.trim().is_empty() {
            return Err(SyncError::Invalid("API key is required".to_string()));
        }
        Ok(())
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs.max(1))
    }

    /// Polling cadence while the push channel is down, clamped to 5..=30s.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.poll_interval_secs
                .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS),
        )
    }

    /// How long a subscribe attempt may sit unconfirmed before polling starts,
    /// clamped to 3..=10s.
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(
            self.subscribe_timeout_secs
                .clamp(MIN_SUBSCRIBE_TIMEOUT_SECS, MAX_SUBSCRIBE_TIMEOUT_SECS),
        )
    }

    pub fn grace_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.grace_window_ms.max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_blank_fields() {
        let mut config = EngineConfig::new("tenant-1", "https://admin.example.com", "key", "/tmp");
        assert!(config.validate().is_ok());

        config.api_key = "   ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("API key"));

        config.api_key = "key".to_string();
        config.tenant_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_intervals_are_clamped() {
        let mut config = EngineConfig::default();
        config.poll_interval_secs = 1;
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        config.poll_interval_secs = 90;
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        config.poll_interval_secs = 12;
        assert_eq!(config.poll_interval(), Duration::from_secs(12));

        config.subscribe_timeout_secs = 1;
        assert_eq!(config.subscribe_timeout(), Duration::from_secs(3));
        config.subscribe_timeout_secs = 60;
        assert_eq!(config.subscribe_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_sound_gating_requires_both_flags() {
        let mut prefs = AlertPrefs::default();
        assert!(!prefs.should_play_sound());
        prefs.audio_unlocked = true;
        assert!(prefs.should_play_sound());
        prefs.sound_enabled = false;
        assert!(!prefs.should_play_sound());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = EngineConfig::new("tenant-1", "admin.example.com", "key", "/data");
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tenant_id, "tenant-1");
        assert_eq!(back.drain_interval_secs, DEFAULT_DRAIN_INTERVAL_SECS);
    }
}
