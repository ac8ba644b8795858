//! Coordinator configuration
//!
//! All knobs have working defaults; hosts usually only set the app name.
//!
//! ```rust
//! use callsync_call_coordinator::CoordinatorConfig;
//! use std::time::Duration;
//!
//! let config = CoordinatorConfig::new("Backstage")
//!     .with_dedup_ttl(Duration::from_secs(30))
//!     .with_trace_capacity(500);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.dedup_ttl(), Duration::from_secs(30));
//! ```
//!
//! Loading from TOML:
//!
//! ```rust
//! use callsync_call_coordinator::CoordinatorConfig;
//!
//! let config = CoordinatorConfig::from_toml_str(r#"
//!     app_name = "Backstage"
//!     supports_video = false
//! "#).unwrap();
//! assert!(!config.supports_video);
//! assert_eq!(config.trace_capacity, 200);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CoordinatorError, CoordinatorResult};

/// Default lifetime of de-dup entries, in milliseconds
pub const DEFAULT_DEDUP_TTL_MS: u64 = 60_000;

/// Default number of entries kept by the trace ring
pub const DEFAULT_TRACE_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Name shown by the OS call UI
    pub app_name: String,
    /// How long a handled call id stays in a de-dup set, in milliseconds
    pub dedup_ttl_ms: u64,
    /// Capacity of the diagnostic trace ring
    pub trace_capacity: usize,
    /// Storage key holding the persisted trace ring
    pub trace_storage_key: String,
    /// Prefix of the storage keys holding the call UUID mapping
    pub mapping_key_prefix: String,
    /// Request runtime permissions before native setup
    pub request_permissions: bool,
    pub supports_video: bool,
    /// Show calls in the OS recents list
    pub include_calls_in_recents: bool,
    pub max_calls_per_group: u32,
    pub ringtone_sound: Option<String>,
    /// Capacity of the coordinator event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            app_name: "callsync".to_string(),
            dedup_ttl_ms: DEFAULT_DEDUP_TTL_MS,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            trace_storage_key: "callsync:trace".to_string(),
            mapping_key_prefix: "callsync:call_map".to_string(),
            request_permissions: true,
            supports_video: true,
            include_calls_in_recents: false,
            max_calls_per_group: 1,
            ringtone_sound: None,
            event_channel_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self { app_name: app_name.into(), ..Default::default() }
    }

    pub fn from_toml_str(raw: &str) -> CoordinatorResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_trace_capacity(mut self, capacity: usize) -> Self {
        self.trace_capacity = capacity;
        self
    }

    pub fn with_trace_storage_key(mut self, key: impl Into<String>) -> Self {
        self.trace_storage_key = key.into();
        self
    }

    pub fn with_permission_requests(mut self, enabled: bool) -> Self {
        self.request_permissions = enabled;
        self
    }

    pub fn with_video(mut self, enabled: bool) -> Self {
        self.supports_video = enabled;
        self
    }

    pub fn with_ringtone(mut self, sound: impl Into<String>) -> Self {
        self.ringtone_sound = Some(sound.into());
        self
    }

    /// De-dup lifetime. A zero TTL would turn every de-dup set into a
    /// pass-through, so an unvalidated zero falls back to the default.
    pub fn dedup_ttl(&self) -> Duration {
        match self.dedup_ttl_ms {
            0 => Duration::from_millis(DEFAULT_DEDUP_TTL_MS),
            ms => Duration::from_millis(ms),
        }
    }

    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.app_name.trim().is_empty() {
            return Err(CoordinatorError::config("app_name", "must not be empty"));
        }
        if self.dedup_ttl_ms == 0 {
            return Err(CoordinatorError::config("dedup_ttl_ms", "must be positive"));
        }
        if self.trace_capacity == 0 {
            return Err(CoordinatorError::config("trace_capacity", "must be positive"));
        }
        if self.trace_storage_key.is_empty() || self.mapping_key_prefix.is_empty() {
            return Err(CoordinatorError::config("storage keys", "must not be empty"));
        }
        if self.event_channel_capacity == 0 {
            return Err(CoordinatorError::config("event_channel_capacity", "must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dedup_ttl(), Duration::from_secs(60));
        assert_eq!(config.trace_capacity, 200);
    }

    #[test]
    fn test_invalid_toml_values_rejected() {
        let err = CoordinatorConfig::from_toml_str("dedup_ttl_ms = 0").unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidConfiguration { .. }));
        assert!(CoordinatorConfig::from_toml_str("trace_capacity = \"lots\"").is_err());
    }

    #[test]
    fn test_sub_second_ttl_is_kept() {
        let config = CoordinatorConfig::new("CallSync").with_dedup_ttl(Duration::from_millis(250));
        assert_eq!(config.dedup_ttl(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_ttl_never_disables_dedup() {
        let config = CoordinatorConfig {
            dedup_ttl_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(config.dedup_ttl(), Duration::from_secs(60));
    }
}
