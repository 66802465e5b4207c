use crate::error::GateError;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_BUCKET_SIZE: u32 = 100;
pub const DEFAULT_HISTOGRAM_INTERVAL: f64 = 10.0;
pub const DEFAULT_MAX_RESULT_WINDOW: u64 = 10_000;

/// Runtime configuration shared by the compilers, the executor and the
/// bulk write coordinator.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub default_bucket_size: u32,
    /// Per-field terms aggregation size, consulted before `default_bucket_size`.
    pub bucket_size_overrides: BTreeMap<String, u32>,
    pub histogram_default_interval: f64,
    pub composite_page_size: u32,
    /// Largest `from + size` window the document store accepts.
    pub max_result_window: u64,
    pub max_reconnect_attempts: u32,
    pub max_deadlock_attempts: u32,
    /// Deadlock backoff is `deadlock_backoff_unit * 2^attempt`.
    pub deadlock_backoff_unit: Duration,
    pub schema_cache_enabled: bool,
    pub schema_cache_capacity: usize,
    pub replica_reads_enabled: bool,
    /// Restores the legacy behaviour of treating an unknown operator key as an
    /// equality filter against the serialized input. Every use is logged.
    pub lenient_unknown_operators: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_bucket_size: DEFAULT_BUCKET_SIZE,
            bucket_size_overrides: BTreeMap::new(),
            histogram_default_interval: DEFAULT_HISTOGRAM_INTERVAL,
            composite_page_size: 100,
            max_result_window: DEFAULT_MAX_RESULT_WINDOW,
            max_reconnect_attempts: 3,
            max_deadlock_attempts: 5,
            deadlock_backoff_unit: Duration::from_secs(1),
            schema_cache_enabled: true,
            schema_cache_capacity: 256,
            replica_reads_enabled: true,
            lenient_unknown_operators: false,
        }
    }
}

impl GateConfig {
    pub fn production() -> Self {
        Self {
            schema_cache_enabled: true,
            replica_reads_enabled: true,
            lenient_unknown_operators: false,
            ..Self::default()
        }
    }

    /// Single-node profile: no replica routing and no schema caching, so
    /// schema edits made while developing are picked up immediately.
    pub fn development() -> Self {
        Self {
            schema_cache_enabled: false,
            replica_reads_enabled: false,
            max_deadlock_attempts: 2,
            deadlock_backoff_unit: Duration::from_millis(50),
            ..Self::default()
        }
    }

    pub fn with_bucket_size(mut self, field: impl Into<String>, size: u32) -> Self {
        self.bucket_size_overrides.insert(field.into(), size);
        self
    }

    pub fn with_max_result_window(mut self, window: u64) -> Self {
        self.max_result_window = window;
        self
    }

    pub fn with_retry_bounds(mut self, reconnect_attempts: u32, deadlock_attempts: u32) -> Self {
        self.max_reconnect_attempts = reconnect_attempts;
        self.max_deadlock_attempts = deadlock_attempts;
        self
    }

    pub fn with_deadlock_backoff_unit(mut self, unit: Duration) -> Self {
        self.deadlock_backoff_unit = unit;
        self
    }

    pub fn with_lenient_unknown_operators(mut self, lenient: bool) -> Self {
        self.lenient_unknown_operators = lenient;
        self
    }

    pub fn with_schema_cache(mut self, enabled: bool) -> Self {
        self.schema_cache_enabled = enabled;
        self
    }

    pub fn with_replica_reads(mut self, enabled: bool) -> Self {
        self.replica_reads_enabled = enabled;
        self
    }

    pub fn bucket_size_for(&self, field: &str) -> u32 {
        self.bucket_size_overrides
            .get(field)
            .copied()
            .unwrap_or(self.default_bucket_size)
    }

    pub fn validate(&self) -> Result<(), GateError> {
        if self.default_bucket_size == 0 {
            return Err(GateError::InvalidConfig {
                message: "default_bucket_size must be positive".into(),
            });
        }
        if let Some((field, _)) = self.bucket_size_overrides.iter().find(|(_, s)| **s == 0) {
            return Err(GateError::InvalidConfig {
                message: format!("bucket size override for '{field}' must be positive"),
            });
        }
        if !(self.histogram_default_interval.is_finite() && self.histogram_default_interval > 0.0)
        {
            return Err(GateError::InvalidConfig {
                message: "histogram_default_interval must be a positive number".into(),
            });
        }
        if self.max_result_window == 0 {
            return Err(GateError::InvalidConfig {
                message: "max_result_window must be positive".into(),
            });
        }
        if self.composite_page_size == 0 {
            return Err(GateError::InvalidConfig {
                message: "composite_page_size must be positive".into(),
            });
        }
        if self.schema_cache_enabled && self.schema_cache_capacity == 0 {
            return Err(GateError::InvalidConfig {
                message: "schema_cache_capacity must be positive when the cache is enabled".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::GateConfig;

    #[test]
    fn bucket_override_wins_over_default() {
        let config = GateConfig::default().with_bucket_size("brand", 7);
        assert_eq!(config.bucket_size_for("brand"), 7);
        assert_eq!(config.bucket_size_for("color"), config.default_bucket_size);
    }

    #[test]
    fn validate_rejects_zero_window() {
        let config = GateConfig::default().with_max_result_window(0);
        assert_eq!(
            config.validate().expect_err("zero window").code_str(),
            "invalid_config"
        );
        assert!(GateConfig::production().validate().is_ok());
        assert!(GateConfig::development().validate().is_ok());
    }
}
