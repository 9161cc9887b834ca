use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{CqrsError, Result};

/// Tunables of the projection engine.
///
/// ```
/// use std::time::Duration;
/// use droplet_es::EngineConfig;
///
/// let config = EngineConfig::default().with_query_wait(Duration::from_millis(50));
/// assert_eq!(config.partitions, 16);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a query waits for an in-flight cache update before failing with
    /// [`CqrsError::QueryTimeout`].
    pub query_wait: Duration,

    /// Period of the sweep destroying idle ephemeral read models.
    pub eviction_interval: Duration,

    /// Number of single-writer partitions of every read-model instance. Events touching
    /// entities of different partitions are folded concurrently.
    pub partitions: usize,

    /// How many of the most recently folded event ids every instance remembers, to ignore
    /// redeliveries of an event under another position.
    pub dedup_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_wait: Duration::from_millis(250),
            eviction_interval: Duration::from_secs(1),
            partitions: 16,
            dedup_window: 4096,
        }
    }
}

impl EngineConfig {
    pub fn with_query_wait(mut self, wait: Duration) -> Self {
        self.query_wait = wait;
        self
    }

    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(CqrsError::Configuration("partitions must be at least 1".to_string()));
        }
        if self.dedup_window == 0 {
            return Err(CqrsError::Configuration("dedup_window must be at least 1".to_string()));
        }
        if self.eviction_interval.is_zero() {
            return Err(CqrsError::Configuration(
                "eviction_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"partitions": 4}"#).unwrap();
        assert_eq!(config.partitions, 4);
        assert_eq!(config.query_wait, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_partitions_is_rejected() {
        let err = EngineConfig::default().with_partitions(0).validate().unwrap_err();
        assert!(matches!(err, CqrsError::Configuration(_)));
    }

    #[test]
    fn zero_sweep_period_and_dedup_window_are_rejected() {
        let no_sweep = EngineConfig::default().with_eviction_interval(Duration::ZERO);
        assert!(no_sweep.validate().is_err());
        assert!(EngineConfig::default().with_dedup_window(0).validate().is_err());
    }
}
