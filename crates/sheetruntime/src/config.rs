use serde::{Deserialize, Serialize};
use sheetcore::FlowError;
use std::path::Path;
use std::time::Duration;

/// Configuration for the runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub engine: EngineConfig,
    pub propagation: PropagationConfig,
    pub channel: ChannelConfig,
}

impl RuntimeConfig {
    /// Load from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempts per node for transient failures, first try included
    pub node_max_attempts: u32,
    /// Linear backoff step between node attempts
    pub retry_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_max_attempts: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(attempt as u64))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub cooldown_ms: u64,
    pub retention_ms: u64,
    pub gc_interval_ms: u64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            cooldown_ms: 30_000,
            retention_ms: 2 * 60 * 60 * 1_000,
            gc_interval_ms: 30 * 60 * 1_000,
        }
    }
}

impl PropagationConfig {
    /// `min(max_delay, base_delay * 2^attempts)`
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 2u64.checked_pow(attempts).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub reconnect_delay_ms: u64,
    pub event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5_000,
            event_buffer_size: 1000,
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let config = PropagationConfig::default();
        let delays: Vec<u64> = (0..7)
            .map(|n| config.backoff_delay(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert_eq!(config.backoff_delay(200), Duration::from_millis(30_000));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"engine": {"retry_delay_ms": 10}}"#).unwrap();
        assert_eq!(config.engine.retry_delay_ms, 10);
        assert_eq!(config.engine.node_max_attempts, 3);
        assert_eq!(config.propagation.max_attempts, 5);
        assert_eq!(config.channel.reconnect_delay(), Duration::from_secs(5));
    }

    #[test]
    fn linear_node_retry_delay() {
        let config = EngineConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(1));
        assert_eq!(config.retry_delay(2), Duration::from_secs(2));
    }
}
