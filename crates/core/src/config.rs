//! Runtime configuration, read from `LUMEN_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::error::LumenError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Identity field name inside documents.
    pub id_field: String,
    /// Minimum time between fan-outs per entry; zero disables debouncing.
    pub debounce: Duration,
    /// Buffered faults on the operator error channel.
    pub error_channel_cap: usize,
    pub watch_backoff_initial: Duration,
    pub watch_backoff_max: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            id_field: "_id".to_string(),
            debounce: Duration::ZERO,
            error_channel_cap: 256,
            watch_backoff_initial: Duration::from_millis(500),
            watch_backoff_max: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl CacheConfig {
    /// Defaults overridden by whichever variables are set and parse.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            id_field: std::env::var("LUMEN_ID_FIELD").ok().filter(|s| !s.trim().is_empty()).unwrap_or(d.id_field),
            debounce: env_parse::<u64>("LUMEN_DEBOUNCE_MS").map(Duration::from_millis).unwrap_or(d.debounce),
            error_channel_cap: env_parse::<usize>("LUMEN_ERROR_CHANNEL_CAP").unwrap_or(d.error_channel_cap),
            watch_backoff_initial: env_parse::<u64>("LUMEN_WATCH_BACKOFF_INITIAL_MS").map(Duration::from_millis).unwrap_or(d.watch_backoff_initial),
            watch_backoff_max: env_parse::<u64>("LUMEN_WATCH_BACKOFF_MAX_SECS").map(Duration::from_secs).unwrap_or(d.watch_backoff_max),
        }
    }

    pub fn with_debounce(mut self, window: Duration) -> Self { self.debounce = window; self }
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self { self.id_field = field.into(); self }

    pub fn validate(&self) -> Result<(), LumenError> {
        if self.id_field.trim().is_empty() {
            return Err(LumenError::Config("id_field must not be empty".into()));
        }
        if self.error_channel_cap == 0 {
            return Err(LumenError::Config("error_channel_cap must be > 0".into()));
        }
        if self.watch_backoff_initial > self.watch_backoff_max {
            return Err(LumenError::Config("watch_backoff_initial exceeds watch_backoff_max".into()));
        }
        Ok(())
    }
}
