//! Cache configuration.
//!
//! Built from the `[cache]` settings section (`ttl_seconds`,
//! `sweep_interval_ms`); see [`crate::config::CacheSettings`].

use std::time::Duration;

/// Entries idle for this long are evicted.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Idle lifetime of an entry; every access pushes the deadline forward.
    pub ttl: Duration,
    /// How often the sweeper looks for expired entries.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            ttl: settings.ttl,
            sweep_interval: settings.sweep_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(1800));
        assert_eq!(config.sweep_interval, Duration::from_millis(1000));
    }

    #[test]
    fn converts_from_settings() {
        let config = CacheConfig::from(&CacheSettings {
            ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(250),
        });
        assert_eq!(config.ttl, Duration::from_secs(5));
        assert_eq!(config.sweep_interval, Duration::from_millis(250));
    }
}
