//! Runtime configuration for the relay daemon.
//!
//! Per-destination settings (URL, credentials) live in each queue's
//! `destination.json`. Process-wide settings come from the environment:
//!
//! - `RELAY_QUEUES_DIR`: root holding one directory per destination
//!   (default `./queues`)
//! - `RELAY_SCAN_INTERVAL_SECS`: how often the root is rescanned for new
//!   destinations (default 60)
//! - `RELAY_WATCH_RATE_PER_SEC`: notification-triggered passes allowed per
//!   second and destination (default 1)
//! - `RELAY_TOKEN_CACHE`: token cache file (default
//!   `<queues dir>/tokens.json`)

use std::path::PathBuf;
use std::time::Duration;

use crate::queue::notifier::DEFAULT_WATCH_RATE;
use crate::retry::BackoffProfile;

/// Default rescan interval for the queues root (1 minute).
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;

/// Default queues root.
const DEFAULT_QUEUES_DIR: &str = "queues";

/// Default token cache file name inside the queues root.
const DEFAULT_TOKEN_CACHE_FILE: &str = "tokens.json";

/// Pacing of one destination's dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Polling cadence while things work or fail transiently.
    pub transient: BackoffProfile,

    /// Polling cadence while logins are refused.
    pub authentication: BackoffProfile,

    /// Notification-triggered passes per second.
    pub watch_rate: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            transient: BackoffProfile::TRANSIENT,
            authentication: BackoffProfile::AUTHENTICATION,
            watch_rate: DEFAULT_WATCH_RATE,
        }
    }
}

/// Process-wide relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Root directory holding one queue directory per destination.
    pub queues_dir: PathBuf,

    /// How often to look for new destination directories.
    pub scan_interval: Duration,

    /// Token cache file.
    pub token_cache: PathBuf,

    pub dispatcher: DispatcherConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUES_DIR)
    }
}

impl RelayConfig {
    /// Creates a configuration for `queues_dir` with default values.
    pub fn new(queues_dir: impl Into<PathBuf>) -> Self {
        let queues_dir = queues_dir.into();
        RelayConfig {
            token_cache: queues_dir.join(DEFAULT_TOKEN_CACHE_FILE),
            queues_dir,
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            dispatcher: DispatcherConfig::default(),
        }
    }

    /// Creates a `RelayConfig` from environment variables.
    ///
    /// Unset or unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let queues_dir = lookup("RELAY_QUEUES_DIR")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_QUEUES_DIR.to_string());
        let mut config = Self::new(queues_dir);

        if let Some(secs) = lookup("RELAY_SCAN_INTERVAL_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|s| *s > 0)
        {
            config.scan_interval = Duration::from_secs(secs);
        }
        if let Some(rate) = lookup("RELAY_WATCH_RATE_PER_SEC")
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|r| *r > 0)
        {
            config.dispatcher.watch_rate = rate;
        }
        if let Some(path) = lookup("RELAY_TOKEN_CACHE").filter(|s| !s.is_empty()) {
            config.token_cache = PathBuf::from(path);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> RelayConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let config = from_map(&[]);
        assert_eq!(config.queues_dir, PathBuf::from("queues"));
        assert_eq!(config.token_cache, PathBuf::from("queues/tokens.json"));
        assert_eq!(config.scan_interval, Duration::from_secs(60));
        assert_eq!(config.dispatcher.watch_rate, 1);
        assert_eq!(config.dispatcher.transient, BackoffProfile::TRANSIENT);
    }

    #[test]
    fn environment_overrides() {
        let config = from_map(&[
            ("RELAY_QUEUES_DIR", "/var/spool/relay"),
            ("RELAY_SCAN_INTERVAL_SECS", "5"),
            ("RELAY_WATCH_RATE_PER_SEC", "4"),
        ]);
        assert_eq!(config.queues_dir, PathBuf::from("/var/spool/relay"));
        assert_eq!(config.token_cache, PathBuf::from("/var/spool/relay/tokens.json"));
        assert_eq!(config.scan_interval, Duration::from_secs(5));
        assert_eq!(config.dispatcher.watch_rate, 4);

        let config = from_map(&[("RELAY_TOKEN_CACHE", "/etc/relay/tokens.json")]);
        assert_eq!(config.token_cache, PathBuf::from("/etc/relay/tokens.json"));
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = from_map(&[
            ("RELAY_SCAN_INTERVAL_SECS", "0"),
            ("RELAY_WATCH_RATE_PER_SEC", "fast"),
        ]);
        assert_eq!(config.scan_interval, Duration::from_secs(60));
        assert_eq!(config.dispatcher.watch_rate, 1);
    }
}
