//! The persisted `Config` tuneables (`# 6` of the external interface) plus
//! the typed struct a [`crate::store::JobStore`] resolves them into.
//!
//! This mirrors the codebase's preference for a small typed config struct
//! with a `Default` impl and `with_*` builders over an external configuration
//! framework; the only process-level (non-persisted) setting, `QUEUECTL_DB`,
//! is resolved the same plain way via `std::env::var` (see
//! [`default_db_path`]).

use std::env;

/// Default cap applied to jobs that omit `max_retries`.
pub const DEFAULT_MAX_RETRIES: i64 = 3;

/// Default base of the exponential backoff, in seconds.
pub const DEFAULT_BACKOFF_BASE: i64 = 2;

/// Default worker tick period, in seconds.
pub const DEFAULT_WORKER_POLL_INTERVAL: f64 = 1.0;

/// Environment variable naming the default store path.
pub const QUEUECTL_DB_ENV: &str = "QUEUECTL_DB";

/// Fallback store path when `QUEUECTL_DB` is unset.
pub const DEFAULT_DB_PATH: &str = "queuectl.db";

/// The three config keys persisted in the `config` table (`# 6`).
pub const KEY_MAX_RETRIES: &str = "max-retries";
pub const KEY_BACKOFF_BASE: &str = "backoff-base";
pub const KEY_WORKER_POLL_INTERVAL: &str = "worker-poll-interval";

pub const ALL_KEYS: [&str; 3] = [KEY_MAX_RETRIES, KEY_BACKOFF_BASE, KEY_WORKER_POLL_INTERVAL];

/// Resolve the store path a bare binary should open when the caller did not
/// pass an explicit path: `QUEUECTL_DB` if set, otherwise [`DEFAULT_DB_PATH`].
pub fn default_db_path() -> String {
    env::var(QUEUECTL_DB_ENV).unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
}

/// The resolved tuneable configuration a worker pool snapshots at startup.
///
/// Per `# 9`, workers capture this once at pool start; operators restart
/// workers to apply new persisted values rather than have the engine
/// re-read config mid-drain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub max_retries: i64,
    pub backoff_base: i64,
    pub worker_poll_interval: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
            worker_poll_interval: DEFAULT_WORKER_POLL_INTERVAL,
        }
    }
}

impl Config {
    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff_base(mut self, backoff_base: i64) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_worker_poll_interval(mut self, worker_poll_interval: f64) -> Self {
        self.worker_poll_interval = worker_poll_interval;
        self
    }

    /// Apply a single `key`/`value` override from the Store's `config`
    /// table, validating against the known key set and each key's type.
    /// Unknown keys and malformed values are [`crate::error::ClientError`]s,
    /// rejected at the boundary without mutating `self`.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), crate::error::ClientError> {
        match key {
            KEY_MAX_RETRIES => {
                let v: i64 = value.parse().map_err(|_| invalid_value(key, value))?;
                if v < 0 {
                    return Err(invalid_value(key, value));
                }
                self.max_retries = v;
            }
            KEY_BACKOFF_BASE => {
                let v: i64 = value.parse().map_err(|_| invalid_value(key, value))?;
                if v < 1 {
                    return Err(invalid_value(key, value));
                }
                self.backoff_base = v;
            }
            KEY_WORKER_POLL_INTERVAL => {
                let v: f64 = value.parse().map_err(|_| invalid_value(key, value))?;
                if !(v > 0.0) {
                    return Err(invalid_value(key, value));
                }
                self.worker_poll_interval = v;
            }
            other => return Err(crate::error::ClientError::InvalidConfigKey(other.to_string())),
        }
        Ok(())
    }

    /// Render one key's current value as a string, as it would be persisted
    /// or displayed by the operator `config show` surface.
    pub fn get(&self, key: &str) -> Result<String, crate::error::ClientError> {
        match key {
            KEY_MAX_RETRIES => Ok(self.max_retries.to_string()),
            KEY_BACKOFF_BASE => Ok(self.backoff_base.to_string()),
            KEY_WORKER_POLL_INTERVAL => Ok(self.worker_poll_interval.to_string()),
            other => Err(crate::error::ClientError::InvalidConfigKey(other.to_string())),
        }
    }
}

fn invalid_value(key: &str, value: &str) -> crate::error::ClientError {
    crate::error::ClientError::InvalidConfigValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.backoff_base, 2);
        assert_eq!(cfg.worker_poll_interval, 1.0);
    }

    #[test]
    fn apply_updates_known_keys() {
        let mut cfg = Config::default();
        cfg.apply(KEY_MAX_RETRIES, "7").unwrap();
        cfg.apply(KEY_BACKOFF_BASE, "3").unwrap();
        cfg.apply(KEY_WORKER_POLL_INTERVAL, "0.5").unwrap();
        assert_eq!(cfg.max_retries, 7);
        assert_eq!(cfg.backoff_base, 3);
        assert_eq!(cfg.worker_poll_interval, 0.5);
    }

    #[test]
    fn apply_rejects_unknown_key() {
        let mut cfg = Config::default();
        assert!(cfg.apply("bogus", "1").is_err());
    }

    #[test]
    fn apply_rejects_out_of_range_values() {
        let mut cfg = Config::default();
        assert!(cfg.apply(KEY_MAX_RETRIES, "-1").is_err());
        assert!(cfg.apply(KEY_BACKOFF_BASE, "0").is_err());
        assert!(cfg.apply(KEY_WORKER_POLL_INTERVAL, "0").is_err());
        assert!(cfg.apply(KEY_WORKER_POLL_INTERVAL, "not-a-float").is_err());
        // none of the rejected writes should have mutated defaults
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn default_db_path_respects_env_override() {
        env::set_var(QUEUECTL_DB_ENV, "/tmp/custom.db");
        assert_eq!(default_db_path(), "/tmp/custom.db");
        env::remove_var(QUEUECTL_DB_ENV);
        assert_eq!(default_db_path(), DEFAULT_DB_PATH);
    }
}
