// Daemon configuration from RELAY_* environment variables

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_DATA_DIR: &str = "~/.station-relay";
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BREAKER_FAILURES: u32 = 5;
const DEFAULT_BREAKER_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub data_dir: PathBuf,
    pub watch_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub max_workers: usize,
    pub max_attempts: u32,
    pub delete_completed: bool,
    pub startup_scan: bool,
    pub breaker_failures: u32,
    pub breaker_timeout: Duration,
    pub log_dir: Option<PathBuf>,
}

impl RelayConfig {
    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    pub fn operations_dir(&self) -> PathBuf {
        self.data_dir.join("operations")
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (tests pass a map instead of the process env)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = |key: &str| lookup(key).map(|v| expand(&v));
        let data_dir = path("RELAY_DATA_DIR").unwrap_or_else(|| expand(DEFAULT_DATA_DIR));

        Ok(Self {
            watch_dir: path("RELAY_WATCH_DIR").unwrap_or_else(|| data_dir.join("inbox")),
            outbox_dir: path("RELAY_OUTBOX_DIR").unwrap_or_else(|| data_dir.join("outbox")),
            max_workers: parse(&lookup, "RELAY_MAX_WORKERS")?.unwrap_or(DEFAULT_MAX_WORKERS),
            max_attempts: parse(&lookup, "RELAY_MAX_ATTEMPTS")?.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            delete_completed: parse_flag(&lookup, "RELAY_DELETE_COMPLETED")?.unwrap_or(false),
            startup_scan: parse_flag(&lookup, "RELAY_STARTUP_SCAN")?.unwrap_or(true),
            breaker_failures: parse(&lookup, "RELAY_BREAKER_FAILURES")?
                .unwrap_or(DEFAULT_BREAKER_FAILURES),
            breaker_timeout: Duration::from_secs(
                parse(&lookup, "RELAY_BREAKER_TIMEOUT_SECS")?
                    .unwrap_or(DEFAULT_BREAKER_TIMEOUT_SECS),
            ),
            log_dir: path("RELAY_LOG_DIR"),
            data_dir,
        })
    }
}

fn expand(value: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(value).into_owned())
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>().with_context(|| format!("{}={:?}", key, raw)))
        .transpose()
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    lookup(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{}={:?} is not a boolean", key, raw),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<RelayConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_hang_off_data_dir() {
        let config = config(&[("RELAY_DATA_DIR", "/srv/relay")]).unwrap();
        assert_eq!(config.watch_dir, PathBuf::from("/srv/relay/inbox"));
        assert_eq!(config.outbox_dir, PathBuf::from("/srv/relay/outbox"));
        assert_eq!(config.queue_dir(), PathBuf::from("/srv/relay/queue"));
        assert_eq!(config.max_workers, 4);
        assert!(config.startup_scan);
        assert!(!config.delete_completed);
        assert_eq!(config.breaker_timeout, Duration::from_secs(60));
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("RELAY_DATA_DIR", "/srv/relay"),
            ("RELAY_WATCH_DIR", "/mnt/station/out"),
            ("RELAY_MAX_WORKERS", "8"),
            ("RELAY_DELETE_COMPLETED", "yes"),
            ("RELAY_STARTUP_SCAN", "0"),
            ("RELAY_BREAKER_TIMEOUT_SECS", "15"),
        ])
        .unwrap();
        assert_eq!(config.watch_dir, PathBuf::from("/mnt/station/out"));
        assert_eq!(config.max_workers, 8);
        assert!(config.delete_completed);
        assert!(!config.startup_scan);
        assert_eq!(config.breaker_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_tilde_is_expanded() {
        let config = config(&[]).unwrap();
        assert!(!config.data_dir.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(config(&[("RELAY_MAX_WORKERS", "many")]).is_err());
        assert!(config(&[("RELAY_STARTUP_SCAN", "maybe")]).is_err());
    }
}
