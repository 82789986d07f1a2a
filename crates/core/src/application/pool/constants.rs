// Pool constants (ADR: No magic values)
use std::time::Duration;

/// How long an idle worker waits on the queue before re-checking shutdown (500ms)
pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Sleep duration after worker error before retry (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Worker count is clamped into this range
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 50;

/// Default retry base delay (1s)
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for a single retry delay (5 minutes)
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// How long startup-scanned paths stay in the dedup set (5s)
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(5);

/// Startup scan cap (0 = unlimited)
pub const DEFAULT_STARTUP_SCAN_MAX_FILES: usize = 10_000;

/// Graceful pool shutdown timeout (30s)
pub const DEFAULT_DISPOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Item metadata keys
pub const REMOTE_ID_KEY: &str = "remote_id";
pub const SOURCE_PATH_KEY: &str = "source_path";
