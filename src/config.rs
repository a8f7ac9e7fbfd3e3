use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub status_limit: u32,
    pub status_window: Duration,
    pub upcoming_horizon_days: i64,
    pub reconcile_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            status_limit: 1,
            status_window: Duration::from_secs(60),
            upcoming_horizon_days: 3,
            reconcile_interval: Duration::from_secs(60),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.parse().ok())
}

/// A whole number of seconds. Zero is rejected: timers need a period.
fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    parse_var::<u64>(lookup, name)
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

impl Config {
    /// Defaults overridden by any `INNKEEP_*` variable that parses.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("INNKEEP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: parse_var(&lookup, "INNKEEP_METRICS_PORT"),
            compact_threshold: parse_var(&lookup, "INNKEEP_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            status_limit: parse_var(&lookup, "INNKEEP_STATUS_LIMIT")
                .unwrap_or(defaults.status_limit),
            status_window: parse_secs(&lookup, "INNKEEP_STATUS_WINDOW_SECS")
                .unwrap_or(defaults.status_window),
            upcoming_horizon_days: parse_var(&lookup, "INNKEEP_UPCOMING_HORIZON_DAYS")
                .unwrap_or(defaults.upcoming_horizon_days),
            reconcile_interval: parse_secs(&lookup, "INNKEEP_RECONCILE_SECS")
                .unwrap_or(defaults.reconcile_interval),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("innkeep.wal")
    }
}
