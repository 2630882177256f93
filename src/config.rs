//! Configuration module for powerwatch.
//!
//! Process-level options are loaded once from environment variables. The
//! operator-tunable monitoring knobs live in [`SharedSettings`] and are read
//! again at every decision point so changes apply to running debounce windows.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::probe::ProbeMode;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the status API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "powerwatch.db")
    pub db_path: String,
    /// Number of SQLite connections the store shards writes over (default: 4)
    pub db_connections: usize,
    /// Maximum number of probes in flight during one tick (default: 50)
    pub concurrency: usize,
    /// Total time allowed for one reachability probe, start jitter included (default: 5s)
    pub probe_timeout: Duration,
    /// How endpoints are probed (default: http)
    pub probe_mode: ProbeMode,
    /// Interval of the bulk state flush (default: 5 minutes)
    pub save_interval: Duration,
    /// Maximum age of a persisted state that is restored at startup (default: 1 hour)
    pub freshness_window: Duration,
    /// Upper bound on the final flush at shutdown (default: 10s)
    pub shutdown_timeout: Duration,
    /// Webhook receiving transition notifications; notifications are only logged when unset
    pub webhook_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "powerwatch.db".to_string(),
            db_connections: 4,
            concurrency: 50,
            probe_timeout: Duration::from_secs(5),
            probe_mode: ProbeMode::Http,
            save_interval: Duration::from_secs(300),
            freshness_window: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_secs(10),
            webhook_url: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `POWERWATCH_HTTP_PORT`: HTTP port (default: 8080)
    /// - `POWERWATCH_DB_PATH`: Database file path (default: "powerwatch.db")
    /// - `POWERWATCH_DB_CONNECTIONS`: Store connections (default: 4)
    /// - `POWERWATCH_CONCURRENCY`: Probe workers per tick (default: 50)
    /// - `POWERWATCH_PROBE_TIMEOUT_SECS`: Probe timeout, start jitter included (default: 5)
    /// - `POWERWATCH_PROBE_MODE`: `http` or `tcp` (default: http)
    /// - `POWERWATCH_SAVE_INTERVAL_SECS`: Bulk flush interval (default: 300)
    /// - `POWERWATCH_FRESHNESS_SECS`: Restore freshness window (default: 3600)
    /// - `POWERWATCH_SHUTDOWN_TIMEOUT_SECS`: Final flush bound (default: 10)
    /// - `POWERWATCH_WEBHOOK_URL`: Notification webhook (default: unset)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("POWERWATCH_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Ok(db_path) = env::var("POWERWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(n) = parse_var::<usize>("POWERWATCH_DB_CONNECTIONS") {
            cfg.db_connections = n.max(1);
        }

        if let Some(n) = parse_var::<usize>("POWERWATCH_CONCURRENCY") {
            cfg.concurrency = n.max(1);
        }

        if let Some(secs) = parse_var::<u64>("POWERWATCH_PROBE_TIMEOUT_SECS") {
            if secs > 0 {
                cfg.probe_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(mode) = parse_var("POWERWATCH_PROBE_MODE") {
            cfg.probe_mode = mode;
        }

        if let Some(secs) = parse_var::<u64>("POWERWATCH_SAVE_INTERVAL_SECS") {
            if secs > 0 {
                cfg.save_interval = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = parse_var("POWERWATCH_FRESHNESS_SECS") {
            cfg.freshness_window = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_var("POWERWATCH_SHUTDOWN_TIMEOUT_SECS") {
            cfg.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Ok(url) = env::var("POWERWATCH_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                cfg.webhook_url = Some(url);
            }
        }

        cfg
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value {:?} for {}", raw, name);
            None
        }
    }
}

/// Smallest confirmation window; a configured debounce of zero maps here.
pub const MIN_STABILIZATION: Duration = Duration::from_secs(30);

/// Operator-tunable monitoring settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Debounce window in minutes. Zero still waits [`MIN_STABILIZATION`].
    pub debounce_minutes: u32,
    /// Fixed tick interval in seconds; zero means derive it from fleet size.
    pub interval_override_secs: u64,
    /// Minimum gap between two notifications for one entity.
    pub cooldown_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            debounce_minutes: 5,
            interval_override_secs: 0,
            cooldown_secs: 60,
        }
    }
}

impl MonitorSettings {
    pub fn debounce(&self) -> Duration {
        if self.debounce_minutes == 0 {
            MIN_STABILIZATION
        } else {
            Duration::from_secs(u64::from(self.debounce_minutes) * 60)
        }
    }

    pub fn interval_override(&self) -> Option<Duration> {
        (self.interval_override_secs > 0).then(|| Duration::from_secs(self.interval_override_secs))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Live settings shared between the API, the scheduler and the engine.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<MonitorSettings>>,
}

impl SharedSettings {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Copy of the current settings.
    pub fn snapshot(&self) -> MonitorSettings {
        match self.inner.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn replace(&self, settings: MonitorSettings) {
        match self.inner.write() {
            Ok(mut guard) => *guard = settings,
            Err(poisoned) => *poisoned.into_inner() = settings,
        }
    }
}
