//! Runtime configuration.
//!
//! Loaded once at startup from environment variables (a `.env` file is read
//! first when present). Tests build configs directly with the `with_*` setters.

use std::time::Duration;

/// Database connection settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost:5432/livesql".to_string()),
            max_connections: env_parse("DATABASE_POOL_SIZE", 10),
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
        }
    }
}

/// Trigger coordination settings
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Identifies this process in the shared coordination tables
    pub app_name: String,
    /// Heartbeat / housekeeping interval
    pub check_interval: Duration,
    /// An app is presumed dead after `check_interval * stale_multiplier`
    pub stale_multiplier: u32,
    /// Install the DDL event trigger and reload the catalog on schema changes
    pub watch_schema: bool,
    /// LISTEN/NOTIFY channel shared by all processes
    pub notify_channel: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            app_name: "livesql".to_string(),
            check_interval: Duration::from_secs(10),
            stale_multiplier: 4,
            watch_schema: false,
            notify_channel: "livesql_notify".to_string(),
        }
    }
}

impl TriggerConfig {
    pub fn stale_after(&self) -> Duration {
        self.check_interval * self.stale_multiplier
    }
}

/// Subscription and sync dispatch settings
#[derive(Debug, Clone)]
pub struct LiveSettings {
    /// Throttle applied when a Rule does not set one
    pub default_throttle: Duration,
    /// Rows per sync batch when the sync Rule does not set one
    pub sync_batch_size: usize,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            default_throttle: Duration::ZERO,
            sync_batch_size: 50,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct LiveConfig {
    pub database: DatabaseConfig,
    pub triggers: TriggerConfig,
    pub live: LiveSettings,
}

impl LiveConfig {
    /// Load from the environment, reading `.env` first if present
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let defaults = TriggerConfig::default();
        let triggers = TriggerConfig {
            app_name: std::env::var("LIVESQL_APP_NAME").unwrap_or(defaults.app_name),
            check_interval: Duration::from_millis(env_parse("LIVESQL_TRIGGER_CHECK_MS", 10_000)),
            stale_multiplier: env_parse("LIVESQL_STALE_MULTIPLIER", defaults.stale_multiplier),
            watch_schema: env_bool("LIVESQL_WATCH_SCHEMA", defaults.watch_schema),
            notify_channel: std::env::var("LIVESQL_NOTIFY_CHANNEL")
                .unwrap_or(defaults.notify_channel),
        };

        let live = LiveSettings {
            default_throttle: Duration::from_millis(env_parse("LIVESQL_DEFAULT_THROTTLE_MS", 0)),
            sync_batch_size: env_parse("LIVESQL_SYNC_BATCH_SIZE", 50),
        };

        Self {
            database: DatabaseConfig::default(),
            triggers,
            live,
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database.database_url = url.into();
        self
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.triggers.app_name = name.into();
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.triggers.check_interval = interval;
        self
    }

    pub fn with_watch_schema(mut self, watch: bool) -> Self {
        self.triggers.watch_schema = watch;
        self
    }

    pub fn with_default_throttle(mut self, throttle: Duration) -> Self {
        self.live.default_throttle = throttle;
        self
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
