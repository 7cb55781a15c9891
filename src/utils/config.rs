// src/utils/config.rs
//! Environment-driven configuration for the template engine.

use indicatif::MultiProgress;
use log::{debug, info, warn};
use std::env;
use std::str::FromStr;

use crate::utils::constants::{DEFAULT_APPROVAL_THRESHOLD, DEFAULT_FLAG_THRESHOLD};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring unparseable value '{}' for {}", raw, key);
                default
            }
        },
        Err(_) => default,
    }
}

/// Promotion and demotion thresholds shared by milestone templates and
/// application types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub approval_threshold: i32,
    pub flag_threshold: i32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            approval_threshold: DEFAULT_APPROVAL_THRESHOLD,
            flag_threshold: DEFAULT_FLAG_THRESHOLD,
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> Self {
        let mut approval_threshold =
            env_or("TEMPLATE_APPROVAL_THRESHOLD", DEFAULT_APPROVAL_THRESHOLD);
        let mut flag_threshold = env_or("TEMPLATE_FLAG_THRESHOLD", DEFAULT_FLAG_THRESHOLD);

        if approval_threshold < 1 {
            warn!(
                "TEMPLATE_APPROVAL_THRESHOLD must be at least 1, got {}; using {}",
                approval_threshold, DEFAULT_APPROVAL_THRESHOLD
            );
            approval_threshold = DEFAULT_APPROVAL_THRESHOLD;
        }
        if flag_threshold < 1 {
            warn!(
                "TEMPLATE_FLAG_THRESHOLD must be at least 1, got {}; using {}",
                flag_threshold, DEFAULT_FLAG_THRESHOLD
            );
            flag_threshold = DEFAULT_FLAG_THRESHOLD;
        }

        debug!(
            "Lifecycle config: approval_threshold={}, flag_threshold={}",
            approval_threshold, flag_threshold
        );
        Self {
            approval_threshold,
            flag_threshold,
        }
    }

    pub fn log_config(&self) {
        info!(
            "📋 Template lifecycle: approve at {} uses, demote unused templates at {} flags",
            self.approval_threshold, self.flag_threshold
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Apply `sql/schema.sql` on startup.
    pub ensure_schema: bool,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let backend = match env::var("IMMITRACKER_STORAGE")
            .unwrap_or_else(|_| "postgres".to_string())
            .trim()
            .to_lowercase()
            .as_str()
        {
            "memory" | "mem" => StorageBackend::Memory,
            "postgres" | "postgresql" | "pg" => StorageBackend::Postgres,
            other => {
                warn!("Unknown IMMITRACKER_STORAGE '{}', falling back to postgres", other);
                StorageBackend::Postgres
            }
        };
        let ensure_schema = env_or("IMMITRACKER_ENSURE_SCHEMA", false);
        Self {
            backend,
            ensure_schema,
        }
    }

    pub fn log_config(&self) {
        match self.backend {
            StorageBackend::Memory => {
                info!("💾 Storage backend: in-memory (state is discarded on exit)")
            }
            StorageBackend::Postgres => info!(
                "🐘 Storage backend: PostgreSQL (ensure schema: {})",
                self.ensure_schema
            ),
        }
    }
}

/// PostgreSQL connection settings read from `POSTGRES_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5432,
            dbname: "immitracker".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            pool_size: 16,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let pool_size = env_or("POSTGRES_POOL_SIZE", defaults.pool_size).max(1);
        Self {
            host: env_or("POSTGRES_HOST", defaults.host),
            port: env_or("POSTGRES_PORT", defaults.port),
            dbname: env_or("POSTGRES_DB", defaults.dbname),
            user: env_or("POSTGRES_USER", defaults.user),
            password: env::var("POSTGRES_PASSWORD").unwrap_or_default(),
            pool_size,
        }
    }

    pub fn log_config(&self) {
        info!(
            "🐘 DB Config: Host={}, Port={}, DB={}, User={}, Pool={}",
            self.host, self.port, self.dbname, self.user, self.pool_size
        );
    }
}

/// Progress bar settings for the normalization job.
#[derive(Debug, Clone)]
pub struct ProgressConfig {
    pub enabled: bool,
    /// Redraw rate in Hz.
    pub refresh_rate_hz: u8,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_rate_hz: 10,
        }
    }
}

impl ProgressConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_or("PROGRESS_ENABLED", true),
            refresh_rate_hz: env_or("PROGRESS_REFRESH_RATE_HZ", 10),
        }
    }

    /// A `MultiProgress` when progress is enabled, `None` otherwise.
    pub fn create_multi_progress(&self) -> Option<MultiProgress> {
        if self.enabled {
            let target = indicatif::ProgressDrawTarget::stderr_with_hz(self.refresh_rate_hz);
            Some(MultiProgress::with_draw_target(target))
        } else {
            None
        }
    }
}
