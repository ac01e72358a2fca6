//! Scanloop configuration system.
//!
//! One explicit config object, constructed at startup and passed into each
//! component — no process-wide mutable state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanloopConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

impl ScanloopConfig {
    /// Load config from the default path (~/.scanloop/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::ScanloopError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::ScanloopError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::ScanloopError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Scanloop home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".scanloop")
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "~/.scanloop/scanloop.db".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Gateway (HTTP API) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String { "0.0.0.0".into() }
fn default_port() -> u16 { 8710 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

/// Scheduler / executor loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Max due tasks dispatched per heartbeat.
    #[serde(default = "default_dispatch_limit")]
    pub dispatch_limit: usize,
    /// Max queue entries claimed per heartbeat.
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    /// Heartbeat interval in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Runs stuck in `running` longer than this are swept.
    #[serde(default = "default_stale_after_minutes")]
    pub stale_after_minutes: i64,
}

fn default_dispatch_limit() -> usize { 25 }
fn default_queue_limit() -> usize { 25 }
fn default_tick_secs() -> u64 { 30 }
fn default_stale_after_minutes() -> i64 { 30 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_limit: default_dispatch_limit(),
            queue_limit: default_queue_limit(),
            tick_secs: default_tick_secs(),
            stale_after_minutes: default_stale_after_minutes(),
        }
    }
}

/// Webhook delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Process-wide fallback signing secret for direct webhooks without one.
    #[serde(default)]
    pub signing_secret: String,
    /// Per-request delivery timeout in seconds.
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout_secs() -> u64 { 10 }

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

impl WebhookConfig {
    /// Resolve the fallback signing secret, preferring the env var.
    pub fn resolve_signing_secret(&self) -> String {
        std::env::var("SCANLOOP_WEBHOOK_SECRET").unwrap_or_else(|_| self.signing_secret.clone())
    }
}

/// Batch runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Base URL of the batch-processing backend. When unset, the
    /// deterministic local runner is used instead.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Request timeout for backend calls in seconds.
    #[serde(default = "default_runner_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_runner_timeout_secs() -> u64 { 60 }

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { base_url: None, timeout_secs: default_runner_timeout_secs() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ScanloopConfig::default();
        assert_eq!(cfg.gateway.port, 8710);
        assert_eq!(cfg.webhook.timeout_secs, 10);
        assert_eq!(cfg.scheduler.dispatch_limit, 25);
        assert!(cfg.runner.base_url.is_none());
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg: ScanloopConfig = toml::from_str(
            "[webhook]\nsigning_secret = \"s3cret\"\n\n[scheduler]\nqueue_limit = 5\n",
        )
        .unwrap();
        assert_eq!(cfg.webhook.signing_secret, "s3cret");
        assert_eq!(cfg.scheduler.queue_limit, 5);
        // Untouched sections keep their defaults
        assert_eq!(cfg.scheduler.tick_secs, 30);
        assert_eq!(cfg.gateway.host, "0.0.0.0");
    }
}
