use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
        }
    }
}

/// Engine tuning knobs.
///
/// These are the only parameters the transfer engine reads; everything else
/// in [`AppConfig`] is process wiring.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    /// Lock lease duration. Must exceed the longest realistic critical
    /// section by a safety margin.
    pub ttl_ms: u64,
    /// Base delay for lock-acquisition backoff.
    pub base_retry_delay_ms: u64,
    /// Hard ceiling on a single backoff delay.
    pub max_retry_delay_ms: u64,
    /// Lock acquisition attempts before giving up.
    pub max_retries: u32,
    /// Watched-transaction attempts before surfacing a conflict.
    pub tx_max_attempts: u32,
    /// Retention of applied-operation records, in seconds.
    pub idempotency_ttl_s: u64,
    /// Fixed number of fractional digits for balances and amounts.
    pub balance_scale: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 10_000,
            base_retry_delay_ms: 100,
            max_retry_delay_ms: 2_000,
            max_retries: 10,
            tx_max_attempts: 3,
            idempotency_ttl_s: 86_400,
            balance_scale: 2,
        }
    }
}

impl EngineConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Transfers processed concurrently by one worker process.
    pub concurrency: usize,
    /// Inbound command channel capacity.
    pub queue_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            queue_size: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SeedConfig {
    pub enabled: bool,
    pub user_count: usize,
    pub initial_balance: Decimal,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_count: 10,
            initial_balance: Decimal::new(100_000, 2), // 1000.00
        }
    }
}

impl AppConfig {
    /// Load config from YAML file based on environment
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let mut config: Self =
            serde_yaml::from_str(&content).context("Failed to parse config yaml")?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Environment variables take precedence over YAML config.
    ///
    /// Supported overrides:
    /// - LEDGERFLOW_REDIS_URL: Redis connection URL
    /// - LEDGERFLOW_LOG_LEVEL: Log level (trace/debug/info/warn/error)
    /// - LEDGERFLOW_WORKER_CONCURRENCY: In-flight transfer limit (usize)
    /// - LEDGERFLOW_LOCK_TTL_MS: Lock lease duration (u64)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("LEDGERFLOW_REDIS_URL") {
            tracing::info!("Config override: redis.url = [REDACTED] (from LEDGERFLOW_REDIS_URL)");
            self.redis.url = url;
        }

        if let Ok(level) = std::env::var("LEDGERFLOW_LOG_LEVEL") {
            tracing::info!(
                "Config override: log_level = {} (from LEDGERFLOW_LOG_LEVEL)",
                level
            );
            self.log_level = level;
        }

        if let Ok(concurrency) = std::env::var("LEDGERFLOW_WORKER_CONCURRENCY")
            && let Ok(c) = concurrency.parse::<usize>()
        {
            tracing::info!(
                "Config override: worker.concurrency = {} (from LEDGERFLOW_WORKER_CONCURRENCY)",
                c
            );
            self.worker.concurrency = c;
        }

        if let Ok(ttl) = std::env::var("LEDGERFLOW_LOCK_TTL_MS")
            && let Ok(t) = ttl.parse::<u64>()
        {
            tracing::info!(
                "Config override: engine.ttl_ms = {} (from LEDGERFLOW_LOCK_TTL_MS)",
                t
            );
            self.engine.ttl_ms = t;
        }
    }

    /// Validate configuration at startup
    ///
    /// Returns an error if any critical configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log_level '{}': must be one of {:?}",
                self.log_level,
                valid_levels
            );
        }

        if self.engine.ttl_ms == 0 {
            anyhow::bail!("Invalid engine.ttl_ms: must be > 0");
        }
        if self.engine.max_retry_delay_ms < self.engine.base_retry_delay_ms {
            anyhow::bail!(
                "Invalid engine.max_retry_delay_ms: must be >= base_retry_delay_ms ({} < {})",
                self.engine.max_retry_delay_ms,
                self.engine.base_retry_delay_ms
            );
        }
        if self.engine.tx_max_attempts == 0 {
            anyhow::bail!("Invalid engine.tx_max_attempts: must be > 0");
        }
        if self.engine.balance_scale > 9 {
            anyhow::bail!(
                "Invalid engine.balance_scale: {} exceeds supported precision",
                self.engine.balance_scale
            );
        }

        if self.worker.concurrency == 0 {
            anyhow::bail!("Invalid worker.concurrency: must be > 0");
        }
        if self.worker.queue_size == 0 {
            anyhow::bail!("Invalid worker.queue_size: must be > 0");
        }

        Ok(())
    }
}
