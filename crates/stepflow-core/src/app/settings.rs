//! Settings - 設定の読み込みと検証
//!
//! Layering (later wins):
//! 1. built-in defaults,
//! 2. `stepflow.toml` in each search directory (optional),
//! 3. environment variables `STEPFLOW__<SECTION>__<KEY>`, e.g. `STEPFLOW__WORKERS__MAX=8`.
//!
//! The double underscore after the prefix keeps `STEPFLOW_LOG` (the log
//! filter) out of the settings tree.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::domain::Backoff;
use crate::error::SetupError;
use crate::ports::BrokerOptions;
use crate::ports::broker::MAX_POLL_INTERVAL;

pub const SETTINGS_FILE: &str = "stepflow.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Workers per step when the step does not say.
    #[serde(rename = "default")]
    pub default_count: usize,
    /// Hard upper bound; larger requests are clamped.
    pub max: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            default_count: 1,
            max: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishRetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for PublishRetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub poll_interval_ms: u64,
    pub publish_retry: PublishRetrySettings,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            publish_retry: PublishRetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive used when `STEPFLOW_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub workers: WorkerSettings,
    pub broker: BrokerSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Loads defaults, then `stepflow.toml` from `search_dirs`, then the environment.
    pub fn load(search_dirs: &[PathBuf]) -> Result<Self, SetupError> {
        Self::load_with(search_dirs, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix("STEPFLOW")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn load_with(search_dirs: &[PathBuf], env: Environment) -> Result<Self, SetupError> {
        let mut builder = Config::builder();
        for dir in search_dirs {
            builder = builder.add_source(File::from(dir.join(SETTINGS_FILE)).required(false));
        }
        builder = builder.add_source(env);

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        if self.workers.max == 0 {
            return Err(SetupError::invalid("workers.max", "must be at least 1"));
        }
        if self.workers.default_count == 0 {
            return Err(SetupError::invalid("workers.default", "must be at least 1"));
        }
        if self.workers.default_count > self.workers.max {
            return Err(SetupError::invalid(
                "workers.default",
                format!("must not exceed workers.max ({})", self.workers.max),
            ));
        }
        let max_poll = MAX_POLL_INTERVAL.as_millis() as u64;
        if !(1..=max_poll).contains(&self.broker.poll_interval_ms) {
            return Err(SetupError::invalid(
                "broker.poll_interval_ms",
                format!("must be within 1..={max_poll}"),
            ));
        }
        let retry = &self.broker.publish_retry;
        if retry.max_attempts == 0 {
            return Err(SetupError::invalid(
                "broker.publish_retry.max_attempts",
                "must be at least 1",
            ));
        }
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(SetupError::invalid(
                "broker.publish_retry.multiplier",
                "must be a finite number >= 1.0",
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.broker.poll_interval_ms)
    }

    /// Broker options preloaded with the configured poll interval.
    pub fn broker_options(&self, name: impl Into<String>) -> BrokerOptions {
        BrokerOptions::new(name).poll_interval(self.poll_interval())
    }

    pub fn publish_backoff(&self) -> Backoff {
        let retry = &self.broker.publish_retry;
        Backoff {
            max_attempts: retry.max_attempts,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            multiplier: retry.multiplier,
            jitter: false,
        }
    }

    /// Clamps a requested worker count into `1..=workers.max`.
    /// `None` or `0` means the configured default.
    pub fn resolve_workers(&self, requested: Option<usize>) -> usize {
        let requested = requested
            .filter(|n| *n > 0)
            .unwrap_or(self.workers.default_count);
        requested.min(self.workers.max)
    }
}
