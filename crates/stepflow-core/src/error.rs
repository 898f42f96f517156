//! Error types shared across the crate.
//!
//! Failures raised by *user step functions* are not here: those are
//! [`StepError`](crate::domain::StepError) values and feed the retry
//! machine. Everything in this module is infrastructure-level.

use thiserror::Error;

/// Transport / broker level failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker `{broker}` failed to publish after {attempts} attempt(s): {reason}")]
    Transport {
        broker: String,
        attempts: u32,
        reason: String,
    },

    #[error("broker `{0}` is shut down")]
    Closed(String),

    #[error("broker `{broker}` middleware failed: {reason}")]
    Middleware { broker: String, reason: String },

    #[error("failed to encode message: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Message envelope manipulation failures.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid `extra` field: {0}")]
    InvalidExtra(serde_json::Error),
}

/// Cron expression failures.
#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression `{expr}`: {reason}")]
    Invalid { expr: String, reason: String },

    #[error("`{0}` is not a supported interval")]
    UnsupportedInterval(String),
}

/// Errors raised while wiring steps, brokers and settings together.
///
/// 起動時に検出して fail-fast する。
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid setting `{key}`: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("step `{name}` is already registered in group `{group}`")]
    DuplicateStep { name: String, group: String },

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl SetupError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Any stepflow error, for callers that do not care which layer failed.
#[derive(Debug, Error)]
pub enum StepflowError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Setup(#[from] SetupError),
}

pub type Result<T, E = StepflowError> = std::result::Result<T, E>;
