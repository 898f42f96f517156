//! Logging setup on top of `tracing-subscriber`.
//!
//! `STEPFLOW_LOG` (an `EnvFilter` directive) wins over `log.level` from the
//! settings. Installing twice is harmless; the second call is a no-op.

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::app::LogSettings;

pub const LOG_ENV: &str = "STEPFLOW_LOG";

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Installs the global subscriber. Returns `false` when another subscriber
/// was already set by someone else.
pub fn init_logging(settings: &LogSettings) -> bool {
    *INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_new(&settings.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let layer: Box<dyn Layer<Registry> + Send + Sync> = if settings.json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(false)
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer().with_target(false).with_filter(filter).boxed()
        };

        let installed = tracing_subscriber::registry().with(layer).try_init().is_ok();
        if installed {
            tracing::debug!(json = settings.json, level = %settings.level, "logging initialised");
        }
        installed
    })
}
