//! Tracing subscriber setup for processes embedding the engine.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::HistoryConfig;
use crate::error::{HistoryError, HistoryResult};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,history_engine=debug";

/// Install the global subscriber. `RUST_LOG` overrides `default_filter`.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(default_filter: &str, json: bool) -> HistoryResult<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    result.map_err(|e| HistoryError::Internal(format!("failed to install tracing subscriber: {}", e)))
}

/// Install the global subscriber with [`DEFAULT_FILTER`], emitting JSON when
/// `HISTORY_LOG_JSON` is set.
pub fn init_from_config(config: &HistoryConfig) -> HistoryResult<()> {
    init_tracing(DEFAULT_FILTER, config.log_json)
}
