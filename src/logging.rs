//! Console logging setup.
//!
//! `RUST_LOG` wins over the configured level when set. The filter can be
//! changed at runtime with [`set_level`].

use std::sync::OnceLock;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::error::{BusError, BusResult};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER_HANDLE: OnceLock<FilterHandle> = OnceLock::new();

/// Install the global subscriber with `level` as the default filter.
///
/// Fails if a global subscriber is already installed.
pub fn init(level: &str) -> BusResult<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(env) if !env.trim().is_empty() => parse_filter(&env)?,
        _ => parse_filter(level)?,
    };
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|e| BusError::config(format!("logging already initialized: {}", e)))?;

    let _ = FILTER_HANDLE.set(handle);
    Ok(())
}

/// Replace the active filter.
pub fn set_level(level: &str) -> BusResult<()> {
    let filter = parse_filter(level)?;
    let handle = FILTER_HANDLE
        .get()
        .ok_or_else(|| BusError::config("logging is not initialized"))?;
    handle
        .reload(filter)
        .map_err(|e| BusError::config(format!("failed to reload log filter: {}", e)))
}

fn parse_filter(directives: &str) -> BusResult<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|e| BusError::config(format!("invalid log level '{}': {}", directives, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filter() {
        assert!(parse_filter("info").is_ok());
        assert!(parse_filter("voltage_regbus=debug,warn").is_ok());
        assert!(matches!(
            parse_filter("voltage_regbus=loud").unwrap_err(),
            BusError::Config { .. }
        ));
    }

    #[test]
    fn test_set_level_before_init() {
        if FILTER_HANDLE.get().is_none() {
            assert!(set_level("debug").is_err());
        }
    }
}
