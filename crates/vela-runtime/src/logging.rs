#![forbid(unsafe_code)]

//! Structured logging setup.
//!
//! The runtime emits `tracing` events under the `vela_runtime` and
//! `vela_vdom` targets:
//!
//! - `debug` for process spawns and kills, update/render spans, host
//!   requests and dropped messages;
//! - `trace` for every scheduler step and effect dispatch;
//! - `error` when a program halts.
//!
//! With the `tracing-subscriber` feature, [`init_tracing`] installs a global
//! subscriber filtered by the `VELA_LOG` variable (same syntax as
//! `RUST_LOG`). The `tracing-json` feature switches the output to one JSON
//! object per line.

/// Environment variable read by [`init_tracing`].
pub const LOG_ENV: &str = "VELA_LOG";

/// Filter used when `VELA_LOG` is unset or invalid.
pub const DEFAULT_DIRECTIVE: &str = "warn";

/// A global subscriber was already installed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("could not install tracing subscriber: {0}")]
pub struct LoggingError(String);

/// Install the global subscriber with [`DEFAULT_DIRECTIVE`].
#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing() -> Result<(), LoggingError> {
    init_tracing_with(DEFAULT_DIRECTIVE)
}

/// Install the global subscriber, falling back to `default_directive`
/// when `VELA_LOG` does not parse.
#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing_with(default_directive: &str) -> Result<(), LoggingError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Registry, fmt};

    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive));

    #[cfg(feature = "tracing-json")]
    let layer = fmt::layer().json().with_target(true);
    #[cfg(not(feature = "tracing-json"))]
    let layer = fmt::layer().with_target(true);

    Registry::default()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|err| LoggingError(err.to_string()))
}

#[cfg(all(test, feature = "tracing-subscriber"))]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_reported() {
        let _ = init_tracing();
        let err = init_tracing().unwrap_err();
        assert!(err.to_string().starts_with("could not install tracing subscriber"));
    }
}
