//! Tracing/logging setup for embedding hosts.
//!
//! The crate itself only emits `tracing` events and spans; where they go
//! is the host's decision. Hosts that don't install their own subscriber
//! can call [`setup_tracing`] once at startup.

use tracing::level_filters::LevelFilter;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

/// Install a stdout fmt subscriber as the global default.
///
/// The filter can be overridden with the `ITERFLOW_LOG` env var; see
/// tracing-subscriber's `EnvFilter` docs for the syntax, e.g.
///
/// ```text
/// ITERFLOW_LOG="iterflow=debug,error"
/// ```
///
/// Falls back to `log_level` when the var is unset.
pub fn setup_tracing(log_level: LevelFilter) -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::try_from_env("ITERFLOW_LOG")
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let fmt = tracing_subscriber::fmt::layer().with_filter(filter);
    let subscriber = tracing_subscriber::registry().with(fmt);

    tracing::subscriber::set_global_default(subscriber)
}

#[test]
fn global_default_installs_only_once() {
    let _ = setup_tracing(LevelFilter::ERROR);

    let found = setup_tracing(LevelFilter::ERROR);
    assert!(found.is_err());
}
