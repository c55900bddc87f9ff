//! Tracing subscriber initialisation.

use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Install a global fmt subscriber. `RUST_LOG` wins over the configured
/// level. Safe to call more than once; only the first call takes effect.
pub fn init_tracing(config: &LoggingConfig) {
    let level = config.level.clone();
    let json = config.json;
    INIT.call_once(move || {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let result = if json {
            fmt()
                .with_env_filter(filter)
                .with_target(true)
                .json()
                .try_init()
        } else {
            fmt().with_env_filter(filter).with_target(true).try_init()
        };
        if let Err(e) = result {
            eprintln!("tracing subscriber already installed: {}", e);
        }
    });
}

/// Quiet subscriber for tests; output is captured by the test harness
pub fn init_test_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
