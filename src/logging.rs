//! Tracing configuration for the sync agent
//!
//! The host application usually owns log files and subscriber installation;
//! this module provides a self-contained console subscriber for standalone
//! use (daemons, integration harnesses). Initialization is guarded so a
//! second call is a no-op rather than a panic.

use once_cell::sync::OnceCell;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

/// Logging configuration for the sync agent.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub level: Level,
    /// Emit JSON structured output instead of human-readable lines.
    pub json_format: bool,
    /// Include span targets in output.
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            with_target: true,
        }
    }
}

/// Install a global tracing subscriber according to `config`.
///
/// `RUST_LOG` takes precedence over `config.level`. Returns `false` if a
/// subscriber was already installed by an earlier call.
pub fn initialize_logging(config: &LoggingConfig) -> bool {
    let mut fresh = false;

    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

        let builder = fmt()
            .with_env_filter(filter)
            .with_target(config.with_target);

        let result = if config.json_format {
            builder.json().try_init()
        } else {
            builder.try_init()
        };

        if let Err(e) = result {
            // A host-installed subscriber wins; ours quietly steps aside.
            eprintln!("attachment-sync logging not installed: {}", e);
        }

        fresh = true;
    });

    fresh
}
