//! Diagnostic logging for the engine and CLI.
//!
//! Logs go to stderr and are filtered by `RUST_LOG` (default `warn`). They
//! are separate from the execution trace, which is product output and is
//! always written to the configured trace sink.

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Install the global subscriber.
///
/// `verbose` raises the default level to `info` for this crate when
/// `RUST_LOG` is unset. Calling this twice is a no-op.
pub fn init(format: LogFormat, verbose: bool) {
    let default = if verbose { "warn,windlass=info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Compact => registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
