//! Tracing setup for the framepipe binary.

use tracing_subscriber::EnvFilter;

/// Initialize logging to stderr.
///
/// Verbosity 0 logs lifecycle events at info, 1 adds per-file events at
/// debug, 2+ enables trace. `RUST_LOG` overrides the computed filter.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("framepipe={level}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
