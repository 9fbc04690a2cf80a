use std::io;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the logging system.
/// `RUST_LOG` wins; otherwise `info`, or `debug` for this crate when verbose.
pub fn init_logger(verbose: bool) {
    let default_directive = if verbose {
        "info,shadow_stream=debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    // A second call is a no-op
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr) // Keep stdout for URLs and command output
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(verbose)
                .compact(),
        )
        .try_init();
}
