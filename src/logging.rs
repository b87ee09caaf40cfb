//! Tracing bootstrap for app binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with the `MESHAPP_LOG` environment variable.
///
/// Defaults to "info" level if `MESHAPP_LOG` is not set. Call once from the
/// app's main before constructing anything that logs.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("MESHAPP_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
