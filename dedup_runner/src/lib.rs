// dedup_runner/src/lib.rs
pub mod acceptor;
pub mod config;
pub mod connection;
pub mod dedup_set;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod registry;
pub mod reporter;
pub mod server;
pub mod sink;
pub mod stats;
pub mod throttle;
pub mod validator;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use lifecycle::LifecycleState;
pub use server::Server;
pub use stats::StatsSnapshot;
pub use validator::{classify, Classification};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the stderr subscriber shared by the binaries. `RUST_LOG` wins over
/// `default_filter`. Safe to call more than once.
pub fn init_tracing(default_filter: &str) {
    let result = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .try_init();

    match result {
        Ok(_) => tracing::debug!("logging initialized"),
        Err(_) => tracing::warn!("logging already initialized, skipping"),
    }
}
