use tracing_subscriber::EnvFilter;

pub const CLIENT: &str = "treesync::client";
pub const SERVER: &str = "treesync::server";
pub const COMMON: &str = "treesync::common";

const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Installs the process-wide subscriber. `RUST_LOG` overrides the default filter.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
