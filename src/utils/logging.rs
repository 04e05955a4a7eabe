//! Tracing setup for host processes embedding the gateway

use tracing_subscriber::EnvFilter;

/// Install a global tracing subscriber honoring `RUST_LOG`, defaulting to
/// warnings plus the gateway's own info-level events. Safe to call more
/// than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,passerelle=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
