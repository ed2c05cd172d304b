//! Tracing setup
//!
//! The engine logs through `tracing`; embedding applications usually
//! install their own subscriber. This helper covers binaries and tests.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber honoring `RUST_LOG`. Safe to call more
/// than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .try_init();
}
