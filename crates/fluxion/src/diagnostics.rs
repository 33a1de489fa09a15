//! `tracing-subscriber` init convenience for examples and tests.
//!
//! Never required by library consumers — every `fluxion` crate logs through
//! `tracing` and is silent without a subscriber installed. This just saves
//! examples/tests from repeating the same three lines.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a `fmt` subscriber reading `RUST_LOG` (defaulting to `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
