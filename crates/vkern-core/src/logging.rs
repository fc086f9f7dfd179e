#![forbid(unsafe_code)]

//! Structured logging setup.
//!
//! Library code logs through `tracing` macros only. Binaries (and the test
//! harness) call [`init`] once to install a `tracing-subscriber` formatter
//! filtered by `RUST_LOG`.

pub use tracing::{
    debug, debug_span, error, error_span, info, info_span, trace, trace_span, warn, warn_span,
};

use tracing_subscriber::EnvFilter;

/// Output format for [`init`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per event. Requires the `tracing-json` feature;
    /// falls back to compact output without it.
    Json,
}

/// Default filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,vkern_core=info,vkern_runtime=info";

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = match format {
        #[cfg(feature = "tracing-json")]
        LogFormat::Json => builder.json().try_init(),
        #[cfg(not(feature = "tracing-json"))]
        LogFormat::Json => builder.compact().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    if result.is_err() {
        tracing::trace!("global subscriber already installed");
    }
}
