//! `tracing` setup (§8.1): an `EnvFilter` seeded from `RUST_LOG` (default
//! `info`), with a human/JSON format switch mirroring the reference
//! binaries this product already ships.

use std::fmt::Write as _;

use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Human => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

/// Renders an error together with its full `source()` chain on one line,
/// for a single structured log field.
pub fn err_with_src(error: &(dyn std::error::Error + 'static)) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(err) = source {
        let _ = write!(out, ": {err}");
        source = err.source();
    }
    out
}
