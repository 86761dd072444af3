//! Tracing setup for the demo binary.
//!
//! Reads `RUST_LOG`, defaulting to `info`. Output goes to stderr so the final
//! report on stdout stays machine-readable.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let compact_layer = (!json).then(|| fmt::layer().with_writer(std::io::stderr).compact());

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(compact_layer)
        .init();
}
