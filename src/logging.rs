//! Structured logging installation (spec §4.7, §B): a JSON-formatted layer
//! writing to `log.json` — the "configured log writer" every `Bus::publish`
//! call writes through — and a human-readable layer to stderr for whoever
//! launched the process, each independently gated by `RUST_LOG`.

use std::path::Path;

use anyhow::Context;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::paths::set_file_mode;

/// A well-known set of noisy messages the underlying HTTP/TLS server emits
/// on ordinary client disconnects (spec §7, error taxonomy item 4). Downgrade
/// these from ERROR to DEBUG at the call site rather than suppressing them
/// outright, so they remain visible with `RUST_LOG=debug`.
pub fn is_routine_tls_noise(message: &str) -> bool {
    const NOISY: &[&str] = &[
        "TLS handshake error",
        "connection reset by peer",
        "unexpected EOF",
    ];
    NOISY.iter().any(|needle| message.contains(needle))
}

/// Log a listener failure at ERROR, or DEBUG if `err`'s message matches the
/// known-noisy set above (spec §7, error taxonomy item 4).
pub fn log_listener_error(err: &dyn std::fmt::Display, context: &str) {
    let message = err.to_string();
    if is_routine_tls_noise(&message) {
        tracing::debug!(error = %message, "{}", context);
    } else {
        tracing::error!(error = %message, "{}", context);
    }
}

/// Install the two-layer subscriber described above. Must run once, before
/// any other module logs.
pub fn install(log_path: &Path) -> anyhow::Result<()> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;
    set_file_mode(log_path)?;

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(log_file)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        );

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        );

    tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_known_noisy_messages() {
        assert!(is_routine_tls_noise(
            "TLS handshake error from 10.0.0.1:4433: EOF"
        ));
        assert!(!is_routine_tls_noise("disk full writing state.json"));
    }
}
