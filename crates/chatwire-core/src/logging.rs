//! Logging setup and redaction helpers.
//!
//! Key material, session tokens and pairing references must never reach a
//! log line. Wrap them in [`Redacted`], [`RedactedBytes`] or [`RedactedHex`]
//! before handing them to `tracing`.

use crate::client::config::LoggingConfig;
use std::fmt;

/// Install a global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false`
/// if a subscriber was already installed (safe to call repeatedly).
pub fn init(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level)),
        )
        .with_target(config.with_target)
        .try_init()
        .is_ok()
}

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Redact a byte slice, showing only length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a hex or token string, keeping the first and last 4 characters.
pub struct RedactedHex<'a>(pub &'a str);

impl fmt::Display for RedactedHex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        match (s.get(..4), s.get(s.len().saturating_sub(4)..)) {
            (Some(head), Some(tail)) if s.len() > 12 => write!(f, "{head}...{tail}"),
            _ => f.write_str("[REDACTED]"),
        }
    }
}

impl fmt::Debug for RedactedHex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
