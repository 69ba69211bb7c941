//! Tracing setup and secret redaction
//!
//! Everything that may end up in a log line or in front of a user (remote error
//! strings, paths, libssh2 messages) goes through [`sanitize`] first.

use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum line length before truncation
const MAX_LINE_LENGTH: usize = 2048;

/// Maximum length of an error message surfaced to the presentation layer
const MAX_ERROR_MESSAGE_LENGTH: usize = 200;

/// Default filter when neither RUST_LOG nor settings provide one
pub const DEFAULT_LOG_FILTER: &str = "rombridge=info,warn";

/// Sensitive patterns to redact
static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // SSH private key blocks
        r"(?s)-----BEGIN[^-]*PRIVATE KEY-----.*?-----END[^-]*PRIVATE KEY-----",
        r"(?s)-----BEGIN[^-]*KEY-----.*?-----END[^-]*KEY-----",
        // Authorization headers
        r"(?i)authorization\s*:\s*bearer\s+[^\s]+",
        r"(?i)authorization\s*:\s*basic\s+[^\s]+",
        // Generic secrets by key name (key=value patterns)
        r#"(?i)(password|passwd|pwd|secret|token|api[_-]?key|private[_-]?key|passphrase)\s*[:=]\s*["']?[^\s"']+["']?"#,
        // Long base64 strings (key material, tokens)
        r"[A-Za-z0-9+/]{64,}={0,2}",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Sanitize a string by removing sensitive information
pub fn sanitize(input: &str) -> String {
    let mut result = input.to_string();

    for pattern in SENSITIVE_PATTERNS.iter() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    truncate_chars(result, MAX_LINE_LENGTH, "... [truncated]")
}

/// Sanitize and shorten an error message before it leaves the crate
pub fn sanitize_error_message(msg: &str) -> String {
    truncate_chars(sanitize(msg), MAX_ERROR_MESSAGE_LENGTH, "...")
}

fn truncate_chars(input: String, max: usize, marker: &str) -> String {
    if input.chars().count() <= max {
        return input;
    }
    let mut truncated: String = input.chars().take(max).collect();
    truncated.push_str(marker);
    truncated
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Calling this twice is harmless;
/// the second call is ignored.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
