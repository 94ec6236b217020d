//! Small helpers shared by the scheduler, processor and cache

pub mod error;
pub mod id;
pub mod retry;

use sha2::{Digest, Sha256};
use url::Url;

pub use id::{IdGenerator, SequentialIdGenerator, UuidIdGenerator};

/// Extract the rate-limiting domain key from a URL
///
/// Returns the lower-cased host. Strings that do not parse as a URL (or have
/// no host) are used verbatim, lower-cased, so every input maps to a bucket.
pub fn extract_domain(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.to_lowercase(),
            None => url.to_lowercase(),
        },
        Err(_) => url.to_lowercase(),
    }
}

/// Hex SHA-256 of a page body, stored alongside cache entries
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Render a byte count with a binary unit, e.g. `1.50 KB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Shorten `text` to at most `max_chars` characters, ending in `...` when cut
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Milliseconds in a duration, saturating at `u64::MAX`
pub fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
