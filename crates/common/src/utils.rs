//! Utility functions for Caption Studio
//!
//! This module provides small formatting helpers used in logs and CLI output.

use std::path::Path;
use std::time::Duration;

/// Formats a byte size into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.0 KiB");
/// assert_eq!(format_bytes(1048576), "1.0 MiB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.1} {}", value, UNITS[unit])
}

/// Formats a duration into a human-readable string
///
/// # Examples
///
/// ```
/// use common::utils::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();

    if total_secs == 0 {
        return format!("{}ms", duration.subsec_millis());
    }

    let hours = total_secs / (60 * 60);
    let minutes = (total_secs % (60 * 60)) / 60;
    let seconds = total_secs % 60;

    let mut result = String::new();

    if hours > 0 {
        result.push_str(&format!("{}h ", hours));
    }

    if minutes > 0 || !result.is_empty() {
        result.push_str(&format!("{}m ", minutes));
    }

    result.push_str(&format!("{}s", seconds));

    result
}

/// Truncates a string to a maximum number of characters, adding an ellipsis if truncated
///
/// # Examples
///
/// ```
/// use common::utils::truncate_string;
///
/// assert_eq!(truncate_string("Hello, world!", 5), "Hello...");
/// assert_eq!(truncate_string("Hello", 10), "Hello");
/// ```
pub fn truncate_string(s: &str, max_length: usize) -> String {
    match s.char_indices().nth(max_length) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}

/// Parses a string into a boolean value
///
/// # Examples
///
/// ```
/// use common::utils::parse_bool;
///
/// assert_eq!(parse_bool("true"), true);
/// assert_eq!(parse_bool("1"), true);
/// assert_eq!(parse_bool("no"), false);
/// ```
pub fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "true" | "yes" | "y" | "1" | "on" | "enable" | "enabled"
    )
}

/// Size of a file in bytes, or zero if it cannot be read
pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(7)), "7s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate_string("héllo wörld", 4), "héll...");
    }

    #[test]
    fn test_file_size_missing() {
        assert_eq!(file_size(Path::new("/definitely/not/here.bin")), 0);
    }
}
