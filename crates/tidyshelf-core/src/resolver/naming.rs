//! Filesystem-safe path components.
//!
//! Unlike slug-style normalization, library names keep their case, spaces and
//! punctuation; only what Windows or Unix cannot store is removed.

use regex::Regex;
use std::sync::LazyLock;

/// Maximum length of one path component, in characters.
pub const MAX_COMPONENT_LENGTH: usize = 128;

/// Characters reserved on NTFS that must be removed.
const NTFS_RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Reserved device names on Windows NTFS.
const NTFS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

static FRACTIONAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)$").unwrap());

/// Make one path component safe to create on any common filesystem.
///
/// Returns an empty string when nothing usable is left; callers decide
/// whether that is an error or a sentinel.
///
/// ```
/// use tidyshelf_core::resolver::sanitize_component;
///
/// assert_eq!(sanitize_component("Batman: Year One"), "Batman Year One");
/// assert_eq!(sanitize_component("  What If?.. "), "What If");
/// ```
pub fn sanitize_component(name: &str) -> String {
    let mut result: String = name
        .chars()
        .filter(|c| !NTFS_RESERVED_CHARS.contains(c) && !c.is_control())
        .collect();

    result = WHITESPACE_RUN.replace_all(&result, " ").to_string();
    result = result.trim_matches(|c: char| c == '.' || c == ' ').to_string();

    if result.chars().count() > MAX_COMPONENT_LENGTH {
        result = result.chars().take(MAX_COMPONENT_LENGTH).collect();
        result = result.trim_end_matches(|c: char| c == '.' || c == ' ').to_string();
    }

    let stem = result.split('.').next().unwrap_or_default().to_uppercase();
    if NTFS_RESERVED_NAMES.contains(&stem.as_str()) {
        result = format!("{}_", result);
    }

    result
}

/// Zero-pad a number to `width` digits.
///
/// Integers are padded (`3` -> `003`), fractional issues keep their fraction
/// (`12.5` -> `012.5`), anything else is returned sanitized as printed
/// (`Annual 1`). Blank input is the sentinel `0`, padded.
pub fn pad_number(raw: &str, width: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return format!("{:0width$}", 0, width = width);
    }
    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return pad_digits(trimmed, width);
    }
    if let Some(caps) = FRACTIONAL.captures(trimmed) {
        return format!("{}.{}", pad_digits(&caps[1], width), &caps[2]);
    }
    sanitize_component(trimmed)
}

/// Pad an all-digit string without going through an integer type, so numbers
/// of any length keep every digit.
fn pad_digits(digits: &str, width: usize) -> String {
    let significant = digits.trim_start_matches('0');
    let significant = if significant.is_empty() { "0" } else { significant };
    format!("{:0>width$}", significant, width = width)
}

/// Lowercase extension without the leading dot.
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_removes_reserved_chars() {
        assert_eq!(sanitize_component("AC/DC: Live"), "ACDC Live");
        assert_eq!(sanitize_component("Who?  Me*"), "Who Me");
        assert_eq!(sanitize_component("..."), "");
    }

    #[test]
    fn test_sanitize_keeps_case_and_unicode() {
        assert_eq!(sanitize_component("Ōoku: The Inner Chambers"), "Ōoku The Inner Chambers");
    }

    #[test]
    fn test_sanitize_reserved_device_names() {
        assert_eq!(sanitize_component("con"), "con_");
        assert_eq!(sanitize_component("Console"), "Console");
    }

    #[test]
    fn test_sanitize_caps_length_on_char_boundary() {
        let long = "é".repeat(300);
        let result = sanitize_component(&long);
        assert_eq!(result.chars().count(), MAX_COMPONENT_LENGTH);
    }

    #[test]
    fn test_pad_number() {
        assert_eq!(pad_number("1", 3), "001");
        assert_eq!(pad_number("12.5", 3), "012.5");
        assert_eq!(pad_number("", 2), "00");
        assert_eq!(pad_number("1234", 3), "1234");
        assert_eq!(pad_number("Annual 1", 3), "Annual 1");
        assert_eq!(pad_number("0007", 3), "007");
        assert_eq!(pad_number("000", 3), "000");
    }

    #[test]
    fn test_pad_number_keeps_digits_beyond_integer_range() {
        let huge = "123456789012345678901234567890";
        assert_eq!(pad_number(huge, 3), huge);
        assert_eq!(
            pad_number("98765432109876543210987.5", 3),
            "98765432109876543210987.5"
        );
    }

    #[test]
    fn test_normalize_extension() {
        assert_eq!(normalize_extension(".CBZ"), "cbz");
        assert_eq!(normalize_extension("pdf"), "pdf");
    }
}
