//! Filename and metadata value checks.

use std::sync::LazyLock;

use regex::Regex;
use transforge_common::ValidationError;

/// Longest accepted filename, in bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

/// Longest accepted metadata value, in characters.
pub const MAX_METADATA_CHARS: usize = 256;

/// Any character allowed, except control characters, path separators and
/// the bidirectional overrides that can disguise an extension.
static FILENAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\p{Cc}/\\\x{202A}-\x{202E}\x{2066}-\x{2069}]+$").expect("valid regex")
});

/// Validate a single path segment.
///
/// Non-ASCII names such as `Café Übersicht.mov` or `東京.mp4` are accepted.
/// Names starting with `-` (could be read as a flag) or `.` (hidden files,
/// `.`/`..`) are rejected, as is anything over [`MAX_FILENAME_BYTES`].
pub fn validate_filename(name: &str) -> Result<(), ValidationError> {
    let invalid = || ValidationError::InvalidFilename(printable(name));

    if name.is_empty() || name.len() > MAX_FILENAME_BYTES {
        return Err(invalid());
    }
    if name.starts_with('-') || name.starts_with('.') || name.trim() != name {
        return Err(invalid());
    }
    if !FILENAME_PATTERN.is_match(name) {
        return Err(invalid());
    }
    Ok(())
}

/// Validate a free-text value destined for a container metadata field.
pub fn validate_metadata_value(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.chars().count() > MAX_METADATA_CHARS || value.chars().any(char::is_control) {
        return Err(ValidationError::InvalidMetadata(field));
    }
    Ok(())
}

/// Render a rejected name with control characters escaped so it can be
/// echoed back safely.
fn printable(name: &str) -> String {
    let mut out: String = name.chars().take(64).flat_map(char::escape_default).collect();
    if name.chars().count() > 64 {
        out.push_str("...");
    }
    out
}
