//! Reduction of raw transcoder stderr to a summary safe to persist and show.
//!
//! The raw text can contain absolute paths, URLs with embedded credentials
//! and arbitrary bytes. Only a short, scrubbed tail survives.

use std::borrow::Cow;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Maximum length of a persisted summary, in characters.
pub const MAX_SUMMARY_CHARS: usize = 240;

/// Lines of stderr kept before scrubbing.
const TAIL_LINES: usize = 4;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z][a-z0-9+.-]*://\S+").expect("valid regex")
});

static SECRET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(password|passwd|secret|token|api[_-]?key|key|auth|authorization)\s*[=:]\s*\S+")
        .expect("valid regex")
});

// An absolute path, or one hidden behind the `file:` protocol prefix.
static PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:file:)?(?:/[^\s/:'\x22]+)+/?|[A-Za-z]:\\\S+").expect("valid regex")
});

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Produce a sanitized summary of transcoder stderr.
///
/// `known_dirs` are directories the caller knows may appear in the output
/// (the job workspace, the storage root). They are removed together with
/// whatever follows them up to the next whitespace, colon or quote before
/// the generic path pass runs, so names containing spaces do not leak.
/// Returns a generic message when nothing useful remains.
pub fn sanitize_stderr(raw: &str, known_dirs: &[&Path]) -> String {
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let tail = lines[lines.len().saturating_sub(TAIL_LINES)..].join(" ");

    let scrubbed = strip_known_dirs(&tail, known_dirs);
    let scrubbed = URL_PATTERN.replace_all(&scrubbed, "<url>");
    let scrubbed = SECRET_PATTERN.replace_all(&scrubbed, "$1=<redacted>");
    let scrubbed = PATH_PATTERN.replace_all(&scrubbed, "<path>");
    let printable: String = scrubbed
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = WHITESPACE.replace_all(printable.trim(), " ").into_owned();

    if collapsed.is_empty() {
        return "transcoder exited with an error".to_string();
    }
    truncate_chars(&collapsed, MAX_SUMMARY_CHARS)
}

fn strip_known_dirs<'a>(text: &'a str, known_dirs: &[&Path]) -> Cow<'a, str> {
    let mut dirs: Vec<&str> = known_dirs
        .iter()
        .filter_map(|d| d.to_str())
        .map(|d| d.trim_end_matches('/'))
        .filter(|d| !d.is_empty())
        .collect();
    // Longest first, so a nested directory wins over its parent.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.len()));

    let mut out = Cow::Borrowed(text);
    for dir in dirs {
        let pattern = format!(r"(?:file:)?{}(?:/[^\s:'\x22]*)*", regex::escape(dir));
        match Regex::new(&pattern) {
            Ok(re) => {
                if let Cow::Owned(replaced) = re.replace_all(&out, "<path>") {
                    out = Cow::Owned(replaced);
                }
            }
            Err(e) => tracing::warn!("Failed to build path scrubber: {e}"),
        }
    }
    out
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
