//! Recover a JSON object from noisy worker output.
//!
//! The worker CLI prints free-form commentary and finishes with a JSON
//! object, but nothing stops it from emitting `{...}` snippets in prose
//! before the real payload. The extractor first tries a strict parse of
//! the whole (trimmed) text; failing that it anchors on the *last* `}`
//! and walks `{` positions right to left before it, returning the first
//! candidate slice that parses. That finds the last balanced object even
//! when it contains nested braces or brace characters inside strings.

use serde_json::Value;

use crate::errors::StageError;

/// Extract the final JSON object embedded in `text`.
pub fn extract_json(text: &str) -> Result<Value, StageError> {
    let trimmed = text.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Ok(value);
        }
    }

    let bytes = trimmed.as_bytes();
    let last_close = match bytes.iter().rposition(|&b| b == b'}') {
        Some(pos) => pos,
        None => return Err(StageError::NoJsonFound),
    };

    for open in (0..last_close).rev() {
        if bytes[open] != b'{' {
            continue;
        }
        if !trimmed.is_char_boundary(open) {
            continue;
        }
        let candidate = &trimmed[open..=last_close];
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }

    Err(StageError::NoJsonFound)
}

/// Extract from stdout, falling back to stderr. Stages use this after a
/// worker exits non-zero: a parseable object on either stream is still a
/// result.
pub fn extract_json_either(stdout: &str, stderr: &str) -> Result<Value, StageError> {
    extract_json(stdout).or_else(|_| extract_json(stderr))
}
