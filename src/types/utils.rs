//! Shared text helpers used by context projection and logging.
//!
//! ## Bounded Text
//!
//! - `truncate_chars` - Cut on a char boundary with an ellipsis marker
//! - `bounded_list` - Render at most N items, each at most M chars
//! - `preview` - Single-line diagnostic preview of raw model text

use crate::types::{LoomError, Result};

// =============================================================================
// String Utilities
// =============================================================================

/// Truncate `s` to at most `max_chars` characters.
///
/// Appends `…` when anything was cut, so the marker itself counts toward
/// the limit.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars - 1).collect();
    out.push('…');
    out
}

/// Single-line preview for log output.
#[inline]
pub fn preview(s: &str, max_chars: usize) -> String {
    truncate_chars(&s.replace(['\n', '\r'], " "), max_chars)
}

/// Render a bulleted list bounded in both item count and item length.
///
/// When items are dropped a trailing line reports how many.
pub fn bounded_list<I, S>(items: I, max_items: usize, max_item_chars: usize) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    let mut omitted = 0usize;
    for (i, item) in items.into_iter().enumerate() {
        if i >= max_items {
            omitted += 1;
            continue;
        }
        out.push_str("- ");
        out.push_str(&truncate_chars(item.as_ref().trim(), max_item_chars));
        out.push('\n');
    }
    if omitted > 0 {
        out.push_str(&format!("- ({} more omitted)\n", omitted));
    }
    out
}

/// Capitalize the first character of a string.
#[inline]
pub fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

// =============================================================================
// Validation Helpers
// =============================================================================

/// Require a non-blank string field.
pub fn require_text(stage: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(LoomError::malformed(
            stage,
            format!("required field '{}' is empty", field),
        ));
    }
    Ok(())
}

/// Require a non-empty list field.
pub fn require_items<T>(stage: &str, field: &str, items: &[T]) -> Result<()> {
    if items.is_empty() {
        return Err(LoomError::malformed(
            stage,
            format!("required list '{}' is empty", field),
        ));
    }
    Ok(())
}
