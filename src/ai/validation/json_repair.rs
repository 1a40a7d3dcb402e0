//! JSON extraction and light repair for model text.
//!
//! Handles the usual formatting noise around a JSON answer:
//! - Markdown code fences (```json ... ```)
//! - Prose before or after the object
//! - Trailing commas
//! - Missing closers at the very end of the text
//!
//! Repairs never invent field values. A truncated answer that still parses
//! after closing its brackets is left for shape validation to reject.

use serde_json::Value;
use tracing::debug;

/// How the JSON was recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Parsed as-is after trimming fences
    Clean,
    /// Cut out of surrounding prose
    Extracted,
    /// Trailing commas removed or closers appended
    Repaired,
}

/// Parse the first JSON value out of a model reply.
///
/// The error is a short diagnostic; callers wrap it with the stage name.
pub fn extract_json(raw: &str) -> std::result::Result<(Value, Recovery), String> {
    let cleaned = strip_code_fences(raw.trim().trim_start_matches('\u{feff}'));

    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return Ok((value, Recovery::Clean));
    }

    let candidate = match slice_outer_json(cleaned) {
        Some(slice) => {
            if let Ok(value) = serde_json::from_str::<Value>(slice) {
                debug!("JSON extracted from surrounding prose");
                return Ok((value, Recovery::Extracted));
            }
            slice
        }
        None => {
            let start = cleaned.find(['{', '[']).ok_or_else(|| {
                "no JSON object or array found in model output".to_string()
            })?;
            &cleaned[start..]
        }
    };

    let repaired = close_open_structures(&remove_trailing_commas(candidate));
    serde_json::from_str::<Value>(&repaired)
        .map(|value| {
            debug!("JSON parsed after repair");
            (value, Recovery::Repaired)
        })
        .map_err(|e| format!("unparseable JSON after repair: {}", e))
}

fn strip_code_fences(s: &str) -> &str {
    let mut out = s;
    if out.starts_with("```") {
        out = match out.find('\n') {
            Some(idx) => &out[idx + 1..],
            None => out.trim_start_matches('`'),
        };
    }
    let trimmed = out.trim_end();
    match trimmed.strip_suffix("```") {
        Some(rest) => rest.trim_end(),
        None => trimmed,
    }
}

/// Slice from the first `{`/`[` to its matching closer, if the text has one.
fn slice_outer_json(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in s[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn remove_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escape = false;

    for (i, &ch) in chars.iter().enumerate() {
        if escape {
            escape = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            ',' if !in_string => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, Some(']') | Some('}')) {
                    continue;
                }
            }
            _ => {}
        }
        out.push(ch);
    }
    out
}

/// Close an unterminated string and any open arrays/objects, innermost first.
fn close_open_structures(s: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for ch in s.chars() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = s.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}
