//! Turn free-form service output into structured JSON.
//!
//! The service may answer with pure JSON, with JSON wrapped in prose or a
//! markdown fence, or with plain text. [`normalize`] never fails: when no
//! JSON can be recovered the raw text is kept and `success` is false.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedResult {
    pub success: bool,
    /// Parsed payload, or an empty object when nothing parsed.
    pub data: Value,
    pub raw_text: String,
}

impl NormalizedResult {
    fn parsed(data: Value, raw: &str) -> Self {
        Self {
            success: true,
            data,
            raw_text: raw.to_string(),
        }
    }

    fn unparsed(raw: &str) -> Self {
        Self {
            success: false,
            data: Value::Object(serde_json::Map::new()),
            raw_text: raw.to_string(),
        }
    }
}

pub fn normalize(raw: &str) -> NormalizedResult {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && (value.is_object() || value.is_array())
    {
        return NormalizedResult::parsed(value, raw);
    }

    match first_embedded_json(trimmed) {
        Some(value) => NormalizedResult::parsed(value, raw),
        None => NormalizedResult::unparsed(raw),
    }
}

/// Limit on full passes over the text. A pass settles every opening bracket
/// it meets outside a string literal, so a further pass is only needed for
/// brackets that earlier passes saw inside a string.
const MAX_SCANS: usize = 8;

/// First balanced `{...}` or `[...]` region of `text` that parses as JSON.
fn first_embedded_json(text: &str) -> Option<Value> {
    let mut spans: HashMap<usize, Option<usize>> = HashMap::new();
    let mut scans = 0;

    for (start, b) in text.bytes().enumerate() {
        if b != b'{' && b != b'[' {
            continue;
        }
        if !spans.contains_key(&start) {
            if scans == MAX_SCANS {
                return None;
            }
            scans += 1;
            settle_spans(text.as_bytes(), start, &mut spans);
        }
        if let Some(Some(end)) = spans.get(&start)
            && let Ok(value) = serde_json::from_str::<Value>(&text[start..*end])
        {
            return Some(value);
        }
    }
    None
}

/// Walk from the opening bracket at `bytes[start]` to the end of input and
/// record, for each opening bracket met outside a string literal, the end of
/// its balanced region. `None` means it never closes or is closed by the
/// wrong bracket. Brackets inside string literals are ignored.
fn settle_spans(bytes: &[u8], start: usize, spans: &mut HashMap<usize, Option<usize>>) {
    let mut stack: Vec<(usize, u8)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => stack.push((i, b'}')),
            b'[' => stack.push((i, b']')),
            b'}' | b']' => match stack.pop() {
                Some((open, close)) if close == b => {
                    spans.insert(open, Some(i + 1));
                }
                // A mismatch poisons every region still open.
                Some((open, _)) => {
                    spans.insert(open, None);
                    for (open, _) in stack.drain(..) {
                        spans.insert(open, None);
                    }
                }
                None => {}
            },
            _ => {}
        }
    }

    for (open, _) in stack {
        spans.insert(open, None);
    }
}
