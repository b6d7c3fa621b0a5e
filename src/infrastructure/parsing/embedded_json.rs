//! Embedded JSON state extraction
//!
//! Marketplace pages ship their product model as a JS object literal
//! assigned in an inline script. A prefix regex finds the assignment and a
//! brace matcher cuts out the balanced object, so nested `};` inside strings
//! or sub-objects do not truncate it.

use regex::Regex;
use serde_json::Value;

const MAX_SEARCH_DEPTH: usize = 16;

/// Byte length of the balanced `{...}` / `[...]` starting at `text[0]`.
#[must_use]
pub fn balanced_span(text: &str) -> Option<usize> {
    let mut chars = text.char_indices();
    let (_, first) = chars.next()?;
    if first != '{' && first != '[' {
        return None;
    }

    let mut depth = 1usize;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for (idx, c) in chars {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => in_string = Some(c),
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Every JSON value that follows one of `prefixes` and parses cleanly.
#[must_use]
pub fn find_json_blobs(source: &str, prefixes: &[Regex]) -> Vec<Value> {
    let mut blobs = Vec::new();
    for prefix in prefixes {
        for found in prefix.find_iter(source) {
            let rest = source[found.end()..].trim_start();
            let Some(len) = balanced_span(rest) else {
                continue;
            };
            if let Ok(value) = serde_json::from_str::<Value>(&rest[..len]) {
                blobs.push(value);
            }
        }
    }
    blobs
}

/// First value stored under any of `keys`, trying keys in priority order
/// across all blobs.
#[must_use]
pub fn find_key<'a>(blobs: &'a [Value], keys: &[String]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| blobs.iter().find_map(|blob| search(blob, key, 0)))
}

fn search<'a>(value: &'a Value, key: &str, depth: usize) -> Option<&'a Value> {
    if depth > MAX_SEARCH_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key).filter(|v| !is_blank(v)) {
                return Some(found);
            }
            map.values().find_map(|v| search(v, key, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|v| search(v, key, depth + 1)),
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Scalar as display text.
#[must_use]
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Flattens an object's scalar fields into `key -> text` pairs.
#[must_use]
pub fn scalar_fields(value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| as_text(v).map(|text| (k.clone(), text)))
            .collect(),
        other => as_text(other)
            .map(|text| vec![("value".to_string(), text)])
            .unwrap_or_default(),
    }
}

/// Decodes a JSON string literal body captured by a regex (`\u7ea2` and friends).
#[must_use]
pub fn unescape(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{raw}\"")).unwrap_or_else(|_| raw.to_string())
}
