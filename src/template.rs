use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%\{\s*([\w.]+)\s*\}").unwrap())
}

// Attribute values are often serialized documents themselves; descending
// into one transparently decodes it first.
fn decode_embedded_json(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    let looks_like_document = (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'));
    if !looks_like_document {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

// Resolve a dotted path against a json tree. An all-digits segment indexes
// an array, any other segment keys into an object; anything else about the
// path makes the whole reference invalid, reported as `None`.
pub fn dig(root: &Value, path: &str) -> Option<Value> {
    let mut current = root.clone();
    for segment in path.split('.') {
        if let Value::String(s) = &current {
            if let Some(decoded) = decode_embedded_json(s) {
                current = decoded;
            }
        }
        let is_index = !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit());
        current = if is_index {
            match &current {
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?.clone(),
                _ => return None,
            }
        } else {
            match &current {
                Value::Object(map) => map.get(segment)?.clone(),
                _ => return None,
            }
        };
    }
    Some(current)
}

fn collect_flat(items: &[Value], quote_strings: bool, out: &mut Vec<String>) {
    for item in items {
        match item {
            Value::Array(inner) => collect_flat(inner, quote_strings, out),
            other => out.push(render(other, quote_strings)),
        }
    }
}

// Canonical text form of a resolved value. Arrays flatten and join with a
// single space so a list of paths becomes separate command arguments.
pub fn render(value: &Value, quote_strings: bool) -> String {
    match value {
        Value::String(s) => {
            if quote_strings {
                Value::String(s.clone()).to_string()
            } else {
                s.clone()
            }
        }
        Value::Array(items) => {
            let mut parts = Vec::new();
            collect_flat(items, quote_strings, &mut parts);
            parts.join(" ")
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// Substitute every `%{dotted.path}` token in `template` from `source`.
// Unresolvable references become the empty string, never an error:
// templates are operator-authored and a missing optional field should
// degrade silently instead of failing the job.
pub fn expand(template: &str, source: &Value, quote_strings: bool) -> String {
    token_regex()
        .replace_all(template, |caps: &regex::Captures| {
            match dig(source, &caps[1]) {
                Some(value) => render(&value, quote_strings),
                None => String::new(),
            }
        })
        .into_owned()
}
