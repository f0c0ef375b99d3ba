//! Template substitution over event payloads.
//!
//! Resolves `{/json/pointer}` and `{dot.path}` placeholders against a JSON
//! payload. Unresolved placeholders are preserved byte-for-byte, which keeps
//! rendering re-applicable across chained commands: a later pass with a richer
//! payload can still fill what an earlier pass could not.

use serde_json::Value;

/// Renders `template` against `payload`.
///
/// A placeholder is `{...}` with no nested brace. Paths starting with `/` are
/// JSON pointers; anything else is a dot path whose segments may be object
/// keys or array indices. Leaf values stringify: strings verbatim, scalars via
/// their JSON text, objects and arrays as serialized JSON. Any traversal
/// failure leaves the literal placeholder in place.
pub fn render(template: &str, payload: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            let start = i;
            while i < bytes.len() && bytes[i] != b'{' {
                i += 1;
            }
            out.push_str(&template[start..i]);
            continue;
        }
        match template[i + 1..].find(['{', '}']) {
            // A closing brace with no nested opener: candidate placeholder.
            Some(rel) if template.as_bytes()[i + 1 + rel] == b'}' => {
                let end = i + 1 + rel;
                let path = &template[i + 1..end];
                match resolve(path, payload) {
                    Some(text) => out.push_str(&text),
                    None => out.push_str(&template[i..=end]),
                }
                i = end + 1;
            }
            // Nested `{` or unterminated: emit this brace literally and move on.
            _ => {
                out.push('{');
                i += 1;
            }
        }
    }
    out
}

/// Resolves one placeholder path to its stringified leaf, or `None` when the
/// path is empty, absent, or malformed.
fn resolve(path: &str, payload: &Value) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    let value = if let Some(pointer) = path.strip_prefix('/') {
        if pointer.is_empty() {
            return None;
        }
        payload.pointer(path)?
    } else {
        walk_dot_path(path, payload)?
    };
    Some(stringify(value))
}

/// Walks `a.b.0.c` segments through objects and arrays.
fn walk_dot_path<'a>(path: &str, payload: &'a Value) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
