//! Output-schema normalization and draft 2020-12 validation.

use serde_json::Value;

const DRAFT_2020_12: &str = "https://json-schema.org/draft/2020-12/schema";

/// Normalizes and validates one command's output schema.
///
/// The schema must be an object schema (`"type": "object"`); `$schema` is
/// pinned to draft 2020-12 (set when absent, rejected when different);
/// `type` values under `properties` are lowercased; finally the document is
/// compiled under draft 2020-12 to prove it is a valid schema.
pub fn normalize_output_schema(mut schema: Value) -> Result<Value, String> {
    let obj = schema
        .as_object_mut()
        .ok_or_else(|| "schema must be a JSON object".to_string())?;

    match obj.get("$schema").and_then(Value::as_str) {
        None => {
            obj.insert("$schema".into(), Value::String(DRAFT_2020_12.into()));
        }
        Some(uri) if uri == DRAFT_2020_12 => {}
        Some(other) => {
            return Err(format!("$schema must be draft 2020-12, got {other}"));
        }
    }

    lowercase_types(&mut schema);

    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {}
        other => {
            return Err(format!(
                "schema type must be \"object\", got {}",
                other.unwrap_or("none")
            ))
        }
    }

    jsonschema::options()
        .with_draft(jsonschema::Draft::Draft202012)
        .build(&schema)
        .map_err(|e| e.to_string())?;

    Ok(schema)
}

/// Lowercases every string `type` field reachable through the schema tree so
/// sloppy catalogs (`STRING`, `Boolean`) still compile.
fn lowercase_types(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(t)) = map.get_mut("type") {
                *t = t.to_ascii_lowercase();
            }
            for v in map.values_mut() {
                lowercase_types(v);
            }
        }
        Value::Array(items) => {
            for v in items {
                lowercase_types(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: missing $schema is pinned; nested type casings are fixed.
    #[test]
    fn normalization_fixes_draft_and_casing() {
        let schema = json!({
            "type": "Object",
            "properties": {
                "ok": {"type": "BOOLEAN"},
                "items": {"type": "ARRAY", "items": {"type": "Number"}}
            }
        });
        let normalized = normalize_output_schema(schema).unwrap();
        assert_eq!(normalized["$schema"], DRAFT_2020_12);
        assert_eq!(normalized["type"], "object");
        assert_eq!(normalized["properties"]["ok"]["type"], "boolean");
        assert_eq!(normalized["properties"]["items"]["items"]["type"], "number");
    }

    /// **Scenario**: invalid schema documents fail compilation.
    #[test]
    fn invalid_schema_rejected() {
        let schema = json!({"type": "object", "properties": {"x": {"type": 12}}});
        assert!(normalize_output_schema(schema).is_err());
        assert!(normalize_output_schema(json!("just a string")).is_err());
        assert!(normalize_output_schema(json!({"type": "array"})).is_err());
    }
}
