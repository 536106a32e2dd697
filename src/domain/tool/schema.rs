use jsonschema::error::ValidationErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Argument validation against a tool's input schema
// ---------------------------------------------------------------------------

/// A single argument problem reported back to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub field: String,
    pub reason: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Violation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Reported against the argument object as a whole.
pub const ARGUMENTS_FIELD: &str = "(arguments)";

/// Check `args` against `schema`, returning every violation found.
///
/// A `null` argument object is treated as `{}` and top-level `null` values
/// as omitted, which is how agents tend to spell "not provided".
pub fn validate(schema: &Value, args: &Value) -> Vec<Violation> {
    let validator = match jsonschema::Validator::new(schema) {
        Ok(validator) => validator,
        Err(e) => return vec![Violation::new(ARGUMENTS_FIELD, format!("invalid tool schema: {e}"))],
    };

    let args = without_nulls(args);
    if validator.is_valid(&args) {
        return Vec::new();
    }
    validator.iter_errors(&args).map(violation_from).collect()
}

fn without_nulls(args: &Value) -> Value {
    match args {
        Value::Null => Value::Object(serde_json::Map::new()),
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn violation_from(error: jsonschema::ValidationError<'_>) -> Violation {
    if let ValidationErrorKind::Required { property } = &error.kind {
        let field = property.as_str().map(String::from).unwrap_or_else(|| property.to_string());
        return Violation::new(field, "is required");
    }

    let pointer = error.instance_path.to_string();
    let field = pointer.trim_start_matches('/').replace('/', ".");
    let field = if field.is_empty() {
        ARGUMENTS_FIELD.to_string()
    } else {
        field
    };
    Violation::new(field, error.to_string())
}
