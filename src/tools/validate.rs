//! Tool input validation
//!
//! Inputs are checked against the tool's JSON schema. A failing input gets
//! one recovery attempt: properties the schema does not name are stripped
//! and the result is checked again.

use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::{Error, Result};

/// Outcome of a successful validation
#[derive(Debug, Clone, PartialEq)]
pub enum Validated {
    /// Input was valid as given
    Unchanged(Value),
    /// Input became valid once unknown fields were removed
    Stripped { input: Value, removed: Vec<String> },
}

impl Validated {
    pub fn into_input(self) -> Value {
        match self {
            Validated::Unchanged(input) | Validated::Stripped { input, .. } => input,
        }
    }
}

/// Validate `input` against `schema`, stripping unknown top-level fields
/// once if that makes it valid
pub fn validate_input(schema: &Value, input: Value) -> Result<Validated> {
    let validator = validator_for(schema)
        .map_err(|e| Error::Tool(format!("invalid tool schema: {}", e)))?;

    if validator.is_valid(&input) {
        return Ok(Validated::Unchanged(input));
    }

    let errors: Vec<String> = validator
        .iter_errors(&input)
        .map(|err| err.to_string())
        .collect();

    if let Some((stripped, removed)) = strip_unknown(schema, &input) {
        if validator.is_valid(&stripped) {
            debug!("Recovered tool input by stripping {:?}", removed);
            return Ok(Validated::Stripped {
                input: stripped,
                removed,
            });
        }
    }

    Err(Error::Tool(format!(
        "InputValidationError: {}",
        errors.join("; ")
    )))
}

/// Remove properties not named in the schema. `None` if nothing to remove.
fn strip_unknown(schema: &Value, input: &Value) -> Option<(Value, Vec<String>)> {
    let known = schema.get("properties")?.as_object()?;
    let object = input.as_object()?;

    let removed: Vec<String> = object
        .keys()
        .filter(|k| !known.contains_key(*k))
        .cloned()
        .collect();
    if removed.is_empty() {
        return None;
    }

    let kept = object
        .iter()
        .filter(|(k, _)| known.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Some((Value::Object(kept), removed))
}
