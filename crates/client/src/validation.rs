//! Checks that run before any network call.

use serde_json::{Map, Value};

use clinicsync_core::errors::{Error, Result};

/// Per-type payload check supplied by the host application.
pub trait ResourceValidator: Send + Sync {
    fn validate(&self, data: &Map<String, Value>) -> Result<()>;
}

impl<F> ResourceValidator for F
where
    F: Fn(&Map<String, Value>) -> Result<()> + Send + Sync,
{
    fn validate(&self, data: &Map<String, Value>) -> Result<()> {
        self(data)
    }
}

/// Validator requiring every listed field to be present and non-null.
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl ResourceValidator for RequiredFields {
    fn validate(&self, data: &Map<String, Value>) -> Result<()> {
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| matches!(data.get(field.as_str()), None | Some(Value::Null)))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "missing required field(s): {}",
                missing.join(", ")
            )))
        }
    }
}

pub(crate) fn require_object(data: Value) -> Result<Map<String, Value>> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(Error::validation(format!(
            "payload must be a JSON object, got {}",
            match other {
                Value::Null => "null",
                Value::Bool(_) => "a boolean",
                Value::Number(_) => "a number",
                Value::String(_) => "a string",
                Value::Array(_) => "an array",
                Value::Object(_) => "an object",
            }
        ))),
    }
}

pub(crate) fn require_id(id: &str) -> Result<&str> {
    let id = id.trim();
    if id.is_empty() {
        return Err(Error::validation("id must not be empty"));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn required_fields_reports_missing_and_null() {
        let validator = RequiredFields::new(["name", "phone"]);
        let data = json!({ "name": "Ana", "phone": null });
        let err = validator
            .validate(data.as_object().unwrap())
            .unwrap_err();
        assert!(err.to_string().contains("phone"));
        assert!(!err.to_string().contains("name,"));
    }

    #[test]
    fn payload_and_id_checks() {
        assert!(require_object(json!([1, 2])).is_err());
        assert!(require_object(json!({})).is_ok());
        assert!(require_id("  ").is_err());
        assert_eq!(require_id(" p1 ").unwrap(), "p1");
    }
}
