//! Output contracts ("tools") that force structured backend output.

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};

use super::message::ToolCall;

/// Optional schema attached to a run's model call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContract {
    pub id: String,
    /// Name used to force the backend into this contract.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema the call arguments must satisfy.
    pub schema: serde_json::Value,
}

/// Collaborator request to register a tool contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewToolContract {
    pub name: String,
    pub description: Option<String>,
    pub schema: serde_json::Value,
}

impl NewToolContract {
    pub fn new(name: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: None,
            schema,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Name must be a usable function identifier and the schema must compile.
    pub fn validate(&self) -> Result<(), String> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err("tool name must not be empty".to_string());
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(format!(
                "tool name `{name}` may only contain ASCII letters, digits, `_` and `-`"
            ));
        }
        if !self.schema.is_object() {
            return Err(format!("tool `{name}` schema must be a JSON object"));
        }
        JSONSchema::compile(&self.schema)
            .map(|_| ())
            .map_err(|error| format!("tool `{name}` schema does not compile: {error}"))
    }
}

impl ToolContract {
    /// Check one argument object against the contract schema.
    pub fn validate_arguments(&self, arguments: &serde_json::Value) -> Result<(), String> {
        let compiled = JSONSchema::compile(&self.schema)
            .map_err(|error| format!("tool `{}` schema does not compile: {error}", self.name))?;
        let outcome = compiled.validate(arguments).map_err(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{path}: {error}")
                    }
                })
                .collect::<Vec<_>>()
                .join("; ")
        });
        outcome
    }

    /// Accept the calls if at least one targets this contract with valid arguments.
    ///
    /// Returns the violation reason otherwise.
    pub fn check_calls(&self, calls: &[ToolCall]) -> Result<(), String> {
        if calls.is_empty() {
            return Err(format!(
                "tool `{}` expected a structured call, backend returned none",
                self.name
            ));
        }
        let mut rejections = Vec::new();
        for call in calls {
            if call.name != self.name {
                rejections.push(format!("call `{}` targets unknown tool `{}`", call.id, call.name));
                continue;
            }
            match self.validate_arguments(&call.arguments) {
                Ok(()) => return Ok(()),
                Err(reason) => rejections.push(format!("call `{}`: {reason}", call.id)),
            }
        }
        Err(format!(
            "no call satisfies tool `{}`: {}",
            self.name,
            rejections.join(" | ")
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn contract() -> ToolContract {
        ToolContract {
            id: "tool-1".to_string(),
            name: "extract_city".to_string(),
            description: None,
            schema: json!({
                "type": "object",
                "properties": {
                    "city": { "type": "string" },
                    "population": { "type": "integer" }
                },
                "required": ["city"]
            }),
        }
    }

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    #[test]
    fn empty_calls_violate_contract() {
        let error = contract().check_calls(&[]).err().unwrap_or_default();
        assert!(error.contains("returned none"), "{error}");
    }

    #[test]
    fn matching_call_satisfies_contract() {
        let calls = [call("extract_city", json!({ "city": "Lyon", "population": 500_000 }))];
        assert_eq!(contract().check_calls(&calls), Ok(()));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let calls = [call("extract_city", json!({ "population": 3 }))];
        let error = contract().check_calls(&calls).err().unwrap_or_default();
        assert!(error.contains("city"), "{error}");
    }

    #[test]
    fn call_for_other_tool_is_rejected() {
        let calls = [call("weather", json!({ "city": "Lyon" }))];
        let error = contract().check_calls(&calls).err().unwrap_or_default();
        assert!(error.contains("unknown tool"), "{error}");
    }

    #[test]
    fn new_contract_requires_object_schema_and_clean_name() {
        assert!(NewToolContract::new("ok_name", json!({ "type": "object" })).validate().is_ok());
        assert!(NewToolContract::new("bad name", json!({ "type": "object" })).validate().is_err());
        assert!(NewToolContract::new("ok", json!("string")).validate().is_err());
        assert!(NewToolContract::new("ok", json!({ "type": 12 })).validate().is_err());
    }
}
