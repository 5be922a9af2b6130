//! Argument and configuration shape checks.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::{MethodDescriptor, PluginKey};

/// JSON value kinds a schema field may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    /// Any JSON number
    Number,
    /// A number without a fractional part
    Integer,
    Bool,
    Array,
    Object,
    Null,
    Any,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        match (self, Self::of(value)) {
            (Self::Any, _) => true,
            (Self::Number, Self::Integer) => true,
            (expected, actual) => expected == actual,
        }
    }
}

/// One field of an [`ArgSchema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: ValueKind,
    pub required: bool,
}

/// Shape descriptor for a JSON object: field kinds and which fields are required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSchema {
    fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    allow_unknown: bool,
}

impl ArgSchema {
    /// Empty object schema; unknown fields are rejected unless allowed
    pub fn object() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.fields.insert(name.into(), FieldSpec { kind, required: true });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.fields.insert(name.into(), FieldSpec { kind, required: false });
        self
    }

    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldSpec> {
        &self.fields
    }

    /// Check `value`, collecting every violation rather than stopping at the first.
    ///
    /// `null` is treated as an empty object.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<String>> {
        let empty = serde_json::Map::new();
        let object = match value {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(vec![format!(
                    "expected an object, got {:?}",
                    ValueKind::of(other)
                )])
            }
        };

        let mut violations = Vec::new();
        for (name, spec) in &self.fields {
            match object.get(name) {
                None if spec.required => violations.push(format!("missing required field '{name}'")),
                None => {}
                Some(field) if !spec.kind.accepts(field) => violations.push(format!(
                    "field '{name}' must be {:?}, got {:?}",
                    spec.kind,
                    ValueKind::of(field)
                )),
                Some(_) => {}
            }
        }
        if !self.allow_unknown {
            for name in object.keys().filter(|name| !self.fields.contains_key(*name)) {
                violations.push(format!("unknown field '{name}'"));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Schemas registered by the host, overriding those declared by plugins.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: DashMap<(PluginKey, String), ArgSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: PluginKey, method: impl Into<String>, schema: ArgSchema) {
        self.schemas.insert((key, method.into()), schema);
    }

    pub fn remove_plugin(&self, key: &PluginKey) {
        self.schemas.retain(|(plugin, _), _| plugin != key);
    }

    /// Schema in force for a call, if any
    pub fn resolve(&self, key: &PluginKey, method: &MethodDescriptor) -> Option<ArgSchema> {
        self.schemas
            .get(&(key.clone(), method.name.clone()))
            .map(|entry| entry.value().clone())
            .or_else(|| method.schema.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn send_schema() -> ArgSchema {
        ArgSchema::object()
            .required("to", ValueKind::String)
            .required("retries", ValueKind::Integer)
            .optional("priority", ValueKind::Number)
    }

    #[test]
    fn test_valid_arguments_pass() {
        let schema = send_schema();
        assert!(schema.validate(&json!({"to": "ops", "retries": 3})).is_ok());
        assert!(schema
            .validate(&json!({"to": "ops", "retries": 3, "priority": 0.5}))
            .is_ok());
    }

    #[test]
    fn test_all_violations_are_reported() {
        let violations = send_schema()
            .validate(&json!({"retries": "three", "cc": "x"}))
            .unwrap_err();
        assert_eq!(violations.len(), 3);
        assert!(violations.iter().any(|v| v.contains("missing required field 'to'")));
        assert!(violations.iter().any(|v| v.contains("field 'retries'")));
        assert!(violations.iter().any(|v| v.contains("unknown field 'cc'")));
    }

    #[test]
    fn test_null_is_an_empty_object() {
        assert!(ArgSchema::object().validate(&Value::Null).is_ok());
        assert!(send_schema().validate(&Value::Null).is_err());
        assert!(ArgSchema::object().validate(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_registered_schema_overrides_descriptor() {
        let registry = SchemaRegistry::new();
        let key = PluginKey::new("comm", "smtp");
        let descriptor = MethodDescriptor::new("send").with_schema(send_schema());
        assert_eq!(registry.resolve(&key, &descriptor), Some(send_schema()));

        let relaxed = ArgSchema::object().allow_unknown();
        registry.register(key.clone(), "send", relaxed.clone());
        assert_eq!(registry.resolve(&key, &descriptor), Some(relaxed));

        registry.remove_plugin(&key);
        assert_eq!(registry.resolve(&key, &descriptor), Some(send_schema()));
    }
}
