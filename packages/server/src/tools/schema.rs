//! Declarative parameter schemas.
//!
//! A small JSON-schema-like descriptor validated recursively: required
//! fields, types, string length bounds, enums, numeric bounds, array item
//! schemas, object property schemas, and regex patterns. Validation stops
//! at the first violation and reports its path.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl SchemaType {
    fn name(&self) -> &'static str {
        match self {
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Array => "array",
            SchemaType::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => value.is_i64() || value.is_u64(),
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Array => value.is_array(),
            SchemaType::Object => value.is_object(),
        }
    }
}

/// One node of a parameter schema.
#[derive(Debug, Clone)]
pub struct ParamSchema {
    pub schema_type: SchemaType,
    pub enum_values: Option<Vec<Value>>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub items: Option<Box<ParamSchema>>,
    pub properties: BTreeMap<String, ParamSchema>,
    pub required: Vec<&'static str>,
}

impl ParamSchema {
    fn of(schema_type: SchemaType) -> Self {
        Self {
            schema_type,
            enum_values: None,
            minimum: None,
            maximum: None,
            min_length: None,
            max_length: None,
            pattern: None,
            items: None,
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    pub fn string() -> Self {
        Self::of(SchemaType::String)
    }

    pub fn number() -> Self {
        Self::of(SchemaType::Number)
    }

    pub fn integer() -> Self {
        Self::of(SchemaType::Integer)
    }

    pub fn boolean() -> Self {
        Self::of(SchemaType::Boolean)
    }

    pub fn array(items: ParamSchema) -> Self {
        let mut schema = Self::of(SchemaType::Array);
        schema.items = Some(Box::new(items));
        schema
    }

    pub fn object(properties: Vec<(&'static str, ParamSchema)>, required: Vec<&'static str>) -> Self {
        let mut schema = Self::of(SchemaType::Object);
        schema.properties = properties
            .into_iter()
            .map(|(name, prop)| (name.to_string(), prop))
            .collect();
        schema.required = required;
        schema
    }

    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn with_length(mut self, min: usize, max: usize) -> Self {
        self.min_length = Some(min);
        self.max_length = Some(max);
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.minimum = Some(min);
        self.maximum = Some(max);
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self
    }
}

/// First violation found, with a JSON-pointer-ish path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schema violation at {path}: {message}")]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

fn violation(path: &str, message: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        message: message.into(),
    }
}

/// Validate `value` against `schema`, returning the first violation.
pub fn validate(value: &Value, schema: &ParamSchema) -> Result<(), SchemaViolation> {
    validate_at(value, schema, "$")
}

fn validate_at(value: &Value, schema: &ParamSchema, path: &str) -> Result<(), SchemaViolation> {
    if !schema.schema_type.matches(value) {
        return Err(violation(
            path,
            format!("expected {}", schema.schema_type.name()),
        ));
    }

    if let Some(allowed) = &schema.enum_values {
        if !allowed.contains(value) {
            return Err(violation(path, "value not in enum"));
        }
    }

    if let Some(text) = value.as_str() {
        if let Some(min) = schema.min_length {
            if text.chars().count() < min {
                return Err(violation(path, format!("shorter than {} chars", min)));
            }
        }
        if let Some(max) = schema.max_length {
            if text.chars().count() > max {
                return Err(violation(path, format!("longer than {} chars", max)));
            }
        }
        if let Some(pattern) = &schema.pattern {
            let re = Regex::new(pattern)
                .map_err(|e| violation(path, format!("invalid pattern: {}", e)))?;
            if !re.is_match(text) {
                return Err(violation(path, format!("does not match {}", pattern)));
            }
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = schema.minimum {
            if number < min {
                return Err(violation(path, format!("below minimum {}", min)));
            }
        }
        if let Some(max) = schema.maximum {
            if number > max {
                return Err(violation(path, format!("above maximum {}", max)));
            }
        }
    }

    if let (Some(items), Some(array)) = (&schema.items, value.as_array()) {
        for (index, item) in array.iter().enumerate() {
            validate_at(item, items, &format!("{}[{}]", path, index))?;
        }
    }

    if let Some(object) = value.as_object() {
        for name in &schema.required {
            if !object.contains_key(*name) {
                return Err(violation(path, format!("missing required field {}", name)));
            }
        }
        for (name, prop_schema) in &schema.properties {
            if let Some(prop) = object.get(name) {
                validate_at(prop, prop_schema, &format!("{}.{}", path, name))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_schema() -> ParamSchema {
        ParamSchema::object(
            vec![("message", ParamSchema::string().with_length(1, 500))],
            vec!["message"],
        )
    }

    #[test]
    fn accepts_conforming_args() {
        assert!(validate(&json!({"message": "hello"}), &message_schema()).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let err = validate(&json!({}), &message_schema()).unwrap_err();
        assert!(err.message.contains("message"));
    }

    #[test]
    fn rejects_wrong_type() {
        let err = validate(&json!({"message": 5}), &message_schema()).unwrap_err();
        assert_eq!(err.path, "$.message");
        assert!(err.message.contains("string"));
    }

    #[test]
    fn rejects_length_bounds() {
        assert!(validate(&json!({"message": ""}), &message_schema()).is_err());
        let long = "x".repeat(501);
        assert!(validate(&json!({ "message": long }), &message_schema()).is_err());
    }

    #[test]
    fn enum_and_range() {
        let schema = ParamSchema::object(
            vec![
                (
                    "phase",
                    ParamSchema::string().with_enum(vec![json!("day"), json!("night")]),
                ),
                ("count", ParamSchema::integer().with_range(0.0, 10.0)),
            ],
            vec!["phase"],
        );
        assert!(validate(&json!({"phase": "day", "count": 3}), &schema).is_ok());
        assert!(validate(&json!({"phase": "noon"}), &schema).is_err());
        assert!(validate(&json!({"phase": "day", "count": 11}), &schema).is_err());
        assert!(validate(&json!({"phase": "day", "count": 2.5}), &schema).is_err());
    }

    #[test]
    fn array_items_and_nested_objects() {
        let schema = ParamSchema::object(
            vec![(
                "targets",
                ParamSchema::array(ParamSchema::object(
                    vec![("user_id", ParamSchema::string())],
                    vec!["user_id"],
                )),
            )],
            vec!["targets"],
        );
        assert!(validate(&json!({"targets": [{"user_id": "u1"}]}), &schema).is_ok());
        let err = validate(&json!({"targets": [{"user_id": "u1"}, {}]}), &schema).unwrap_err();
        assert_eq!(err.path, "$.targets[1]");
    }

    #[test]
    fn pattern() {
        let schema = ParamSchema::object(
            vec![(
                "event_type",
                ParamSchema::string().with_pattern(r"^[a-z_]+(\.[a-z_]+)*$"),
            )],
            vec!["event_type"],
        );
        assert!(validate(&json!({"event_type": "storyteller.note"}), &schema).is_ok());
        assert!(validate(&json!({"event_type": "Bad Type!"}), &schema).is_err());
    }

    #[test]
    fn first_violation_wins() {
        let schema = ParamSchema::object(
            vec![
                ("a", ParamSchema::string()),
                ("b", ParamSchema::string()),
            ],
            vec!["a", "b"],
        );
        // Both are missing; the reported one is the first required entry.
        let err = validate(&json!({}), &schema).unwrap_err();
        assert!(err.message.contains("a"));
    }
}
