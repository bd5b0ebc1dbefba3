//! Parameter schemas for capabilities.
//!
//! A [`ParameterSchema`] is the object-shaped argument description of one
//! capability. It validates [`ToolArguments`] and renders itself into the
//! JSON-schema fragment expected by chat-completion tool calling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::value::{ToolArguments, ToolValue};
use crate::error::ValidationError;

/// Declared type of a schema property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// Whether a runtime value satisfies this declared type.
    pub fn accepts(self, value: &ToolValue) -> bool {
        match self {
            Self::String => matches!(value, ToolValue::String(_)),
            Self::Integer => value.as_i64().is_some(),
            Self::Number => matches!(value, ToolValue::Integer(_) | ToolValue::Number(_)),
            Self::Boolean => matches!(value, ToolValue::Bool(_)),
            Self::Array => matches!(value, ToolValue::Array(_)),
            Self::Object => matches!(value, ToolValue::Object(_)),
        }
    }
}

/// One property of a parameter schema, possibly nested.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertySchema {
    pub value_type: ValueType,
    pub description: Option<String>,
    pub enum_values: Vec<String>,
    pub items: Option<Box<PropertySchema>>,
    pub properties: BTreeMap<String, PropertySchema>,
    pub required: Vec<String>,
}

impl PropertySchema {
    pub fn new(value_type: ValueType) -> Self {
        Self {
            value_type,
            description: None,
            enum_values: Vec::new(),
            items: None,
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }

    pub fn string() -> Self {
        Self::new(ValueType::String)
    }

    pub fn integer() -> Self {
        Self::new(ValueType::Integer)
    }

    pub fn number() -> Self {
        Self::new(ValueType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(ValueType::Boolean)
    }

    pub fn array(items: PropertySchema) -> Self {
        let mut schema = Self::new(ValueType::Array);
        schema.items = Some(Box::new(items));
        schema
    }

    pub fn object() -> Self {
        Self::new(ValueType::Object)
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn one_of(mut self, values: &[&str]) -> Self {
        self.enum_values = values.iter().map(ToString::to_string).collect();
        self
    }

    /// Add a nested property (object schemas).
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    fn validate(&self, path: &str, value: &ToolValue) -> Result<(), ValidationError> {
        if !self.value_type.accepts(value) {
            return Err(ValidationError::TypeMismatch {
                field: path.to_string(),
                expected: self.value_type.as_str(),
                actual: value.type_name(),
            });
        }

        if !self.enum_values.is_empty() {
            let listed = value
                .as_str()
                .is_some_and(|s| self.enum_values.iter().any(|allowed| allowed == s));
            if !listed {
                return Err(ValidationError::InvalidEnumValue {
                    field: path.to_string(),
                    allowed: self.enum_values.clone(),
                });
            }
        }

        match value {
            ToolValue::Array(elements) => {
                if let Some(items) = &self.items {
                    for (i, element) in elements.iter().enumerate() {
                        items.validate(&format!("{path}[{i}]"), element)?;
                    }
                }
            }
            ToolValue::Object(map) => {
                validate_members(path, &self.required, &self.properties, |name| map.get(name))?;
            }
            _ => {}
        }

        Ok(())
    }

    fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert("type".into(), json!(self.value_type.as_str()));
        if let Some(description) = &self.description {
            out.insert("description".into(), json!(description));
        }
        if !self.enum_values.is_empty() {
            out.insert("enum".into(), json!(self.enum_values));
        }
        if let Some(items) = &self.items {
            out.insert("items".into(), items.to_json());
        }
        if !self.properties.is_empty() {
            out.insert("properties".into(), properties_json(&self.properties));
        }
        if !self.required.is_empty() {
            out.insert("required".into(), json!(self.required));
        }
        serde_json::Value::Object(out)
    }
}

/// The object-shaped argument schema of a capability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSchema {
    pub properties: BTreeMap<String, PropertySchema>,
    pub required: Vec<String>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn required(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        let name = name.into();
        self.required.push(name.clone());
        self.properties.insert(name, schema);
        self
    }

    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, schema: PropertySchema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Check required fields first, then each present property's type and enum.
    pub fn validate(&self, args: &ToolArguments) -> Result<(), ValidationError> {
        validate_members("", &self.required, &self.properties, |name| args.get(name))
    }

    /// Render as the `parameters` object of a function tool definition.
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert("type".into(), json!("object"));
        if !self.properties.is_empty() {
            out.insert("properties".into(), properties_json(&self.properties));
        }
        if !self.required.is_empty() {
            out.insert("required".into(), json!(self.required));
        }
        serde_json::Value::Object(out)
    }
}

fn validate_members<'a>(
    prefix: &str,
    required: &[String],
    properties: &BTreeMap<String, PropertySchema>,
    lookup: impl Fn(&str) -> Option<&'a ToolValue>,
) -> Result<(), ValidationError> {
    let path = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    };

    for name in required {
        if lookup(name).is_none() {
            return Err(ValidationError::MissingRequiredField { field: path(name) });
        }
    }

    for (name, schema) in properties {
        if let Some(value) = lookup(name) {
            schema.validate(&path(name), value)?;
        }
    }

    Ok(())
}

fn properties_json(properties: &BTreeMap<String, PropertySchema>) -> serde_json::Value {
    serde_json::Value::Object(
        properties
            .iter()
            .map(|(name, schema)| (name.clone(), schema.to_json()))
            .collect(),
    )
}
