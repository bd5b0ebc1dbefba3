//! Typed tool argument values.
//!
//! Model-supplied arguments arrive as an opaque JSON blob. They are converted
//! once, at the registry boundary, into [`ToolValue`] so that validation and
//! capability code never handle untyped data.

use std::collections::BTreeMap;

use serde::Serialize;

/// A tagged-union argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Array(Vec<ToolValue>),
    Object(BTreeMap<String, ToolValue>),
}

impl ToolValue {
    /// Name of the runtime type, as used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integers, and floats without a fractional part.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            #[allow(clippy::float_cmp, clippy::cast_precision_loss)]
            Self::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ToolValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, ToolValue>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for ToolValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Number(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&str> for ToolValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl Serialize for ToolValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// The argument object of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ToolArguments(BTreeMap<String, ToolValue>);

impl ToolArguments {
    /// Parse the raw argument blob emitted by the model.
    ///
    /// A blank blob is an empty object; anything else must be a JSON object.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| format!("parse failure: {e}"))?;
        Self::from_json(value)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, String> {
        match ToolValue::from(value) {
            ToolValue::Object(map) => Ok(Self(map)),
            other => Err(format!(
                "parse failure: arguments must be an object, got {}",
                other.type_name()
            )),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ToolValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ToolValue::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(ToolValue::as_i64)
    }

    pub fn get_object(&self, key: &str) -> Option<&BTreeMap<String, ToolValue>> {
        self.get(key).and_then(ToolValue::as_object)
    }

    /// String elements of an array argument; non-string elements are skipped.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        string_list(self.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ToolValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ToolValue) {
        self.0.insert(key.into(), value);
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
    }
}

/// Collect string elements of an optional array value.
pub fn string_list(value: Option<&ToolValue>) -> Vec<String> {
    value
        .and_then(ToolValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(ToolValue::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_object_arguments() {
        let args = ToolArguments::parse(r#"{"query":"milk","top_k":3,"tags":["a",1,"b"]}"#)
            .expect("valid object");
        assert_eq!(args.get_str("query"), Some("milk"));
        assert_eq!(args.get_i64("top_k"), Some(3));
        assert_eq!(args.get_str_list("tags"), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_rejects_malformed_and_non_object() {
        assert!(ToolArguments::parse("{not json").is_err());
        let err = ToolArguments::parse("[1,2]").unwrap_err();
        assert!(err.contains("must be an object"));
    }

    #[test]
    fn test_blank_arguments_are_empty_object() {
        assert!(ToolArguments::parse("  ").unwrap().is_empty());
    }

    #[test]
    fn test_whole_float_counts_as_integer() {
        let value = ToolValue::from(json!(5.0));
        assert_eq!(value.as_i64(), Some(5));
        assert_eq!(ToolValue::from(json!(5.5)).as_i64(), None);
    }

    #[test]
    fn test_json_conversion_preserves_structure() {
        let original = json!({"a": [1, "x", null], "b": {"c": true}});
        let args = ToolArguments::from_json(original.clone()).unwrap();
        assert_eq!(args.to_json(), original);
    }
}
