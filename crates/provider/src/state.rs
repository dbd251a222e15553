//! Resource state values
//!
//! State crosses the handler boundary as a dynamic value, encoded as
//! msgpack (or JSON for the CLI and fixtures).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use ruleplane_common::{Error, Result};

/// Dynamic value carried in resource state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum DynamicValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<DynamicValue>),
    Map(HashMap<String, DynamicValue>),
}

impl DynamicValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DynamicValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, DynamicValue>> {
        match self {
            DynamicValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        self.as_map()?.get(key)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }
}

impl From<serde_json::Value> for DynamicValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => DynamicValue::Null,
            serde_json::Value::Bool(b) => DynamicValue::Bool(b),
            serde_json::Value::Number(n) => DynamicValue::Number(n),
            serde_json::Value::String(s) => DynamicValue::String(s),
            serde_json::Value::Array(items) => DynamicValue::List(items.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(map) => {
                DynamicValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<DynamicValue> for serde_json::Value {
    fn from(value: DynamicValue) -> Self {
        match value {
            DynamicValue::Null => serde_json::Value::Null,
            DynamicValue::Bool(b) => serde_json::Value::Bool(b),
            DynamicValue::Number(n) => serde_json::Value::Number(n),
            DynamicValue::String(s) => serde_json::Value::String(s),
            DynamicValue::List(items) => serde_json::Value::Array(items.into_iter().map(Into::into).collect()),
            DynamicValue::Map(map) => serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect()),
        }
    }
}

/// Build a typed value from state
pub fn from_state<T: serde::de::DeserializeOwned>(value: &DynamicValue) -> Result<T> {
    Ok(serde_json::from_value(value.clone().into())?)
}

/// Turn a typed value into state
pub fn to_state<T: Serialize>(value: &T) -> Result<DynamicValue> {
    Ok(serde_json::to_value(value)?.into())
}

/// Drop null map entries at every depth so omitted attributes take their defaults
pub fn prune_nulls(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, prune_nulls(v)))
                .collect(),
        ),
        serde_json::Value::Array(items) => serde_json::Value::Array(items.into_iter().map(prune_nulls).collect()),
        other => other,
    }
}

/// Decode a state value from msgpack bytes
pub fn decode_dynamic_value(data: &[u8]) -> Result<DynamicValue> {
    if data.is_empty() {
        return Ok(DynamicValue::Null);
    }

    let value: serde_json::Value =
        rmp_serde::from_slice(data).map_err(|e| Error::Encoding(format!("invalid msgpack state: {}", e)))?;
    Ok(value.into())
}

/// Encode a state value as msgpack bytes
pub fn encode_dynamic_value(value: &DynamicValue) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| Error::Encoding(format!("cannot encode state: {}", e)))
}

/// Decode a state value from JSON bytes
pub fn decode_json_value(data: &[u8]) -> Result<DynamicValue> {
    if data.is_empty() {
        return Ok(DynamicValue::Null);
    }
    let value: serde_json::Value = serde_json::from_slice(data)?;
    Ok(value.into())
}

/// Encode a state value as JSON bytes
pub fn encode_json_value(value: &DynamicValue) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Helper to extract a string attribute from a DynamicValue
pub fn get_string_attr(value: &DynamicValue, key: &str) -> String {
    value.get(key).and_then(|v| v.as_string()).unwrap_or("").to_string()
}

/// Helper to extract an optional string attribute from a DynamicValue
pub fn get_optional_string_attr(value: &DynamicValue, key: &str) -> Option<String> {
    value.get(key).and_then(|v| match v {
        DynamicValue::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    })
}

/// Helper to extract a required string attribute
pub fn require_string_attr(value: &DynamicValue, key: &str) -> Result<String> {
    get_optional_string_attr(value, key).ok_or_else(|| Error::InvalidConfig(format!("attribute {:?} is required", key)))
}

/// Create a DynamicValue map with the given attributes
pub fn make_state(attrs: Vec<(&str, DynamicValue)>) -> DynamicValue {
    let mut map = HashMap::new();
    for (key, value) in attrs {
        map.insert(key.to_string(), value);
    }
    DynamicValue::Map(map)
}

/// Create a string DynamicValue
pub fn string_value(s: impl Into<String>) -> DynamicValue {
    DynamicValue::String(s.into())
}

/// Create a number DynamicValue from i64
pub fn int_value(n: i64) -> DynamicValue {
    DynamicValue::Number(serde_json::Number::from(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DynamicValue {
        make_state(vec![
            ("name", string_value("r1")),
            ("priority", int_value(100)),
            (
                "rules",
                DynamicValue::List(vec![make_state(vec![
                    ("name", string_value("allow-dns")),
                    ("destination_ports", DynamicValue::List(vec![string_value("53")])),
                ])]),
            ),
            ("description", DynamicValue::Null),
        ])
    }

    #[test]
    fn test_msgpack_preserves_nested_values() {
        let value = sample();
        let bytes = encode_dynamic_value(&value).unwrap();
        assert_eq!(decode_dynamic_value(&bytes).unwrap(), value);
    }

    #[test]
    fn test_empty_and_garbage_input() {
        assert!(decode_dynamic_value(&[]).unwrap().is_null());
        assert!(decode_json_value(&[]).unwrap().is_null());
        assert!(matches!(decode_dynamic_value(&[0xc1]), Err(Error::Encoding(_))));
    }

    #[test]
    fn test_attribute_helpers() {
        let value = sample();
        assert_eq!(get_string_attr(&value, "name"), "r1");
        assert_eq!(get_string_attr(&value, "missing"), "");
        assert_eq!(get_optional_string_attr(&value, "description"), None);
        assert_eq!(value.get("priority").and_then(|v| v.as_i64()), Some(100));
        assert!(require_string_attr(&value, "firewall_id").is_err());
    }

    #[test]
    fn test_prune_nulls_is_recursive() {
        let pruned = prune_nulls(serde_json::json!({
            "name": "r1",
            "description": null,
            "rules": [{"name": "a", "description": null}]
        }));
        assert_eq!(pruned, serde_json::json!({"name": "r1", "rules": [{"name": "a"}]}));
    }
}
