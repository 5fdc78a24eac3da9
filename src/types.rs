use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Dynamic value carried by records, criteria and identities.
///
/// `Array` doubles as the representation of a composite identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
    Uuid(Uuid),
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::String(s) => s.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Array(arr) => arr.hash(state),
            Value::Object(map) => {
                // Sort keys for consistent hashing
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                for (key, value) in entries {
                    key.hash(state);
                    value.hash(state);
                }
            }
            Value::Uuid(u) => u.hash(state),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

/// Identity-friendly formatting: strings are written bare so that
/// `format!("{}", id)` yields the same text a search index stores.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Object(_) => write!(f, "{}", self.to_json()),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Null => write!(f, "null"),
        }
    }
}

// Helper for deterministic ordering of different types
fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::String(_) => 3,
        Value::Uuid(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

impl Value {
    /// Scalars are everything that is not a container and not null.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Null | Value::Array(_) | Value::Object(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Total order used for sorting and range comparisons. Integers and
    /// floats compare numerically; other types fall back to a fixed rank.
    pub fn compare(&self, other: &Value) -> Ordering {
        let self_rank = type_rank(self);
        let other_rank = type_rank(other);

        if self_rank != other_rank {
            return self_rank.cmp(&other_rank);
        }

        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Int(_), Value::Float(_))
            | (Value::Float(_), Value::Int(_))
            | (Value::Float(_), Value::Float(_)) => {
                let a = self.as_f64().unwrap_or(f64::NAN);
                let b = other.as_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }

    /// Recursively converts into a `serde_json::Value`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::String(s) => json!(s),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::Bool(b) => json!(b),
            Value::Uuid(u) => json!(u.to_string()),
            Value::Array(arr) => JsonValue::Array(arr.iter().map(Value::to_json).collect()),
            Value::Object(obj) => {
                let map = obj.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
                JsonValue::Object(map)
            }
        }
    }

    /// Recursively converts from a `serde_json::Value`. Numbers that fit an
    /// `i64` become `Int`, everything else numeric becomes `Float`.
    pub fn from_json(json_value: &JsonValue) -> Value {
        match json_value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(arr) => Value::Array(arr.iter().map(Value::from_json).collect()),
            JsonValue::Object(obj) => Value::Object(
                obj.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(v: HashMap<String, Value>) -> Self {
        Value::Object(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<&JsonValue> for Value {
    fn from(v: &JsonValue) -> Self {
        Value::from_json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_comparison_crosses_int_and_float() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Ordering::Less);
        assert_eq!(Value::Float(3.0).compare(&Value::Int(3)), Ordering::Equal);
        assert_eq!(Value::Null.compare(&Value::Int(0)), Ordering::Less);
    }

    #[test]
    fn display_writes_strings_bare() {
        assert_eq!(Value::from("5:42").to_string(), "5:42");
        assert_eq!(Value::Int(7).to_string(), "7");
    }

    #[test]
    fn json_conversion_keeps_integers() {
        let v = Value::from_json(&json!({"a": 1, "b": [1.5, "x"], "c": null}));
        match v {
            Value::Object(map) => {
                assert_eq!(map["a"], Value::Int(1));
                assert_eq!(
                    map["b"],
                    Value::Array(vec![Value::Float(1.5), Value::from("x")])
                );
                assert!(map["c"].is_null());
            }
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn scalars_exclude_containers() {
        assert!(Value::Int(1).is_scalar());
        assert!(Value::from("a").is_scalar());
        assert!(!Value::Array(vec![Value::Int(1)]).is_scalar());
        assert!(!Value::Null.is_scalar());
    }
}
