use crate::dal::Record;
use crate::error::{QuarryError, Result};
use crate::filter::DEFAULT_IDENTITY_FIELD;
use crate::types::Value;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Int,
    Float,
    Boolean,
    /// Unix seconds or an RFC 3339 timestamp.
    Time,
    Uuid,
    Array,
    Object,
    Raw,
}

impl FieldType {
    /// Convert `value` into this type, failing when it cannot be represented.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        let invalid = |v: &Value| {
            QuarryError::InvalidValue(format!("cannot convert {} to {:?}", v, self))
        };

        match self {
            FieldType::String => match value {
                Value::String(_) => Ok(value),
                ref v if v.is_scalar() => Ok(Value::String(v.to_string())),
                v => Err(invalid(&v)),
            },
            FieldType::Int => value.as_i64().map(Value::Int).ok_or_else(|| invalid(&value)),
            FieldType::Float => value.as_f64().map(Value::Float).ok_or_else(|| invalid(&value)),
            FieldType::Boolean => value.as_bool().map(Value::Bool).ok_or_else(|| invalid(&value)),
            FieldType::Time => match parse_time(&value) {
                Some(_) => Ok(value),
                None => Err(invalid(&value)),
            },
            FieldType::Uuid => match value {
                Value::Uuid(_) => Ok(value),
                Value::String(ref s) => match Uuid::parse_str(s) {
                    Ok(u) => Ok(Value::Uuid(u)),
                    Err(_) => Err(invalid(&value)),
                },
                ref v => Err(invalid(v)),
            },
            FieldType::Array => match value {
                Value::Array(_) => Ok(value),
                v => Ok(Value::Array(vec![v])),
            },
            FieldType::Object => match value {
                Value::Object(_) => Ok(value),
                v => Err(invalid(&v)),
            },
            FieldType::Raw => Ok(value),
        }
    }
}

/// Parses a TTL/time value. Zero, empty and boolean values mean "no time".
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Int(secs) if *secs > 0 => Utc.timestamp_opt(*secs, 0).single(),
        Value::Float(secs) if *secs > 0.0 => {
            let whole = secs.trunc() as i64;
            let nanos = (secs.fract() * 1e9) as u32;
            Utc.timestamp_opt(whole, nanos).single()
        }
        Value::String(s) if !s.is_empty() => match s.parse::<i64>() {
            Ok(secs) => parse_time(&Value::Int(secs)),
            Err(_) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        },
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            default_value: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}

/// Schema and index configuration for one record type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
    pub identity_field: String,
    pub identity_field_type: FieldType,
    #[serde(default)]
    pub index_name: Option<String>,
    #[serde(default)]
    pub aggregator_name: Option<String>,
    /// Ordered fields forming a composite identity in the search index.
    #[serde(default)]
    pub index_compound_fields: Vec<String>,
    #[serde(default)]
    pub index_compound_field_joiner: Option<String>,
    #[serde(default)]
    pub time_to_live_field: Option<String>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
            identity_field_type: FieldType::String,
            index_name: None,
            aggregator_name: None,
            index_compound_fields: Vec::new(),
            index_compound_field_joiner: None,
            time_to_live_field: None,
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_identity(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.identity_field = name.into();
        self.identity_field_type = field_type;
        self
    }

    pub fn with_compound_fields<I, S>(mut self, fields: I, joiner: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index_compound_fields = fields.into_iter().map(Into::into).collect();
        self.index_compound_field_joiner = joiner.map(str::to_string);
        self
    }

    pub fn with_ttl_field(mut self, field: impl Into<String>) -> Self {
        self.time_to_live_field = Some(field.into());
        self
    }

    pub fn add_fields(&mut self, fields: impl IntoIterator<Item = Field>) {
        self.fields.extend(fields);
    }

    pub fn get_field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn index_name(&self) -> &str {
        self.index_name.as_deref().unwrap_or(&self.name)
    }

    pub fn aggregator_name(&self) -> &str {
        self.aggregator_name.as_deref().unwrap_or_else(|| self.index_name())
    }

    /// More than one compound field means identities in the index are joined tuples.
    pub fn is_compound(&self) -> bool {
        self.index_compound_fields.len() > 1
    }

    pub fn compound_joiner<'a>(&'a self, fallback: &'a str) -> &'a str {
        match self.index_compound_field_joiner.as_deref() {
            Some(j) if !j.is_empty() => j,
            _ => fallback,
        }
    }

    /// The identity under which `record` is stored in a search index.
    pub fn index_identity(&self, record: &Record, fallback_joiner: &str) -> String {
        if !self.is_compound() {
            return record.id.to_string();
        }

        let parts: Vec<String> = self
            .index_compound_fields
            .iter()
            .enumerate()
            .map(|(i, field)| {
                if i == 0 {
                    record.id.to_string()
                } else {
                    record.get(field).map(Value::to_string).unwrap_or_default()
                }
            })
            .collect();

        parts.join(self.compound_joiner(fallback_joiner))
    }

    /// Index identity for a lookup key: tuples are joined, scalars pass through.
    pub fn index_key(&self, id: &Value, fallback_joiner: &str) -> String {
        match id {
            Value::Array(parts) if self.is_compound() => parts
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(self.compound_joiner(fallback_joiner)),
            id => id.to_string(),
        }
    }

    /// Key `record` is stored under. Compound collections key by the full
    /// tuple, identity first, so records sharing an identity stay distinct.
    pub fn storage_key(&self, record: &Record) -> Result<Value> {
        let id = self.coerce_identity(record.id.clone())?;
        if !self.is_compound() || matches!(id, Value::Array(_)) {
            return Ok(id);
        }

        let mut parts = vec![id];
        for field in &self.index_compound_fields[1..] {
            let value = record.get(field).cloned().unwrap_or(Value::Null);
            parts.push(self.coerce_field(field, value)?);
        }
        Ok(Value::Array(parts))
    }

    /// Normalise a caller-supplied identity: scalars are coerced to the
    /// identity type, compound tuples component by component.
    pub fn lookup_key(&self, id: &Value) -> Result<Value> {
        match id {
            Value::Array(parts) if self.is_compound() => parts
                .iter()
                .enumerate()
                .map(|(i, part)| match (i, self.index_compound_fields.get(i)) {
                    (0, _) => self.coerce_identity(part.clone()),
                    (_, Some(field)) => self.coerce_field(field, part.clone()),
                    (_, None) => Ok(part.clone()),
                })
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            id => self.coerce_identity(id.clone()),
        }
    }

    /// Whether a stored key belongs to `id`: an exact match, or for compound
    /// collections a tuple whose leading component is the scalar `id`.
    pub fn key_matches(&self, stored: &Value, id: &Value) -> bool {
        if stored == id {
            return true;
        }
        match (stored, id) {
            (Value::Array(parts), scalar) if self.is_compound() && !matches!(scalar, Value::Array(_)) => {
                parts.first() == Some(scalar)
            }
            _ => false,
        }
    }

    /// Coerce a value for `field` using its declared type; undeclared fields
    /// pass through unchanged.
    pub fn coerce_field(&self, field: &str, value: Value) -> Result<Value> {
        if field == self.identity_field {
            return self.coerce_identity(value);
        }

        match self.get_field(field) {
            Some(def) => def.field_type.coerce(value),
            None => Ok(value),
        }
    }

    pub fn coerce_identity(&self, value: Value) -> Result<Value> {
        match value {
            Value::Array(parts) => Ok(Value::Array(parts)),
            v => self.identity_field_type.coerce(v),
        }
    }

    /// Build a record from raw data: applies defaults, coerces declared
    /// fields, and enforces required fields.
    pub fn make_record(&self, id: impl Into<Value>, data: HashMap<String, Value>) -> Result<Record> {
        let mut record = Record::new(self.coerce_identity(id.into())?);

        for (key, value) in data {
            if key == self.identity_field {
                continue;
            }
            let coerced = self.coerce_field(&key, value)?;
            record.fields.insert(key, coerced);
        }

        for field in &self.fields {
            let missing = record.get(&field.name).is_none_or(Value::is_null);

            if missing {
                if let Some(default) = &field.default_value {
                    record
                        .fields
                        .insert(field.name.clone(), field.field_type.coerce(default.clone())?);
                } else if field.required {
                    return Err(QuarryError::InvalidValue(format!(
                        "{}: missing required field {:?}",
                        self.name, field.name
                    )));
                }
            }
        }

        Ok(record)
    }

    /// Flatten a record into a field map including its identity, filling in
    /// declared defaults.
    pub fn map_from_record(&self, record: &Record) -> Result<HashMap<String, Value>> {
        let mut out = HashMap::new();

        for field in &self.fields {
            if let Some(default) = &field.default_value {
                out.insert(field.name.clone(), default.clone());
            }
        }

        for (key, value) in &record.fields {
            out.insert(key.clone(), self.coerce_field(key, value.clone())?);
        }

        if !record.id.is_null() {
            out.insert(self.identity_field.clone(), record.id.clone());
        }

        Ok(out)
    }

    /// Absolute expiry time carried by the TTL field, if any.
    pub fn expires_at(&self, record: &Record) -> Option<DateTime<Utc>> {
        let field = self.time_to_live_field.as_deref()?;
        parse_time(record.get(field)?)
    }

    /// Time left before `record` expires; zero when it has no TTL or already expired.
    pub fn ttl(&self, record: &Record) -> Duration {
        self.expires_at(record)
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, record: &Record) -> bool {
        self.expires_at(record).is_some_and(|at| at <= Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl_collection() -> Collection {
        Collection::new("sessions").with_ttl_field("ttl")
    }

    #[test]
    fn ttl_is_zero_without_a_usable_value() {
        let c = ttl_collection();
        assert_eq!(c.ttl(&Record::new("a")), Duration::ZERO);
        assert_eq!(c.ttl(&Record::new("a").set("ttl", Value::Null)), Duration::ZERO);
        assert_eq!(c.ttl(&Record::new("a").set("ttl", 0)), Duration::ZERO);
        assert_eq!(c.ttl(&Record::new("a").set("ttl", "")), Duration::ZERO);
        assert_eq!(c.ttl(&Record::new("a").set("ttl", false)), Duration::ZERO);
    }

    #[test]
    fn ttl_and_expiry_follow_the_clock() {
        let c = ttl_collection();
        let future = Utc::now().timestamp() + 60;
        let past = Utc::now().timestamp() - 60;

        assert!(c.ttl(&Record::new("a").set("ttl", future)) > Duration::ZERO);
        assert!(!c.is_expired(&Record::new("a").set("ttl", future)));
        assert!(c.is_expired(&Record::new("a").set("ttl", past)));

        let rfc = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        assert!(c.is_expired(&Record::new("a").set("ttl", rfc)));
    }

    #[test]
    fn make_record_applies_defaults_and_types() {
        let c = Collection::new("users")
            .with_identity("id", FieldType::Int)
            .with_field(Field::new("name", FieldType::String).with_default("Bob"))
            .with_field(Field::new("age", FieldType::Int))
            .with_field(Field::new("enabled", FieldType::Boolean).with_default(true));

        let mut data = HashMap::new();
        data.insert("age".to_string(), Value::from("42"));
        let record = c.make_record("11", data).unwrap();

        assert_eq!(record.id, Value::Int(11));
        assert_eq!(record.get("name"), Some(&Value::from("Bob")));
        assert_eq!(record.get("age"), Some(&Value::Int(42)));
        assert_eq!(record.get("enabled"), Some(&Value::Bool(true)));
    }

    #[test]
    fn make_record_rejects_missing_required_fields() {
        let c = Collection::new("users").with_field(Field::new("email", FieldType::String).required());
        assert!(c.make_record("a", HashMap::new()).is_err());
    }

    #[test]
    fn compound_identity_joins_declared_fields() {
        let c = Collection::new("variants").with_compound_fields(["id", "variant"], None);
        let record = Record::new(5).set("variant", 42);
        assert_eq!(c.index_identity(&record, ":"), "5:42");

        let c = c.with_compound_fields(["id", "variant"], Some("|"));
        assert_eq!(c.index_identity(&record, ":"), "5|42");
    }

    #[test]
    fn map_from_record_includes_identity_and_defaults() {
        let c = Collection::new("users")
            .with_field(Field::new("enabled", FieldType::Boolean).with_default(true));
        let map = c
            .map_from_record(&Record::new("test").set("name", "tester"))
            .unwrap();

        assert_eq!(map["id"], Value::from("test"));
        assert_eq!(map["name"], Value::from("tester"));
        assert_eq!(map["enabled"], Value::Bool(true));
    }

    #[test]
    fn compound_records_key_by_full_tuple() {
        let variants = Collection::new("variants")
            .with_identity("id", FieldType::Int)
            .with_field(Field::new("variant", FieldType::Int))
            .with_compound_fields(["id", "variant"], None);

        let record = Record::new(5).set("variant", 2);
        let key = variants.storage_key(&record).unwrap();
        assert_eq!(key, Value::Array(vec![Value::Int(5), Value::Int(2)]));

        let parsed = variants
            .lookup_key(&Value::Array(vec![Value::from("5"), Value::from("2")]))
            .unwrap();
        assert_eq!(parsed, key);
        assert_eq!(variants.index_key(&parsed, ":"), "5:2");

        assert!(variants.key_matches(&key, &Value::Int(5)));
        assert!(!variants.key_matches(&key, &Value::Int(2)));
        assert_eq!(variants.lookup_key(&Value::from("5")).unwrap(), Value::Int(5));
    }
}
