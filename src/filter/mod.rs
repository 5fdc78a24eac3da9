//! Backend-independent query model.
//!
//! A [`Filter`] is built once by the caller and handed, read-only, to a
//! generator or indexer. Nothing in this module talks to a backend.

pub mod generators;

use crate::dal::FieldType;
use crate::error::{QuarryError, Result};
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Option key that makes the index copy of a record authoritative.
pub const FORCE_INDEX_RECORD: &str = "ForceIndexRecord";

/// Literal criterion value standing for "field is missing".
pub const NULL_SENTINEL: &str = "null";

pub const DEFAULT_IDENTITY_FIELD: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Is,
    Not,
    Contains,
    Prefix,
    Suffix,
    Gt,
    Gte,
    Lt,
    Lte,
    #[serde(alias = "range")]
    Between,
    Fulltext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    AtLeastOne,
    Exactly(usize),
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Is => "is",
            Operator::Not => "not",
            Operator::Contains => "contains",
            Operator::Prefix => "prefix",
            Operator::Suffix => "suffix",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Between => "between",
            Operator::Fulltext => "fulltext",
        }
    }

    /// Bound name for single-bound range operators.
    pub fn bound_name(&self) -> Option<&'static str> {
        match self {
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => Some(self.as_str()),
            _ => None,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Operator::Contains | Operator::Prefix | Operator::Suffix)
    }

    fn arity(&self) -> Arity {
        match self {
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => Arity::Exactly(1),
            Operator::Between => Arity::Exactly(2),
            _ => Arity::AtLeastOne,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "is" => Operator::Is,
            "not" => Operator::Not,
            "contains" => Operator::Contains,
            "prefix" => Operator::Prefix,
            "suffix" => Operator::Suffix,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "between" | "range" => Operator::Between,
            "fulltext" => Operator::Fulltext,
            other => {
                return Err(QuarryError::Unsupported(format!(
                    "unknown operator {:?}",
                    other
                )));
            }
        })
    }
}

/// One predicate. Multiple values are OR-combined, except for `not` where
/// every listed value is excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub field: String,
    pub operator: Operator,
    pub values: Vec<Value>,
    #[serde(default)]
    pub value_type: Option<FieldType>,
}

impl Criterion {
    pub fn new<I, V>(field: impl Into<String>, operator: Operator, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            field: field.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
            value_type: None,
        }
    }

    pub fn is(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Is, [value.into()])
    }

    pub fn not(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Not, [value.into()])
    }

    pub fn between(
        field: impl Into<String>,
        lower: impl Into<Value>,
        upper: impl Into<Value>,
    ) -> Self {
        Self::new(field, Operator::Between, [lower.into(), upper.into()])
    }

    pub fn of_type(mut self, value_type: FieldType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    /// A single `null` value (either `Value::Null` or the literal string).
    pub fn is_null_sentinel(&self) -> bool {
        match self.values.as_slice() {
            [Value::Null] => true,
            [Value::String(s)] => s == NULL_SENTINEL,
            _ => false,
        }
    }

    /// Explicitly string-typed, or untyped with only string values.
    pub fn is_string_typed(&self) -> bool {
        match self.value_type {
            Some(t) => t == FieldType::String,
            None => {
                !self.values.is_empty() && self.values.iter().all(|v| matches!(v, Value::String(_)))
            }
        }
    }

    /// Rejects value counts that do not fit the operator.
    pub fn validate(&self) -> Result<()> {
        let count = self.values.len();

        match self.operator.arity() {
            Arity::AtLeastOne if count == 0 => Err(QuarryError::Validation(format!(
                "The {} criterion on {:?} must have at least one value",
                self.operator, self.field
            ))),
            Arity::Exactly(n) if count != n => Err(QuarryError::Validation(format!(
                "Ranging criteria {} on {:?} can only accept {} value{}, {} given",
                self.operator,
                self.field,
                n,
                if n == 1 { "" } else { "s" },
                count
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conjunction {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub descending: bool,
}

impl SortField {
    /// `-field` sorts descending, `field` or `+field` ascending.
    pub fn parse(expr: &str) -> Self {
        if let Some(field) = expr.strip_prefix('-') {
            Self {
                field: field.to_string(),
                descending: true,
            }
        } else {
            Self {
                field: expr.trim_start_matches('+').to_string(),
                descending: false,
            }
        }
    }
}

/// One logical query: predicates, projection, ordering and pagination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub criteria: Vec<Criterion>,
    pub conjunction: Conjunction,
    /// Zero means unbounded.
    pub limit: usize,
    pub offset: usize,
    pub fields: Vec<String>,
    pub sort: Vec<SortField>,
    pub options: HashMap<String, Value>,
    pub identity_field: String,
    pub id_only: bool,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            conjunction: Conjunction::And,
            limit: 0,
            offset: 0,
            fields: Vec::new(),
            sort: Vec::new(),
            options: HashMap::new(),
            identity_field: DEFAULT_IDENTITY_FIELD.to_string(),
            id_only: false,
        }
    }
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn with_conjunction(mut self, conjunction: Conjunction) -> Self {
        self.conjunction = conjunction;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_sort(mut self, expr: &str) -> Self {
        self.sort.push(SortField::parse(expr));
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_id_only(mut self) -> Self {
        self.id_only = true;
        self
    }

    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = field.into();
        self
    }

    /// True when only identities are wanted, either explicitly or because the
    /// projection is exactly the identity field.
    pub fn id_only(&self) -> bool {
        self.id_only || (self.fields.len() == 1 && self.fields[0] == self.identity_field)
    }

    pub fn is_match_all(&self) -> bool {
        self.criteria.is_empty()
    }

    pub fn force_index_record(&self) -> bool {
        self.options
            .get(FORCE_INDEX_RECORD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Validates every criterion, failing on the first bad one.
    pub fn validate(&self) -> Result<()> {
        self.criteria.iter().try_for_each(Criterion::validate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Count,
    #[serde(alias = "min")]
    Minimum,
    #[serde(alias = "max")]
    Maximum,
    #[serde(alias = "avg")]
    Average,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Sum => "sum",
            Aggregation::Count => "count",
            Aggregation::Minimum => "min",
            Aggregation::Maximum => "max",
            Aggregation::Average => "avg",
        }
    }
}

/// One rollup request. `count` ignores `field`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub aggregation: Aggregation,
    #[serde(default)]
    pub field: String,
}

impl Aggregate {
    pub fn new(aggregation: Aggregation, field: impl Into<String>) -> Self {
        Self {
            aggregation,
            field: field.into(),
        }
    }

    pub fn count() -> Self {
        Self::new(Aggregation::Count, "")
    }

    /// Field name under which group-by results carry this aggregate.
    pub fn result_key(&self) -> String {
        match self.aggregation {
            Aggregation::Count => "count".to_string(),
            other => format!("{}_{}", other.as_str(), self.field),
        }
    }
}
