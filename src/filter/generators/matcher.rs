//! In-process compilation target: a filter becomes a predicate over records.

use super::{Generator, Rendered};
use crate::dal::Record;
use crate::error::{QuarryError, Result};
use crate::filter::{Conjunction, Criterion, Filter, Operator, SortField};
use crate::types::Value;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::HashSet;
use unicode_segmentation::UnicodeSegmentation;

#[derive(Debug, Clone)]
enum Test {
    Missing,
    Present,
    AnyEqual(Vec<Value>),
    NoneEqual(Vec<Value>),
    AnyPattern(Vec<Regex>),
    Bound(Operator, Value),
    Between(Value, Value),
    /// One token list per criterion value; values are OR-combined.
    Fulltext(Vec<Vec<String>>, bool),
}

#[derive(Debug, Clone)]
struct CompiledCriterion {
    field: String,
    test: Test,
}

/// A filter compiled for evaluation against in-memory records.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    criteria: Vec<CompiledCriterion>,
    conjunction: Conjunction,
    identity_field: String,
    sort: Vec<SortField>,
}

#[derive(Debug, Clone)]
pub struct MatcherGenerator {
    fulltext_conjunction_and: bool,
}

impl Default for MatcherGenerator {
    fn default() -> Self {
        Self {
            fulltext_conjunction_and: true,
        }
    }
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words().map(|word| word.to_lowercase()).collect()
}

/// Equality that tolerates criteria written as strings against typed fields.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }

    match (a, b) {
        (Value::Int(_) | Value::Float(_), _) | (_, Value::Int(_) | Value::Float(_)) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Null, _) | (_, Value::Null) => false,
        _ if a.is_scalar() && b.is_scalar() => a.to_string() == b.to_string(),
        _ => false,
    }
}

fn loose_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    let numeric = matches!(a, Value::Int(_) | Value::Float(_))
        || matches!(b, Value::Int(_) | Value::Float(_));

    if numeric {
        let (x, y) = (a.as_f64()?, b.as_f64()?);
        return x.partial_cmp(&y);
    }

    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => Some(a.compare(b)),
    }
}

/// Scalar candidates for a stored value; arrays match element-wise.
fn candidates(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

impl MatcherGenerator {
    pub fn with_fulltext_conjunction_and(mut self, and: bool) -> Self {
        self.fulltext_conjunction_and = and;
        self
    }

    fn compile(&self, c: &Criterion) -> Result<CompiledCriterion> {
        c.validate()?;

        let test = match c.operator {
            Operator::Is if c.is_null_sentinel() => Test::Missing,
            Operator::Not if c.is_null_sentinel() => Test::Present,
            Operator::Is => Test::AnyEqual(c.values.clone()),
            Operator::Not => Test::NoneEqual(c.values.clone()),
            Operator::Contains | Operator::Prefix | Operator::Suffix => {
                let patterns = c
                    .values
                    .iter()
                    .map(|v| {
                        let literal = regex::escape(&v.to_string());
                        let pattern = match c.operator {
                            Operator::Prefix => format!("^{}", literal),
                            Operator::Suffix => format!("{}$", literal),
                            _ => literal,
                        };
                        Regex::new(&pattern).map_err(|e| QuarryError::Validation(e.to_string()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Test::AnyPattern(patterns)
            }
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                Test::Bound(c.operator, c.values[0].clone())
            }
            Operator::Between => Test::Between(c.values[0].clone(), c.values[1].clone()),
            Operator::Fulltext => Test::Fulltext(
                c.values.iter().map(|v| tokenize(&v.to_string())).collect(),
                self.fulltext_conjunction_and,
            ),
        };

        Ok(CompiledCriterion {
            field: c.field.clone(),
            test,
        })
    }
}

impl Generator for MatcherGenerator {
    type Query = CompiledFilter;

    fn render(&self, _collection: &str, filter: &Filter) -> Result<Rendered<CompiledFilter>> {
        let criteria = filter
            .criteria
            .iter()
            .map(|c| self.compile(c))
            .collect::<Result<Vec<_>>>()?;

        let values = filter
            .criteria
            .iter()
            .flat_map(|c| c.values.iter().cloned())
            .collect();

        Ok(Rendered {
            query: CompiledFilter {
                criteria,
                conjunction: filter.conjunction,
                identity_field: filter.identity_field.clone(),
                sort: filter.sort.clone(),
            },
            values,
        })
    }
}

impl CompiledCriterion {
    fn matches(&self, record: &Record, identity_field: &str) -> bool {
        let stored = record
            .lookup(&self.field, identity_field)
            .filter(|v| !v.is_null());

        match (&self.test, stored) {
            (Test::Missing, stored) => stored.is_none(),
            (Test::Present, stored) => stored.is_some(),
            // absent fields satisfy negations, the way must_not behaves in an index
            (Test::NoneEqual(_), None) => true,
            (_, None) => false,
            (Test::AnyEqual(wanted), Some(v)) => candidates(v)
                .into_iter()
                .any(|c| wanted.iter().any(|w| loose_eq(c, w))),
            (Test::NoneEqual(excluded), Some(v)) => candidates(v)
                .into_iter()
                .all(|c| excluded.iter().all(|x| !loose_eq(c, x))),
            (Test::AnyPattern(patterns), Some(v)) => candidates(v).into_iter().any(|c| {
                let text = c.to_string();
                patterns.iter().any(|p| p.is_match(&text))
            }),
            (Test::Bound(op, bound), Some(v)) => candidates(v).into_iter().any(|c| {
                match loose_cmp(c, bound) {
                    Some(ord) => match op {
                        Operator::Gt => ord == Ordering::Greater,
                        Operator::Gte => ord != Ordering::Less,
                        Operator::Lt => ord == Ordering::Less,
                        _ => ord != Ordering::Greater,
                    },
                    None => false,
                }
            }),
            (Test::Between(lower, upper), Some(v)) => candidates(v).into_iter().any(|c| {
                matches!(loose_cmp(c, lower), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(loose_cmp(c, upper), Some(Ordering::Less))
            }),
            (Test::Fulltext(queries, and), Some(v)) => {
                let words: HashSet<String> = candidates(v)
                    .into_iter()
                    .flat_map(|c| tokenize(&c.to_string()))
                    .collect();

                queries.iter().any(|tokens| {
                    if tokens.is_empty() {
                        false
                    } else if *and {
                        tokens.iter().all(|t| words.contains(t))
                    } else {
                        tokens.iter().any(|t| words.contains(t))
                    }
                })
            }
        }
    }
}

impl CompiledFilter {
    pub fn matches(&self, record: &Record) -> bool {
        if self.criteria.is_empty() {
            return true;
        }

        match self.conjunction {
            Conjunction::And => self
                .criteria
                .iter()
                .all(|c| c.matches(record, &self.identity_field)),
            Conjunction::Or => self
                .criteria
                .iter()
                .any(|c| c.matches(record, &self.identity_field)),
        }
    }

    /// Orders records by the filter's sort fields, then by identity.
    pub fn sort(&self, records: &mut [Record]) {
        records.sort_by(|a, b| {
            for s in &self.sort {
                let left = a.lookup(&s.field, &self.identity_field).unwrap_or(&Value::Null);
                let right = b.lookup(&s.field, &self.identity_field).unwrap_or(&Value::Null);
                let ord = left.compare(right);
                let ord = if s.descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.id.compare(&b.id)
        });
    }
}
