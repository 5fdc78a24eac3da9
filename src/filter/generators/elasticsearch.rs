use super::{Generator, Rendered};
use crate::config::EngineConfig;
use crate::error::{QuarryError, Result};
use crate::filter::{Conjunction, Criterion, Filter, Operator};
use crate::types::Value;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};

/// A `_search` request body.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EsSearch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<JsonValue>,
    #[serde(rename = "_source", skip_serializing_if = "Option::is_none")]
    pub source: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct ElasticsearchGenerator {
    exact_match_query_type: String,
    multifield: Option<String>,
    fulltext_conjunction_and: bool,
}

impl Default for ElasticsearchGenerator {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

fn object(key: impl Into<String>, value: JsonValue) -> JsonValue {
    let mut map = Map::new();
    map.insert(key.into(), value);
    JsonValue::Object(map)
}

fn missing_clause(field: &str) -> JsonValue {
    json!({
        "missing": {
            "field": field,
            "existence": true,
            "null_value": true,
        }
    })
}

fn regexp_clause(field: &str, pattern: String) -> JsonValue {
    json!({
        "regexp": object(field, json!({
            "value": pattern,
            "flags": "ALL",
        }))
    })
}

/// Escapes characters reserved by the Lucene regular expression syntax so
/// pattern operators match values literally.
fn escape_regexp(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(
            ch,
            '.' | '?' | '+' | '*' | '|' | '{' | '}' | '[' | ']' | '(' | ')' | '"' | '\\' | '#'
                | '@' | '&' | '<' | '>' | '~'
        ) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl ElasticsearchGenerator {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            exact_match_query_type: config.exact_match_query_type.clone(),
            multifield: config.multifield.clone(),
            fulltext_conjunction_and: config.fulltext_conjunction_and,
        }
    }

    pub fn with_multifield(mut self, suffix: impl Into<String>) -> Self {
        self.multifield = Some(suffix.into());
        self
    }

    pub fn with_fulltext_conjunction_and(mut self, and: bool) -> Self {
        self.fulltext_conjunction_and = and;
        self
    }

    fn exact(&self, field: &str, value: &Value) -> JsonValue {
        object(
            self.exact_match_query_type.as_str(),
            object(field, value.to_json()),
        )
    }

    fn multifield_name(&self, field: &str) -> Option<String> {
        self.multifield
            .as_ref()
            .map(|suffix| format!("{}.{}", field, suffix))
    }

    fn is_clause(&self, c: &Criterion, values: &mut Vec<Value>) -> JsonValue {
        if c.is_null_sentinel() {
            values.push(Value::Null);
            return missing_clause(&c.field);
        }

        let mut or_terms = Vec::with_capacity(c.values.len());

        for value in &c.values {
            values.push(value.clone());
            or_terms.push(self.exact(&c.field, value));

            if let Some(mf) = self.multifield_name(&c.field) {
                or_terms.push(self.exact(&mf, value));
            }
        }

        json!({ "bool": { "should": or_terms } })
    }

    fn not_clause(&self, c: &Criterion, values: &mut Vec<Value>) -> JsonValue {
        if c.is_null_sentinel() {
            values.push(Value::Null);
            return json!({ "bool": { "must_not": missing_clause(&c.field) } });
        }

        let string_typed = c.is_string_typed();
        let mut and_not = Vec::with_capacity(c.values.len());

        for value in &c.values {
            values.push(value.clone());

            let negated = if string_typed {
                regexp_clause(&c.field, escape_regexp(&value.to_string()))
            } else {
                self.exact(&c.field, value)
            };

            and_not.push(json!({ "bool": { "must_not": negated } }));
        }

        json!({ "bool": { "must": and_not } })
    }

    fn pattern_clause(&self, c: &Criterion, values: &mut Vec<Value>) -> Result<JsonValue> {
        let mut or_regexp = Vec::new();

        for value in &c.values {
            values.push(value.clone());
            let literal = escape_regexp(&value.to_string());

            let pattern = match c.operator {
                Operator::Contains => format!(".*{}.*", literal),
                Operator::Prefix => format!("{}.*", literal),
                Operator::Suffix => format!(".*{}", literal),
                other => {
                    return Err(QuarryError::Unsupported(format!(
                        "Unsupported pattern operator {:?}",
                        other.as_str()
                    )));
                }
            };

            if let Some(mf) = self.multifield_name(&c.field) {
                or_regexp.push(regexp_clause(&c.field, pattern.clone()));
                or_regexp.push(regexp_clause(&mf, pattern));
            } else {
                or_regexp.push(regexp_clause(&c.field, pattern));
            }
        }

        Ok(json!({ "bool": { "should": or_regexp } }))
    }

    fn range_clause(&self, c: &Criterion, bound: &str, values: &mut Vec<Value>) -> JsonValue {
        let value = &c.values[0];
        values.push(value.clone());

        object("range", object(c.field.as_str(), object(bound, value.to_json())))
    }

    fn between_clause(&self, c: &Criterion, values: &mut Vec<Value>) -> JsonValue {
        values.extend(c.values.iter().cloned());

        object(
            "range",
            object(
                c.field.as_str(),
                json!({
                    "gte": c.values[0].to_json(),
                    "lt": c.values[1].to_json(),
                }),
            ),
        )
    }

    fn fulltext_clause(&self, c: &Criterion, values: &mut Vec<Value>) -> JsonValue {
        let default_operator = if self.fulltext_conjunction_and { "AND" } else { "OR" };

        let or_queries: Vec<JsonValue> = c
            .values
            .iter()
            .map(|value| {
                values.push(value.clone());
                json!({
                    "query_string": {
                        "query": value.to_string(),
                        "default_field": c.field,
                        "default_operator": default_operator,
                        "lenient": true,
                    }
                })
            })
            .collect();

        json!({ "bool": { "should": or_queries } })
    }

    /// Compile one criterion into a query clause.
    pub fn criterion_clause(&self, c: &Criterion, values: &mut Vec<Value>) -> Result<JsonValue> {
        c.validate()?;

        Ok(match c.operator {
            Operator::Is => self.is_clause(c, values),
            Operator::Not => self.not_clause(c, values),
            Operator::Contains | Operator::Prefix | Operator::Suffix => {
                self.pattern_clause(c, values)?
            }
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                self.range_clause(c, c.operator.as_str(), values)
            }
            Operator::Between => self.between_clause(c, values),
            Operator::Fulltext => self.fulltext_clause(c, values),
        })
    }

    /// Only the query clause of `filter`; `None` for a match-all filter.
    pub fn render_query(&self, filter: &Filter) -> Result<Rendered<Option<JsonValue>>> {
        let mut values = Vec::new();

        if filter.is_match_all() {
            return Ok(Rendered { query: None, values });
        }

        let clauses = filter
            .criteria
            .iter()
            .map(|c| self.criterion_clause(c, &mut values))
            .collect::<Result<Vec<_>>>()?;

        let query = match filter.conjunction {
            Conjunction::And => json!({ "bool": { "must": clauses } }),
            Conjunction::Or => json!({
                "bool": {
                    "should": clauses,
                    "minimum_should_match": 1,
                }
            }),
        };

        Ok(Rendered {
            query: Some(query),
            values,
        })
    }
}

impl Generator for ElasticsearchGenerator {
    type Query = EsSearch;

    fn render(&self, _collection: &str, filter: &Filter) -> Result<Rendered<EsSearch>> {
        let Rendered { query, values } = self.render_query(filter)?;

        let sort = filter
            .sort
            .iter()
            .map(|s| {
                object(
                    s.field.as_str(),
                    json!({ "order": if s.descending { "desc" } else { "asc" } }),
                )
            })
            .collect();

        let source = if filter.id_only() {
            Some(JsonValue::Bool(false))
        } else if !filter.fields.is_empty() {
            Some(json!(filter.fields))
        } else {
            None
        };

        Ok(Rendered {
            query: EsSearch {
                query,
                size: (filter.limit > 0).then_some(filter.limit),
                from: (filter.offset > 0).then_some(filter.offset),
                sort,
                source,
            },
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::FieldType;

    fn clause(generator: &ElasticsearchGenerator, c: Criterion) -> Result<JsonValue> {
        generator.criterion_clause(&c, &mut Vec::new())
    }

    #[test]
    fn is_values_are_or_combined() {
        let generator = ElasticsearchGenerator::default();
        let out = clause(&generator, Criterion::new("name", Operator::Is, ["a", "b"])).unwrap();

        assert_eq!(
            out,
            json!({"bool": {"should": [
                {"term": {"name": "a"}},
                {"term": {"name": "b"}},
            ]}})
        );
    }

    #[test]
    fn is_duplicates_clauses_for_multifield() {
        let generator = ElasticsearchGenerator::default().with_multifield("raw");
        let out = clause(&generator, Criterion::is("name", "a")).unwrap();

        assert_eq!(
            out,
            json!({"bool": {"should": [
                {"term": {"name": "a"}},
                {"term": {"name.raw": "a"}},
            ]}})
        );
    }

    #[test]
    fn is_null_emits_missing() {
        let generator = ElasticsearchGenerator::default();
        let out = clause(&generator, Criterion::is("deleted", "null")).unwrap();
        assert_eq!(
            out,
            json!({"missing": {"field": "deleted", "existence": true, "null_value": true}})
        );
    }

    #[test]
    fn not_null_negates_missing() {
        let generator = ElasticsearchGenerator::default();
        let out = clause(&generator, Criterion::not("deleted", Value::Null)).unwrap();
        assert_eq!(
            out,
            json!({"bool": {"must_not": {"missing": {
                "field": "deleted", "existence": true, "null_value": true
            }}}})
        );
    }

    #[test]
    fn not_values_are_and_combined() {
        let generator = ElasticsearchGenerator::default();

        let out = clause(&generator, Criterion::new("age", Operator::Not, [1, 2])).unwrap();
        assert_eq!(
            out,
            json!({"bool": {"must": [
                {"bool": {"must_not": {"term": {"age": 1}}}},
                {"bool": {"must_not": {"term": {"age": 2}}}},
            ]}})
        );

        let out = clause(
            &generator,
            Criterion::new("name", Operator::Not, ["x"]).of_type(FieldType::String),
        )
        .unwrap();
        assert_eq!(
            out,
            json!({"bool": {"must": [
                {"bool": {"must_not": {"regexp": {"name": {"value": "x", "flags": "ALL"}}}}},
            ]}})
        );
    }

    #[test]
    fn not_without_values_fails() {
        let generator = ElasticsearchGenerator::default();
        let err = clause(&generator, Criterion::new("a", Operator::Not, Vec::<Value>::new()));
        assert!(matches!(err, Err(QuarryError::Validation(_))));
    }

    #[test]
    fn pattern_operators_wrap_values() {
        let generator = ElasticsearchGenerator::default();

        for (op, expected) in [
            (Operator::Contains, ".*ab.*"),
            (Operator::Prefix, "ab.*"),
            (Operator::Suffix, ".*ab"),
        ] {
            let out = clause(&generator, Criterion::new("name", op, ["ab"])).unwrap();
            assert_eq!(
                out,
                json!({"bool": {"should": [
                    {"regexp": {"name": {"value": expected, "flags": "ALL"}}},
                ]}})
            );
        }

        let out = clause(&generator, Criterion::new("name", Operator::Contains, ["a.b"])).unwrap();
        assert_eq!(out["bool"]["should"][0]["regexp"]["name"]["value"], ".*a\\.b.*");
    }

    #[test]
    fn ranges_check_arity() {
        let generator = ElasticsearchGenerator::default();

        let out = clause(&generator, Criterion::new("age", Operator::Gte, [21])).unwrap();
        assert_eq!(out, json!({"range": {"age": {"gte": 21}}}));

        let out = clause(&generator, Criterion::between("age", 10, 20)).unwrap();
        assert_eq!(out, json!({"range": {"age": {"gte": 10, "lt": 20}}}));

        assert!(clause(&generator, Criterion::new("age", Operator::Lt, [1, 2])).is_err());
        assert!(clause(&generator, Criterion::new("age", Operator::Between, [1])).is_err());
    }

    #[test]
    fn fulltext_uses_configured_conjunction() {
        let generator = ElasticsearchGenerator::default().with_fulltext_conjunction_and(false);
        let out = clause(
            &generator,
            Criterion::new("body", Operator::Fulltext, ["quick fox"]),
        )
        .unwrap();

        assert_eq!(
            out,
            json!({"bool": {"should": [{"query_string": {
                "query": "quick fox",
                "default_field": "body",
                "default_operator": "OR",
                "lenient": true,
            }}]}})
        );
    }

    #[test]
    fn render_builds_search_body() {
        let generator = ElasticsearchGenerator::default();
        let filter = Filter::all()
            .with(Criterion::is("name", "a"))
            .with(Criterion::new("age", Operator::Gt, [3]))
            .with_limit(10)
            .with_offset(20)
            .with_sort("-age")
            .with_fields(["name"]);

        let rendered = generator.render("users", &filter).unwrap();
        assert_eq!(rendered.values, vec![Value::from("a"), Value::Int(3)]);

        let body = serde_json::to_value(&rendered.query).unwrap();
        assert_eq!(
            body,
            json!({
                "query": {"bool": {"must": [
                    {"bool": {"should": [{"term": {"name": "a"}}]}},
                    {"range": {"age": {"gt": 3}}},
                ]}},
                "size": 10,
                "from": 20,
                "sort": [{"age": {"order": "desc"}}],
                "_source": ["name"],
            })
        );
    }

    #[test]
    fn empty_filter_renders_no_query() {
        let generator = ElasticsearchGenerator::default();
        let rendered = generator.render("users", &Filter::all()).unwrap();
        assert_eq!(serde_json::to_value(&rendered.query).unwrap(), json!({}));
    }

    #[test]
    fn or_conjunction_uses_should() {
        let generator = ElasticsearchGenerator::default();
        let filter = Filter::all()
            .with(Criterion::is("a", 1))
            .with(Criterion::is("b", 2))
            .with_conjunction(Conjunction::Or);

        let query = generator.render_query(&filter).unwrap().query.unwrap();
        assert_eq!(query["bool"]["minimum_should_match"], 1);
        assert_eq!(query["bool"]["should"].as_array().unwrap().len(), 2);
    }
}
