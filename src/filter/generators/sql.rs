use super::{Generator, Rendered};
use crate::error::Result;
use crate::filter::{Aggregate, Aggregation, Conjunction, Criterion, Filter, Operator};
use crate::types::Value;

/// Parameter placeholder style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placeholder {
    /// `?` (SQLite, MySQL)
    #[default]
    Question,
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
}

/// A parameterized statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub statement: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct SqlGenerator {
    placeholder: Placeholder,
    fulltext_conjunction_and: bool,
}

impl Default for SqlGenerator {
    fn default() -> Self {
        Self {
            placeholder: Placeholder::Question,
            fulltext_conjunction_and: true,
        }
    }
}

/// Escape LIKE wildcards so pattern values match literally under `ESCAPE '\'`.
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Per-render parameter accumulator; lives only for one `render` call.
struct Binder {
    style: Placeholder,
    params: Vec<Value>,
}

impl Binder {
    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        match self.style {
            Placeholder::Question => "?".to_string(),
            Placeholder::Dollar => format!("${}", self.params.len()),
        }
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn join_group(parts: Vec<String>, joiner: &str) -> String {
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", parts.join(joiner))
    }
}

impl SqlGenerator {
    pub fn new(placeholder: Placeholder) -> Self {
        Self {
            placeholder,
            ..Self::default()
        }
    }

    pub fn with_fulltext_conjunction_and(mut self, and: bool) -> Self {
        self.fulltext_conjunction_and = and;
        self
    }

    fn criterion_sql(&self, c: &Criterion, binder: &mut Binder) -> Result<String> {
        c.validate()?;
        let field = quote_identifier(&c.field);

        let sql = match c.operator {
            Operator::Is if c.is_null_sentinel() => format!("{} IS NULL", field),
            Operator::Not if c.is_null_sentinel() => format!("{} IS NOT NULL", field),
            Operator::Is => {
                let parts = c
                    .values
                    .iter()
                    .map(|v| format!("{} = {}", field, binder.bind(v.clone())))
                    .collect();
                join_group(parts, " OR ")
            }
            Operator::Not => {
                let parts = c
                    .values
                    .iter()
                    .map(|v| format!("{} <> {}", field, binder.bind(v.clone())))
                    .collect();
                join_group(parts, " AND ")
            }
            Operator::Contains | Operator::Prefix | Operator::Suffix => {
                let parts = c
                    .values
                    .iter()
                    .map(|v| {
                        let literal = escape_like(&v.to_string());
                        let pattern = match c.operator {
                            Operator::Prefix => format!("{}%", literal),
                            Operator::Suffix => format!("%{}", literal),
                            _ => format!("%{}%", literal),
                        };
                        format!(
                            "{} LIKE {} ESCAPE '\\'",
                            field,
                            binder.bind(Value::String(pattern))
                        )
                    })
                    .collect();
                join_group(parts, " OR ")
            }
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let symbol = match c.operator {
                    Operator::Gt => ">",
                    Operator::Gte => ">=",
                    Operator::Lt => "<",
                    _ => "<=",
                };
                format!("{} {} {}", field, symbol, binder.bind(c.values[0].clone()))
            }
            Operator::Between => {
                let lower = binder.bind(c.values[0].clone());
                let upper = binder.bind(c.values[1].clone());
                format!("({f} >= {} AND {f} < {})", lower, upper, f = field)
            }
            Operator::Fulltext => {
                let token_joiner = if self.fulltext_conjunction_and { " AND " } else { " OR " };
                let parts = c
                    .values
                    .iter()
                    .map(|v| {
                        let text = v.to_string();
                        let tokens: Vec<String> = text
                            .split_whitespace()
                            .map(|tok| {
                                format!(
                                    "{} LIKE {} ESCAPE '\\'",
                                    field,
                                    binder.bind(Value::String(format!("%{}%", escape_like(tok))))
                                )
                            })
                            .collect();
                        join_group(tokens, token_joiner)
                    })
                    .collect();
                join_group(parts, " OR ")
            }
        };

        Ok(sql)
    }

    fn where_clause(&self, filter: &Filter, binder: &mut Binder) -> Result<String> {
        if filter.is_match_all() {
            return Ok(String::new());
        }

        let joiner = match filter.conjunction {
            Conjunction::And => " AND ",
            Conjunction::Or => " OR ",
        };

        let parts = filter
            .criteria
            .iter()
            .map(|c| self.criterion_sql(c, binder))
            .collect::<Result<Vec<_>>>()?;

        Ok(format!(" WHERE {}", parts.join(joiner)))
    }

    fn binder(&self) -> Binder {
        Binder {
            style: self.placeholder,
            params: Vec::new(),
        }
    }

    /// `SELECT <group fields>, <aggregates> FROM ... [WHERE ...] [GROUP BY ...]`
    pub fn render_aggregate(
        &self,
        collection: &str,
        group_by: &[String],
        aggregates: &[Aggregate],
        filter: &Filter,
    ) -> Result<SqlQuery> {
        let mut binder = self.binder();
        let mut columns: Vec<String> = group_by.iter().map(|g| quote_identifier(g)).collect();

        for aggregate in aggregates {
            let expr = match aggregate.aggregation {
                Aggregation::Count => "COUNT(*)".to_string(),
                Aggregation::Sum => format!("SUM({})", quote_identifier(&aggregate.field)),
                Aggregation::Minimum => format!("MIN({})", quote_identifier(&aggregate.field)),
                Aggregation::Maximum => format!("MAX({})", quote_identifier(&aggregate.field)),
                Aggregation::Average => format!("AVG({})", quote_identifier(&aggregate.field)),
            };
            columns.push(format!("{} AS {}", expr, quote_identifier(&aggregate.result_key())));
        }

        let mut statement = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            quote_identifier(collection)
        );
        statement.push_str(&self.where_clause(filter, &mut binder)?);

        if !group_by.is_empty() {
            let groups: Vec<String> = group_by.iter().map(|g| quote_identifier(g)).collect();
            statement.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }

        Ok(SqlQuery {
            statement,
            params: binder.params,
        })
    }
}

impl Generator for SqlGenerator {
    type Query = SqlQuery;

    fn render(&self, collection: &str, filter: &Filter) -> Result<Rendered<SqlQuery>> {
        let mut binder = self.binder();

        let columns = if filter.id_only() {
            quote_identifier(&filter.identity_field)
        } else if filter.fields.is_empty() {
            "*".to_string()
        } else {
            filter
                .fields
                .iter()
                .map(|f| quote_identifier(f))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut statement = format!("SELECT {} FROM {}", columns, quote_identifier(collection));
        statement.push_str(&self.where_clause(filter, &mut binder)?);

        if !filter.sort.is_empty() {
            let order: Vec<String> = filter
                .sort
                .iter()
                .map(|s| {
                    format!(
                        "{} {}",
                        quote_identifier(&s.field),
                        if s.descending { "DESC" } else { "ASC" }
                    )
                })
                .collect();
            statement.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }

        if filter.limit > 0 {
            statement.push_str(&format!(" LIMIT {}", filter.limit));
        }

        if filter.offset > 0 {
            statement.push_str(&format!(" OFFSET {}", filter.offset));
        }

        let values = binder.params.clone();

        Ok(Rendered {
            query: SqlQuery {
                statement,
                params: binder.params,
            },
            values,
        })
    }
}
