//! Compilers from a [`Filter`] to one backend's native query form.
//!
//! Rendering is a pure function of the generator's configuration and the
//! filter: bound parameters are returned alongside the query instead of
//! being accumulated on the generator, so one generator may serve any
//! number of concurrent renders.

pub mod elasticsearch;
pub mod matcher;
pub mod sql;

pub use elasticsearch::{ElasticsearchGenerator, EsSearch};
pub use matcher::{CompiledFilter, MatcherGenerator};
pub use sql::{Placeholder, SqlGenerator, SqlQuery};

use crate::error::Result;
use crate::filter::Filter;
use crate::types::Value;

/// A rendered query and the values bound into it, in binding order.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered<Q> {
    pub query: Q,
    pub values: Vec<Value>,
}

pub trait Generator {
    type Query;

    fn render(&self, collection: &str, filter: &Filter) -> Result<Rendered<Self::Query>>;
}

/// Render `filter`, treating `None` as match-all.
pub fn render<G: Generator>(
    generator: &G,
    collection: &str,
    filter: Option<&Filter>,
) -> Result<Rendered<G::Query>> {
    match filter {
        Some(f) => generator.render(collection, f),
        None => generator.render(collection, &Filter::all()),
    }
}
