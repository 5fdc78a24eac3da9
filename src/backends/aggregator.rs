use super::{ConnectionString, IndexPage, Indexer};
use crate::context::Context;
use crate::dal::{Collection, Record, RecordSet};
use crate::error::Result;
use crate::filter::{Aggregate, Aggregation, Filter};
use std::ops::ControlFlow;

/// Statistical rollups over the records matching a filter.
pub trait Aggregator: Send + Sync {
    fn aggregator_connection_string(&self) -> &ConnectionString;

    fn sum(&self, ctx: &Context, collection: &Collection, field: &str, filter: Option<&Filter>)
    -> Result<f64>;

    fn count(&self, ctx: &Context, collection: &Collection, filter: Option<&Filter>) -> Result<u64>;

    fn minimum(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<f64>;

    fn maximum(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<f64>;

    fn average(
        &self,
        ctx: &Context,
        collection: &Collection,
        field: &str,
        filter: Option<&Filter>,
    ) -> Result<f64>;

    /// One record per distinct tuple of `group_by` values, carrying each
    /// requested aggregate under [`Aggregate::result_key`].
    fn group_by(
        &self,
        ctx: &Context,
        collection: &Collection,
        group_by: &[String],
        aggregates: &[Aggregate],
        filter: Option<&Filter>,
    ) -> Result<RecordSet>;
}

/// The `stats` rollup of one numeric field.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl AggregateStats {
    /// Every statistic is zero for an empty input.
    pub fn from_values(values: impl IntoIterator<Item = f64>) -> Self {
        let mut stats = Self::default();

        for value in values {
            if stats.count == 0 {
                stats.min = value;
                stats.max = value;
            } else {
                stats.min = stats.min.min(value);
                stats.max = stats.max.max(value);
            }
            stats.count += 1;
            stats.sum += value;
        }

        if stats.count > 0 {
            stats.avg = stats.sum / stats.count as f64;
        }

        stats
    }

    pub fn get(&self, aggregation: Aggregation) -> f64 {
        match aggregation {
            Aggregation::Sum => self.sum,
            Aggregation::Count => self.count as f64,
            Aggregation::Minimum => self.min,
            Aggregation::Maximum => self.max,
            Aggregation::Average => self.avg,
        }
    }
}

/// Count by running an id-only query capped at one result and reading the
/// total from the first page. Falls back to counting every identity when the
/// index cannot report totals.
pub fn count_via_query<I: Indexer + ?Sized>(
    indexer: &I,
    ctx: &Context,
    collection: &Collection,
    filter: Option<&Filter>,
) -> Result<u64> {
    let mut probe = filter.cloned().unwrap_or_default().with_id_only();
    probe.limit = 1;
    probe.offset = 0;

    let mut total = None;
    let mut seen = false;
    let mut first_page = |_: Record, page: &IndexPage| -> Result<ControlFlow<()>> {
        seen = true;
        total = page.total_results;
        Ok(ControlFlow::Break(()))
    };

    indexer.query(ctx, collection, Some(&probe), Some(&mut first_page))?;

    match total {
        Some(count) => Ok(count),
        None if !seen => Ok(0),
        None => {
            probe.limit = 0;
            let all = indexer.query(ctx, collection, Some(&probe), None)?;
            Ok(all.len() as u64)
        }
    }
}
