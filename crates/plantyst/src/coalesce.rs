//! Coalesce the gaps of a batch into the fewest server queries.

use std::collections::HashMap;

use crate::interval::{aggregate_ranges, KeyedRanges};
use crate::item::FetchItem;
use crate::partition::CachePartition;
use crate::source::SeriesSource;
use crate::wire::ServerQuery;

/// Who a server result must be merged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Contributor {
    Partition(usize),
    Item(usize),
}

#[derive(Debug, Clone)]
struct Origin {
    contributor: Contributor,
    measurement_id: i64,
    view: Option<String>,
}

/// Queries to send plus the routing of each answer.
#[derive(Debug, Default)]
pub(crate) struct NetworkPlan {
    pub queries: Vec<ServerQuery>,
    /// Query identity to contributors, partitions before items.
    pub routes: HashMap<String, Vec<Contributor>>,
}

impl NetworkPlan {
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Merge incomplete partition tails and pending item gaps per series.
///
/// Ranges sharing a cache key base that touch or overlap become one query.
pub(crate) fn build_network_queries<S: SeriesSource + ?Sized>(
    source: &S,
    partitions: &[CachePartition],
    incomplete: &[usize],
    items: &[FetchItem],
    pending: &[usize],
) -> NetworkPlan {
    let from_partitions = incomplete.iter().map(|&i| {
        let p = &partitions[i];
        KeyedRanges {
            key: p.cache_key_base.clone(),
            ranges: vec![p.missing_tail()],
            item: Origin {
                contributor: Contributor::Partition(i),
                measurement_id: p.measurement_id,
                view: p.view.clone(),
            },
        }
    });
    let from_items = pending.iter().map(|&i| {
        let item = &items[i];
        KeyedRanges {
            key: item.plan.cache_key_base.clone(),
            ranges: item.missing.clone(),
            item: Origin {
                contributor: Contributor::Item(i),
                measurement_id: item.query.measurement_id,
                view: item.plan.view.clone(),
            },
        }
    });
    let inputs: Vec<KeyedRanges<Origin>> = from_partitions.chain(from_items).collect();

    let mut plan = NetworkPlan::default();
    for aggregated in aggregate_ranges(&inputs) {
        let Some(base) = aggregated.items.first() else {
            continue;
        };
        let view = base.view.as_deref();
        let identity = source.query_identity(base.measurement_id, view, aggregated.range);
        plan.queries
            .push(source.server_query(base.measurement_id, view, aggregated.range));
        plan.routes.insert(
            identity,
            aggregated.items.iter().map(|o| o.contributor).collect(),
        );
    }
    tracing::debug!(
        "Coalesced {} ranges into {} server queries",
        inputs.iter().map(|i| i.ranges.len()).sum::<usize>(),
        plan.queries.len()
    );
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyValueCache;
    use crate::partition::build_index;
    use crate::promise::Settlement;
    use crate::source::AggregationSource;
    use crate::types::SeriesQuery;
    use chrono::{TimeZone, Utc};

    const MIN: i64 = 60_000;
    const JAN1: i64 = 1_577_836_800_000;

    fn item(id: i64, from_min: i64, to_min: i64, view: &str) -> FetchItem {
        let source = AggregationSource::default();
        let query = SeriesQuery::aggregation(
            id,
            Utc.timestamp_millis_opt(JAN1 + from_min * MIN).unwrap(),
            Utc.timestamp_millis_opt(JAN1 + to_min * MIN).unwrap(),
            view,
        );
        let plan = source.plan(&query, "plantyst.").unwrap();
        let (settlement, _rx) = Settlement::channel();
        FetchItem::new(query, plan, settlement)
    }

    #[test]
    fn test_overlapping_items_share_one_query() {
        let source = AggregationSource::default();
        let items: Vec<FetchItem> = (0..5).map(|i| item(1, i * 5, 30 + i * 5, "Base.MinuteSet")).collect();
        let pending: Vec<usize> = (0..items.len()).collect();

        let plan = build_network_queries(&source, &[], &[], &items, &pending);
        assert_eq!(plan.queries.len(), 1);
        assert_eq!(plan.queries[0].from, "2020-01-01T00:00:00Z");
        assert_eq!(plan.queries[0].to, "2020-01-01T00:50:00Z");
        let routes = plan.routes.values().next().unwrap();
        assert_eq!(routes.len(), 5);
    }

    #[test]
    fn test_series_and_views_stay_apart() {
        let source = AggregationSource::default();
        let items = vec![
            item(1, 0, 60, "Base.MinuteSet"),
            item(2, 0, 60, "Base.MinuteSet"),
            item(1, 0, 60, "Base.Hour"),
        ];
        let plan = build_network_queries(&source, &[], &[], &items, &[0, 1, 2]);
        assert_eq!(plan.queries.len(), 3);
        assert_eq!(plan.routes.len(), 3);
    }

    #[test]
    fn test_partition_tail_widens_query() {
        let source = AggregationSource::default();
        let cache = KeyValueCache::default();
        let items = vec![item(1, 0, 60, "Base.MinuteSet")];
        let partitions = build_index(&items, &cache);

        let plan = build_network_queries(&source, &partitions, &[0], &items, &[0]);
        assert_eq!(plan.queries.len(), 1);
        assert_eq!(plan.queries[0].to, "2020-01-02T00:00:00Z");
        let routes = plan.routes.values().next().unwrap();
        assert_eq!(routes, &vec![Contributor::Partition(0), Contributor::Item(0)]);
    }
}
