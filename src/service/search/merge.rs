// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Merging of per-shard partial results: global top-K under the request's
//! sort comparator, and the aggregation combiners from the partial forms.

use std::collections::BTreeMap;

use config::meta::search::{
    AggPartial, Aggregation, AggregationResult, HistogramBucket, Hit, HitsMeta, SearchRequest,
    SearchResponse, ShardSearchResponse, ShardStatistics, TermsBucket, TotalHits, TotalRelation,
};
use config::utils::json;

use crate::service::shard::search::cmp_sort_values;

/// Merge shard responses into the client response. `shard_stats` carries the
/// partial-failure accounting the caller already computed.
pub fn merge(
    req: &SearchRequest,
    responses: Vec<ShardSearchResponse>,
    shard_stats: ShardStatistics,
    took_ms: u64,
    timed_out: bool,
) -> SearchResponse {
    let is_partial = shard_stats.failed > 0 || shard_stats.skipped > 0;
    let total: u64 = responses.iter().map(|r| r.total).sum();

    // global top-K: union of per-shard hits under the same comparator
    let mut hits: Vec<(Vec<json::Value>, Hit)> = Vec::new();
    for resp in &responses {
        for hit in &resp.hits {
            hits.push((
                hit.sort_values.clone(),
                Hit {
                    id: hit.doc_id.clone(),
                    score: Some(hit.score),
                    source: hit.source.clone(),
                    sort: if req.sort.is_empty() {
                        Vec::new()
                    } else {
                        hit.sort_values.clone()
                    },
                },
            ));
        }
    }
    hits.sort_by(|a, b| cmp_sort_values(&a.0, &a.1.id, &b.0, &b.1.id, &req.sort));
    let window: Vec<Hit> = hits
        .into_iter()
        .skip(req.from)
        .take(req.size)
        .map(|(_, hit)| hit)
        .collect();

    let max_score = responses
        .iter()
        .flat_map(|r| r.hits.iter().map(|h| h.score))
        .fold(None, |acc: Option<f64>, score| {
            Some(acc.map_or(score, |m| m.max(score)))
        });

    let aggregations = if req.aggs.is_empty() {
        None
    } else {
        let mut merged = BTreeMap::new();
        for (name, agg) in &req.aggs {
            let partials: Vec<&AggPartial> = responses
                .iter()
                .filter_map(|r| r.aggs.get(name))
                .collect();
            if let Some(result) = merge_agg(agg, &partials) {
                merged.insert(name.clone(), result);
            }
        }
        Some(merged)
    };

    SearchResponse {
        took: took_ms,
        timed_out,
        shards: shard_stats,
        hits: HitsMeta {
            total: TotalHits {
                value: total,
                relation: TotalRelation::Eq,
            },
            max_score,
            hits: window,
        },
        aggregations,
        is_partial,
    }
}

fn merge_agg(agg: &Aggregation, partials: &[&AggPartial]) -> Option<AggregationResult> {
    match agg {
        Aggregation::Terms { size, .. } => {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for partial in partials {
                let AggPartial::Terms { counts: c } = partial else {
                    continue;
                };
                for (key, count) in c {
                    *counts.entry(key.clone()).or_insert(0) += count;
                }
            }
            let mut buckets: Vec<TermsBucket> = counts
                .into_iter()
                .map(|(key, doc_count)| TermsBucket { key, doc_count })
                .collect();
            // doc_count desc, key asc on ties
            buckets.sort_by(|a, b| {
                b.doc_count
                    .cmp(&a.doc_count)
                    .then_with(|| a.key.cmp(&b.key))
            });
            buckets.truncate(*size);
            Some(AggregationResult::Terms { buckets })
        }
        Aggregation::Stats { .. } | Aggregation::ExtendedStats { .. } => {
            let mut count = 0u64;
            let mut sum = 0.0;
            let mut sum_of_squares = 0.0;
            let mut min: Option<f64> = None;
            let mut max: Option<f64> = None;
            for partial in partials {
                let AggPartial::Stats {
                    count: c,
                    sum: s,
                    sum_of_squares: ss,
                    min: mn,
                    max: mx,
                } = partial
                else {
                    continue;
                };
                count += c;
                sum += s;
                sum_of_squares += ss;
                min = merge_bound(min, *mn, f64::min);
                max = merge_bound(max, *mx, f64::max);
            }
            let avg = (count > 0).then(|| sum / count as f64);
            match agg {
                Aggregation::Stats { .. } => Some(AggregationResult::Stats {
                    count,
                    min,
                    max,
                    avg,
                    sum,
                }),
                _ => {
                    // floored at 0 against numeric error
                    let variance = avg.map(|a| (sum_of_squares / count as f64 - a * a).max(0.0));
                    Some(AggregationResult::ExtendedStats {
                        count,
                        min,
                        max,
                        avg,
                        sum,
                        sum_of_squares,
                        variance,
                        std_deviation: variance.map(f64::sqrt),
                    })
                }
            }
        }
        Aggregation::Histogram { .. } | Aggregation::DateHistogram { .. } => {
            let mut interval = 1.0;
            let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
            for partial in partials {
                let AggPartial::Histogram {
                    interval: i,
                    counts: c,
                } = partial
                else {
                    continue;
                };
                interval = *i;
                for (bucket, count) in c {
                    *counts.entry(*bucket).or_insert(0) += count;
                }
            }
            Some(AggregationResult::Histogram {
                buckets: counts
                    .into_iter()
                    .map(|(bucket, doc_count)| HistogramBucket {
                        key: bucket as f64 * interval,
                        doc_count,
                    })
                    .collect(),
            })
        }
        Aggregation::Percentiles { percents, .. } => {
            let mut digest = config::meta::sketch::QuantileDigest::new();
            for partial in partials {
                if let AggPartial::Percentiles { digest: d } = partial {
                    digest.merge(d);
                }
            }
            let mut values = BTreeMap::new();
            for percent in percents {
                if let Some(v) = digest.quantile(percent / 100.0) {
                    values.insert(format!("{percent}"), v);
                }
            }
            Some(AggregationResult::Percentiles { values })
        }
        Aggregation::Cardinality { .. } => {
            let mut sketch = config::meta::sketch::CardinalitySketch::new();
            for partial in partials {
                if let AggPartial::Cardinality { sketch: s } = partial {
                    sketch.merge(s);
                }
            }
            Some(AggregationResult::Cardinality {
                value: sketch.estimate(),
            })
        }
    }
}

fn merge_bound(acc: Option<f64>, v: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (acc, v) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (None, v) => v,
        (acc, None) => acc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::meta::search::{ShardHit, SortField, SortOrder};
    use config::utils::json::json;
    use float_cmp::approx_eq;

    fn hit(id: &str, score: f64, sort_values: Vec<json::Value>) -> ShardHit {
        ShardHit {
            doc_id: id.to_string(),
            score,
            source: json!({"id": id}),
            sort_values,
        }
    }

    fn stats(total: u32, ok: u32) -> ShardStatistics {
        ShardStatistics {
            total,
            successful: ok,
            skipped: 0,
            failed: total - ok,
            failures: vec![],
        }
    }

    fn plain_req(size: usize) -> SearchRequest {
        crate::service::search::parser::parse(&json!({"size": size})).unwrap()
    }

    #[test]
    fn test_topk_equals_topk_of_union() {
        // three shards, interleaved scores
        let shard_hits = vec![
            vec![hit("a", 9.0, vec![json!(9.0), json!("a")]), hit("b", 3.0, vec![json!(3.0), json!("b")])],
            vec![hit("c", 8.0, vec![json!(8.0), json!("c")]), hit("d", 1.0, vec![json!(1.0), json!("d")])],
            vec![hit("e", 5.0, vec![json!(5.0), json!("e")])],
        ];
        let responses: Vec<ShardSearchResponse> = shard_hits
            .into_iter()
            .map(|hits| ShardSearchResponse {
                total: hits.len() as u64,
                hits,
                aggs: BTreeMap::new(),
                took_ms: 1,
            })
            .collect();
        let resp = merge(&plain_req(3), responses, stats(3, 3), 5, false);
        let ids: Vec<&str> = resp.hits.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "e"]);
        assert_eq!(resp.hits.total.value, 5);
        assert_eq!(resp.hits.max_score, Some(9.0));
    }

    #[test]
    fn test_sorted_merge_respects_field_order() {
        let mut req = plain_req(2);
        req.sort = vec![SortField {
            field: "price".to_string(),
            order: SortOrder::Desc,
        }];
        let responses = vec![
            ShardSearchResponse {
                total: 2,
                hits: vec![
                    hit("a", 1.0, vec![json!(10.0)]),
                    hit("b", 1.0, vec![json!(30.0)]),
                ],
                aggs: BTreeMap::new(),
                took_ms: 1,
            },
            ShardSearchResponse {
                total: 1,
                hits: vec![hit("c", 1.0, vec![json!(20.0)])],
                aggs: BTreeMap::new(),
                took_ms: 1,
            },
        ];
        let resp = merge(&req, responses, stats(2, 2), 3, false);
        let ids: Vec<&str> = resp.hits.hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(resp.hits.hits[0].sort, vec![json!(30.0)]);
    }

    #[test]
    fn test_terms_merge_sums_and_truncates() {
        let mut req = crate::service::search::parser::parse(&json!({
            "size": 0,
            "aggs": {"statuses": {"terms": {"field": "status", "size": 2}}}
        }))
        .unwrap();
        req.size = 0;
        let partial = |pairs: &[(&str, u64)]| {
            let mut aggs = BTreeMap::new();
            aggs.insert(
                "statuses".to_string(),
                AggPartial::Terms {
                    counts: pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), *v))
                        .collect(),
                },
            );
            ShardSearchResponse {
                total: 0,
                hits: vec![],
                aggs,
                took_ms: 1,
            }
        };
        let resp = merge(
            &req,
            vec![
                partial(&[("active", 3), ("done", 5)]),
                partial(&[("active", 4), ("failed", 1)]),
            ],
            stats(2, 2),
            2,
            false,
        );
        let aggs = resp.aggregations.unwrap();
        match aggs.get("statuses").unwrap() {
            AggregationResult::Terms { buckets } => {
                assert_eq!(buckets.len(), 2);
                assert_eq!(buckets[0].key, "active");
                assert_eq!(buckets[0].doc_count, 7);
                assert_eq!(buckets[1].key, "done");
            }
            other => panic!("unexpected agg: {other:?}"),
        }
    }

    #[test]
    fn test_extended_stats_variance() {
        let req = crate::service::search::parser::parse(&json!({
            "size": 0,
            "aggs": {"s": {"extended_stats": {"field": "v"}}}
        }))
        .unwrap();
        // values 1..4 split over two shards
        let partial = |vals: &[f64]| {
            let mut aggs = BTreeMap::new();
            aggs.insert(
                "s".to_string(),
                AggPartial::Stats {
                    count: vals.len() as u64,
                    sum: vals.iter().sum(),
                    sum_of_squares: vals.iter().map(|v| v * v).sum(),
                    min: vals.iter().cloned().reduce(f64::min),
                    max: vals.iter().cloned().reduce(f64::max),
                },
            );
            ShardSearchResponse {
                total: 0,
                hits: vec![],
                aggs,
                took_ms: 1,
            }
        };
        let resp = merge(
            &req,
            vec![partial(&[1.0, 2.0]), partial(&[3.0, 4.0])],
            stats(2, 2),
            1,
            false,
        );
        let aggs = resp.aggregations.unwrap();
        match aggs.get("s").unwrap() {
            AggregationResult::ExtendedStats {
                count,
                avg,
                variance,
                min,
                max,
                ..
            } => {
                assert_eq!(*count, 4);
                assert_eq!(*avg, Some(2.5));
                assert_eq!(*min, Some(1.0));
                assert_eq!(*max, Some(4.0));
                assert!(approx_eq!(f64, variance.unwrap(), 1.25, epsilon = 1e-9));
            }
            other => panic!("unexpected agg: {other:?}"),
        }
    }

    #[test]
    fn test_histogram_merge_aligns_buckets() {
        let req = crate::service::search::parser::parse(&json!({
            "size": 0,
            "aggs": {"h": {"histogram": {"field": "v", "interval": 10.0}}}
        }))
        .unwrap();
        let partial = |pairs: &[(i64, u64)]| {
            let mut aggs = BTreeMap::new();
            aggs.insert(
                "h".to_string(),
                AggPartial::Histogram {
                    interval: 10.0,
                    counts: pairs.iter().cloned().collect(),
                },
            );
            ShardSearchResponse {
                total: 0,
                hits: vec![],
                aggs,
                took_ms: 1,
            }
        };
        let resp = merge(
            &req,
            vec![partial(&[(0, 2), (1, 1)]), partial(&[(1, 3), (2, 4)])],
            stats(2, 2),
            1,
            false,
        );
        let aggs = resp.aggregations.unwrap();
        match aggs.get("h").unwrap() {
            AggregationResult::Histogram { buckets } => {
                assert_eq!(buckets.len(), 3);
                assert_eq!(buckets[1].key, 10.0);
                assert_eq!(buckets[1].doc_count, 4);
            }
            other => panic!("unexpected agg: {other:?}"),
        }
    }

    #[test]
    fn test_partial_flag_set_on_failures() {
        let resp = merge(&plain_req(10), vec![], stats(3, 2), 1, false);
        assert!(resp.is_partial);
        assert_eq!(resp.shards.failed, 1);
    }
}
