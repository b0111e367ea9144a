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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    meta::{
        query::Query,
        sketch::{CardinalitySketch, QuantileDigest},
    },
    utils::json,
};

/// A parsed search request: the coordinator pipeline's input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Query,
    #[serde(default)]
    pub from: usize,
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortField>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aggs: BTreeMap<String, Aggregation>,
    /// Fail the whole request on any shard failure instead of returning
    /// partial results.
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub timeout_ms: u64,
}

fn default_size() -> usize {
    10
}

impl SearchRequest {
    pub fn new(query: Query) -> Self {
        SearchRequest {
            query,
            from: 0,
            size: default_size(),
            sort: Vec::new(),
            aggs: BTreeMap::new(),
            strict: false,
            timeout_ms: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Terms {
        field: String,
        #[serde(default = "default_terms_size")]
        size: usize,
    },
    Stats {
        field: String,
    },
    ExtendedStats {
        field: String,
    },
    Histogram {
        field: String,
        interval: f64,
    },
    DateHistogram {
        field: String,
        interval_ms: i64,
    },
    Percentiles {
        field: String,
        #[serde(default = "default_percents")]
        percents: Vec<f64>,
    },
    Cardinality {
        field: String,
    },
}

fn default_terms_size() -> usize {
    10
}

fn default_percents() -> Vec<f64> {
    vec![1.0, 5.0, 25.0, 50.0, 75.0, 95.0, 99.0]
}

impl Aggregation {
    pub fn field(&self) -> &str {
        match self {
            Aggregation::Terms { field, .. } => field,
            Aggregation::Stats { field } => field,
            Aggregation::ExtendedStats { field } => field,
            Aggregation::Histogram { field, .. } => field,
            Aggregation::DateHistogram { field, .. } => field,
            Aggregation::Percentiles { field, .. } => field,
            Aggregation::Cardinality { field } => field,
        }
    }
}

// ------------------------- client-facing response -------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub took: u64,
    pub timed_out: bool,
    #[serde(rename = "_shards")]
    pub shards: ShardStatistics,
    pub hits: HitsMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregations: Option<BTreeMap<String, AggregationResult>>,
    /// Set when aggregations were computed over a strict subset of shards.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_partial: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStatistics {
    pub total: u32,
    pub successful: u32,
    pub skipped: u32,
    pub failed: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ShardFailure>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFailure {
    pub shard: u32,
    pub index: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HitsMeta {
    pub total: TotalHits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,
    pub hits: Vec<Hit>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalHits {
    pub value: u64,
    pub relation: TotalRelation,
}

impl Default for TotalHits {
    fn default() -> Self {
        TotalHits {
            value: 0,
            relation: TotalRelation::Eq,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TotalRelation {
    #[serde(rename = "eq")]
    Eq,
    #[serde(rename = "gte")]
    Gte,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_score", default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(rename = "_source")]
    pub source: json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregationResult {
    Terms {
        buckets: Vec<TermsBucket>,
    },
    Stats {
        count: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        avg: Option<f64>,
        sum: f64,
    },
    ExtendedStats {
        count: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        avg: Option<f64>,
        sum: f64,
        sum_of_squares: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        variance: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        std_deviation: Option<f64>,
    },
    Histogram {
        buckets: Vec<HistogramBucket>,
    },
    Percentiles {
        values: BTreeMap<String, f64>,
    },
    Cardinality {
        value: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TermsBucket {
    pub key: String,
    pub doc_count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub key: f64,
    pub doc_count: u64,
}

// --------------------- shard-level partial results ------------------------

/// One matching document as returned by a shard, before global merging.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardHit {
    pub doc_id: String,
    pub score: f64,
    pub source: json::Value,
    /// Values of the request's sort fields, in request order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort_values: Vec<json::Value>,
}

/// Mergeable per-shard aggregation partial.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggPartial {
    Terms {
        counts: BTreeMap<String, u64>,
    },
    Stats {
        count: u64,
        sum: f64,
        sum_of_squares: f64,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// Bucket index -> count; `key = index * interval`.
    Histogram {
        interval: f64,
        counts: BTreeMap<i64, u64>,
    },
    Percentiles {
        digest: QuantileDigest,
    },
    Cardinality {
        sketch: CardinalitySketch,
    },
}

/// A shard's answer to one sub-query of a fan-out.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardSearchResponse {
    pub total: u64,
    pub hits: Vec<ShardHit>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aggs: BTreeMap<String, AggPartial>,
    pub took_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::json::json;

    #[test]
    fn test_response_wire_shape() {
        let resp = SearchResponse {
            took: 3,
            timed_out: false,
            shards: ShardStatistics {
                total: 3,
                successful: 3,
                skipped: 0,
                failed: 0,
                failures: vec![],
            },
            hits: HitsMeta {
                total: TotalHits {
                    value: 2,
                    relation: TotalRelation::Eq,
                },
                max_score: Some(1.2),
                hits: vec![Hit {
                    id: "d1".to_string(),
                    score: Some(1.2),
                    source: json!({"title": "quick fox"}),
                    sort: vec![],
                }],
            },
            aggregations: None,
            is_partial: false,
        };
        let v: json::Value = json::from_str(&json::to_string(&resp).unwrap()).unwrap();
        assert_eq!(v["_shards"]["total"], json!(3));
        assert_eq!(v["hits"]["total"]["relation"], json!("eq"));
        assert_eq!(v["hits"]["hits"][0]["_id"], json!("d1"));
        assert!(v.get("is_partial").is_none());
    }

    #[test]
    fn test_request_defaults() {
        let req: SearchRequest =
            json::from_str(r#"{"query": "match_all"}"#).unwrap();
        assert_eq!(req.from, 0);
        assert_eq!(req.size, 10);
        assert!(req.sort.is_empty());
        assert!(!req.strict);
    }

    #[test]
    fn test_agg_serde() {
        let agg: Aggregation =
            json::from_str(r#"{"terms": {"field": "status", "size": 5}}"#).unwrap();
        assert_eq!(
            agg,
            Aggregation::Terms {
                field: "status".to_string(),
                size: 5
            }
        );
        assert_eq!(agg.field(), "status");
    }
}
