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

use serde::{Deserialize, Serialize};

use crate::utils::json;

/// Query AST. Produced by the coordinator's parser, consumed by the planner,
/// and shipped to shards inside pushed-down filter expressions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    MatchAll,
    Term {
        field: String,
        value: json::Value,
    },
    Match {
        field: String,
        text: String,
    },
    Range {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gte: Option<json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lte: Option<json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gt: Option<json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lt: Option<json::Value>,
    },
    Prefix {
        field: String,
        prefix: String,
    },
    Wildcard {
        field: String,
        pattern: String,
    },
    Bool {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        must: Vec<Query>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        should: Vec<Query>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        filter: Vec<Query>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        must_not: Vec<Query>,
    },
    Udf {
        name: String,
        #[serde(default)]
        version: String,
        #[serde(default)]
        params: json::Value,
    },
}

impl Query {
    pub fn is_match_all(&self) -> bool {
        matches!(self, Query::MatchAll)
    }

    /// True when the query tree contains a UDF node anywhere. UDF filters run
    /// as a post-filter on final hits and block pushdown across them.
    pub fn contains_udf(&self) -> bool {
        match self {
            Query::Udf { .. } => true,
            Query::Bool {
                must,
                should,
                filter,
                must_not,
            } => must
                .iter()
                .chain(should)
                .chain(filter)
                .chain(must_not)
                .any(|q| q.contains_udf()),
            _ => false,
        }
    }

    /// Split a query into (index-evaluable part, udf post-filters). The
    /// index-evaluable part never contains UDF nodes.
    pub fn split_udf(&self) -> (Query, Vec<Query>) {
        match self {
            Query::Udf { .. } => (Query::MatchAll, vec![self.clone()]),
            Query::Bool {
                must,
                should,
                filter,
                must_not,
            } => {
                let mut udfs = Vec::new();
                let mut keep = |qs: &[Query]| -> Vec<Query> {
                    qs.iter()
                        .filter(|q| {
                            if let Query::Udf { .. } = q {
                                udfs.push((*q).clone());
                                false
                            } else {
                                true
                            }
                        })
                        .cloned()
                        .collect()
                };
                let q = Query::Bool {
                    must: keep(must),
                    should: should.to_vec(),
                    filter: keep(filter),
                    must_not: must_not.to_vec(),
                };
                (q, udfs)
            }
            _ => (self.clone(), Vec::new()),
        }
    }

    /// Canonical form for cache keys: bool clause lists are sorted by their
    /// serialized representation so clause order does not fragment the cache.
    pub fn normalized(&self) -> Query {
        match self {
            Query::Bool {
                must,
                should,
                filter,
                must_not,
            } => {
                let mut norm = |qs: &[Query]| -> Vec<Query> {
                    let mut v: Vec<Query> = qs.iter().map(|q| q.normalized()).collect();
                    v.sort_by_key(|q| json::to_string(q).unwrap_or_default());
                    v
                };
                Query::Bool {
                    must: norm(must),
                    should: norm(should),
                    filter: norm(filter),
                    must_not: norm(must_not),
                }
            }
            _ => self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::json::json;

    #[test]
    fn test_normalized_sorts_clauses() {
        let a = Query::Bool {
            must: vec![
                Query::Term {
                    field: "b".to_string(),
                    value: json!(1),
                },
                Query::Term {
                    field: "a".to_string(),
                    value: json!(1),
                },
            ],
            should: vec![],
            filter: vec![],
            must_not: vec![],
        };
        let b = Query::Bool {
            must: vec![
                Query::Term {
                    field: "a".to_string(),
                    value: json!(1),
                },
                Query::Term {
                    field: "b".to_string(),
                    value: json!(1),
                },
            ],
            should: vec![],
            filter: vec![],
            must_not: vec![],
        };
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn test_split_udf() {
        let q = Query::Bool {
            must: vec![
                Query::Match {
                    field: "title".to_string(),
                    text: "fox".to_string(),
                },
                Query::Udf {
                    name: "geo_fence".to_string(),
                    version: "1".to_string(),
                    params: json!({"radius": 10}),
                },
            ],
            should: vec![],
            filter: vec![],
            must_not: vec![],
        };
        let (rest, udfs) = q.split_udf();
        assert_eq!(udfs.len(), 1);
        assert!(!rest.contains_udf());
    }

    #[test]
    fn test_serde_roundtrip() {
        let q = Query::Range {
            field: "price".to_string(),
            gte: Some(json!(10)),
            lte: None,
            gt: None,
            lt: Some(json!(99.5)),
        };
        let s = json::to_string(&q).unwrap();
        let back: Query = json::from_str(&s).unwrap();
        assert_eq!(q, back);
    }
}
