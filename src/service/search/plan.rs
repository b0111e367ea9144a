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

//! Plan trees. The logical plan describes what to compute; the physical plan
//! adds a cost and a concrete execution strategy per node. Both are sum types
//! so the optimizer and executors can match on structure.

use std::collections::BTreeMap;

use config::meta::{
    query::Query,
    search::{Aggregation, SortField},
};
use serde::{Deserialize, Serialize};

/// Default row estimate for a shard scan when no statistics are available.
pub const DEFAULT_SCAN_ROWS: u64 = 10_000;
/// Selectivity guess for a filter with no statistics.
pub const FILTER_SELECTIVITY: f64 = 0.25;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogicalPlan {
    Scan {
        index: String,
        shards: Vec<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pushed_filter: Option<Query>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_hint: Option<usize>,
    },
    Filter {
        expr: Query,
        child: Box<LogicalPlan>,
    },
    Project {
        fields: Vec<String>,
        child: Box<LogicalPlan>,
    },
    Aggregate {
        group_by: Vec<String>,
        aggs: BTreeMap<String, Aggregation>,
        child: Box<LogicalPlan>,
    },
    Sort {
        fields: Vec<SortField>,
        child: Box<LogicalPlan>,
    },
    Limit {
        n: usize,
        offset: usize,
        child: Box<LogicalPlan>,
    },
    TopN {
        n: usize,
        offset: usize,
        sort_fields: Vec<SortField>,
        child: Box<LogicalPlan>,
    },
}

impl LogicalPlan {
    pub fn child(&self) -> Option<&LogicalPlan> {
        match self {
            LogicalPlan::Scan { .. } => None,
            LogicalPlan::Filter { child, .. }
            | LogicalPlan::Project { child, .. }
            | LogicalPlan::Aggregate { child, .. }
            | LogicalPlan::Sort { child, .. }
            | LogicalPlan::Limit { child, .. }
            | LogicalPlan::TopN { child, .. } => Some(child),
        }
    }

    /// Estimated cardinality of this node's output.
    pub fn cardinality(&self) -> u64 {
        match self {
            LogicalPlan::Scan {
                shards, limit_hint, ..
            } => {
                let rows = DEFAULT_SCAN_ROWS * shards.len().max(1) as u64;
                match limit_hint {
                    Some(limit) => rows.min(*limit as u64),
                    None => rows,
                }
            }
            LogicalPlan::Filter { child, .. } => {
                ((child.cardinality() as f64) * FILTER_SELECTIVITY).ceil() as u64
            }
            LogicalPlan::Project { child, .. } => child.cardinality(),
            LogicalPlan::Aggregate { child, .. } => child.cardinality().min(1024),
            LogicalPlan::Sort { child, .. } => child.cardinality(),
            LogicalPlan::Limit { n, offset, child } | LogicalPlan::TopN { n, offset, child, .. } => {
                child.cardinality().min((*n + *offset) as u64)
            }
        }
    }

    /// True when per-shard results can be merged without re-sorting, so the
    /// fan-out executor may skip the `from+size` sub-query rewrite.
    pub fn is_order_insensitive(&self) -> bool {
        match self {
            LogicalPlan::Scan { .. } => true,
            LogicalPlan::Sort { .. } | LogicalPlan::TopN { .. } => false,
            LogicalPlan::Limit { offset, child, .. } => *offset == 0 && child.is_order_insensitive(),
            LogicalPlan::Filter { child, .. }
            | LogicalPlan::Project { child, .. }
            | LogicalPlan::Aggregate { child, .. } => child.is_order_insensitive(),
        }
    }

    /// Stable fingerprint used as the physical-plan cache key.
    pub fn fingerprint(&self) -> u64 {
        let encoded = serde_json::to_string(self).unwrap_or_default();
        config::utils::hash::Fnv64a::new().sum64(&encoded)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
}

impl Cost {
    pub fn new(cpu: f64, memory: f64, network: f64) -> Self {
        Cost {
            cpu,
            memory,
            network,
        }
    }

    pub fn total(&self) -> f64 {
        self.cpu + 0.5 * self.memory + 2.0 * self.network
    }

    pub fn add(&self, other: &Cost) -> Cost {
        Cost {
            cpu: self.cpu + other.cpu,
            memory: self.memory + other.memory,
            network: self.network + other.network,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopNStrategy {
    /// Min-heap of size n, O(rows log n) cpu, O(n) memory.
    Heap,
    /// Materialize and sort everything.
    FullSort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateStrategy {
    Hash,
    Streaming,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PhysicalPlan {
    ShardScan {
        index: String,
        shards: Vec<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Query>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit_hint: Option<usize>,
        rows: u64,
        cost: Cost,
    },
    Filter {
        expr: Query,
        child: Box<PhysicalPlan>,
        rows: u64,
        cost: Cost,
    },
    Project {
        fields: Vec<String>,
        child: Box<PhysicalPlan>,
        rows: u64,
        cost: Cost,
    },
    Aggregate {
        group_by: Vec<String>,
        aggs: BTreeMap<String, Aggregation>,
        strategy: AggregateStrategy,
        child: Box<PhysicalPlan>,
        rows: u64,
        cost: Cost,
    },
    Sort {
        fields: Vec<SortField>,
        child: Box<PhysicalPlan>,
        rows: u64,
        cost: Cost,
    },
    Limit {
        n: usize,
        offset: usize,
        child: Box<PhysicalPlan>,
        rows: u64,
        cost: Cost,
    },
    TopN {
        n: usize,
        offset: usize,
        sort_fields: Vec<SortField>,
        strategy: TopNStrategy,
        child: Box<PhysicalPlan>,
        rows: u64,
        cost: Cost,
    },
}

impl PhysicalPlan {
    pub fn child(&self) -> Option<&PhysicalPlan> {
        match self {
            PhysicalPlan::ShardScan { .. } => None,
            PhysicalPlan::Filter { child, .. }
            | PhysicalPlan::Project { child, .. }
            | PhysicalPlan::Aggregate { child, .. }
            | PhysicalPlan::Sort { child, .. }
            | PhysicalPlan::Limit { child, .. }
            | PhysicalPlan::TopN { child, .. } => Some(child),
        }
    }

    pub fn rows(&self) -> u64 {
        match self {
            PhysicalPlan::ShardScan { rows, .. }
            | PhysicalPlan::Filter { rows, .. }
            | PhysicalPlan::Project { rows, .. }
            | PhysicalPlan::Aggregate { rows, .. }
            | PhysicalPlan::Sort { rows, .. }
            | PhysicalPlan::Limit { rows, .. }
            | PhysicalPlan::TopN { rows, .. } => *rows,
        }
    }

    pub fn cost(&self) -> Cost {
        match self {
            PhysicalPlan::ShardScan { cost, .. }
            | PhysicalPlan::Filter { cost, .. }
            | PhysicalPlan::Project { cost, .. }
            | PhysicalPlan::Aggregate { cost, .. }
            | PhysicalPlan::Sort { cost, .. }
            | PhysicalPlan::Limit { cost, .. }
            | PhysicalPlan::TopN { cost, .. } => *cost,
        }
    }

    /// Total cost of the whole tree.
    pub fn total_cost(&self) -> f64 {
        let mut total = self.cost().total();
        if let Some(child) = self.child() {
            total += child.total_cost();
        }
        total
    }

    /// The scan at the bottom of the tree. Every well-formed plan has one.
    pub fn scan(&self) -> Option<&PhysicalPlan> {
        match self {
            PhysicalPlan::ShardScan { .. } => Some(self),
            _ => self.child().and_then(|c| c.scan()),
        }
    }

    pub fn index_name(&self) -> Option<&str> {
        match self.scan() {
            Some(PhysicalPlan::ShardScan { index, .. }) => Some(index),
            _ => None,
        }
    }

    /// Rewrite for one shard of a fan-out: the shard evaluates the plan over
    /// its local data only, and pagination windows become `0..from+size` so
    /// global top-K can be merged correctly.
    pub fn for_shard(&self, shard_id: u32, order_insensitive: bool) -> PhysicalPlan {
        match self {
            PhysicalPlan::ShardScan {
                index,
                filter,
                limit_hint,
                rows,
                cost,
                ..
            } => PhysicalPlan::ShardScan {
                index: index.clone(),
                shards: vec![shard_id],
                filter: filter.clone(),
                limit_hint: *limit_hint,
                rows: *rows,
                cost: *cost,
            },
            PhysicalPlan::Limit {
                n,
                offset,
                child,
                rows,
                cost,
            } => {
                let (n, offset) = if order_insensitive {
                    (*n, *offset)
                } else {
                    (*n + *offset, 0)
                };
                PhysicalPlan::Limit {
                    n,
                    offset,
                    child: Box::new(child.for_shard(shard_id, order_insensitive)),
                    rows: *rows,
                    cost: *cost,
                }
            }
            PhysicalPlan::TopN {
                n,
                offset,
                sort_fields,
                strategy,
                child,
                rows,
                cost,
            } => PhysicalPlan::TopN {
                n: *n + *offset,
                offset: 0,
                sort_fields: sort_fields.clone(),
                strategy: *strategy,
                child: Box::new(child.for_shard(shard_id, order_insensitive)),
                rows: *rows,
                cost: *cost,
            },
            PhysicalPlan::Filter {
                expr,
                child,
                rows,
                cost,
            } => PhysicalPlan::Filter {
                expr: expr.clone(),
                child: Box::new(child.for_shard(shard_id, order_insensitive)),
                rows: *rows,
                cost: *cost,
            },
            PhysicalPlan::Project {
                fields,
                child,
                rows,
                cost,
            } => PhysicalPlan::Project {
                fields: fields.clone(),
                child: Box::new(child.for_shard(shard_id, order_insensitive)),
                rows: *rows,
                cost: *cost,
            },
            PhysicalPlan::Aggregate {
                group_by,
                aggs,
                strategy,
                child,
                rows,
                cost,
            } => PhysicalPlan::Aggregate {
                group_by: group_by.clone(),
                aggs: aggs.clone(),
                strategy: *strategy,
                child: Box::new(child.for_shard(shard_id, order_insensitive)),
                rows: *rows,
                cost: *cost,
            },
            PhysicalPlan::Sort {
                fields,
                child,
                rows,
                cost,
            } => PhysicalPlan::Sort {
                fields: fields.clone(),
                child: Box::new(child.for_shard(shard_id, order_insensitive)),
                rows: *rows,
                cost: *cost,
            },
        }
    }

    /// One-line rendering used by the optimizer trace log.
    pub fn describe(&self) -> String {
        match self {
            PhysicalPlan::ShardScan { index, filter, .. } => match filter {
                Some(_) => format!("ShardScan({index}, filtered)"),
                None => format!("ShardScan({index})"),
            },
            PhysicalPlan::Filter { child, .. } => format!("Filter -> {}", child.describe()),
            PhysicalPlan::Project { child, .. } => format!("Project -> {}", child.describe()),
            PhysicalPlan::Aggregate {
                strategy, child, ..
            } => format!("Aggregate({strategy:?}) -> {}", child.describe()),
            PhysicalPlan::Sort { child, .. } => format!("Sort -> {}", child.describe()),
            PhysicalPlan::Limit { n, child, .. } => format!("Limit({n}) -> {}", child.describe()),
            PhysicalPlan::TopN {
                n,
                strategy,
                child,
                ..
            } => format!("TopN({n}, {strategy:?}) -> {}", child.describe()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan() -> LogicalPlan {
        LogicalPlan::Scan {
            index: "logs".to_string(),
            shards: vec![0, 1, 2],
            pushed_filter: None,
            limit_hint: None,
        }
    }

    #[test]
    fn test_cardinality_shrinks_through_tree() {
        let plan = LogicalPlan::Limit {
            n: 10,
            offset: 0,
            child: Box::new(LogicalPlan::Filter {
                expr: Query::MatchAll,
                child: Box::new(scan()),
            }),
        };
        assert!(plan.cardinality() <= 10);
        assert!(scan().cardinality() >= DEFAULT_SCAN_ROWS);
    }

    #[test]
    fn test_cost_total_weights() {
        let cost = Cost::new(10.0, 4.0, 3.0);
        assert_eq!(cost.total(), 10.0 + 2.0 + 6.0);
    }

    #[test]
    fn test_order_insensitive() {
        assert!(scan().is_order_insensitive());
        let sorted = LogicalPlan::Sort {
            fields: vec![],
            child: Box::new(scan()),
        };
        assert!(!sorted.is_order_insensitive());
        let offset = LogicalPlan::Limit {
            n: 10,
            offset: 5,
            child: Box::new(scan()),
        };
        assert!(!offset.is_order_insensitive());
    }

    #[test]
    fn test_fingerprint_stable() {
        let a = scan();
        let b = scan();
        assert_eq!(a.fingerprint(), b.fingerprint());
        let c = LogicalPlan::Scan {
            index: "other".to_string(),
            shards: vec![0],
            pushed_filter: None,
            limit_hint: None,
        };
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_for_shard_rewrites_window() {
        let physical = PhysicalPlan::TopN {
            n: 10,
            offset: 5,
            sort_fields: vec![],
            strategy: TopNStrategy::Heap,
            child: Box::new(PhysicalPlan::ShardScan {
                index: "logs".to_string(),
                shards: vec![0, 1, 2],
                filter: None,
                limit_hint: None,
                rows: 100,
                cost: Cost::default(),
            }),
            rows: 15,
            cost: Cost::default(),
        };
        let per_shard = physical.for_shard(1, false);
        match &per_shard {
            PhysicalPlan::TopN { n, offset, child, .. } => {
                assert_eq!((*n, *offset), (15, 0));
                match child.as_ref() {
                    PhysicalPlan::ShardScan { shards, .. } => assert_eq!(shards, &vec![1]),
                    other => panic!("unexpected child: {other:?}"),
                }
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }
}
