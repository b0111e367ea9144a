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

//! Logical plan construction from a parsed request, and the cost-based
//! physical planner that picks execution strategies.

use config::{get_config, meta::search::SearchRequest};

use super::plan::{
    AggregateStrategy, Cost, LogicalPlan, PhysicalPlan, TopNStrategy,
};

/// Build the logical tree for one request. The shape is always
/// `Limit(Sort?(Aggregate?(Filter?(Scan))))`; the optimizer reshapes it.
pub fn build_logical(req: &SearchRequest, index: &str, shards: Vec<u32>) -> LogicalPlan {
    let mut plan = LogicalPlan::Scan {
        index: index.to_string(),
        shards,
        pushed_filter: None,
        limit_hint: None,
    };
    if !req.query.is_match_all() {
        plan = LogicalPlan::Filter {
            expr: req.query.clone(),
            child: Box::new(plan),
        };
    }
    if !req.aggs.is_empty() {
        plan = LogicalPlan::Aggregate {
            group_by: Vec::new(),
            aggs: req.aggs.clone(),
            child: Box::new(plan),
        };
    }
    if !req.sort.is_empty() {
        plan = LogicalPlan::Sort {
            fields: req.sort.clone(),
            child: Box::new(plan),
        };
    }
    LogicalPlan::Limit {
        n: req.size,
        offset: req.from,
        child: Box::new(plan),
    }
}

/// Instantiate a physical operator per logical node and cost it.
pub fn build_physical(plan: &LogicalPlan) -> PhysicalPlan {
    let cfg = get_config();
    let rows = plan.cardinality();
    match plan {
        LogicalPlan::Scan {
            index,
            shards,
            pushed_filter,
            limit_hint,
        } => {
            let scanned = rows as f64;
            PhysicalPlan::ShardScan {
                index: index.clone(),
                shards: shards.clone(),
                filter: pushed_filter.clone(),
                limit_hint: *limit_hint,
                rows,
                cost: Cost::new(scanned, scanned * 0.2, scanned * 0.1),
            }
        }
        LogicalPlan::Filter { expr, child } => {
            let input = child.cardinality() as f64;
            PhysicalPlan::Filter {
                expr: expr.clone(),
                child: Box::new(build_physical(child)),
                rows,
                cost: Cost::new(input * 0.25, 0.0, 0.0),
            }
        }
        LogicalPlan::Project { fields, child } => {
            let input = child.cardinality() as f64;
            PhysicalPlan::Project {
                fields: fields.clone(),
                child: Box::new(build_physical(child)),
                rows,
                cost: Cost::new(input * 0.1, input * 0.1, 0.0),
            }
        }
        LogicalPlan::Aggregate {
            group_by,
            aggs,
            child,
        } => {
            let input = child.cardinality() as f64;
            let groups = estimate_groups(child.cardinality());
            let strategy = if (groups as usize) < cfg.limit.agg_hash_cardinality_limit {
                AggregateStrategy::Hash
            } else {
                AggregateStrategy::Streaming
            };
            let memory = match strategy {
                AggregateStrategy::Hash => groups as f64,
                AggregateStrategy::Streaming => 1.0,
            };
            PhysicalPlan::Aggregate {
                group_by: group_by.clone(),
                aggs: aggs.clone(),
                strategy,
                child: Box::new(build_physical(child)),
                rows,
                cost: Cost::new(input, memory, 0.0),
            }
        }
        LogicalPlan::Sort { fields, child } => {
            let input = (child.cardinality() as f64).max(1.0);
            PhysicalPlan::Sort {
                fields: fields.clone(),
                child: Box::new(build_physical(child)),
                rows,
                cost: Cost::new(input * input.log2().max(1.0) * 0.01, input, 0.0),
            }
        }
        LogicalPlan::Limit { n, offset, child } => PhysicalPlan::Limit {
            n: *n,
            offset: *offset,
            child: Box::new(build_physical(child)),
            rows,
            cost: Cost::new(0.01, 0.0, 0.0),
        },
        LogicalPlan::TopN {
            n,
            offset,
            sort_fields,
            child,
        } => {
            let input = (child.cardinality() as f64).max(1.0);
            let window = n + offset;
            let strategy = if window <= cfg.limit.topn_heap_threshold {
                TopNStrategy::Heap
            } else {
                TopNStrategy::FullSort
            };
            let cost = match strategy {
                TopNStrategy::Heap => Cost::new(
                    input * ((window.max(2)) as f64).log2() * 0.01,
                    window as f64,
                    0.0,
                ),
                TopNStrategy::FullSort => {
                    Cost::new(input * input.log2().max(1.0) * 0.01, input, 0.0)
                }
            };
            PhysicalPlan::TopN {
                n: *n,
                offset: *offset,
                sort_fields: sort_fields.clone(),
                strategy,
                child: Box::new(build_physical(child)),
                rows,
                cost,
            }
        }
    }
}

fn estimate_groups(input_rows: u64) -> u64 {
    input_rows.min(1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::meta::search::{SortField, SortOrder};
    use config::utils::json;
    use config::utils::json::json;

    use crate::service::search::optimizer;

    fn request(body: json::Value) -> SearchRequest {
        crate::service::search::parser::parse(&body).unwrap()
    }

    #[test]
    fn test_logical_shape() {
        let req = request(json!({
            "query": {"term": {"status": "active"}},
            "sort": [{"price": "desc"}],
            "from": 5,
            "size": 10
        }));
        let plan = build_logical(&req, "orders", vec![0, 1, 2]);
        match plan {
            LogicalPlan::Limit { n, offset, child } => {
                assert_eq!((n, offset), (10, 5));
                assert!(matches!(child.as_ref(), LogicalPlan::Sort { .. }));
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn test_match_all_skips_filter_node() {
        let req = request(json!({"size": 10}));
        let plan = build_logical(&req, "orders", vec![0]);
        match plan {
            LogicalPlan::Limit { child, .. } => {
                assert!(matches!(child.as_ref(), LogicalPlan::Scan { .. }))
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn test_sorted_query_plans_heap_topn() {
        let req = request(json!({
            "sort": [{"price": "desc"}],
            "size": 10
        }));
        let logical = build_logical(&req, "products", vec![0]);
        let (optimized, _) = optimizer::optimize(logical);
        let physical = build_physical(&optimized);
        match &physical {
            PhysicalPlan::TopN {
                n,
                strategy,
                sort_fields,
                ..
            } => {
                assert_eq!(*n, 10);
                assert_eq!(*strategy, TopNStrategy::Heap);
                assert_eq!(
                    sort_fields,
                    &vec![SortField {
                        field: "price".to_string(),
                        order: SortOrder::Desc
                    }]
                );
            }
            other => panic!("expected TopN: {other:?}"),
        }
    }

    #[test]
    fn test_huge_window_plans_full_sort() {
        let req = request(json!({
            "sort": [{"price": "desc"}],
            "size": 5000
        }));
        let logical = build_logical(&req, "products", vec![0]);
        let (optimized, _) = optimizer::optimize(logical);
        let physical = build_physical(&optimized);
        match &physical {
            PhysicalPlan::TopN { strategy, .. } => {
                assert_eq!(*strategy, TopNStrategy::FullSort)
            }
            other => panic!("expected TopN: {other:?}"),
        }
    }

    #[test]
    fn test_filter_fused_after_optimize() {
        let req = request(json!({
            "query": {"bool": {"filter": [{"term": {"status": "active"}}]}},
            "size": 0
        }));
        let logical = build_logical(&req, "orders", vec![0, 1, 2]);
        let (optimized, trace) = optimizer::optimize(logical);
        assert!(trace.contains(&"filter_pushdown"));
        let physical = build_physical(&optimized);
        match physical.scan() {
            Some(PhysicalPlan::ShardScan { filter, .. }) => assert!(filter.is_some()),
            other => panic!("expected scan: {other:?}"),
        }
    }

    #[test]
    fn test_costs_accumulate() {
        let req = request(json!({
            "query": {"match": {"title": "fox"}},
            "size": 10
        }));
        let logical = build_logical(&req, "products", vec![0]);
        let physical = build_physical(&logical);
        assert!(physical.total_cost() > 0.0);
        assert!(physical.cost().total() < physical.total_cost());
    }
}
