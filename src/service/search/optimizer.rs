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

//! Rule-based optimizer. Rules are pure `plan -> Option<plan>` functions
//! applied in priority order to a fixed point, capped at [`MAX_PASSES`]. A
//! repeated plan shape means the rule set is cycling; optimization stops and
//! the best plan found so far is returned.

use std::collections::HashSet;

use config::meta::{query::Query, search::Aggregation};

use super::plan::LogicalPlan;

pub const MAX_PASSES: usize = 10;

pub struct Rule {
    pub name: &'static str,
    pub priority: u8,
    pub apply: fn(&LogicalPlan) -> Option<LogicalPlan>,
}

/// The rule table, ordered by descending priority.
pub fn rules() -> &'static [Rule] {
    &[
        Rule {
            name: "filter_pushdown",
            priority: 95,
            apply: filter_pushdown,
        },
        Rule {
            name: "sort_limit_to_topn",
            priority: 85,
            apply: sort_limit_to_topn,
        },
        Rule {
            name: "limit_pushdown",
            priority: 75,
            apply: limit_pushdown,
        },
        Rule {
            name: "predicate_pushdown_aggregate",
            priority: 75,
            apply: predicate_pushdown_aggregate,
        },
        Rule {
            name: "redundant_filter_elimination",
            priority: 70,
            apply: redundant_filter_elimination,
        },
        Rule {
            name: "projection_merge",
            priority: 60,
            apply: projection_merge,
        },
    ]
}

/// Optimize to a fixed point. Also returns the trace of fired rules so
/// callers can log `optimizer trace: [...]`.
pub fn optimize(plan: LogicalPlan) -> (LogicalPlan, Vec<&'static str>) {
    let mut plan = plan;
    let mut trace = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();
    seen.insert(plan.fingerprint());
    for _pass in 0..MAX_PASSES {
        let mut changed = false;
        for rule in rules() {
            if let Some(next) = apply_recursive(rule.apply, &plan) {
                trace.push(rule.name);
                plan = next;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        if !seen.insert(plan.fingerprint()) {
            log::warn!(
                "[SEARCH] optimizer cycle detected after rules {:?}, keeping current plan",
                trace
            );
            break;
        }
    }
    (plan, trace)
}

/// Apply a rule top-down, rebuilding the tree if any node changed.
fn apply_recursive(
    rule: fn(&LogicalPlan) -> Option<LogicalPlan>,
    plan: &LogicalPlan,
) -> Option<LogicalPlan> {
    if let Some(next) = rule(plan) {
        // rerun on the rewritten node so cascades settle in one pass
        return Some(apply_recursive(rule, &next).unwrap_or(next));
    }
    let child = plan.child()?;
    let new_child = apply_recursive(rule, child)?;
    Some(replace_child(plan, new_child))
}

fn replace_child(plan: &LogicalPlan, new_child: LogicalPlan) -> LogicalPlan {
    let mut cloned = plan.clone();
    match &mut cloned {
        LogicalPlan::Scan { .. } => unreachable!("scan has no child"),
        LogicalPlan::Filter { child, .. }
        | LogicalPlan::Project { child, .. }
        | LogicalPlan::Aggregate { child, .. }
        | LogicalPlan::Sort { child, .. }
        | LogicalPlan::Limit { child, .. }
        | LogicalPlan::TopN { child, .. } => *child = Box::new(new_child),
    }
    cloned
}

// ------------------------------- the rules --------------------------------

/// Filter directly above a scan fuses into the scan. UDF filters stay put:
/// they run as a post-filter on final hits.
fn filter_pushdown(plan: &LogicalPlan) -> Option<LogicalPlan> {
    let LogicalPlan::Filter { expr, child } = plan else {
        return None;
    };
    if expr.contains_udf() || is_always_true(expr) {
        return None;
    }
    let LogicalPlan::Scan {
        index,
        shards,
        pushed_filter,
        limit_hint,
    } = child.as_ref()
    else {
        return None;
    };
    let merged = match pushed_filter {
        None => expr.clone(),
        Some(existing) => Query::Bool {
            must: vec![],
            should: vec![],
            filter: vec![existing.clone(), expr.clone()],
            must_not: vec![],
        },
    };
    Some(LogicalPlan::Scan {
        index: index.clone(),
        shards: shards.clone(),
        pushed_filter: Some(merged),
        limit_hint: *limit_hint,
    })
}

/// Limit over Sort materializes only the window: TopN.
fn sort_limit_to_topn(plan: &LogicalPlan) -> Option<LogicalPlan> {
    let LogicalPlan::Limit { n, offset, child } = plan else {
        return None;
    };
    let LogicalPlan::Sort { fields, child } = child.as_ref() else {
        return None;
    };
    Some(LogicalPlan::TopN {
        n: *n,
        offset: *offset,
        sort_fields: fields.clone(),
        child: child.clone(),
    })
}

/// Limit directly above a scan propagates its window into the scan as a
/// fetch bound. The Limit node stays for the final slice.
fn limit_pushdown(plan: &LogicalPlan) -> Option<LogicalPlan> {
    let LogicalPlan::Limit { n, offset, child } = plan else {
        return None;
    };
    let LogicalPlan::Scan {
        index,
        shards,
        pushed_filter,
        limit_hint,
    } = child.as_ref()
    else {
        return None;
    };
    let wanted = n + offset;
    if limit_hint.is_some_and(|hint| hint <= wanted) {
        return None;
    }
    Some(LogicalPlan::Limit {
        n: *n,
        offset: *offset,
        child: Box::new(LogicalPlan::Scan {
            index: index.clone(),
            shards: shards.clone(),
            pushed_filter: pushed_filter.clone(),
            limit_hint: Some(wanted),
        }),
    })
}

/// A filter above an aggregate moves below it when the predicate only
/// touches group-by keys or fields no aggregation reads.
fn predicate_pushdown_aggregate(plan: &LogicalPlan) -> Option<LogicalPlan> {
    let LogicalPlan::Filter { expr, child } = plan else {
        return None;
    };
    let LogicalPlan::Aggregate {
        group_by,
        aggs,
        child: agg_child,
    } = child.as_ref()
    else {
        return None;
    };
    if expr.contains_udf() {
        return None;
    }
    let pred_fields = query_fields(expr);
    let agg_fields: Vec<&str> = aggs.values().map(Aggregation::field).collect();
    let pushable = pred_fields.iter().all(|f| {
        group_by.iter().any(|g| g == f) || !agg_fields.contains(&f.as_str())
    });
    if !pushable {
        return None;
    }
    Some(LogicalPlan::Aggregate {
        group_by: group_by.clone(),
        aggs: aggs.clone(),
        child: Box::new(LogicalPlan::Filter {
            expr: expr.clone(),
            child: agg_child.clone(),
        }),
    })
}

fn redundant_filter_elimination(plan: &LogicalPlan) -> Option<LogicalPlan> {
    let LogicalPlan::Filter { expr, child } = plan else {
        return None;
    };
    if is_always_true(expr) {
        return Some(child.as_ref().clone());
    }
    None
}

fn is_always_true(query: &Query) -> bool {
    match query {
        Query::MatchAll => true,
        Query::Bool {
            must,
            should,
            filter,
            must_not,
        } => {
            must_not.is_empty()
                && should.is_empty()
                && must.iter().chain(filter).all(is_always_true)
                && !(must.is_empty() && filter.is_empty())
        }
        _ => false,
    }
}

/// Nested projections collapse into one keeping the outer (narrower) set.
fn projection_merge(plan: &LogicalPlan) -> Option<LogicalPlan> {
    let LogicalPlan::Project { fields, child } = plan else {
        return None;
    };
    let LogicalPlan::Project {
        fields: inner,
        child: grandchild,
    } = child.as_ref()
    else {
        return None;
    };
    let merged: Vec<String> = fields
        .iter()
        .filter(|f| inner.contains(f))
        .cloned()
        .collect();
    Some(LogicalPlan::Project {
        fields: merged,
        child: grandchild.clone(),
    })
}

fn query_fields(query: &Query) -> Vec<String> {
    match query {
        Query::MatchAll | Query::Udf { .. } => vec![],
        Query::Term { field, .. }
        | Query::Match { field, .. }
        | Query::Range { field, .. }
        | Query::Prefix { field, .. }
        | Query::Wildcard { field, .. } => vec![field.clone()],
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
            .flat_map(query_fields)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::meta::search::{SortField, SortOrder};
    use config::utils::json::json;

    fn scan() -> LogicalPlan {
        LogicalPlan::Scan {
            index: "logs".to_string(),
            shards: vec![0, 1],
            pushed_filter: None,
            limit_hint: None,
        }
    }

    fn term(field: &str) -> Query {
        Query::Term {
            field: field.to_string(),
            value: json!("x"),
        }
    }

    #[test]
    fn test_filter_fuses_into_scan() {
        let plan = LogicalPlan::Filter {
            expr: term("status"),
            child: Box::new(scan()),
        };
        let (optimized, trace) = optimize(plan);
        assert!(trace.contains(&"filter_pushdown"));
        match optimized {
            LogicalPlan::Scan { pushed_filter, .. } => {
                assert_eq!(pushed_filter, Some(term("status")))
            }
            other => panic!("filter not fused: {other:?}"),
        }
    }

    #[test]
    fn test_sort_limit_becomes_topn() {
        let plan = LogicalPlan::Limit {
            n: 10,
            offset: 0,
            child: Box::new(LogicalPlan::Sort {
                fields: vec![SortField {
                    field: "price".to_string(),
                    order: SortOrder::Desc,
                }],
                child: Box::new(scan()),
            }),
        };
        let (optimized, trace) = optimize(plan);
        assert!(trace.contains(&"sort_limit_to_topn"));
        match optimized {
            LogicalPlan::TopN { n, sort_fields, .. } => {
                assert_eq!(n, 10);
                assert_eq!(sort_fields[0].field, "price");
            }
            other => panic!("expected TopN: {other:?}"),
        }
    }

    #[test]
    fn test_limit_pushes_hint_into_scan() {
        let plan = LogicalPlan::Limit {
            n: 10,
            offset: 5,
            child: Box::new(scan()),
        };
        let (optimized, _) = optimize(plan);
        match optimized {
            LogicalPlan::Limit { child, .. } => match child.as_ref() {
                LogicalPlan::Scan { limit_hint, .. } => assert_eq!(*limit_hint, Some(15)),
                other => panic!("expected scan: {other:?}"),
            },
            other => panic!("expected limit: {other:?}"),
        }
    }

    #[test]
    fn test_match_all_filter_eliminated() {
        let plan = LogicalPlan::Filter {
            expr: Query::MatchAll,
            child: Box::new(scan()),
        };
        let (optimized, trace) = optimize(plan);
        assert!(trace.contains(&"redundant_filter_elimination") || trace.contains(&"filter_pushdown"));
        // either eliminated or fused; both leave a bare scan-shaped plan
        assert!(matches!(optimized, LogicalPlan::Scan { .. }));
    }

    #[test]
    fn test_udf_filter_not_pushed() {
        let plan = LogicalPlan::Filter {
            expr: Query::Udf {
                name: "geo".to_string(),
                version: "1".to_string(),
                params: json!(null),
            },
            child: Box::new(scan()),
        };
        let (optimized, _) = optimize(plan);
        assert!(matches!(optimized, LogicalPlan::Filter { .. }));
    }

    #[test]
    fn test_projection_merge() {
        let plan = LogicalPlan::Project {
            fields: vec!["a".to_string(), "b".to_string()],
            child: Box::new(LogicalPlan::Project {
                fields: vec!["a".to_string(), "c".to_string()],
                child: Box::new(scan()),
            }),
        };
        let (optimized, _) = optimize(plan);
        match optimized {
            LogicalPlan::Project { fields, child } => {
                assert_eq!(fields, vec!["a".to_string()]);
                assert!(matches!(child.as_ref(), LogicalPlan::Scan { .. }));
            }
            other => panic!("expected project: {other:?}"),
        }
    }

    #[test]
    fn test_fixed_point_terminates() {
        // the full stack: limit over sort over filter over scan
        let plan = LogicalPlan::Limit {
            n: 10,
            offset: 0,
            child: Box::new(LogicalPlan::Sort {
                fields: vec![SortField {
                    field: "price".to_string(),
                    order: SortOrder::Desc,
                }],
                child: Box::new(LogicalPlan::Filter {
                    expr: term("status"),
                    child: Box::new(scan()),
                }),
            }),
        };
        let (optimized, _) = optimize(plan);
        // topn over filtered scan
        match optimized {
            LogicalPlan::TopN { child, .. } => match child.as_ref() {
                LogicalPlan::Scan { pushed_filter, .. } => assert!(pushed_filter.is_some()),
                other => panic!("expected scan: {other:?}"),
            },
            other => panic!("expected topn: {other:?}"),
        }
    }

    #[test]
    fn test_clause_order_confluence() {
        let a = LogicalPlan::Filter {
            expr: Query::Bool {
                must: vec![term("a"), term("b")],
                should: vec![],
                filter: vec![],
                must_not: vec![],
            },
            child: Box::new(scan()),
        };
        let b = LogicalPlan::Filter {
            expr: Query::Bool {
                must: vec![term("b"), term("a")],
                should: vec![],
                filter: vec![],
                must_not: vec![],
            },
            child: Box::new(scan()),
        };
        let (oa, _) = optimize(a);
        let (ob, _) = optimize(b);
        // same shape either way
        assert!(matches!(oa, LogicalPlan::Scan { .. }));
        assert!(matches!(ob, LogicalPlan::Scan { .. }));
    }
}
