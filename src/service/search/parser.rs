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

//! Parses the OpenSearch-style request JSON into the typed AST, validating
//! as it goes. Everything downstream of the parser works on typed values.

use config::{
    get_config,
    meta::{
        query::Query,
        search::{Aggregation, SearchRequest, SortField, SortOrder},
    },
    utils::json,
};
use infra::errors::{Error, Result};

pub fn parse(raw: &json::Value) -> Result<SearchRequest> {
    let cfg = get_config();
    let obj = raw
        .as_object()
        .ok_or_else(|| Error::InvalidArgument("request body must be a JSON object".to_string()))?;

    let query = match obj.get("query") {
        Some(q) => parse_query(q)?,
        None => Query::MatchAll,
    };
    validate_udf_placement(&query, false)?;

    let from = parse_window(obj.get("from"), "from", 0)?;
    let size = parse_window(obj.get("size"), "size", cfg.limit.query_default_limit as usize)?;
    if from + size > cfg.limit.max_result_window {
        return Err(Error::InvalidArgument(format!(
            "from + size ({}) exceeds max_result_window ({})",
            from + size,
            cfg.limit.max_result_window
        )));
    }

    let sort = match obj.get("sort") {
        Some(s) => parse_sort(s)?,
        None => Vec::new(),
    };
    let aggs = match obj.get("aggs").or_else(|| obj.get("aggregations")) {
        Some(a) => parse_aggs(a)?,
        None => Default::default(),
    };
    let strict = obj
        .get("strict")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let timeout_ms = obj
        .get("timeout_ms")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    Ok(SearchRequest {
        query,
        from,
        size,
        sort,
        aggs,
        strict,
        timeout_ms,
    })
}

fn parse_window(value: Option<&json::Value>, name: &str, default: usize) -> Result<usize> {
    match value {
        None => Ok(default),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 0 => Ok(n as usize),
            _ => Err(Error::InvalidArgument(format!("{name} must be >= 0"))),
        },
    }
}

pub fn parse_query(value: &json::Value) -> Result<Query> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidArgument("query must be a JSON object".to_string()))?;
    if obj.len() != 1 {
        return Err(Error::InvalidArgument(
            "query object must have exactly one key".to_string(),
        ));
    }
    let (kind, body) = obj.iter().next().unwrap();
    match kind.as_str() {
        "match_all" => Ok(Query::MatchAll),
        "term" => {
            let (field, spec) = single_field(body, "term")?;
            let value = match spec.get("value") {
                Some(v) => v.clone(),
                None => spec.clone(),
            };
            if value.is_object() || value.is_array() {
                return Err(Error::InvalidArgument(format!(
                    "term value for field {field} must be a scalar"
                )));
            }
            Ok(Query::Term { field, value })
        }
        "match" => {
            let (field, spec) = single_field(body, "match")?;
            let text = match spec.get("query") {
                Some(v) => json::get_string_value(v),
                None => {
                    if spec.is_object() || spec.is_array() {
                        return Err(Error::InvalidArgument(format!(
                            "match text for field {field} must be a string"
                        )));
                    }
                    json::get_string_value(&spec)
                }
            };
            Ok(Query::Match { field, text })
        }
        "range" => {
            let (field, spec) = single_field(body, "range")?;
            let spec = spec.as_object().ok_or_else(|| {
                Error::InvalidArgument(format!("range for field {field} must be an object"))
            })?;
            let mut bounds = [None, None, None, None];
            for (key, slot) in ["gte", "lte", "gt", "lt"].iter().zip(bounds.iter_mut()) {
                *slot = spec.get(*key).cloned();
            }
            let [gte, lte, gt, lt] = bounds;
            if gte.is_none() && lte.is_none() && gt.is_none() && lt.is_none() {
                return Err(Error::InvalidArgument(format!(
                    "range for field {field} needs at least one bound"
                )));
            }
            check_range_types(&field, [&gte, &lte, &gt, &lt])?;
            Ok(Query::Range {
                field,
                gte,
                lte,
                gt,
                lt,
            })
        }
        "prefix" => {
            let (field, spec) = single_field(body, "prefix")?;
            let prefix = match spec.get("value") {
                Some(v) => json::get_string_value(v),
                None => json::get_string_value(&spec),
            };
            Ok(Query::Prefix { field, prefix })
        }
        "wildcard" => {
            let (field, spec) = single_field(body, "wildcard")?;
            let pattern = match spec.get("value") {
                Some(v) => json::get_string_value(v),
                None => json::get_string_value(&spec),
            };
            Ok(Query::Wildcard { field, pattern })
        }
        "bool" => {
            let spec = body
                .as_object()
                .ok_or_else(|| Error::InvalidArgument("bool must be an object".to_string()))?;
            let clause = |name: &str| -> Result<Vec<Query>> {
                match spec.get(name) {
                    None => Ok(Vec::new()),
                    Some(json::Value::Array(items)) => items.iter().map(parse_query).collect(),
                    Some(single) => Ok(vec![parse_query(single)?]),
                }
            };
            let must = clause("must")?;
            let should = clause("should")?;
            let filter = clause("filter")?;
            let must_not = clause("must_not")?;
            if must.is_empty() && should.is_empty() && filter.is_empty() && must_not.is_empty() {
                return Err(Error::InvalidArgument(
                    "bool query needs at least one clause".to_string(),
                ));
            }
            Ok(Query::Bool {
                must,
                should,
                filter,
                must_not,
            })
        }
        "udf" => {
            let spec = body
                .as_object()
                .ok_or_else(|| Error::InvalidArgument("udf must be an object".to_string()))?;
            let name = spec
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidArgument("udf needs a name".to_string()))?;
            Ok(Query::Udf {
                name: name.to_string(),
                version: spec
                    .get("version")
                    .map(json::get_string_value)
                    .unwrap_or_default(),
                params: spec.get("params").cloned().unwrap_or(json::Value::Null),
            })
        }
        other => Err(Error::InvalidArgument(format!(
            "unknown query kind: {other}"
        ))),
    }
}

/// Field-scoped queries are written `{"kind": {"field": spec}}`; exactly one
/// field is required.
fn single_field(body: &json::Value, kind: &str) -> Result<(String, json::Value)> {
    let obj = body
        .as_object()
        .ok_or_else(|| Error::InvalidArgument(format!("{kind} must be an object")))?;
    if obj.len() != 1 {
        return Err(Error::InvalidArgument(format!(
            "{kind} must name exactly one field"
        )));
    }
    let (field, spec) = obj.iter().next().unwrap();
    if field.is_empty() {
        return Err(Error::InvalidArgument(format!("{kind} field must not be empty")));
    }
    Ok((field.clone(), spec.clone()))
}

/// All present bounds must agree on type: all numeric or all string.
fn check_range_types(field: &str, bounds: [&Option<json::Value>; 4]) -> Result<()> {
    let mut saw_number = false;
    let mut saw_string = false;
    for bound in bounds.into_iter().flatten() {
        match bound {
            json::Value::Number(_) => saw_number = true,
            json::Value::String(_) => saw_string = true,
            other => {
                return Err(Error::InvalidArgument(format!(
                    "range bound for field {field} must be a number or string, got {other}"
                )))
            }
        }
    }
    if saw_number && saw_string {
        return Err(Error::InvalidArgument(format!(
            "range bounds for field {field} mix numeric and string types"
        )));
    }
    Ok(())
}

/// UDF filters run as a post-filter on final hits; they are only allowed in
/// contexts with plain conjunctive semantics.
fn validate_udf_placement(query: &Query, in_soft_clause: bool) -> Result<()> {
    match query {
        Query::Udf { name, .. } if in_soft_clause => Err(Error::InvalidArgument(format!(
            "udf filter {name} is only allowed in must/filter clauses"
        ))),
        Query::Bool {
            must,
            should,
            filter,
            must_not,
        } => {
            for q in must.iter().chain(filter) {
                validate_udf_placement(q, in_soft_clause)?;
            }
            for q in should.iter().chain(must_not) {
                validate_udf_placement(q, true)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn parse_sort(value: &json::Value) -> Result<Vec<SortField>> {
    let items: Vec<&json::Value> = match value {
        json::Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match item {
            json::Value::String(field) => out.push(SortField {
                field: field.clone(),
                order: SortOrder::Asc,
            }),
            json::Value::Object(obj) => {
                if obj.len() != 1 {
                    return Err(Error::InvalidArgument(
                        "sort entry must name exactly one field".to_string(),
                    ));
                }
                let (field, spec) = obj.iter().next().unwrap();
                let order = match spec {
                    json::Value::String(s) => parse_order(s)?,
                    json::Value::Object(o) => match o.get("order") {
                        Some(json::Value::String(s)) => parse_order(s)?,
                        _ => SortOrder::Asc,
                    },
                    _ => {
                        return Err(Error::InvalidArgument(format!(
                            "invalid sort spec for field {field}"
                        )))
                    }
                };
                out.push(SortField {
                    field: field.clone(),
                    order,
                });
            }
            _ => {
                return Err(Error::InvalidArgument(
                    "sort entries must be strings or objects".to_string(),
                ))
            }
        }
    }
    Ok(out)
}

fn parse_order(s: &str) -> Result<SortOrder> {
    match s {
        "asc" => Ok(SortOrder::Asc),
        "desc" => Ok(SortOrder::Desc),
        other => Err(Error::InvalidArgument(format!("invalid sort order: {other}"))),
    }
}

fn parse_aggs(
    value: &json::Value,
) -> Result<std::collections::BTreeMap<String, Aggregation>> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::InvalidArgument("aggs must be an object".to_string()))?;
    let mut out = std::collections::BTreeMap::new();
    for (name, spec) in obj {
        let agg: Aggregation = json::from_value(spec.clone()).map_err(|e| {
            Error::InvalidArgument(format!("invalid aggregation {name}: {e}"))
        })?;
        if agg.field().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "aggregation {name} needs a field"
            )));
        }
        out.insert(name.clone(), agg);
    }
    Ok(out)
}
