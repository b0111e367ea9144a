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

//! Shard-local execution of a physical sub-plan: candidate selection from the
//! postings, TF-IDF scoring, filtering, local top-K and partial aggregations.
//! Cancellation is checked between document batches so a dropped request
//! stops burning cpu within a bounded interval.

use std::{cmp::Ordering, collections::BTreeMap, sync::atomic::Ordering as AtomicOrdering, sync::Arc};

use config::{
    get_config,
    meta::{
        query::Query,
        search::{AggPartial, Aggregation, ShardHit, ShardSearchResponse, SortField, SortOrder},
        sketch::{CardinalitySketch, QuantileDigest},
    },
    utils::json,
};
use hashbrown::HashMap;
use infra::errors::{Error, Result};
use tokio_util::sync::CancellationToken;

use super::index::{Shard, ShardData, StoredDocument};
use crate::service::search::plan::{PhysicalPlan, TopNStrategy};

struct Row {
    doc_id: String,
    score: f64,
    doc: Arc<StoredDocument>,
    sort_values: Vec<json::Value>,
}

struct ExecCtx<'a> {
    shard: &'a Shard,
    data: Arc<ShardData>,
    cancel: CancellationToken,
    check_batch: usize,
    since_check: usize,
    total: Option<u64>,
    aggs: BTreeMap<String, AggPartial>,
}

impl ExecCtx<'_> {
    /// Suspension point: cheap counter, token checked once per batch.
    fn tick(&mut self) -> Result<()> {
        self.since_check += 1;
        if self.since_check >= self.check_batch {
            self.since_check = 0;
            if self.cancel.is_cancelled() {
                return Err(Error::Unavailable("search cancelled".to_string()));
            }
        }
        Ok(())
    }
}

/// Execute a per-shard sub-plan against the current searcher snapshot.
pub async fn execute(
    shard: &Shard,
    plan: &PhysicalPlan,
    cancel: CancellationToken,
) -> Result<ShardSearchResponse> {
    let started = std::time::Instant::now();
    shard.search_count.fetch_add(1, AtomicOrdering::Relaxed);
    let mut ctx = ExecCtx {
        shard,
        data: shard.snapshot(),
        cancel,
        check_batch: get_config().limit.cancel_check_batch.max(1),
        since_check: 0,
        total: None,
        aggs: BTreeMap::new(),
    };
    let rows = eval_plan(plan, &mut ctx)?;
    let total = ctx.total.unwrap_or(rows.len() as u64);
    let hits = rows
        .into_iter()
        .map(|row| ShardHit {
            doc_id: row.doc_id,
            score: row.score,
            source: row.doc.source.clone(),
            sort_values: row.sort_values,
        })
        .collect();
    Ok(ShardSearchResponse {
        total,
        hits,
        aggs: ctx.aggs,
        took_ms: started.elapsed().as_millis() as u64,
    })
}

fn eval_plan(plan: &PhysicalPlan, ctx: &mut ExecCtx<'_>) -> Result<Vec<Row>> {
    match plan {
        PhysicalPlan::ShardScan {
            filter, limit_hint, ..
        } => {
            let scored = match filter {
                Some(query) => eval_query(query, ctx)?,
                None => eval_query(&Query::MatchAll, ctx)?,
            };
            let mut rows = Vec::with_capacity(scored.len());
            for (doc_id, score) in scored {
                ctx.tick()?;
                if let Some(doc) = ctx.data.documents.get(&doc_id) {
                    rows.push(Row {
                        doc_id,
                        score,
                        doc: doc.clone(),
                        sort_values: Vec::new(),
                    });
                }
            }
            if let Some(limit) = limit_hint {
                ctx.total = Some(rows.len() as u64);
                if rows.len() > *limit {
                    // fetch bound: keep the best rows under the default
                    // comparator so the window above stays correct
                    fill_sort_values(&mut rows, &[]);
                    rows = heap_top_n(rows, *limit, &[]);
                }
            }
            Ok(rows)
        }
        PhysicalPlan::Filter { expr, child, .. } => {
            let mut rows = eval_plan(child, ctx)?;
            let mut kept = Vec::with_capacity(rows.len());
            for row in rows.drain(..) {
                ctx.tick()?;
                if matches_query(expr, &row.doc.source, ctx)? {
                    kept.push(row);
                }
            }
            Ok(kept)
        }
        PhysicalPlan::Project { fields, child, .. } => {
            let rows = eval_plan(child, ctx)?;
            Ok(rows
                .into_iter()
                .map(|row| {
                    let mut projected = json::Map::new();
                    for field in fields {
                        if let Some(value) = field_value(&row.doc.source, field) {
                            projected.insert(field.clone(), value);
                        }
                    }
                    Row {
                        doc: Arc::new(StoredDocument {
                            source: json::Value::Object(projected),
                            index_time: row.doc.index_time,
                        }),
                        ..row
                    }
                })
                .collect())
        }
        PhysicalPlan::Aggregate { aggs, child, .. } => {
            let rows = eval_plan(child, ctx)?;
            for (name, agg) in aggs {
                let partial = compute_partial(agg, &rows, ctx)?;
                ctx.aggs.insert(name.clone(), partial);
            }
            Ok(rows)
        }
        PhysicalPlan::Sort { fields, child, .. } => {
            let mut rows = eval_plan(child, ctx)?;
            fill_sort_values(&mut rows, fields);
            rows.sort_by(|a, b| cmp_rows(a, b, fields));
            Ok(rows)
        }
        PhysicalPlan::TopN {
            n,
            offset,
            sort_fields,
            strategy,
            child,
            ..
        } => {
            let mut rows = eval_plan(child, ctx)?;
            // a limit-hinted scan already recorded the pre-truncation total
            if ctx.total.is_none() {
                ctx.total = Some(rows.len() as u64);
            }
            fill_sort_values(&mut rows, sort_fields);
            let keep = *n + *offset;
            match strategy {
                TopNStrategy::FullSort => {
                    rows.sort_by(|a, b| cmp_rows(a, b, sort_fields));
                    rows.truncate(keep);
                }
                TopNStrategy::Heap => {
                    rows = heap_top_n(rows, keep, sort_fields);
                }
            }
            if *offset > 0 {
                rows.drain(..(*offset).min(rows.len()));
            }
            Ok(rows)
        }
        PhysicalPlan::Limit {
            n, offset, child, ..
        } => {
            let mut rows = eval_plan(child, ctx)?;
            if ctx.total.is_none() {
                ctx.total = Some(rows.len() as u64);
            }
            if rows.is_empty() && *n == 0 {
                return Ok(rows);
            }
            // default ordering: score desc, doc id asc
            fill_sort_values(&mut rows, &[]);
            rows.sort_by(|a, b| cmp_rows(a, b, &[]));
            if *offset > 0 {
                rows.drain(..(*offset).min(rows.len()));
            }
            rows.truncate(*n);
            Ok(rows)
        }
    }
}

// ----------------------------- query evaluation ---------------------------

/// Evaluate a query into `doc_id -> score`.
fn eval_query(query: &Query, ctx: &mut ExecCtx<'_>) -> Result<HashMap<String, f64>> {
    let data = ctx.data.clone();
    match query {
        Query::MatchAll => {
            let mut out = HashMap::with_capacity(data.documents.len());
            for doc_id in data.documents.keys() {
                ctx.tick()?;
                out.insert(doc_id.clone(), 1.0);
            }
            Ok(out)
        }
        Query::Match { field, text } => {
            let cfg = get_config();
            let name = match ctx.shard.mappings.field_type(field) {
                Some(config::meta::index::FieldType::Keyword) => "keyword",
                _ => ctx
                    .shard
                    .mappings
                    .analyzer(field, cfg.shard.default_analyzer.as_str()),
            };
            let analyzer = ctx.shard.analyzers().get(name)?;
            let doc_count = data.doc_count().max(1) as f64;
            let mut out: HashMap<String, f64> = HashMap::new();
            for token in analyzer.analyze(text) {
                let Some(postings) = data.postings(field, &token.term) else {
                    continue;
                };
                let idf = 1.0 + (doc_count / (1.0 + postings.len() as f64)).ln();
                for posting in postings {
                    ctx.tick()?;
                    let tf = (posting.positions.len() as f64).sqrt();
                    *out.entry(posting.doc_id.clone()).or_insert(0.0) += tf * idf;
                }
            }
            Ok(out)
        }
        Query::Term { field, value } => {
            // exact term against the index when the field is indexed,
            // stored-value comparison otherwise
            let term = json::get_string_value(value);
            if let Some(postings) = data.postings(field, &term) {
                let mut out = HashMap::with_capacity(postings.len());
                for posting in postings {
                    ctx.tick()?;
                    out.insert(posting.doc_id.clone(), 1.0);
                }
                return Ok(out);
            }
            scan_matching(ctx, |source| {
                field_value(source, field).is_some_and(|v| json_eq(&v, value))
            })
        }
        Query::Range {
            field,
            gte,
            lte,
            gt,
            lt,
        } => scan_matching(ctx, |source| {
            let Some(v) = field_value(source, field) else {
                return false;
            };
            in_range(&v, gte.as_ref(), lte.as_ref(), gt.as_ref(), lt.as_ref())
        }),
        Query::Prefix { field, prefix } => {
            terms_matching(ctx, field, |term| term.starts_with(prefix.as_str()))
        }
        Query::Wildcard { field, pattern } => {
            terms_matching(ctx, field, |term| wildcard_match(pattern, term))
        }
        Query::Bool {
            must,
            should,
            filter,
            must_not,
        } => {
            let mut out: Option<HashMap<String, f64>> = None;
            for clause in must {
                let scored = eval_query(clause, ctx)?;
                out = Some(intersect(out, scored, true));
            }
            for clause in filter {
                let scored = eval_query(clause, ctx)?;
                out = Some(intersect(out, scored, false));
            }
            let mut out = match out {
                Some(out) => out,
                // pure-should bool: union
                None => {
                    let mut union: HashMap<String, f64> = HashMap::new();
                    for clause in should {
                        for (doc_id, score) in eval_query(clause, ctx)? {
                            *union.entry(doc_id).or_insert(0.0) += score;
                        }
                    }
                    union
                }
            };
            if !must.is_empty() || !filter.is_empty() {
                // should only boosts when other clauses constrain the set
                for clause in should {
                    for (doc_id, score) in eval_query(clause, ctx)? {
                        if let Some(existing) = out.get_mut(&doc_id) {
                            *existing += score;
                        }
                    }
                }
            }
            for clause in must_not {
                let excluded = eval_query(clause, ctx)?;
                out.retain(|doc_id, _| !excluded.contains_key(doc_id));
            }
            Ok(out)
        }
        Query::Udf { name, .. } => Err(Error::Internal(format!(
            "udf filter {name} cannot run on a shard"
        ))),
    }
}

fn intersect(
    acc: Option<HashMap<String, f64>>,
    scored: HashMap<String, f64>,
    add_score: bool,
) -> HashMap<String, f64> {
    match acc {
        None => {
            if add_score {
                scored
            } else {
                scored.into_iter().map(|(k, _)| (k, 0.0)).collect()
            }
        }
        Some(mut acc) => {
            acc.retain(|doc_id, _| scored.contains_key(doc_id));
            if add_score {
                for (doc_id, score) in scored {
                    if let Some(existing) = acc.get_mut(&doc_id) {
                        *existing += score;
                    }
                }
            }
            acc
        }
    }
}

fn scan_matching<F: Fn(&json::Value) -> bool>(
    ctx: &mut ExecCtx<'_>,
    pred: F,
) -> Result<HashMap<String, f64>> {
    let data = ctx.data.clone();
    let mut out = HashMap::new();
    for (doc_id, doc) in data.documents.iter() {
        ctx.tick()?;
        if pred(&doc.source) {
            out.insert(doc_id.clone(), 1.0);
        }
    }
    Ok(out)
}

fn terms_matching<F: Fn(&str) -> bool>(
    ctx: &mut ExecCtx<'_>,
    field: &str,
    pred: F,
) -> Result<HashMap<String, f64>> {
    let data = ctx.data.clone();
    let mut out = HashMap::new();
    if let Some(terms) = data.inverted.get(field) {
        for (term, postings) in terms {
            ctx.tick()?;
            if pred(term) {
                for posting in postings {
                    out.insert(posting.doc_id.clone(), 1.0);
                }
            }
        }
    }
    Ok(out)
}

/// Boolean re-check of a query against one document, used by residual Filter
/// nodes above the scan. Scoring already happened at the scan.
fn matches_query(query: &Query, source: &json::Value, ctx: &mut ExecCtx<'_>) -> Result<bool> {
    match query {
        Query::MatchAll => Ok(true),
        Query::Term { field, value } => Ok(field_value(source, field)
            .is_some_and(|v| json_eq(&v, value) || json::get_string_value(&v) == json::get_string_value(value))),
        Query::Match { field, text } => {
            let cfg = get_config();
            let name = ctx
                .shard
                .mappings
                .analyzer(field, cfg.shard.default_analyzer.as_str());
            let analyzer = ctx.shard.analyzers().get(name)?;
            let Some(v) = field_value(source, field) else {
                return Ok(false);
            };
            let doc_terms: std::collections::HashSet<String> = analyzer
                .analyze(&json::get_string_value(&v))
                .into_iter()
                .map(|t| t.term)
                .collect();
            Ok(analyzer
                .analyze(text)
                .iter()
                .any(|t| doc_terms.contains(&t.term)))
        }
        Query::Range {
            field,
            gte,
            lte,
            gt,
            lt,
        } => Ok(field_value(source, field).is_some_and(|v| {
            in_range(&v, gte.as_ref(), lte.as_ref(), gt.as_ref(), lt.as_ref())
        })),
        Query::Prefix { field, prefix } => Ok(field_value(source, field)
            .is_some_and(|v| json::get_string_value(&v).starts_with(prefix.as_str()))),
        Query::Wildcard { field, pattern } => Ok(field_value(source, field)
            .is_some_and(|v| wildcard_match(pattern, &json::get_string_value(&v)))),
        Query::Bool {
            must,
            should,
            filter,
            must_not,
        } => {
            for clause in must.iter().chain(filter) {
                if !matches_query(clause, source, ctx)? {
                    return Ok(false);
                }
            }
            for clause in must_not {
                if matches_query(clause, source, ctx)? {
                    return Ok(false);
                }
            }
            if must.is_empty() && filter.is_empty() && !should.is_empty() {
                for clause in should {
                    if matches_query(clause, source, ctx)? {
                        return Ok(true);
                    }
                }
                return Ok(false);
            }
            Ok(true)
        }
        Query::Udf { name, .. } => Err(Error::Internal(format!(
            "udf filter {name} cannot run on a shard"
        ))),
    }
}

// ------------------------------- helpers ----------------------------------

pub fn field_value(source: &json::Value, path: &str) -> Option<json::Value> {
    if let Some(v) = source.get(path) {
        return Some(v.clone());
    }
    let mut current = source;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

fn json_eq(a: &json::Value, b: &json::Value) -> bool {
    if a == b {
        return true;
    }
    match (json::get_float_value(a), json::get_float_value(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn in_range(
    v: &json::Value,
    gte: Option<&json::Value>,
    lte: Option<&json::Value>,
    gt: Option<&json::Value>,
    lt: Option<&json::Value>,
) -> bool {
    let cmp_to = |bound: &json::Value| cmp_json(v, bound);
    if let Some(b) = gte {
        if cmp_to(b) == Ordering::Less {
            return false;
        }
    }
    if let Some(b) = gt {
        if cmp_to(b) != Ordering::Greater {
            return false;
        }
    }
    if let Some(b) = lte {
        if cmp_to(b) == Ordering::Greater {
            return false;
        }
    }
    if let Some(b) = lt {
        if cmp_to(b) != Ordering::Less {
            return false;
        }
    }
    true
}

/// Ordering over json values: numbers before strings, missing handled by the
/// caller; numeric strings compare numerically against numbers.
pub fn cmp_json(a: &json::Value, b: &json::Value) -> Ordering {
    match (json::get_float_value(a), json::get_float_value(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => json::get_string_value(a).cmp(&json::get_string_value(b)),
    }
}

fn wildcard_match(pattern: &str, input: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = input.chars().collect();
    // iterative glob with backtracking on the last star
    let (mut pi, mut si) = (0usize, 0usize);
    let (mut star, mut mark) = (usize::MAX, 0usize);
    while si < s.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == s[si]) {
            pi += 1;
            si += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = pi;
            mark = si;
            pi += 1;
        } else if star != usize::MAX {
            pi = star + 1;
            mark += 1;
            si = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

fn fill_sort_values(rows: &mut [Row], fields: &[SortField]) {
    for row in rows.iter_mut() {
        if fields.is_empty() {
            row.sort_values = vec![json::json!(row.score), json::json!(row.doc_id)];
        } else {
            row.sort_values = fields
                .iter()
                .map(|f| {
                    if f.field == "_score" {
                        json::json!(row.score)
                    } else {
                        field_value(&row.doc.source, &f.field).unwrap_or(json::Value::Null)
                    }
                })
                .collect();
        }
    }
}

/// Default comparator: score descending, doc id ascending on ties.
pub fn cmp_sort_values(
    a_values: &[json::Value],
    a_doc: &str,
    b_values: &[json::Value],
    b_doc: &str,
    fields: &[SortField],
) -> Ordering {
    if fields.is_empty() {
        let a_score = a_values.first().and_then(json::get_float_value).unwrap_or(0.0);
        let b_score = b_values.first().and_then(json::get_float_value).unwrap_or(0.0);
        return b_score
            .partial_cmp(&a_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a_doc.cmp(b_doc));
    }
    for (i, field) in fields.iter().enumerate() {
        let a = a_values.get(i).unwrap_or(&json::Value::Null);
        let b = b_values.get(i).unwrap_or(&json::Value::Null);
        let ord = match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            // missing values sort last regardless of direction
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = cmp_json(a, b);
                match field.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a_doc.cmp(b_doc)
}

fn cmp_rows(a: &Row, b: &Row, fields: &[SortField]) -> Ordering {
    cmp_sort_values(&a.sort_values, &a.doc_id, &b.sort_values, &b.doc_id, fields)
}

/// Bounded selection: a sorted buffer capped at n, so memory stays O(n)
/// no matter how many rows stream through.
fn heap_top_n(rows: Vec<Row>, n: usize, fields: &[SortField]) -> Vec<Row> {
    if n == 0 {
        return Vec::new();
    }
    let mut kept: Vec<Row> = Vec::with_capacity(n + 1);
    for row in rows {
        let pos = kept
            .binary_search_by(|probe| cmp_rows(probe, &row, fields))
            .unwrap_or_else(|e| e);
        if pos < n {
            kept.insert(pos, row);
            kept.truncate(n);
        }
    }
    kept
}

// ------------------------------ aggregations ------------------------------

fn compute_partial(agg: &Aggregation, rows: &[Row], ctx: &mut ExecCtx<'_>) -> Result<AggPartial> {
    match agg {
        Aggregation::Terms { field, .. } => {
            let mut counts: BTreeMap<String, u64> = BTreeMap::new();
            for row in rows {
                ctx.tick()?;
                if let Some(v) = field_value(&row.doc.source, field) {
                    *counts.entry(json::get_string_value(&v)).or_insert(0) += 1;
                }
            }
            Ok(AggPartial::Terms { counts })
        }
        Aggregation::Stats { field } | Aggregation::ExtendedStats { field } => {
            let mut count = 0u64;
            let mut sum = 0.0;
            let mut sum_of_squares = 0.0;
            let mut min = None;
            let mut max = None;
            for row in rows {
                ctx.tick()?;
                let Some(v) = field_value(&row.doc.source, field).and_then(|v| json::get_float_value(&v))
                else {
                    continue;
                };
                count += 1;
                sum += v;
                sum_of_squares += v * v;
                min = Some(min.map_or(v, |m: f64| m.min(v)));
                max = Some(max.map_or(v, |m: f64| m.max(v)));
            }
            Ok(AggPartial::Stats {
                count,
                sum,
                sum_of_squares,
                min,
                max,
            })
        }
        Aggregation::Histogram { field, interval } => {
            histogram_partial(rows, ctx, field, *interval, |v| json::get_float_value(&v))
        }
        Aggregation::DateHistogram { field, interval_ms } => {
            histogram_partial(rows, ctx, field, *interval_ms as f64, |v| {
                date_to_millis(&v)
            })
        }
        Aggregation::Percentiles { field, .. } => {
            let mut digest = QuantileDigest::new();
            for row in rows {
                ctx.tick()?;
                if let Some(v) =
                    field_value(&row.doc.source, field).and_then(|v| json::get_float_value(&v))
                {
                    digest.add(v);
                }
            }
            Ok(AggPartial::Percentiles { digest })
        }
        Aggregation::Cardinality { field } => {
            let mut sketch = CardinalitySketch::new();
            for row in rows {
                ctx.tick()?;
                if let Some(v) = field_value(&row.doc.source, field) {
                    sketch.add(&json::get_string_value(&v));
                }
            }
            Ok(AggPartial::Cardinality { sketch })
        }
    }
}

fn histogram_partial<F: Fn(json::Value) -> Option<f64>>(
    rows: &[Row],
    ctx: &mut ExecCtx<'_>,
    field: &str,
    interval: f64,
    to_num: F,
) -> Result<AggPartial> {
    if interval <= 0.0 {
        return Err(Error::InvalidArgument(
            "histogram interval must be > 0".to_string(),
        ));
    }
    let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
    for row in rows {
        ctx.tick()?;
        if let Some(v) = field_value(&row.doc.source, field).and_then(&to_num) {
            let bucket = (v / interval).floor() as i64;
            *counts.entry(bucket).or_insert(0) += 1;
        }
    }
    Ok(AggPartial::Histogram { interval, counts })
}

fn date_to_millis(v: &json::Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    let s = v.as_str()?;
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::search::plan::Cost;
    use config::meta::index::{IndexSettings, Mappings};
    use config::utils::json::json;

    async fn seeded_shard() -> (tempfile::TempDir, Shard) {
        let dir = tempfile::tempdir().unwrap();
        let shard = Shard::open(
            dir.path(),
            "products",
            0,
            true,
            IndexSettings::default(),
            Mappings::default(),
        )
        .unwrap();
        for (id, title, price) in [
            ("d1", "Quick Brown Fox", 10.0),
            ("d2", "Lazy Dog", 20.0),
            ("d3", "Quick Lazy Fox", 15.0),
        ] {
            shard
                .index_document(id, json!({"title": title, "price": price}))
                .await
                .unwrap();
        }
        shard.commit().await.unwrap();
        shard.refresh().await.unwrap();
        (dir, shard)
    }

    fn scan(filter: Option<Query>) -> PhysicalPlan {
        PhysicalPlan::ShardScan {
            index: "products".to_string(),
            shards: vec![0],
            filter,
            limit_hint: None,
            rows: 3,
            cost: Cost::default(),
        }
    }

    #[tokio::test]
    async fn test_match_query_finds_indexed_terms() {
        let (_dir, shard) = seeded_shard().await;
        let plan = scan(Some(Query::Match {
            field: "title".to_string(),
            text: "quick".to_string(),
        }));
        let resp = execute(&shard, &plan, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.total, 2);
        let mut ids: Vec<&str> = resp.hits.iter().map(|h| h.doc_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["d1", "d3"]);
    }

    #[tokio::test]
    async fn test_range_query() {
        let (_dir, shard) = seeded_shard().await;
        let plan = scan(Some(Query::Range {
            field: "price".to_string(),
            gte: Some(json!(15.0)),
            lte: None,
            gt: None,
            lt: None,
        }));
        let resp = execute(&shard, &plan, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.total, 2);
    }

    #[tokio::test]
    async fn test_bool_must_not() {
        let (_dir, shard) = seeded_shard().await;
        let plan = scan(Some(Query::Bool {
            must: vec![Query::Match {
                field: "title".to_string(),
                text: "fox".to_string(),
            }],
            should: vec![],
            filter: vec![],
            must_not: vec![Query::Match {
                field: "title".to_string(),
                text: "lazy".to_string(),
            }],
        }));
        let resp = execute(&shard, &plan, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.total, 1);
        assert_eq!(resp.hits[0].doc_id, "d1");
    }

    #[tokio::test]
    async fn test_topn_orders_by_price_desc() {
        let (_dir, shard) = seeded_shard().await;
        let plan = PhysicalPlan::TopN {
            n: 2,
            offset: 0,
            sort_fields: vec![SortField {
                field: "price".to_string(),
                order: SortOrder::Desc,
            }],
            strategy: TopNStrategy::Heap,
            child: Box::new(scan(None)),
            rows: 2,
            cost: Cost::default(),
        };
        let resp = execute(&shard, &plan, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.total, 3);
        let ids: Vec<&str> = resp.hits.iter().map(|h| h.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d3"]);
    }

    #[tokio::test]
    async fn test_heap_and_full_sort_agree() {
        let (_dir, shard) = seeded_shard().await;
        let sort_fields = vec![SortField {
            field: "price".to_string(),
            order: SortOrder::Asc,
        }];
        let heap_plan = PhysicalPlan::TopN {
            n: 2,
            offset: 0,
            sort_fields: sort_fields.clone(),
            strategy: TopNStrategy::Heap,
            child: Box::new(scan(None)),
            rows: 2,
            cost: Cost::default(),
        };
        let sort_plan = PhysicalPlan::TopN {
            n: 2,
            offset: 0,
            sort_fields,
            strategy: TopNStrategy::FullSort,
            child: Box::new(scan(None)),
            rows: 2,
            cost: Cost::default(),
        };
        let cancel = CancellationToken::new();
        let a = execute(&shard, &heap_plan, cancel.clone()).await.unwrap();
        let b = execute(&shard, &sort_plan, cancel).await.unwrap();
        let ids = |r: &ShardSearchResponse| {
            r.hits.iter().map(|h| h.doc_id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&a), ids(&b));
    }

    #[tokio::test]
    async fn test_terms_aggregation_partial() {
        let (_dir, shard) = seeded_shard().await;
        let mut aggs = BTreeMap::new();
        aggs.insert(
            "titles".to_string(),
            Aggregation::Terms {
                field: "title".to_string(),
                size: 10,
            },
        );
        let plan = PhysicalPlan::Aggregate {
            group_by: vec![],
            aggs,
            strategy: crate::service::search::plan::AggregateStrategy::Hash,
            child: Box::new(scan(None)),
            rows: 3,
            cost: Cost::default(),
        };
        let resp = execute(&shard, &plan, CancellationToken::new())
            .await
            .unwrap();
        match resp.aggs.get("titles").unwrap() {
            AggPartial::Terms { counts } => {
                assert_eq!(counts.len(), 3);
                assert_eq!(counts["Quick Brown Fox"], 1);
            }
            other => panic!("unexpected partial: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stats_aggregation_partial() {
        let (_dir, shard) = seeded_shard().await;
        let mut aggs = BTreeMap::new();
        aggs.insert(
            "price_stats".to_string(),
            Aggregation::Stats {
                field: "price".to_string(),
            },
        );
        let plan = PhysicalPlan::Aggregate {
            group_by: vec![],
            aggs,
            strategy: crate::service::search::plan::AggregateStrategy::Hash,
            child: Box::new(scan(None)),
            rows: 3,
            cost: Cost::default(),
        };
        let resp = execute(&shard, &plan, CancellationToken::new())
            .await
            .unwrap();
        match resp.aggs.get("price_stats").unwrap() {
            AggPartial::Stats {
                count,
                sum,
                min,
                max,
                ..
            } => {
                assert_eq!(*count, 3);
                assert_eq!(*sum, 45.0);
                assert_eq!(*min, Some(10.0));
                assert_eq!(*max, Some(20.0));
            }
            other => panic!("unexpected partial: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_search_stops() {
        let (_dir, shard) = seeded_shard().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        // batch of 1 checks the token between every document
        std::env::set_var("QV_CANCEL_CHECK_BATCH", "1");
        config::refresh_config().unwrap();
        let err = execute(&shard, &scan(None), cancel).await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        std::env::remove_var("QV_CANCEL_CHECK_BATCH");
        config::refresh_config().unwrap();
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("qu*ck", "quick"));
        assert!(wildcard_match("q?ick", "quick"));
        assert!(wildcard_match("*fox*", "quick fox jumps"));
        assert!(!wildcard_match("fox", "quick"));
        assert!(wildcard_match("*", ""));
    }

    #[test]
    fn test_cmp_sort_values_default() {
        let a = vec![json!(2.0), json!("a")];
        let b = vec![json!(1.0), json!("b")];
        assert_eq!(cmp_sort_values(&a, "a", &b, "b", &[]), Ordering::Less);
        // tie on score: doc id ascending
        let c = vec![json!(2.0), json!("c")];
        assert_eq!(cmp_sort_values(&a, "a", &c, "c", &[]), Ordering::Less);
    }

    #[test]
    fn test_missing_sort_values_last() {
        let fields = vec![SortField {
            field: "price".to_string(),
            order: SortOrder::Desc,
        }];
        let present = vec![json!(5.0)];
        let missing = vec![json::Value::Null];
        assert_eq!(
            cmp_sort_values(&present, "a", &missing, "b", &fields),
            Ordering::Less
        );
    }
}
