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

//! The fan-out executor: one task per shard against a frozen routing
//! snapshot, bounded concurrency with a short admission queue, bounded
//! retries with jittered backoff for infrastructure errors, and partial
//! results when some shards fail. The whole request shares one cancellation
//! token; dropping the caller cancels every outstanding shard RPC.

use std::{sync::Arc, time::Duration};

use config::{
    get_config, ider,
    meta::{
        cluster::Node,
        index::IndexState,
        search::{
            SearchRequest, SearchResponse, ShardFailure, ShardSearchResponse, ShardStatistics,
        },
    },
    metrics,
    utils::{json, rand::jitter_millis},
};
use infra::errors::{Error, Result};
use proto::cluster_rpc::SearchShardRequest;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{
    cache::PLAN_CACHE, merge, optimizer, parser, pipeline::QUERY_PIPELINES, planner,
    udf::UDF_REGISTRY,
};
use crate::service::{clients::data::DataClient, cluster};

pub struct SearchService {
    client: Arc<dyn DataClient>,
    semaphore: Arc<Semaphore>,
}

impl SearchService {
    pub fn new(client: Arc<dyn DataClient>) -> Self {
        let cfg = get_config();
        SearchService {
            client,
            semaphore: Arc::new(Semaphore::new(cfg.limit.max_concurrent)),
        }
    }

    /// Run one search request end to end: parse, rewrite, plan, fan out,
    /// merge.
    pub async fn search(
        &self,
        index: &str,
        raw: &json::Value,
        cancel: CancellationToken,
    ) -> Result<SearchResponse> {
        let cfg = get_config();
        let started = std::time::Instant::now();
        let trace_id = ider::generate();

        // (a) parse and validate
        let req = parser::parse(raw)?;
        // (b) optional per-index rewrite hook, before any planning
        let req = QUERY_PIPELINES.apply(index, req)?;
        // udf filters never reach the shards
        let (index_query, udfs) = req.query.split_udf();
        let mut plan_req = req.clone();
        plan_req.query = index_query;

        // (c) frozen routing snapshot for the whole request
        let snapshot = cluster::snapshot();
        let meta = snapshot
            .indices
            .get(index)
            .filter(|meta| meta.state != IndexState::Deleting)
            .ok_or_else(|| Error::NotFound(format!("index {index}")))?;
        let total_shards = meta.settings.shards;
        let started_allocs = snapshot.started_allocations(index).unwrap_or_default();
        let mut failures: Vec<ShardFailure> = Vec::new();
        let reachable: Vec<(u32, &Node)> = started_allocs
            .iter()
            .filter_map(|(shard_id, alloc)| {
                let node = alloc
                    .node_uuid
                    .as_deref()
                    .and_then(|uuid| snapshot.get_node(uuid));
                match node {
                    Some(node) => Some((*shard_id, node)),
                    None => None,
                }
            })
            .collect();
        for shard_id in 0..total_shards {
            if !reachable.iter().any(|(id, _)| *id == shard_id) {
                failures.push(ShardFailure {
                    shard: shard_id,
                    index: index.to_string(),
                    reason: "no STARTED copy".to_string(),
                });
            }
        }
        if req.strict && !failures.is_empty() {
            return Err(Error::Unavailable(format!(
                "{} of {} shards unavailable and request is strict",
                failures.len(),
                total_shards
            )));
        }
        if reachable.is_empty() {
            return Err(Error::Unavailable(format!(
                "no shard of index {index} is searchable"
            )));
        }
        let shard_ids: Vec<u32> = reachable.iter().map(|(id, _)| *id).collect();

        // (d,e) logical plan, via cache
        let logical_key = super::cache::PlanCache::logical_key(index, &plan_req, &shard_ids);
        let logical = match PLAN_CACHE.get_logical(&logical_key) {
            Some(plan) => plan,
            None => {
                let built = planner::build_logical(&plan_req, index, shard_ids.clone());
                let (optimized, trace) = optimizer::optimize(built);
                log::debug!("[SEARCH] trace_id {trace_id} optimizer trace: {trace:?}");
                let plan = Arc::new(optimized);
                PLAN_CACHE.put_logical(logical_key, plan.clone());
                plan
            }
        };
        // (f) physical plan, via cache
        let physical_key = super::cache::PlanCache::physical_key(index, &logical);
        let physical = match PLAN_CACHE.get_physical(&physical_key) {
            Some(plan) => plan,
            None => {
                let plan = Arc::new(planner::build_physical(&logical));
                log::debug!(
                    "[SEARCH] trace_id {trace_id} physical plan: {} (cost {:.1})",
                    plan.describe(),
                    plan.total_cost()
                );
                PLAN_CACHE.put_physical(physical_key, plan.clone());
                plan
            }
        };

        // (g) fan out
        let total_timeout = if req.timeout_ms > 0 {
            Duration::from_millis(req.timeout_ms)
        } else {
            Duration::from_secs(cfg.limit.request_timeout)
        };
        let per_shard_timeout = total_timeout.mul_f64(0.8);
        let order_insensitive = logical.is_order_insensitive();
        let cancel = cancel.child_token();

        let mut join_set = tokio::task::JoinSet::new();
        for (shard_id, node) in &reachable {
            let shard_plan = physical.for_shard(*shard_id, order_insensitive);
            let rpc = SearchShardRequest {
                index: index.to_string(),
                shard_id: *shard_id,
                plan: json::to_vec(&shard_plan)?,
                cluster_version: snapshot.version,
                timeout_ms: per_shard_timeout.as_millis() as u64,
                trace_id: trace_id.clone(),
            };
            let client = self.client.clone();
            let semaphore = self.semaphore.clone();
            let node = (*node).clone();
            let cancel = cancel.clone();
            let index = index.to_string();
            let shard_id = *shard_id;
            join_set.spawn(async move {
                // brief admission queue, then reject
                let queue_deadline = Duration::from_millis(get_config().limit.queue_deadline_ms);
                let permit = match tokio::time::timeout(queue_deadline, semaphore.acquire_owned())
                    .await
                {
                    Ok(Ok(permit)) => permit,
                    _ => {
                        return (
                            shard_id,
                            Err(Error::ResourceExhausted(
                                "too many in-flight shard requests".to_string(),
                            )),
                        )
                    }
                };
                metrics::QUERY_RUNNING.with_label_values(&[index.as_str()]).inc();
                let result = tokio::time::timeout(
                    per_shard_timeout,
                    search_one_shard(client, &node, rpc, cancel),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Unavailable(format!(
                        "shard {shard_id} timed out after {}ms",
                        per_shard_timeout.as_millis()
                    )))
                });
                metrics::QUERY_RUNNING.with_label_values(&[index.as_str()]).dec();
                metrics::SHARD_REQUESTS
                    .with_label_values(&[
                        index.as_str(),
                        if result.is_ok() { "ok" } else { "error" },
                    ])
                    .inc();
                drop(permit);
                (shard_id, result)
            });
        }

        // total-request deadline over the whole collection phase
        let mut responses: Vec<ShardSearchResponse> = Vec::with_capacity(reachable.len());
        let mut responded: Vec<u32> = Vec::with_capacity(reachable.len());
        let mut timed_out = false;
        let deadline = tokio::time::Instant::now() + total_timeout;
        let mut pending: usize = reachable.len();
        while pending > 0 {
            let next = tokio::time::timeout_at(deadline, join_set.join_next()).await;
            match next {
                Err(_) => {
                    timed_out = true;
                    cancel.cancel();
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(join_err))) => {
                    pending -= 1;
                    log::error!("[SEARCH] trace_id {trace_id} shard task panicked: {join_err}");
                }
                Ok(Some(Ok((shard_id, Ok(resp))))) => {
                    pending -= 1;
                    responded.push(shard_id);
                    responses.push(resp);
                }
                Ok(Some(Ok((shard_id, Err(e))))) => {
                    pending -= 1;
                    log::warn!(
                        "[SEARCH] trace_id {trace_id} shard {index}/{shard_id} failed: {e}"
                    );
                    responded.push(shard_id);
                    failures.push(ShardFailure {
                        shard: shard_id,
                        index: index.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        join_set.detach_all();
        // shards that never answered inside the deadline
        for shard_id in &shard_ids {
            if !responded.contains(shard_id) {
                failures.push(ShardFailure {
                    shard: *shard_id,
                    index: index.to_string(),
                    reason: "no response within request timeout".to_string(),
                });
            }
        }

        let successful = responses.len() as u32;
        if successful == 0 {
            return Err(Error::Unavailable(format!(
                "all {total_shards} shards of index {index} failed"
            )));
        }
        if req.strict && successful < total_shards {
            return Err(Error::Unavailable(format!(
                "{} of {total_shards} shards failed and request is strict",
                total_shards - successful
            )));
        }

        let shard_stats = ShardStatistics {
            total: total_shards,
            successful,
            skipped: 0,
            failed: total_shards - successful,
            failures,
        };
        let mut response = merge::merge(
            &req,
            responses,
            shard_stats,
            started.elapsed().as_millis() as u64,
            timed_out,
        );

        // udf post-filter on final hits
        if !udfs.is_empty() {
            let before = response.hits.hits.len();
            let mut kept = Vec::with_capacity(before);
            for hit in response.hits.hits.drain(..) {
                if UDF_REGISTRY.matches(&udfs, &hit.source)? {
                    kept.push(hit);
                }
            }
            response.hits.hits = kept;
        }
        Ok(response)
    }
}

/// One shard call with bounded retries: only infrastructure errors retry,
/// with exponential backoff and jitter.
async fn search_one_shard(
    client: Arc<dyn DataClient>,
    node: &Node,
    rpc: SearchShardRequest,
    cancel: CancellationToken,
) -> Result<ShardSearchResponse> {
    let cfg = get_config();
    let mut last_err = Error::Unavailable("no attempt made".to_string());
    for attempt in 0..cfg.limit.shard_rpc_retries.max(1) {
        if cancel.is_cancelled() {
            return Err(Error::Unavailable("search cancelled".to_string()));
        }
        if attempt > 0 {
            let backoff = jitter_millis(50u64 << attempt.min(6), 50);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }
        match client.search(node, rpc.clone(), cancel.clone()).await {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_retryable() => {
                log::debug!(
                    "[SEARCH] retryable failure on {} attempt {attempt}: {e}",
                    node.uuid
                );
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}
