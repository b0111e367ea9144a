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

//! Two-level plan cache: optimized logical plans keyed by the normalized
//! request, physical plans keyed by the optimized logical plan. Keys are
//! prefixed `{index}:` so a cluster event can drop one index's entries.
//! Lookups never fail: any problem is a miss.

use std::{sync::Arc, time::Duration};

use config::{
    get_config,
    meta::{cluster::ClusterEvent, search::SearchRequest},
    metrics,
    utils::{hash::Fnv64a, json},
};
use infra::cache::Cache;
use once_cell::sync::Lazy;

use super::plan::{LogicalPlan, PhysicalPlan};

pub static PLAN_CACHE: Lazy<PlanCache> = Lazy::new(PlanCache::new);

pub struct PlanCache {
    logical: Cache<Arc<LogicalPlan>>,
    physical: Cache<Arc<PhysicalPlan>>,
    enable_logical: bool,
    enable_physical: bool,
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanCache {
    pub fn new() -> Self {
        let cfg = get_config();
        PlanCache {
            logical: Cache::new(
                "logical_plan",
                cfg.cache.logical_cache_size,
                cfg.cache.logical_cache_bytes,
                Duration::from_secs(cfg.cache.logical_cache_ttl),
                cfg.cache.bucket_num,
            ),
            physical: Cache::new(
                "physical_plan",
                cfg.cache.physical_cache_size,
                cfg.cache.physical_cache_bytes,
                Duration::from_secs(cfg.cache.physical_cache_ttl),
                cfg.cache.bucket_num,
            ),
            enable_logical: cfg.cache.enable_logical_cache,
            enable_physical: cfg.cache.enable_physical_cache,
        }
    }

    /// Cache key for the logical level: index, normalized query, shard set.
    /// Normalization: AST clause ordering is canonicalized, object keys are
    /// already sorted by the typed representation, shard ids are sorted, and
    /// cache-busting fields (timeout, strict) are stripped.
    pub fn logical_key(index: &str, req: &SearchRequest, shards: &[u32]) -> String {
        let mut shards = shards.to_vec();
        shards.sort_unstable();
        let normalized = json::json!({
            "query": req.query.normalized(),
            "from": req.from,
            "size": req.size,
            "sort": req.sort,
            "aggs": req.aggs,
            "shards": shards,
        });
        let hash = Fnv64a::new().sum64(&normalized.to_string());
        format!("{index}:{hash:016x}")
    }

    pub fn physical_key(index: &str, logical: &LogicalPlan) -> String {
        format!("{index}:{:016x}", logical.fingerprint())
    }

    pub fn get_logical(&self, key: &str) -> Option<Arc<LogicalPlan>> {
        if !self.enable_logical {
            return None;
        }
        let hit = self.logical.get(key);
        match &hit {
            Some(_) => metrics::QUERY_CACHE_HITS.with_label_values(&["logical"]).inc(),
            None => metrics::QUERY_CACHE_MISSES
                .with_label_values(&["logical"])
                .inc(),
        }
        hit
    }

    pub fn put_logical(&self, key: String, plan: Arc<LogicalPlan>) {
        if !self.enable_logical {
            return;
        }
        let bytes = json::to_string(plan.as_ref()).map(|s| s.len()).unwrap_or(256);
        self.logical.insert(key, plan, bytes);
    }

    pub fn get_physical(&self, key: &str) -> Option<Arc<PhysicalPlan>> {
        if !self.enable_physical {
            return None;
        }
        let hit = self.physical.get(key);
        match &hit {
            Some(_) => metrics::QUERY_CACHE_HITS
                .with_label_values(&["physical"])
                .inc(),
            None => metrics::QUERY_CACHE_MISSES
                .with_label_values(&["physical"])
                .inc(),
        }
        hit
    }

    pub fn put_physical(&self, key: String, plan: Arc<PhysicalPlan>) {
        if !self.enable_physical {
            return;
        }
        let bytes = json::to_string(plan.as_ref()).map(|s| s.len()).unwrap_or(256);
        self.physical.insert(key, plan, bytes);
    }

    /// Drop all entries of one index, both levels.
    pub fn invalidate_index(&self, index: &str) {
        let prefix = format!("{index}:");
        self.logical.retain(|k| !k.starts_with(&prefix));
        self.physical.retain(|k| !k.starts_with(&prefix));
        log::info!("[CACHE] invalidated plan caches for index {index}");
    }

    /// Cluster events that change routing or schema invalidate the index.
    pub fn on_cluster_event(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::IndexDeleted { index, .. }
            | ClusterEvent::ShardAllocated { index, .. }
            | ClusterEvent::ShardStateChanged { index, .. } => self.invalidate_index(index),
            _ => {}
        }
    }

    pub fn sweep(&self) {
        self.logical.sweep();
        self.physical.sweep();
    }

    pub fn len(&self) -> (usize, usize) {
        (self.logical.len(), self.physical.len())
    }

    pub fn clear(&self) {
        self.logical.clear();
        self.physical.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::utils::json::json;

    fn req(body: json::Value) -> SearchRequest {
        crate::service::search::parser::parse(&body).unwrap()
    }

    #[test]
    fn test_key_is_order_independent() {
        let a = req(json!({"query": {"bool": {"must": [
            {"term": {"a": "1"}}, {"term": {"b": "2"}}
        ]}}}));
        let b = req(json!({"query": {"bool": {"must": [
            {"term": {"b": "2"}}, {"term": {"a": "1"}}
        ]}}}));
        assert_eq!(
            PlanCache::logical_key("logs", &a, &[2, 0, 1]),
            PlanCache::logical_key("logs", &b, &[0, 1, 2]),
        );
    }

    #[test]
    fn test_key_strips_cache_busting_fields() {
        let mut a = req(json!({"query": {"match": {"t": "x"}}}));
        let mut b = req(json!({"query": {"match": {"t": "x"}}}));
        a.timeout_ms = 1000;
        b.timeout_ms = 9999;
        b.strict = true;
        assert_eq!(
            PlanCache::logical_key("logs", &a, &[0]),
            PlanCache::logical_key("logs", &b, &[0]),
        );
    }

    #[test]
    fn test_key_differs_by_window() {
        let a = req(json!({"from": 0, "size": 10}));
        let b = req(json!({"from": 10, "size": 10}));
        assert_ne!(
            PlanCache::logical_key("logs", &a, &[0]),
            PlanCache::logical_key("logs", &b, &[0]),
        );
    }

    #[test]
    fn test_invalidate_by_index() {
        let cache = PlanCache::new();
        let plan = Arc::new(LogicalPlan::Scan {
            index: "logs".to_string(),
            shards: vec![0],
            pushed_filter: None,
            limit_hint: None,
        });
        cache.put_logical("logs:abc".to_string(), plan.clone());
        cache.put_logical("metrics:abc".to_string(), plan.clone());
        cache.put_physical("logs:def".to_string(), Arc::new(crate::service::search::planner::build_physical(&plan)));
        cache.invalidate_index("logs");
        assert!(cache.get_logical("logs:abc").is_none());
        assert!(cache.get_physical("logs:def").is_none());
        assert!(cache.get_logical("metrics:abc").is_some());
    }
}
