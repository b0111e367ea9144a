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

use std::{collections::BTreeMap, sync::Arc};

use arc_swap::ArcSwap;
use dotenv_config::EnvConfig;
use dotenvy::dotenv_override;
use hashbrown::{HashMap, HashSet};
use once_cell::sync::Lazy;

pub type RwHashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type RwHashSet<K> = dashmap::DashSet<K, ahash::RandomState>;
pub type RwAHashMap<K, V> = tokio::sync::RwLock<HashMap<K, V>>;
pub type RwAHashSet<K> = tokio::sync::RwLock<HashSet<K>>;
pub type RwBTreeMap<K, V> = tokio::sync::RwLock<BTreeMap<K, V>>;

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from(Arc::new(init())));

pub fn get_config() -> Arc<Config> {
    CONFIG.load().clone()
}

pub fn refresh_config() -> Result<(), anyhow::Error> {
    CONFIG.store(Arc::new(init()));
    Ok(())
}

#[derive(EnvConfig)]
pub struct Config {
    pub common: Common,
    pub grpc: Grpc,
    pub limit: Limit,
    pub cache: Cache,
    pub cluster: Cluster,
    pub raft: Raft,
    pub shard: Shard,
}

#[derive(EnvConfig)]
pub struct Common {
    #[env_config(name = "QV_LOCAL_MODE", default = false)]
    pub local_mode: bool,
    #[env_config(name = "QV_INSTANCE_NAME", default = "")]
    pub instance_name: String,
    #[env_config(name = "QV_NODE_ROLE", default = "all")]
    pub node_role: String,
    #[env_config(name = "QV_DATA_DIR", default = "./data/quiver/")]
    pub data_dir: String,
    #[env_config(
        name = "QV_MASTER_ADDRS",
        default = "http://127.0.0.1:5461",
        help = "Comma separated grpc addresses of the master quorum"
    )]
    pub master_addrs: String,
    #[env_config(name = "QV_LOG_LEVEL", default = "info")]
    pub log_level: String,
}

#[derive(EnvConfig)]
pub struct Grpc {
    #[env_config(name = "QV_GRPC_PORT", default = 5461)]
    pub port: u16,
    #[env_config(name = "QV_GRPC_ADDR", default = "")]
    pub addr: String,
    #[env_config(
        name = "QV_GRPC_MAX_MESSAGE_SIZE",
        default = 16,
        help = "Max grpc message size in MB, default is 16 MB"
    )]
    pub max_message_size: usize,
    #[env_config(name = "QV_GRPC_CONNECT_TIMEOUT", default = 5)] // in seconds
    pub connect_timeout: u64,
}

#[derive(EnvConfig)]
pub struct Limit {
    #[env_config(name = "QV_REQUEST_TIMEOUT", default = 30)] // in seconds
    pub request_timeout: u64,
    #[env_config(
        name = "QV_MAX_CONCURRENT",
        default = 1000,
        help = "Max in-flight shard requests per coordinator"
    )]
    pub max_concurrent: usize,
    #[env_config(name = "QV_QUEUE_DEADLINE_MS", default = 100)]
    pub queue_deadline_ms: u64,
    #[env_config(name = "QV_MAX_RESULT_WINDOW", default = 10000)]
    pub max_result_window: usize,
    #[env_config(name = "QV_QUERY_DEFAULT_LIMIT", default = 10)]
    pub query_default_limit: i64,
    #[env_config(
        name = "QV_TOPN_HEAP_THRESHOLD",
        default = 1000,
        help = "TopN uses a bounded heap when n is at most this, full sort otherwise"
    )]
    pub topn_heap_threshold: usize,
    #[env_config(
        name = "QV_AGG_HASH_CARDINALITY_LIMIT",
        default = 65536,
        help = "Hash aggregation is chosen when the estimated group count is below this"
    )]
    pub agg_hash_cardinality_limit: usize,
    #[env_config(name = "QV_SHARD_RPC_RETRIES", default = 3)]
    pub shard_rpc_retries: usize,
    #[env_config(name = "QV_CANCEL_CHECK_BATCH", default = 1024)]
    pub cancel_check_batch: usize,
    #[env_config(name = "QV_CPU_NUM", default = 0)]
    pub cpu_num: usize,
}

#[derive(EnvConfig)]
pub struct Cache {
    #[env_config(name = "QV_ENABLE_LOGICAL_CACHE", default = true)]
    pub enable_logical_cache: bool,
    #[env_config(name = "QV_LOGICAL_CACHE_SIZE", default = 1000)]
    pub logical_cache_size: usize,
    #[env_config(name = "QV_LOGICAL_CACHE_BYTES", default = 104857600)] // 100 MB
    pub logical_cache_bytes: usize,
    #[env_config(name = "QV_LOGICAL_CACHE_TTL", default = 300)] // in seconds
    pub logical_cache_ttl: u64,
    #[env_config(name = "QV_ENABLE_PHYSICAL_CACHE", default = true)]
    pub enable_physical_cache: bool,
    #[env_config(name = "QV_PHYSICAL_CACHE_SIZE", default = 500)]
    pub physical_cache_size: usize,
    #[env_config(name = "QV_PHYSICAL_CACHE_BYTES", default = 52428800)] // 50 MB
    pub physical_cache_bytes: usize,
    #[env_config(name = "QV_PHYSICAL_CACHE_TTL", default = 300)] // in seconds
    pub physical_cache_ttl: u64,
    #[env_config(name = "QV_CACHE_BUCKET_NUM", default = 16)]
    pub bucket_num: usize,
    #[env_config(name = "QV_CACHE_SWEEP_INTERVAL", default = 60)] // in seconds
    pub sweep_interval: u64,
}

#[derive(EnvConfig)]
pub struct Cluster {
    #[env_config(name = "QV_HEARTBEAT_INTERVAL", default = 10)] // in seconds
    pub heartbeat_interval: u64,
    #[env_config(
        name = "QV_HEARTBEAT_TIMEOUT_TIMES",
        default = 3,
        help = "A node is marked DOWN after heartbeat_interval * this with no heartbeat"
    )]
    pub heartbeat_timeout_times: u64,
    #[env_config(name = "QV_REGISTER_RETRY_INTERVAL", default = 2)] // in seconds
    pub register_retry_interval: u64,
    #[env_config(name = "QV_WATCH_CHANNEL_SIZE", default = 1024)]
    pub watch_channel_size: usize,
}

#[derive(EnvConfig)]
pub struct Raft {
    #[env_config(name = "QV_COMMIT_TIMEOUT", default = 10)] // in seconds
    pub commit_timeout: u64,
    #[env_config(name = "QV_ELECTION_TIMEOUT_MIN_MS", default = 1500)]
    pub election_timeout_min_ms: u64,
    #[env_config(name = "QV_ELECTION_TIMEOUT_MAX_MS", default = 3000)]
    pub election_timeout_max_ms: u64,
    #[env_config(name = "QV_RAFT_TICK_MS", default = 150)]
    pub tick_ms: u64,
    #[env_config(
        name = "QV_SNAPSHOT_ENTRIES",
        default = 10000,
        help = "Snapshot and truncate the replicated log every this many committed entries"
    )]
    pub snapshot_entries: u64,
}

#[derive(EnvConfig)]
pub struct Shard {
    #[env_config(name = "QV_SHARD_REFRESH_INTERVAL_MS", default = 1000)]
    pub default_refresh_interval_ms: u64,
    #[env_config(name = "QV_SHARD_MAX_DOCS_PER_BULK", default = 10000)]
    pub max_docs_per_bulk: usize,
    #[env_config(name = "QV_SHARD_DEFAULT_ANALYZER", default = "standard")]
    pub default_analyzer: String,
}

pub fn init() -> Config {
    dotenv_override().ok();
    let mut cfg = Config::init().expect("config init error");

    if cfg.limit.cpu_num == 0 {
        cfg.limit.cpu_num = std::thread::available_parallelism()
            .map(|v| v.get())
            .unwrap_or(1);
    }
    if cfg.common.instance_name.is_empty() {
        cfg.common.instance_name = sys_hostname();
    }
    if !cfg.common.data_dir.ends_with('/') {
        cfg.common.data_dir = format!("{}/", cfg.common.data_dir);
    }
    if cfg.raft.election_timeout_max_ms <= cfg.raft.election_timeout_min_ms {
        cfg.raft.election_timeout_max_ms = cfg.raft.election_timeout_min_ms * 2;
    }
    cfg
}

fn sys_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = init();
        assert_eq!(cfg.cluster.heartbeat_interval, 10);
        assert_eq!(cfg.limit.request_timeout, 30);
        assert_eq!(cfg.limit.max_concurrent, 1000);
        assert_eq!(cfg.cache.logical_cache_size, 1000);
        assert_eq!(cfg.cache.physical_cache_size, 500);
        assert!(cfg.common.data_dir.ends_with('/'));
        assert!(cfg.limit.cpu_num > 0);
    }

    #[test]
    fn test_get_config() {
        let cfg = get_config();
        assert!(cfg.limit.max_result_window > 0);
        assert!(cfg.raft.election_timeout_max_ms > cfg.raft.election_timeout_min_ms);
    }
}
