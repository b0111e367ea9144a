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

use once_cell::sync::Lazy;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};

pub const NAMESPACE: &str = "qv";

// grpc latency
pub static GRPC_INCOMING_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("grpc_incoming_requests", "gRPC incoming requests").namespace(NAMESPACE),
        &["endpoint", "status"],
    )
    .expect("Metric created")
});
pub static GRPC_RESPONSE_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("grpc_response_time", "gRPC response time").namespace(NAMESPACE),
        &["endpoint", "status"],
    )
    .expect("Metric created")
});

// coordinator query pipeline
pub static QUERY_CACHE_HITS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("query_cache_hits", "Plan cache hits").namespace(NAMESPACE),
        &["level"],
    )
    .expect("Metric created")
});
pub static QUERY_CACHE_MISSES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("query_cache_misses", "Plan cache misses").namespace(NAMESPACE),
        &["level"],
    )
    .expect("Metric created")
});
pub static SHARD_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("shard_requests", "Per-shard sub-requests dispatched").namespace(NAMESPACE),
        &["index", "status"],
    )
    .expect("Metric created")
});
pub static QUERY_RUNNING: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("query_running", "In-flight shard sub-requests").namespace(NAMESPACE),
        &["index"],
    )
    .expect("Metric created")
});

// control plane
pub static CLUSTER_STATE_VERSION: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("cluster_state_version", "Last committed cluster state version")
            .namespace(NAMESPACE),
        &["role"],
    )
    .expect("Metric created")
});
pub static RAFT_PROPOSALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("raft_proposals", "Replicated log proposals").namespace(NAMESPACE),
        &["status"],
    )
    .expect("Metric created")
});

// data node
pub static SHARD_DOC_COUNT: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("shard_doc_count", "Documents per shard").namespace(NAMESPACE),
        &["index", "shard"],
    )
    .expect("Metric created")
});
pub static SHARD_BYTE_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("shard_byte_size", "Stored bytes per shard").namespace(NAMESPACE),
        &["index", "shard"],
    )
    .expect("Metric created")
});

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(GRPC_INCOMING_REQUESTS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(GRPC_RESPONSE_TIME.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(QUERY_CACHE_HITS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(QUERY_CACHE_MISSES.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(SHARD_REQUESTS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(QUERY_RUNNING.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(CLUSTER_STATE_VERSION.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(RAFT_PROPOSALS.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(SHARD_DOC_COUNT.clone()))
        .expect("Metric registered");
    registry
        .register(Box::new(SHARD_BYTE_SIZE.clone()))
        .expect("Metric registered");
}

pub fn init() {
    register_metrics(prometheus::default_registry());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_labels() {
        GRPC_INCOMING_REQUESTS
            .with_label_values(&["/search", "200"])
            .inc();
        assert!(
            GRPC_INCOMING_REQUESTS
                .with_label_values(&["/search", "200"])
                .get()
                >= 1
        );
    }
}
