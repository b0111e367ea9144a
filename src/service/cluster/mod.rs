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

//! Node-side cluster membership: register with the master, keep alive with
//! heartbeats, and mirror the cluster state locally. The local mirror is an
//! immutable snapshot swapped atomically on every observed version bump;
//! watch events also invalidate the coordinator's plan caches.

use std::sync::Arc;

use arc_swap::ArcSwap;
use config::{
    cluster::{get_local_grpc_addr, LOCAL_NODE_ROLE, LOCAL_NODE_UUID},
    get_config,
    meta::cluster::{ClusterState, Node, NodeState, NodeStats},
    utils::rand::jitter_millis,
};
use infra::errors::{Error, Result};
use once_cell::sync::Lazy;
use tokio::sync::OnceCell;

use crate::service::{
    clients::master::MasterClient, search::cache::PLAN_CACHE, shard::SHARD_MANAGER,
};

static SNAPSHOT: Lazy<ArcSwap<ClusterState>> =
    Lazy::new(|| ArcSwap::from(Arc::new(ClusterState::default())));

static MASTER_CLIENT: OnceCell<Arc<dyn MasterClient>> = OnceCell::const_new();

pub async fn set_master_client(client: Arc<dyn MasterClient>) {
    _ = MASTER_CLIENT.get_or_init(|| async { client }).await;
}

pub fn master_client() -> Result<Arc<dyn MasterClient>> {
    MASTER_CLIENT
        .get()
        .cloned()
        .ok_or_else(|| Error::Internal("master client not initialized".to_string()))
}

/// The local, immutable view of the cluster. Whole-request consistency comes
/// from taking one snapshot and using only it.
pub fn snapshot() -> Arc<ClusterState> {
    SNAPSHOT.load_full()
}

/// Swap in a newer snapshot; older versions are dropped silently.
pub fn publish_snapshot(state: Arc<ClusterState>) {
    let current = SNAPSHOT.load();
    if state.version >= current.version {
        SNAPSHOT.store(state);
    }
}

pub fn local_node() -> Node {
    let cfg = get_config();
    Node {
        id: 0,
        uuid: LOCAL_NODE_UUID.clone(),
        name: cfg.common.instance_name.clone(),
        grpc_addr: get_local_grpc_addr(),
        role: LOCAL_NODE_ROLE.clone(),
        attributes: Default::default(),
        state: NodeState::Joining,
        last_seen_micros: 0,
        cpu_num: cfg.limit.cpu_num as u64,
        stats: NodeStats::default(),
    }
}

/// Register this node and start the keepalive and watch loops.
pub async fn register_and_keepalive() -> Result<()> {
    let cfg = get_config();
    let client = master_client()?;
    let node = local_node();

    let mut backoff = cfg.cluster.register_retry_interval.max(1);
    loop {
        match client.register_node(&node).await {
            Ok((version, node_id)) => {
                log::info!(
                    "[CLUSTER] registered {} as node {node_id} at version {version}",
                    node.uuid
                );
                break;
            }
            Err(e) => {
                log::error!("[CLUSTER] register failed, retrying in {backoff}s: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(jitter_millis(
                    backoff * 1000,
                    500,
                )))
                .await;
                backoff = (backoff * 2).min(60);
            }
        }
    }

    // seed the local mirror before anything consults it
    match client.get_cluster_state(true).await {
        Ok(state) => publish_snapshot(state),
        Err(e) => log::warn!("[CLUSTER] initial state fetch failed: {e}"),
    }

    tokio::task::spawn(heartbeat_loop());
    tokio::task::spawn(watch_loop());
    Ok(())
}

/// Leave the cluster; allocations move off this node.
pub async fn leave() -> Result<()> {
    let client = master_client()?;
    client.unregister_node(&LOCAL_NODE_UUID).await?;
    log::info!("[CLUSTER] left cluster");
    Ok(())
}

async fn heartbeat_loop() {
    let cfg = get_config();
    let interval = std::time::Duration::from_secs(cfg.cluster.heartbeat_interval.max(1));
    loop {
        tokio::time::sleep(interval).await;
        let Ok(client) = master_client() else {
            continue;
        };
        let stats = SHARD_MANAGER.node_stats();
        match client.heartbeat(&LOCAL_NODE_UUID, stats).await {
            Ok(_version) => {}
            Err(Error::NotFound(_)) => {
                // master forgot us; re-register
                log::warn!("[CLUSTER] unknown to master, re-registering");
                if let Err(e) = client.register_node(&local_node()).await {
                    log::error!("[CLUSTER] re-register failed: {e}");
                }
            }
            Err(e) => log::warn!("[CLUSTER] heartbeat failed: {e}"),
        }
    }
}

/// Consume the watch stream: invalidate plan caches per event and refresh
/// the local snapshot. Re-subscribes with backoff when the stream breaks.
async fn watch_loop() {
    loop {
        let Ok(client) = master_client() else {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            continue;
        };
        let since = snapshot().version;
        let mut events = match client.watch(since).await {
            Ok(events) => events,
            Err(e) => {
                log::warn!("[CLUSTER] watch subscribe failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(jitter_millis(1000, 500)))
                    .await;
                continue;
            }
        };
        log::info!("[CLUSTER] watching cluster state since version {since}");
        while let Some(event) = events.recv().await {
            let version = event.version();
            if version <= snapshot().version {
                continue;
            }
            PLAN_CACHE.on_cluster_event(&event);
            match client.get_cluster_state(true).await {
                Ok(state) => publish_snapshot(state),
                Err(e) => log::warn!("[CLUSTER] state refresh failed: {e}"),
            }
        }
        log::warn!("[CLUSTER] watch stream closed, re-subscribing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_version_monotonic() {
        let mut newer = ClusterState::default();
        newer.version = 5;
        publish_snapshot(Arc::new(newer));
        assert_eq!(snapshot().version, 5);

        let mut older = ClusterState::default();
        older.version = 3;
        publish_snapshot(Arc::new(older));
        assert_eq!(snapshot().version, 5);

        let mut newest = ClusterState::default();
        newest.version = 8;
        publish_snapshot(Arc::new(newest));
        assert_eq!(snapshot().version, 8);
    }

    #[test]
    fn test_local_node_has_identity() {
        let node = local_node();
        assert!(!node.uuid.is_empty());
        assert!(node.grpc_addr.starts_with("http://"));
        assert!(!node.role.is_empty());
    }
}
