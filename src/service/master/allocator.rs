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

//! The shard allocator: a reconciliation loop on the master leader. It
//! sweeps dead nodes, places missing shard copies on the least-loaded
//! healthy node, drives CreateShard/DeleteShard RPCs, and purges deleted
//! indices once their shards are gone.

use std::{sync::Arc, time::Duration};

use config::{
    get_config,
    meta::{
        cluster::{ClusterState, NodeState, ShardState},
        index::IndexState,
    },
    utils::time,
};
use infra::errors::Result;

use super::MasterNode;
use crate::service::clients::data::DataClient;

pub struct Allocator {
    master: Arc<MasterNode>,
    data_client: Arc<dyn DataClient>,
}

impl Allocator {
    pub fn new(master: Arc<MasterNode>, data_client: Arc<dyn DataClient>) -> Self {
        Allocator {
            master,
            data_client,
        }
    }

    /// The reconciliation loop. Runs forever; only acts while this master is
    /// the leader.
    pub async fn run(self) {
        let interval = Duration::from_secs(get_config().cluster.heartbeat_interval.max(1));
        log::info!("[MASTER] allocator loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.master.nudge.notified() => {}
            }
            if !self.master.is_leader() {
                continue;
            }
            if let Err(e) = self.reconcile().await {
                log::error!("[MASTER] reconcile pass failed: {e}");
            }
        }
    }

    /// One reconciliation pass over a single state snapshot.
    pub async fn reconcile(&self) -> Result<()> {
        let snapshot = self.master.state().snapshot();
        self.sweep_dead_nodes(&snapshot).await;
        self.purge_deleting_indices(&snapshot).await;
        self.place_missing_copies(&snapshot).await;
        Ok(())
    }

    /// Nodes silent for `heartbeat_interval * heartbeat_timeout_times` go
    /// DOWN and their allocations become unassigned.
    async fn sweep_dead_nodes(&self, snapshot: &ClusterState) {
        let cfg = get_config();
        let deadline_micros =
            (cfg.cluster.heartbeat_interval * cfg.cluster.heartbeat_timeout_times * 1_000_000)
                as i64;
        let now = time::now_micros();
        for node in snapshot.nodes.values() {
            if node.state != NodeState::Active
                || node.last_seen_micros == 0
                || now - node.last_seen_micros < deadline_micros
            {
                continue;
            }
            log::warn!(
                "[MASTER] node {} missed heartbeats for {}s, marking DOWN",
                node.uuid,
                (now - node.last_seen_micros) / 1_000_000
            );
            if let Err(e) = self
                .master
                .raft()
                .propose(
                    &config::meta::cluster::ClusterCommand::MarkNodeDown {
                        uuid: node.uuid.clone(),
                    },
                    "",
                )
                .await
            {
                log::error!("[MASTER] mark node {} down failed: {e}", node.uuid);
            }
        }
    }

    /// Deleting indices: best-effort shard teardown, then purge from state.
    async fn purge_deleting_indices(&self, snapshot: &ClusterState) {
        for (name, meta) in &snapshot.indices {
            if meta.state != IndexState::Deleting {
                continue;
            }
            if let Some(routing) = snapshot.routing.get(name) {
                for (shard_id, allocations) in routing {
                    for alloc in allocations {
                        let Some(node) = alloc
                            .node_uuid
                            .as_deref()
                            .and_then(|uuid| snapshot.get_node(uuid))
                        else {
                            continue;
                        };
                        if let Err(e) =
                            self.data_client.delete_shard(node, name, *shard_id).await
                        {
                            log::warn!(
                                "[MASTER] delete shard {name}/{shard_id} on {} failed: {e}",
                                node.uuid
                            );
                        }
                    }
                }
            }
            if let Err(e) = self
                .master
                .raft()
                .propose(
                    &config::meta::cluster::ClusterCommand::PurgeIndex { name: name.clone() },
                    "",
                )
                .await
            {
                log::error!("[MASTER] purge index {name} failed: {e}");
            } else {
                log::info!("[MASTER] index {name} purged");
            }
        }
    }

    /// Every `(index, shard)` with fewer than `replicas + 1` live copies gets
    /// one placed on the best candidate node. Placements made earlier in the
    /// same pass count toward node load, so a batch spreads out.
    async fn place_missing_copies(&self, snapshot: &ClusterState) {
        let mut placed_now: hashbrown::HashMap<String, usize> = hashbrown::HashMap::new();
        for (name, meta) in &snapshot.indices {
            if meta.state == IndexState::Deleting {
                continue;
            }
            let Some(routing) = snapshot.routing.get(name) else {
                continue;
            };
            let needed = meta.settings.replicas + 1;
            for (shard_id, allocations) in routing {
                let live: Vec<_> = allocations
                    .iter()
                    .filter(|a| a.state != ShardState::Unassigned)
                    .collect();
                if live.len() as u32 >= needed {
                    continue;
                }
                let has_primary = live.iter().any(|a| a.is_primary);
                let hosting: Vec<&str> = live
                    .iter()
                    .filter_map(|a| a.node_uuid.as_deref())
                    .collect();
                let Some(target) = pick_target(snapshot, &hosting, &placed_now) else {
                    log::warn!(
                        "[MASTER] no candidate node for {name}/{shard_id}, leaving unassigned"
                    );
                    continue;
                };
                *placed_now.entry(target.clone()).or_insert(0) += 1;
                self.place_one(snapshot, name, *shard_id, &target, !has_primary)
                    .await;
            }
        }
    }

    async fn place_one(
        &self,
        snapshot: &ClusterState,
        index: &str,
        shard_id: u32,
        node_uuid: &str,
        is_primary: bool,
    ) {
        if let Err(e) = self
            .master
            .allocate_shard(index, shard_id, node_uuid, is_primary, "")
            .await
        {
            log::error!("[MASTER] allocate {index}/{shard_id} on {node_uuid} failed: {e}");
            return;
        }
        let Some(node) = snapshot.get_node(node_uuid) else {
            return;
        };
        let meta = snapshot.indices.get(index).cloned();
        let (settings, mappings) = match meta {
            Some(meta) => (meta.settings, meta.mappings),
            None => return,
        };
        let next_state = match self
            .data_client
            .create_shard(node, index, shard_id, is_primary, &settings, &mappings)
            .await
        {
            Ok(()) => ShardState::Started,
            Err(e) => {
                log::error!("[MASTER] create shard {index}/{shard_id} on {node_uuid} failed: {e}");
                ShardState::Unassigned
            }
        };
        if let Err(e) = self
            .master
            .update_shard_state(index, shard_id, node_uuid, next_state)
            .await
        {
            log::error!(
                "[MASTER] shard state update {index}/{shard_id} -> {next_state} failed: {e}"
            );
        }
    }
}

/// Target choice: fewest hosted shards, then lowest disk pressure, ties by
/// node uuid ascending.
fn pick_target(
    snapshot: &ClusterState,
    exclude: &[&str],
    placed_now: &hashbrown::HashMap<String, usize>,
) -> Option<String> {
    let mut candidates: Vec<(usize, u32, &str)> = snapshot
        .active_data_nodes()
        .into_iter()
        .filter(|n| !exclude.contains(&n.uuid.as_str()))
        .map(|n| {
            (
                hosted_shards(snapshot, &n.uuid) + placed_now.get(&n.uuid).copied().unwrap_or(0),
                (n.stats.disk_usage_percent * 100.0) as u32,
                n.uuid.as_str(),
            )
        })
        .collect();
    candidates.sort();
    candidates.first().map(|(_, _, uuid)| uuid.to_string())
}

fn hosted_shards(snapshot: &ClusterState, uuid: &str) -> usize {
    snapshot
        .routing
        .values()
        .flat_map(|routing| routing.values())
        .flatten()
        .filter(|a| a.node_uuid.as_deref() == Some(uuid))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use config::meta::{
        cluster::{Node, NodeStats, Role},
        index::{IndexSettings, Mappings},
        search::ShardSearchResponse,
    };
    use infra::errors::Error;
    use proto::cluster_rpc::SearchShardRequest;
    use tokio_util::sync::CancellationToken;

    use crate::service::master::tests::single_master;

    #[derive(Default)]
    struct RecordingDataClient {
        created: parking_lot::Mutex<Vec<(String, u32, bool, String)>>,
        fail_nodes: Vec<String>,
    }

    #[async_trait]
    impl DataClient for RecordingDataClient {
        async fn create_shard(
            &self,
            node: &Node,
            index: &str,
            shard_id: u32,
            is_primary: bool,
            _settings: &IndexSettings,
            _mappings: &Mappings,
        ) -> Result<()> {
            if self.fail_nodes.contains(&node.uuid) {
                return Err(Error::Unavailable(format!("node {} down", node.uuid)));
            }
            self.created.lock().push((
                index.to_string(),
                shard_id,
                is_primary,
                node.uuid.clone(),
            ));
            Ok(())
        }

        async fn delete_shard(&self, _node: &Node, _index: &str, _shard_id: u32) -> Result<()> {
            Ok(())
        }

        async fn search(
            &self,
            _node: &Node,
            _req: SearchShardRequest,
            _cancel: CancellationToken,
        ) -> Result<ShardSearchResponse> {
            Err(Error::Internal("not a search client".to_string()))
        }
    }

    fn data_node(uuid: &str) -> Node {
        Node {
            uuid: uuid.to_string(),
            name: uuid.to_string(),
            grpc_addr: format!("http://{uuid}:5461"),
            role: vec![Role::Data],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_allocates_primaries_and_activates_index() {
        let master = single_master();
        master.register_node(data_node("n1")).await.unwrap();
        master.register_node(data_node("n2")).await.unwrap();
        master
            .create_index("logs", IndexSettings { shards: 3, ..Default::default() }, Mappings::default(), "")
            .await
            .unwrap();
        let client = Arc::new(RecordingDataClient::default());
        let allocator = Allocator::new(master.clone(), client.clone());
        allocator.reconcile().await.unwrap();

        assert_eq!(client.created.lock().len(), 3);
        let state = master.state().snapshot();
        assert_eq!(state.indices["logs"].state, IndexState::Active);
        for allocations in state.routing["logs"].values() {
            assert_eq!(allocations.len(), 1);
            assert!(allocations[0].is_primary);
            assert_eq!(allocations[0].state, ShardState::Started);
        }
    }

    #[tokio::test]
    async fn test_spreads_shards_across_nodes() {
        let master = single_master();
        master.register_node(data_node("n1")).await.unwrap();
        master.register_node(data_node("n2")).await.unwrap();
        master
            .create_index("logs", IndexSettings { shards: 4, ..Default::default() }, Mappings::default(), "")
            .await
            .unwrap();
        let client = Arc::new(RecordingDataClient::default());
        Allocator::new(master.clone(), client.clone())
            .reconcile()
            .await
            .unwrap();
        let created = client.created.lock();
        let on_n1 = created.iter().filter(|(_, _, _, n)| n == "n1").count();
        let on_n2 = created.iter().filter(|(_, _, _, n)| n == "n2").count();
        assert_eq!(on_n1, 2);
        assert_eq!(on_n2, 2);
    }

    #[tokio::test]
    async fn test_replicas_get_second_copy() {
        let master = single_master();
        master.register_node(data_node("n1")).await.unwrap();
        master.register_node(data_node("n2")).await.unwrap();
        master
            .create_index(
                "logs",
                IndexSettings { shards: 1, replicas: 1, ..Default::default() },
                Mappings::default(),
                "",
            )
            .await
            .unwrap();
        let allocator = Allocator::new(master.clone(), Arc::new(RecordingDataClient::default()));
        // first pass places the primary, second the replica
        allocator.reconcile().await.unwrap();
        allocator.reconcile().await.unwrap();
        let state = master.state().snapshot();
        let allocations = &state.routing["logs"][&0];
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations.iter().filter(|a| a.is_primary).count(), 1);
    }

    #[tokio::test]
    async fn test_failed_create_leaves_unassigned() {
        let master = single_master();
        master.register_node(data_node("n1")).await.unwrap();
        master
            .create_index("logs", IndexSettings::default(), Mappings::default(), "")
            .await
            .unwrap();
        let client = Arc::new(RecordingDataClient {
            fail_nodes: vec!["n1".to_string()],
            ..Default::default()
        });
        Allocator::new(master.clone(), client)
            .reconcile()
            .await
            .unwrap();
        let state = master.state().snapshot();
        assert_eq!(state.routing["logs"][&0][0].state, ShardState::Unassigned);
        assert_eq!(state.indices["logs"].state, IndexState::Creating);
    }

    #[tokio::test]
    async fn test_dead_node_swept_and_rescheduled() {
        let master = single_master();
        master.register_node(data_node("n1")).await.unwrap();
        master.register_node(data_node("n2")).await.unwrap();
        master
            .create_index("logs", IndexSettings::default(), Mappings::default(), "")
            .await
            .unwrap();
        let client = Arc::new(RecordingDataClient::default());
        let allocator = Allocator::new(master.clone(), client.clone());
        allocator.reconcile().await.unwrap();

        // find the hosting node, age its heartbeat far into the past
        let state = master.state().snapshot();
        let hosting = state.routing["logs"][&0][0]
            .node_uuid
            .clone()
            .unwrap();
        // the other node stays fresh
        let other = if hosting == "n1" { "n2" } else { "n1" };
        master
            .heartbeat(other, NodeStats::default())
            .await
            .unwrap();
        // hosting node's last_seen stays 0 from registration, which reads as
        // never-heartbeated; give it one ancient heartbeat instead
        master
            .raft()
            .propose(
                &config::meta::cluster::ClusterCommand::Heartbeat {
                    uuid: hosting.clone(),
                    stats: NodeStats::default(),
                    at_micros: 1,
                },
                "",
            )
            .await
            .unwrap();

        allocator.reconcile().await.unwrap();
        let state = master.state().snapshot();
        assert_eq!(state.nodes[&hosting].state, NodeState::Down);
        // a later pass re-places the shard on the survivor
        allocator.reconcile().await.unwrap();
        let state = master.state().snapshot();
        let alloc = &state.routing["logs"][&0][0];
        assert_eq!(alloc.node_uuid.as_deref(), Some(other));
        assert_eq!(alloc.state, ShardState::Started);
    }

    #[tokio::test]
    async fn test_delete_index_purges() {
        let master = single_master();
        master.register_node(data_node("n1")).await.unwrap();
        master
            .create_index("logs", IndexSettings::default(), Mappings::default(), "")
            .await
            .unwrap();
        let allocator = Allocator::new(master.clone(), Arc::new(RecordingDataClient::default()));
        allocator.reconcile().await.unwrap();
        master.delete_index("logs", "").await.unwrap();
        allocator.reconcile().await.unwrap();
        let state = master.state().snapshot();
        assert!(!state.indices.contains_key("logs"));
        assert!(!state.routing.contains_key("logs"));
    }
}
