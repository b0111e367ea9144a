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

//! The master's public control-plane surface. Every mutation is proposed to
//! the replicated log and applied only after commit; reads come from the
//! leader's state machine, or from a follower when the caller allows stale
//! reads.

pub mod allocator;
pub mod log;
pub mod state;
pub mod watch;

use std::sync::Arc;

use config::{
    ider,
    meta::{
        cluster::{ClusterCommand, ClusterState, IndexRouting, Node, NodeStats, ShardState},
        index::{IndexMeta, IndexSettings, IndexState, Mappings},
    },
    utils::time,
};
use infra::errors::{Error, Result};

use self::log::RaftNode;
use self::state::MasterState;

static MASTER_NODE: tokio::sync::OnceCell<Arc<MasterNode>> = tokio::sync::OnceCell::const_new();

pub async fn set_master_node(master: Arc<MasterNode>) {
    _ = MASTER_NODE.get_or_init(|| async { master }).await;
}

pub fn get_master_node() -> Result<Arc<MasterNode>> {
    MASTER_NODE
        .get()
        .cloned()
        .ok_or_else(|| Error::Internal("master node not initialized".to_string()))
}

pub struct MasterNode {
    raft: Arc<RaftNode>,
    /// Pokes the allocator loop after index-level changes.
    pub nudge: tokio::sync::Notify,
}

impl MasterNode {
    pub fn new(raft: Arc<RaftNode>) -> Arc<Self> {
        Arc::new(MasterNode {
            raft,
            nudge: tokio::sync::Notify::new(),
        })
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn state(&self) -> Arc<MasterState> {
        self.raft.state_machine()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Register (or re-register) a node. Returns `(version, node_id)`.
    pub async fn register_node(&self, node: Node) -> Result<(u64, i32)> {
        if node.uuid.is_empty() || node.grpc_addr.is_empty() {
            return Err(Error::InvalidArgument(
                "node uuid and grpc_addr are required".to_string(),
            ));
        }
        let uuid = node.uuid.clone();
        let version = self
            .raft
            .propose(&ClusterCommand::RegisterNode { node }, "")
            .await?;
        let node_id = self
            .state()
            .snapshot()
            .get_node(&uuid)
            .map(|n| n.id)
            .unwrap_or_default();
        ::log::info!("[MASTER] node {uuid} registered as id {node_id} at version {version}");
        self.nudge.notify_one();
        Ok((version, node_id))
    }

    pub async fn unregister_node(&self, uuid: &str) -> Result<u64> {
        let version = self
            .raft
            .propose(
                &ClusterCommand::UnregisterNode {
                    uuid: uuid.to_string(),
                },
                "",
            )
            .await?;
        ::log::info!("[MASTER] node {uuid} unregistered at version {version}");
        self.nudge.notify_one();
        Ok(version)
    }

    /// Heartbeat from a data node. `NotFound` tells the node to re-register.
    pub async fn heartbeat(&self, uuid: &str, stats: NodeStats) -> Result<u64> {
        self.raft
            .propose(
                &ClusterCommand::Heartbeat {
                    uuid: uuid.to_string(),
                    stats,
                    at_micros: time::now_micros(),
                },
                "",
            )
            .await
    }

    pub async fn create_index(
        &self,
        name: &str,
        settings: IndexSettings,
        mappings: Mappings,
        request_id: &str,
    ) -> Result<IndexMeta> {
        let meta = IndexMeta::new(name, settings, mappings, time::now_micros());
        meta.validate().map_err(Error::InvalidArgument)?;
        let request_id = if request_id.is_empty() {
            ider::generate()
        } else {
            request_id.to_string()
        };
        let version = self
            .raft
            .propose(&ClusterCommand::CreateIndex { meta }, &request_id)
            .await?;
        self.nudge.notify_one();
        let snapshot = self.state().snapshot();
        let meta = snapshot
            .indices
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("index {name} vanished after commit")))?;
        ::log::info!(
            "[MASTER] index {name} created at version {version} ({} shards, {} replicas)",
            meta.settings.shards,
            meta.settings.replicas
        );
        Ok(meta)
    }

    pub async fn delete_index(&self, name: &str, request_id: &str) -> Result<u64> {
        let request_id = if request_id.is_empty() {
            ider::generate()
        } else {
            request_id.to_string()
        };
        let version = self
            .raft
            .propose(
                &ClusterCommand::DeleteIndex {
                    name: name.to_string(),
                },
                &request_id,
            )
            .await?;
        ::log::info!("[MASTER] index {name} marked for deletion at version {version}");
        self.nudge.notify_one();
        Ok(version)
    }

    pub async fn allocate_shard(
        &self,
        index: &str,
        shard_id: u32,
        node_uuid: &str,
        is_primary: bool,
        request_id: &str,
    ) -> Result<u64> {
        self.raft
            .propose(
                &ClusterCommand::AllocateShard {
                    index: index.to_string(),
                    shard_id,
                    node_uuid: node_uuid.to_string(),
                    is_primary,
                },
                request_id,
            )
            .await
    }

    pub async fn update_shard_state(
        &self,
        index: &str,
        shard_id: u32,
        node_uuid: &str,
        state: ShardState,
    ) -> Result<u64> {
        self.raft
            .propose(
                &ClusterCommand::UpdateShardState {
                    index: index.to_string(),
                    shard_id,
                    node_uuid: node_uuid.to_string(),
                    state,
                },
                "",
            )
            .await
    }

    /// A version-stamped snapshot. Followers serve it only with
    /// `allow_stale`; otherwise the caller is redirected to the leader.
    pub fn get_state(&self, allow_stale: bool) -> Result<Arc<ClusterState>> {
        if !self.raft.is_leader() && !allow_stale {
            return Err(match self.raft.leader_hint() {
                Some(leader) => {
                    Error::FailedPrecondition(format!("stale reads not allowed; leader={leader}"))
                }
                None => Error::FailedPrecondition("no leader elected yet".to_string()),
            });
        }
        Ok(self.state().snapshot())
    }

    pub fn get_index(&self, name: &str) -> Result<IndexMeta> {
        self.state()
            .snapshot()
            .indices
            .get(name)
            .filter(|meta| meta.state != IndexState::Deleting)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("index {name}")))
    }

    pub fn get_routing(&self, index: &str) -> Result<(u64, IndexRouting)> {
        let snapshot = self.state().snapshot();
        let meta = snapshot
            .indices
            .get(index)
            .filter(|meta| meta.state != IndexState::Deleting)
            .ok_or_else(|| Error::NotFound(format!("index {index}")))?;
        let routing = snapshot
            .routing
            .get(&meta.name)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("index {index} has no routing table")))?;
        Ok((snapshot.version, routing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::master::log::InProcessTransport;
    use config::meta::cluster::{NodeState, Role};

    pub(crate) fn single_master() -> Arc<MasterNode> {
        let raft = RaftNode::new(
            "m1",
            vec![],
            Arc::new(MasterState::new()),
            Arc::new(InProcessTransport::new()),
        );
        MasterNode::new(raft)
    }

    fn data_node(uuid: &str) -> Node {
        Node {
            uuid: uuid.to_string(),
            name: uuid.to_string(),
            grpc_addr: format!("http://{uuid}:5461"),
            role: vec![Role::Data],
            state: NodeState::Active,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_get_index() {
        let master = single_master();
        let meta = master
            .create_index("logs", IndexSettings::default(), Mappings::default(), "")
            .await
            .unwrap();
        assert_eq!(meta.state, IndexState::Creating);
        assert_eq!(master.get_index("logs").unwrap().name, "logs");
        assert!(matches!(
            master.get_index("missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let master = single_master();
        master
            .create_index("logs", IndexSettings::default(), Mappings::default(), "")
            .await
            .unwrap();
        let err = master
            .create_index("logs", IndexSettings::default(), Mappings::default(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_register_assigns_ids() {
        let master = single_master();
        let (_, id1) = master.register_node(data_node("n1")).await.unwrap();
        let (_, id2) = master.register_node(data_node("n2")).await.unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node() {
        let master = single_master();
        let err = master
            .heartbeat("ghost", NodeStats::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_deleted_index_routing_not_found() {
        let master = single_master();
        master
            .create_index("logs", IndexSettings::default(), Mappings::default(), "")
            .await
            .unwrap();
        assert!(master.get_routing("logs").is_ok());
        master.delete_index("logs", "").await.unwrap();
        assert!(matches!(
            master.get_routing("logs"),
            Err(Error::NotFound(_))
        ));
    }
}
