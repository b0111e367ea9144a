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

//! Clients for master RPCs. Writes go to the leader; a follower answers
//! `FailedPrecondition` with a `leader=` hint and the client follows it,
//! bounded at three redirects. The local client calls the in-process master,
//! the path local mode and tests take.

use std::sync::Arc;

use async_trait::async_trait;
use config::{
    get_config,
    meta::{
        cluster::{ClusterEvent, ClusterState, Node, NodeStats},
        index::{IndexMeta, IndexSettings, Mappings},
    },
    utils::json,
};
use infra::errors::{Error, Result};
use proto::cluster_rpc::{
    master_service_client::MasterServiceClient, AppendEntriesRequest, AppendEntriesResponse,
    CreateIndexRequest, DeleteIndexRequest, GetClusterStateRequest, HeartbeatRequest,
    InstallSnapshotRequest, InstallSnapshotResponse, NodeInfo, NodeStats as RpcNodeStats,
    RegisterNodeRequest, UnregisterNodeRequest, VoteRequest, VoteResponse,
    WatchClusterStateRequest,
};
use tokio::sync::mpsc;

use crate::service::master::{log::RaftTransport, MasterNode};

const MAX_REDIRECTS: usize = 3;

#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn register_node(&self, node: &Node) -> Result<(u64, i32)>;
    async fn unregister_node(&self, uuid: &str) -> Result<u64>;
    async fn heartbeat(&self, uuid: &str, stats: NodeStats) -> Result<u64>;
    async fn get_cluster_state(&self, allow_stale: bool) -> Result<Arc<ClusterState>>;
    async fn create_index(
        &self,
        name: &str,
        settings: IndexSettings,
        mappings: Mappings,
        request_id: &str,
    ) -> Result<IndexMeta>;
    async fn delete_index(&self, name: &str, request_id: &str) -> Result<u64>;
    async fn watch(&self, since_version: u64) -> Result<mpsc::Receiver<ClusterEvent>>;
}

// ------------------------------ local client ------------------------------

pub struct LocalMasterClient {
    pub master: Arc<MasterNode>,
}

#[async_trait]
impl MasterClient for LocalMasterClient {
    async fn register_node(&self, node: &Node) -> Result<(u64, i32)> {
        self.master.register_node(node.clone()).await
    }

    async fn unregister_node(&self, uuid: &str) -> Result<u64> {
        self.master.unregister_node(uuid).await
    }

    async fn heartbeat(&self, uuid: &str, stats: NodeStats) -> Result<u64> {
        self.master.heartbeat(uuid, stats).await
    }

    async fn get_cluster_state(&self, allow_stale: bool) -> Result<Arc<ClusterState>> {
        self.master.get_state(allow_stale)
    }

    async fn create_index(
        &self,
        name: &str,
        settings: IndexSettings,
        mappings: Mappings,
        request_id: &str,
    ) -> Result<IndexMeta> {
        self.master
            .create_index(name, settings, mappings, request_id)
            .await
    }

    async fn delete_index(&self, name: &str, request_id: &str) -> Result<u64> {
        self.master.delete_index(name, request_id).await
    }

    async fn watch(&self, since_version: u64) -> Result<mpsc::Receiver<ClusterEvent>> {
        let (_id, receiver) = self.master.state().watch.subscribe(since_version);
        Ok(receiver)
    }
}

// ------------------------------ gRPC client -------------------------------

pub struct GrpcMasterClient {
    addrs: Vec<String>,
    leader_hint: parking_lot::Mutex<Option<String>>,
}

impl GrpcMasterClient {
    pub fn new(addrs: Vec<String>) -> Self {
        GrpcMasterClient {
            addrs,
            leader_hint: parking_lot::Mutex::new(None),
        }
    }

    pub fn from_config() -> Self {
        let cfg = get_config();
        Self::new(
            cfg.common
                .master_addrs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    async fn client(
        &self,
        addr: &str,
    ) -> Result<MasterServiceClient<tonic::transport::Channel>> {
        let cfg = get_config();
        let channel = super::get_channel(addr).await?;
        Ok(MasterServiceClient::new(channel)
            .max_decoding_message_size(cfg.grpc.max_message_size * 1024 * 1024)
            .max_encoding_message_size(cfg.grpc.max_message_size * 1024 * 1024))
    }

    /// Run `op` against the leader, following redirects and failing over to
    /// the other configured masters.
    async fn with_leader<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(MasterServiceClient<tonic::transport::Channel>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut candidates: Vec<String> = Vec::new();
        if let Some(leader) = self.leader_hint.lock().clone() {
            candidates.push(leader);
        }
        for addr in &self.addrs {
            if !candidates.contains(addr) {
                candidates.push(addr.clone());
            }
        }
        let mut last_err = Error::Unavailable("no master reachable".to_string());
        let mut redirects = 0;
        let mut i = 0;
        while i < candidates.len() && redirects <= MAX_REDIRECTS {
            let addr = candidates[i].clone();
            i += 1;
            let client = match self.client(&addr).await {
                Ok(client) => client,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            match op(client).await {
                Ok(out) => {
                    *self.leader_hint.lock() = Some(addr);
                    return Ok(out);
                }
                Err(e) => {
                    if let Some(leader) = e.leader_hint() {
                        redirects += 1;
                        if !candidates.contains(&leader) {
                            candidates.insert(i, leader);
                        }
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

fn to_node_info(node: &Node) -> NodeInfo {
    NodeInfo {
        uuid: node.uuid.clone(),
        name: node.name.clone(),
        grpc_addr: node.grpc_addr.clone(),
        roles: node.role.iter().map(|r| r.to_string()).collect(),
        attributes: node.attributes.clone().into_iter().collect(),
        cpu_num: node.cpu_num,
    }
}

fn to_rpc_stats(stats: &NodeStats) -> RpcNodeStats {
    RpcNodeStats {
        shard_count: stats.shard_count,
        doc_count: stats.doc_count,
        disk_usage_percent: stats.disk_usage_percent,
        cpu_usage_percent: stats.cpu_usage_percent,
    }
}

#[async_trait]
impl MasterClient for GrpcMasterClient {
    async fn register_node(&self, node: &Node) -> Result<(u64, i32)> {
        let info = to_node_info(node);
        self.with_leader(|mut client| {
            let info = info.clone();
            async move {
                let resp = client
                    .register_node(RegisterNodeRequest { node: Some(info) })
                    .await
                    .map_err(Error::from)?
                    .into_inner();
                Ok((resp.version, resp.node_id))
            }
        })
        .await
    }

    async fn unregister_node(&self, uuid: &str) -> Result<u64> {
        let uuid = uuid.to_string();
        self.with_leader(|mut client| {
            let uuid = uuid.clone();
            async move {
                let resp = client
                    .unregister_node(UnregisterNodeRequest { uuid })
                    .await
                    .map_err(Error::from)?
                    .into_inner();
                Ok(resp.version)
            }
        })
        .await
    }

    async fn heartbeat(&self, uuid: &str, stats: NodeStats) -> Result<u64> {
        let uuid = uuid.to_string();
        let stats = to_rpc_stats(&stats);
        self.with_leader(|mut client| {
            let uuid = uuid.clone();
            let stats = stats.clone();
            async move {
                let resp = client
                    .heartbeat(HeartbeatRequest {
                        uuid,
                        stats: Some(stats),
                    })
                    .await
                    .map_err(Error::from)?
                    .into_inner();
                Ok(resp.version)
            }
        })
        .await
    }

    async fn get_cluster_state(&self, allow_stale: bool) -> Result<Arc<ClusterState>> {
        self.with_leader(|mut client| async move {
            let resp = client
                .get_cluster_state(GetClusterStateRequest { allow_stale })
                .await
                .map_err(Error::from)?
                .into_inner();
            let state: ClusterState = json::from_slice(&resp.state)?;
            Ok(Arc::new(state))
        })
        .await
    }

    async fn create_index(
        &self,
        name: &str,
        settings: IndexSettings,
        mappings: Mappings,
        request_id: &str,
    ) -> Result<IndexMeta> {
        let req = CreateIndexRequest {
            name: name.to_string(),
            settings: json::to_vec(&settings)?,
            mappings: json::to_vec(&mappings)?,
            request_id: request_id.to_string(),
        };
        self.with_leader(|mut client| {
            let req = req.clone();
            async move {
                let resp = client
                    .create_index(req)
                    .await
                    .map_err(Error::from)?
                    .into_inner();
                Ok(json::from_slice(&resp.meta)?)
            }
        })
        .await
    }

    async fn delete_index(&self, name: &str, request_id: &str) -> Result<u64> {
        let req = DeleteIndexRequest {
            name: name.to_string(),
            request_id: request_id.to_string(),
        };
        self.with_leader(|mut client| {
            let req = req.clone();
            async move {
                let resp = client
                    .delete_index(req)
                    .await
                    .map_err(Error::from)?
                    .into_inner();
                Ok(resp.version)
            }
        })
        .await
    }

    async fn watch(&self, since_version: u64) -> Result<mpsc::Receiver<ClusterEvent>> {
        let cfg = get_config();
        let mut stream = self
            .with_leader(|mut client| async move {
                let resp = client
                    .watch_cluster_state(WatchClusterStateRequest { since_version })
                    .await
                    .map_err(Error::from)?;
                Ok(resp.into_inner())
            })
            .await?;
        let (sender, receiver) = mpsc::channel(cfg.cluster.watch_channel_size);
        tokio::task::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(msg)) => {
                        let event: ClusterEvent = match json::from_slice(&msg.event) {
                            Ok(event) => event,
                            Err(e) => {
                                log::error!("[CLUSTER] undecodable watch event: {e}");
                                continue;
                            }
                        };
                        if sender.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("[CLUSTER] watch stream broke: {e}");
                        break;
                    }
                }
            }
        });
        Ok(receiver)
    }
}

// --------------------------- raft over gRPC -------------------------------

#[derive(Default)]
pub struct GrpcRaftTransport {}

#[async_trait]
impl RaftTransport for GrpcRaftTransport {
    async fn request_vote(&self, peer: &str, req: VoteRequest) -> Result<VoteResponse> {
        let channel = super::get_channel(peer).await?;
        let mut client = MasterServiceClient::new(channel);
        Ok(client
            .request_vote(req)
            .await
            .map_err(Error::from)?
            .into_inner())
    }

    async fn append_entries(
        &self,
        peer: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let channel = super::get_channel(peer).await?;
        let mut client = MasterServiceClient::new(channel);
        Ok(client
            .append_entries(req)
            .await
            .map_err(Error::from)?
            .into_inner())
    }

    async fn install_snapshot(
        &self,
        peer: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let channel = super::get_channel(peer).await?;
        let mut client = MasterServiceClient::new(channel);
        Ok(client
            .install_snapshot(req)
            .await
            .map_err(Error::from)?
            .into_inner())
    }
}
