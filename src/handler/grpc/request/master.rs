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

//! Thin gRPC surface over the master control plane: decode, delegate, map
//! errors, count.

use std::sync::Arc;

use config::{
    meta::cluster::{Node, NodeState, NodeStats},
    utils::json,
};
use infra::errors::Error;
use proto::cluster_rpc::{
    master_service_server::MasterService, AllocateShardRequest, AppendEntriesRequest,
    AppendEntriesResponse, ClusterEventMessage, CreateIndexRequest, CreateIndexResponse,
    DeleteIndexRequest, GetClusterStateRequest, GetClusterStateResponse, GetIndexMetadataRequest,
    GetIndexMetadataResponse, GetShardRoutingRequest, GetShardRoutingResponse, HeartbeatRequest,
    HeartbeatResponse, InstallSnapshotRequest, InstallSnapshotResponse, NodeInfo,
    RegisterNodeRequest, RegisterNodeResponse, UnregisterNodeRequest, VersionResponse,
    VoteRequest, VoteResponse, WatchClusterStateRequest,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use super::observe;
use crate::service::master::MasterNode;

pub struct MasterServiceImpl {
    master: Arc<MasterNode>,
}

impl MasterServiceImpl {
    pub fn new(master: Arc<MasterNode>) -> Self {
        MasterServiceImpl { master }
    }
}

fn node_from_info(info: NodeInfo) -> Result<Node, Status> {
    let mut role = Vec::with_capacity(info.roles.len());
    for r in &info.roles {
        role.push(
            r.parse()
                .map_err(|e: String| Status::invalid_argument(e))?,
        );
    }
    Ok(Node {
        id: 0,
        uuid: info.uuid,
        name: info.name,
        grpc_addr: info.grpc_addr,
        role,
        attributes: info.attributes.into_iter().collect(),
        state: NodeState::Joining,
        last_seen_micros: 0,
        cpu_num: info.cpu_num,
        stats: NodeStats::default(),
    })
}

#[tonic::async_trait]
impl MasterService for MasterServiceImpl {
    async fn register_node(
        &self,
        req: Request<RegisterNodeRequest>,
    ) -> Result<Response<RegisterNodeResponse>, Status> {
        let started = std::time::Instant::now();
        let info = req
            .into_inner()
            .node
            .ok_or_else(|| Status::invalid_argument("node info is required"))?;
        let node = node_from_info(info)?;
        let result = self.master.register_node(node).await;
        observe("/master/register_node", result.is_ok(), started);
        let (version, node_id) = result.map_err(Status::from)?;
        Ok(Response::new(RegisterNodeResponse { version, node_id }))
    }

    async fn unregister_node(
        &self,
        req: Request<UnregisterNodeRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let started = std::time::Instant::now();
        let result = self.master.unregister_node(&req.into_inner().uuid).await;
        observe("/master/unregister_node", result.is_ok(), started);
        Ok(Response::new(VersionResponse {
            version: result.map_err(Status::from)?,
        }))
    }

    async fn heartbeat(
        &self,
        req: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        let req = req.into_inner();
        let stats = req.stats.unwrap_or_default();
        let result = self
            .master
            .heartbeat(
                &req.uuid,
                NodeStats {
                    shard_count: stats.shard_count,
                    doc_count: stats.doc_count,
                    disk_usage_percent: stats.disk_usage_percent,
                    cpu_usage_percent: stats.cpu_usage_percent,
                },
            )
            .await;
        Ok(Response::new(HeartbeatResponse {
            version: result.map_err(Status::from)?,
        }))
    }

    async fn get_cluster_state(
        &self,
        req: Request<GetClusterStateRequest>,
    ) -> Result<Response<GetClusterStateResponse>, Status> {
        let state = self
            .master
            .get_state(req.into_inner().allow_stale)
            .map_err(Status::from)?;
        Ok(Response::new(GetClusterStateResponse {
            version: state.version,
            state: state.to_canonical_bytes(),
        }))
    }

    type WatchClusterStateStream = ReceiverStream<Result<ClusterEventMessage, Status>>;

    async fn watch_cluster_state(
        &self,
        req: Request<WatchClusterStateRequest>,
    ) -> Result<Response<Self::WatchClusterStateStream>, Status> {
        let since = req.into_inner().since_version;
        let state = self.master.state();
        let (watch_id, mut events) = state.watch.subscribe(since);
        let (sender, receiver) = tokio::sync::mpsc::channel(128);
        tokio::task::spawn(async move {
            while let Some(event) = events.recv().await {
                let msg = match json::to_vec(&event) {
                    Ok(bytes) => ClusterEventMessage {
                        version: event.version(),
                        event: bytes,
                    },
                    Err(e) => {
                        log::error!("[MASTER] unencodable watch event: {e}");
                        continue;
                    }
                };
                if sender.send(Ok(msg)).await.is_err() {
                    // client went away
                    break;
                }
            }
            state.watch.unsubscribe(watch_id);
        });
        Ok(Response::new(ReceiverStream::new(receiver)))
    }

    async fn create_index(
        &self,
        req: Request<CreateIndexRequest>,
    ) -> Result<Response<CreateIndexResponse>, Status> {
        let started = std::time::Instant::now();
        let req = req.into_inner();
        let settings = if req.settings.is_empty() {
            Default::default()
        } else {
            json::from_slice(&req.settings)
                .map_err(|e| Status::invalid_argument(format!("bad settings: {e}")))?
        };
        let mappings = if req.mappings.is_empty() {
            Default::default()
        } else {
            json::from_slice(&req.mappings)
                .map_err(|e| Status::invalid_argument(format!("bad mappings: {e}")))?
        };
        let result = self
            .master
            .create_index(&req.name, settings, mappings, &req.request_id)
            .await;
        observe("/master/create_index", result.is_ok(), started);
        let meta = result.map_err(Status::from)?;
        let version = self.master.state().version();
        Ok(Response::new(CreateIndexResponse {
            version,
            meta: json::to_vec(&meta).map_err(Error::from).map_err(Status::from)?,
        }))
    }

    async fn delete_index(
        &self,
        req: Request<DeleteIndexRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let started = std::time::Instant::now();
        let req = req.into_inner();
        let result = self.master.delete_index(&req.name, &req.request_id).await;
        observe("/master/delete_index", result.is_ok(), started);
        Ok(Response::new(VersionResponse {
            version: result.map_err(Status::from)?,
        }))
    }

    async fn get_index_metadata(
        &self,
        req: Request<GetIndexMetadataRequest>,
    ) -> Result<Response<GetIndexMetadataResponse>, Status> {
        let meta = self
            .master
            .get_index(&req.into_inner().name)
            .map_err(Status::from)?;
        Ok(Response::new(GetIndexMetadataResponse {
            version: self.master.state().version(),
            meta: json::to_vec(&meta).map_err(Error::from).map_err(Status::from)?,
        }))
    }

    async fn get_shard_routing(
        &self,
        req: Request<GetShardRoutingRequest>,
    ) -> Result<Response<GetShardRoutingResponse>, Status> {
        let (version, routing) = self
            .master
            .get_routing(&req.into_inner().index)
            .map_err(Status::from)?;
        Ok(Response::new(GetShardRoutingResponse {
            version,
            routing: json::to_vec(&routing)
                .map_err(Error::from)
                .map_err(Status::from)?,
        }))
    }

    async fn allocate_shard(
        &self,
        req: Request<AllocateShardRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let req = req.into_inner();
        let version = self
            .master
            .allocate_shard(
                &req.index,
                req.shard_id,
                &req.node_uuid,
                req.is_primary,
                &req.request_id,
            )
            .await
            .map_err(Status::from)?;
        Ok(Response::new(VersionResponse { version }))
    }

    async fn request_vote(
        &self,
        req: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        Ok(Response::new(
            self.master.raft().handle_request_vote(req.into_inner()),
        ))
    }

    async fn append_entries(
        &self,
        req: Request<AppendEntriesRequest>,
    ) -> Result<Response<AppendEntriesResponse>, Status> {
        Ok(Response::new(
            self.master.raft().handle_append_entries(req.into_inner()),
        ))
    }

    async fn install_snapshot(
        &self,
        req: Request<InstallSnapshotRequest>,
    ) -> Result<Response<InstallSnapshotResponse>, Status> {
        Ok(Response::new(
            self.master.raft().handle_install_snapshot(req.into_inner()),
        ))
    }
}
