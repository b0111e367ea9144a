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

//! Clients for data-node RPCs. The gRPC client is the production path; the
//! local client routes straight into this process's shard manager, which is
//! what local mode and the in-process tests use.

use async_trait::async_trait;
use config::{
    get_config,
    meta::{
        cluster::Node,
        index::{IndexSettings, Mappings},
        search::ShardSearchResponse,
    },
    utils::json,
};
use infra::errors::{Error, Result};
use proto::cluster_rpc::{
    data_service_client::DataServiceClient, CreateShardRequest, DeleteShardRequest,
    SearchShardRequest,
};
use tokio_util::sync::CancellationToken;

use crate::service::shard::SHARD_MANAGER;

#[async_trait]
pub trait DataClient: Send + Sync {
    async fn create_shard(
        &self,
        node: &Node,
        index: &str,
        shard_id: u32,
        is_primary: bool,
        settings: &IndexSettings,
        mappings: &Mappings,
    ) -> Result<()>;

    async fn delete_shard(&self, node: &Node, index: &str, shard_id: u32) -> Result<()>;

    async fn search(
        &self,
        node: &Node,
        req: SearchShardRequest,
        cancel: CancellationToken,
    ) -> Result<ShardSearchResponse>;
}

// ------------------------------ gRPC client -------------------------------

#[derive(Default)]
pub struct GrpcDataClient {}

impl GrpcDataClient {
    async fn client(&self, node: &Node) -> Result<DataServiceClient<tonic::transport::Channel>> {
        let cfg = get_config();
        let channel = super::get_channel(&node.grpc_addr).await?;
        Ok(DataServiceClient::new(channel)
            .max_decoding_message_size(cfg.grpc.max_message_size * 1024 * 1024)
            .max_encoding_message_size(cfg.grpc.max_message_size * 1024 * 1024))
    }
}

#[async_trait]
impl DataClient for GrpcDataClient {
    async fn create_shard(
        &self,
        node: &Node,
        index: &str,
        shard_id: u32,
        is_primary: bool,
        settings: &IndexSettings,
        mappings: &Mappings,
    ) -> Result<()> {
        let mut client = self.client(node).await?;
        client
            .create_shard(CreateShardRequest {
                index: index.to_string(),
                shard_id,
                is_primary,
                settings: json::to_vec(settings)?,
                mappings: json::to_vec(mappings)?,
            })
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn delete_shard(&self, node: &Node, index: &str, shard_id: u32) -> Result<()> {
        let mut client = self.client(node).await?;
        client
            .delete_shard(DeleteShardRequest {
                index: index.to_string(),
                shard_id,
            })
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    async fn search(
        &self,
        node: &Node,
        req: SearchShardRequest,
        cancel: CancellationToken,
    ) -> Result<ShardSearchResponse> {
        let mut client = self.client(node).await?;
        // dropping the rpc future on cancellation resets the stream
        let resp = tokio::select! {
            resp = client.search(req) => resp.map_err(Error::from)?,
            _ = cancel.cancelled() => {
                return Err(Error::Unavailable("search cancelled".to_string()));
            }
        };
        let resp = resp.into_inner();
        Ok(json::from_slice(&resp.response)?)
    }
}

// ------------------------------ local client ------------------------------

#[derive(Default)]
pub struct LocalDataClient {}

#[async_trait]
impl DataClient for LocalDataClient {
    async fn create_shard(
        &self,
        _node: &Node,
        index: &str,
        shard_id: u32,
        is_primary: bool,
        settings: &IndexSettings,
        mappings: &Mappings,
    ) -> Result<()> {
        SHARD_MANAGER.create_shard(index, shard_id, is_primary, settings.clone(), mappings.clone())
    }

    async fn delete_shard(&self, _node: &Node, index: &str, shard_id: u32) -> Result<()> {
        SHARD_MANAGER.delete_shard(index, shard_id)
    }

    async fn search(
        &self,
        _node: &Node,
        req: SearchShardRequest,
        cancel: CancellationToken,
    ) -> Result<ShardSearchResponse> {
        let plan = json::from_slice(&req.plan)?;
        let shard = SHARD_MANAGER.get_shard(&req.index, req.shard_id)?;
        crate::service::shard::search::execute(&shard, &plan, cancel).await
    }
}
