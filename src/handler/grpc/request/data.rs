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

//! Data-node gRPC surface: shard lifecycle and per-shard document and search
//! operations, delegating to the shard manager.

use config::utils::json;
use infra::errors::Error;
use proto::cluster_rpc::{
    data_service_server::DataService, BulkIndexRequest, BulkIndexResponse, CountRequest,
    CountResponse, CreateShardRequest, DeleteDocumentRequest, DeleteShardRequest,
    GetDocumentRequest, GetDocumentResponse, GetNodeStatsRequest, GetNodeStatsResponse,
    GetShardInfoResponse, GetShardStatsResponse, IndexDocumentRequest, NodeStats, SearchShardRequest,
    SearchShardResponse, ShardRef, VersionResponse,
};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use super::observe;
use crate::service::{
    cluster,
    search::plan::{Cost, PhysicalPlan},
    shard::{search as shard_search, SHARD_MANAGER},
};

#[derive(Default)]
pub struct DataServiceImpl {}

fn cluster_version() -> u64 {
    cluster::snapshot().version
}

#[tonic::async_trait]
impl DataService for DataServiceImpl {
    async fn create_shard(
        &self,
        req: Request<CreateShardRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
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
        let result =
            SHARD_MANAGER.create_shard(&req.index, req.shard_id, req.is_primary, settings, mappings);
        observe("/data/create_shard", result.is_ok(), started);
        result.map_err(Status::from)?;
        Ok(Response::new(VersionResponse {
            version: cluster_version(),
        }))
    }

    async fn delete_shard(
        &self,
        req: Request<DeleteShardRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let req = req.into_inner();
        // deleting an already-absent shard acks cleanly; the master retries
        match SHARD_MANAGER.delete_shard(&req.index, req.shard_id) {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Response::new(VersionResponse {
            version: cluster_version(),
        }))
    }

    async fn get_shard_info(
        &self,
        req: Request<ShardRef>,
    ) -> Result<Response<GetShardInfoResponse>, Status> {
        let req = req.into_inner();
        let shard = SHARD_MANAGER
            .get_shard(&req.index, req.shard_id)
            .map_err(Status::from)?;
        Ok(Response::new(GetShardInfoResponse {
            version: cluster_version(),
            state: shard.state().to_string(),
            doc_count: shard.doc_count(),
            byte_size: shard.byte_size(),
            last_commit_micros: shard.last_commit_micros(),
        }))
    }

    async fn refresh_shard(
        &self,
        req: Request<ShardRef>,
    ) -> Result<Response<VersionResponse>, Status> {
        let req = req.into_inner();
        let shard = SHARD_MANAGER
            .get_shard(&req.index, req.shard_id)
            .map_err(Status::from)?;
        shard.refresh().await.map_err(Status::from)?;
        Ok(Response::new(VersionResponse {
            version: cluster_version(),
        }))
    }

    async fn flush_shard(
        &self,
        req: Request<ShardRef>,
    ) -> Result<Response<VersionResponse>, Status> {
        let req = req.into_inner();
        let shard = SHARD_MANAGER
            .get_shard(&req.index, req.shard_id)
            .map_err(Status::from)?;
        shard.flush().await.map_err(Status::from)?;
        Ok(Response::new(VersionResponse {
            version: cluster_version(),
        }))
    }

    async fn index_document(
        &self,
        req: Request<IndexDocumentRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let started = std::time::Instant::now();
        let req = req.into_inner();
        let shard = SHARD_MANAGER
            .get_shard(&req.index, req.shard_id)
            .map_err(Status::from)?;
        let body: json::Value = json::from_slice(&req.document)
            .map_err(|e| Status::invalid_argument(format!("bad document body: {e}")))?;
        let result = shard.index_document(&req.doc_id, body).await;
        let ok = result.is_ok();
        observe("/data/index_document", ok, started);
        result.map_err(Status::from)?;
        if req.refresh {
            shard.commit().await.map_err(Status::from)?;
            shard.refresh().await.map_err(Status::from)?;
        }
        Ok(Response::new(VersionResponse {
            version: cluster_version(),
        }))
    }

    async fn get_document(
        &self,
        req: Request<GetDocumentRequest>,
    ) -> Result<Response<GetDocumentResponse>, Status> {
        let req = req.into_inner();
        let shard = SHARD_MANAGER
            .get_shard(&req.index, req.shard_id)
            .map_err(Status::from)?;
        let doc = shard.get_document(&req.doc_id);
        Ok(Response::new(GetDocumentResponse {
            version: cluster_version(),
            found: doc.is_some(),
            document: match doc {
                Some(doc) => json::to_vec(&doc).map_err(Error::from).map_err(Status::from)?,
                None => Vec::new(),
            },
        }))
    }

    async fn delete_document(
        &self,
        req: Request<DeleteDocumentRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let req = req.into_inner();
        let shard = SHARD_MANAGER
            .get_shard(&req.index, req.shard_id)
            .map_err(Status::from)?;
        shard.delete_document(&req.doc_id).await.map_err(Status::from)?;
        if req.refresh {
            shard.commit().await.map_err(Status::from)?;
            shard.refresh().await.map_err(Status::from)?;
        }
        Ok(Response::new(VersionResponse {
            version: cluster_version(),
        }))
    }

    async fn bulk_index(
        &self,
        req: Request<BulkIndexRequest>,
    ) -> Result<Response<BulkIndexResponse>, Status> {
        let started = std::time::Instant::now();
        let req = req.into_inner();
        let max_docs = config::get_config().shard.max_docs_per_bulk;
        if req.docs.len() > max_docs {
            return Err(Status::invalid_argument(format!(
                "bulk of {} docs exceeds limit {max_docs}",
                req.docs.len()
            )));
        }
        let shard = SHARD_MANAGER
            .get_shard(&req.index, req.shard_id)
            .map_err(Status::from)?;
        let mut indexed = 0u32;
        let mut errors = Vec::new();
        for doc in req.docs {
            let body: json::Value = match json::from_slice(&doc.document) {
                Ok(body) => body,
                Err(e) => {
                    errors.push(format!("{}: bad body: {e}", doc.doc_id));
                    continue;
                }
            };
            match shard.index_document(&doc.doc_id, body).await {
                Ok(()) => indexed += 1,
                Err(e) => errors.push(format!("{}: {e}", doc.doc_id)),
            }
        }
        if req.refresh {
            shard.commit().await.map_err(Status::from)?;
            shard.refresh().await.map_err(Status::from)?;
        }
        observe("/data/bulk_index", errors.is_empty(), started);
        Ok(Response::new(BulkIndexResponse {
            version: cluster_version(),
            indexed,
            errors,
        }))
    }

    async fn search(
        &self,
        req: Request<SearchShardRequest>,
    ) -> Result<Response<SearchShardResponse>, Status> {
        let started = std::time::Instant::now();
        let req = req.into_inner();
        // stale executors working against an older routing snapshot are told
        // to refresh rather than served mismatched data
        let local_version = cluster_version();
        if req.cluster_version > local_version && local_version > 0 {
            return Err(Status::failed_precondition(format!(
                "request cluster version {} ahead of local {}",
                req.cluster_version, local_version
            )));
        }
        let shard = SHARD_MANAGER
            .get_shard(&req.index, req.shard_id)
            .map_err(Status::from)?;
        let plan: PhysicalPlan = json::from_slice(&req.plan)
            .map_err(|e| Status::invalid_argument(format!("bad sub-plan: {e}")))?;
        let result = shard_search::execute(&shard, &plan, CancellationToken::new()).await;
        observe("/data/search", result.is_ok(), started);
        let resp = result.map_err(Status::from)?;
        Ok(Response::new(SearchShardResponse {
            version: local_version,
            response: json::to_vec(&resp).map_err(Error::from).map_err(Status::from)?,
        }))
    }

    async fn count(
        &self,
        req: Request<CountRequest>,
    ) -> Result<Response<CountResponse>, Status> {
        let req = req.into_inner();
        let shard = SHARD_MANAGER
            .get_shard(&req.index, req.shard_id)
            .map_err(Status::from)?;
        let filter = if req.filter.is_empty() {
            None
        } else {
            Some(
                json::from_slice(&req.filter)
                    .map_err(|e| Status::invalid_argument(format!("bad filter: {e}")))?,
            )
        };
        let plan = PhysicalPlan::Limit {
            n: 0,
            offset: 0,
            child: Box::new(PhysicalPlan::ShardScan {
                index: req.index.clone(),
                shards: vec![req.shard_id],
                filter,
                limit_hint: None,
                rows: 0,
                cost: Cost::default(),
            }),
            rows: 0,
            cost: Cost::default(),
        };
        let resp = shard_search::execute(&shard, &plan, CancellationToken::new())
            .await
            .map_err(Status::from)?;
        Ok(Response::new(CountResponse {
            version: cluster_version(),
            count: resp.total,
        }))
    }

    async fn get_shard_stats(
        &self,
        req: Request<ShardRef>,
    ) -> Result<Response<GetShardStatsResponse>, Status> {
        let req = req.into_inner();
        let shard = SHARD_MANAGER
            .get_shard(&req.index, req.shard_id)
            .map_err(Status::from)?;
        Ok(Response::new(GetShardStatsResponse {
            version: cluster_version(),
            doc_count: shard.doc_count(),
            byte_size: shard.byte_size(),
            last_commit_micros: shard.last_commit_micros(),
            search_count: shard.search_count.load(std::sync::atomic::Ordering::Relaxed),
            index_count: shard.index_count.load(std::sync::atomic::Ordering::Relaxed),
        }))
    }

    async fn get_node_stats(
        &self,
        _req: Request<GetNodeStatsRequest>,
    ) -> Result<Response<GetNodeStatsResponse>, Status> {
        let stats = SHARD_MANAGER.node_stats();
        Ok(Response::new(GetNodeStatsResponse {
            version: cluster_version(),
            stats: Some(NodeStats {
                shard_count: stats.shard_count,
                doc_count: stats.doc_count,
                disk_usage_percent: stats.disk_usage_percent,
                cpu_usage_percent: stats.cpu_usage_percent,
            }),
            shard_count: stats.shard_count,
        }))
    }
}
