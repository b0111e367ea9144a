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

pub mod request;

use config::{cluster, get_config};
use infra::errors::{Error, Result};
use proto::cluster_rpc::{
    data_service_server::DataServiceServer, master_service_server::MasterServiceServer,
};

use crate::service::master::get_master_node;

/// Serve the role-appropriate gRPC services until shutdown.
pub async fn run_server(shutdown: tokio_util::sync::CancellationToken) -> Result<()> {
    let cfg = get_config();
    let addr: std::net::SocketAddr = format!("0.0.0.0:{}", cfg.grpc.port)
        .parse()
        .map_err(|e| Error::Internal(format!("bad grpc bind address: {e}")))?;
    let mut builder = tonic::transport::Server::builder();
    let mut router = builder.add_optional_service(
        cluster::is_master(&cluster::LOCAL_NODE_ROLE)
            .then(|| MasterServiceServer::new(request::master::MasterServiceImpl::new(
                get_master_node().expect("master node initialized before grpc server"),
            ))),
    );
    router = router.add_optional_service(
        cluster::is_data(&cluster::LOCAL_NODE_ROLE)
            .then(|| DataServiceServer::new(request::data::DataServiceImpl::default())),
    );
    log::info!("[GRPC] listening on {addr}");
    router
        .serve_with_shutdown(addr, async move {
            shutdown.cancelled().await;
            log::info!("[GRPC] shutting down");
        })
        .await
        .map_err(Error::from)?;
    Ok(())
}
