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

use config::cluster::LOCAL_NODE_ROLE;
use quiver::{handler, job, service};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cfg = config::get_config();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&cfg.common.log_level));
    log::info!("starting quiver node {}", *config::cluster::LOCAL_NODE_UUID);

    config::init()?;
    job::init().await?;

    let shutdown = CancellationToken::new();
    let serves_rpc = config::cluster::is_master(&LOCAL_NODE_ROLE)
        || config::cluster::is_data(&LOCAL_NODE_ROLE);
    let server = if serves_rpc {
        let shutdown = shutdown.clone();
        Some(tokio::task::spawn(async move {
            if let Err(e) = handler::grpc::run_server(shutdown).await {
                log::error!("[GRPC] server exited with error: {e}");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown signal received");
    shutdown.cancel();
    if let Err(e) = service::cluster::leave().await {
        log::warn!("[CLUSTER] leave failed: {e}");
    }
    if let Some(server) = server {
        _ = server.await;
    }
    log::info!("quiver node stopped");
    Ok(())
}
