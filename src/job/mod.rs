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

//! Role-driven startup: wires the master, data and coordinator services and
//! spawns their background loops.

use std::{sync::Arc, time::Duration};

use config::{
    cluster::{get_local_grpc_addr, LOCAL_NODE_ROLE},
    get_config,
};
use infra::errors::Result;

use crate::service::{
    clients::{
        data::{DataClient, GrpcDataClient, LocalDataClient},
        master::{GrpcMasterClient, GrpcRaftTransport, LocalMasterClient, MasterClient},
    },
    cluster,
    master::{
        allocator::Allocator,
        log::{RaftNode, RaftTransport},
        state::MasterState,
        MasterNode,
    },
    search::{self, cache::PLAN_CACHE},
    shard::SHARD_MANAGER,
};

pub async fn init() -> Result<()> {
    let cfg = get_config();
    config::metrics::init();

    let is_master = config::cluster::is_master(&LOCAL_NODE_ROLE);
    let is_data = config::cluster::is_data(&LOCAL_NODE_ROLE);
    let is_coordinator = config::cluster::is_coordinator(&LOCAL_NODE_ROLE);
    let local_mode = cfg.common.local_mode;

    // data-plane client: in-process when everything runs in this process
    let data_client: Arc<dyn DataClient> = if local_mode {
        Arc::new(LocalDataClient::default())
    } else {
        Arc::new(GrpcDataClient::default())
    };

    if is_master {
        let self_addr = get_local_grpc_addr();
        let peers: Vec<String> = if local_mode {
            Vec::new()
        } else {
            cfg.common
                .master_addrs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|addr| !addr.is_empty() && addr != &self_addr)
                .collect()
        };
        let transport: Arc<dyn RaftTransport> = Arc::new(GrpcRaftTransport::default());
        let raft = RaftNode::new(&self_addr, peers, Arc::new(MasterState::new()), transport);
        raft.start();
        let master = MasterNode::new(raft);
        crate::service::master::set_master_node(master.clone()).await;
        tokio::task::spawn(Allocator::new(master, data_client.clone()).run());
    }

    // control-plane client: in-process in local mode, otherwise the
    // leader-following grpc client even on masters
    let master_client: Arc<dyn MasterClient> = if local_mode && is_master {
        Arc::new(LocalMasterClient {
            master: crate::service::master::get_master_node()?,
        })
    } else {
        Arc::new(GrpcMasterClient::from_config())
    };
    cluster::set_master_client(master_client).await;
    cluster::register_and_keepalive().await?;

    if is_data {
        tokio::task::spawn(async {
            let interval =
                Duration::from_millis(get_config().shard.default_refresh_interval_ms.max(100));
            loop {
                tokio::time::sleep(interval).await;
                SHARD_MANAGER.refresh_dirty().await;
            }
        });
    }

    if is_coordinator {
        search::init(data_client).await;
        tokio::task::spawn(async {
            let interval = Duration::from_secs(get_config().cache.sweep_interval.max(1));
            loop {
                tokio::time::sleep(interval).await;
                PLAN_CACHE.sweep();
            }
        });
    }

    log::info!(
        "[JOB] initialized roles master={is_master} data={is_data} coordinator={is_coordinator} local_mode={local_mode}"
    );
    Ok(())
}
