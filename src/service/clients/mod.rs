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

pub mod data;
pub mod master;

use std::time::Duration;

use config::get_config;
use config::RwHashMap;
use infra::errors::{Error, Result};
use once_cell::sync::Lazy;
use tonic::transport::{Channel, Endpoint};

/// One channel per peer, shared by every client in the process. Channels
/// multiplex internally; keep-alive probes detect dead peers.
static CHANNELS: Lazy<RwHashMap<String, Channel>> = Lazy::new(Default::default);

pub async fn get_channel(addr: &str) -> Result<Channel> {
    if let Some(channel) = CHANNELS.get(addr) {
        return Ok(channel.clone());
    }
    let cfg = get_config();
    let endpoint = Endpoint::from_shared(addr.to_string())
        .map_err(|e| Error::InvalidArgument(format!("bad peer address {addr}: {e}")))?
        .connect_timeout(Duration::from_secs(cfg.grpc.connect_timeout))
        .http2_keep_alive_interval(Duration::from_secs(cfg.cluster.heartbeat_interval))
        .keep_alive_while_idle(true);
    let channel = endpoint
        .connect()
        .await
        .map_err(|e| Error::Unavailable(format!("connect to {addr}: {e}")))?;
    CHANNELS.insert(addr.to_string(), channel.clone());
    Ok(channel)
}

pub fn drop_channel(addr: &str) {
    CHANNELS.remove(addr);
}
