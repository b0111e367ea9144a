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

use once_cell::sync::Lazy;

use crate::{get_config, ider, meta::cluster::Role};

pub static LOCAL_NODE_UUID: Lazy<String> = Lazy::new(load_local_node_uuid);
pub static LOCAL_NODE_ROLE: Lazy<Vec<Role>> = Lazy::new(load_local_node_role);

#[inline(always)]
pub fn load_local_node_uuid() -> String {
    ider::uuid()
}

#[inline(always)]
pub fn get_local_grpc_ip() -> String {
    let cfg = get_config();
    if !cfg.grpc.addr.is_empty() {
        cfg.grpc.addr.clone()
    } else {
        get_local_node_ip()
    }
}

#[inline(always)]
pub fn get_local_node_ip() -> String {
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}

#[inline(always)]
pub fn get_local_grpc_addr() -> String {
    format!("http://{}:{}", get_local_grpc_ip(), get_config().grpc.port)
}

#[inline(always)]
pub fn load_local_node_role() -> Vec<Role> {
    get_config()
        .common
        .node_role
        .split(',')
        .map(|s| s.trim().parse().expect("invalid node role"))
        .collect()
}

#[inline(always)]
pub fn is_master(role: &[Role]) -> bool {
    role.contains(&Role::Master) || role.contains(&Role::All)
}

#[inline(always)]
pub fn is_coordinator(role: &[Role]) -> bool {
    role.contains(&Role::Coordinator) || role.contains(&Role::All)
}

#[inline(always)]
pub fn is_data(role: &[Role]) -> bool {
    role.contains(&Role::Data) || role.contains(&Role::All)
}

#[inline(always)]
pub fn is_single_node(role: &[Role]) -> bool {
    role.contains(&Role::All)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_role() {
        let parse = |s: &str| s.parse::<Role>().unwrap();

        assert_eq!(parse("all"), Role::All);
        assert_eq!(parse("master"), Role::Master);
        assert_eq!(parse("coordinator"), Role::Coordinator);
        assert_eq!(parse("coord"), Role::Coordinator);
        assert_eq!(parse("data"), Role::Data);
        assert!("ingester".parse::<Role>().is_err());
    }

    #[test]
    fn test_is_master() {
        assert!(is_master(&[Role::Master]));
        assert!(is_master(&[Role::All]));
        assert!(!is_master(&[Role::Data]));
    }

    #[test]
    fn test_is_data() {
        assert!(is_data(&[Role::Data]));
        assert!(is_data(&[Role::All]));
        assert!(!is_data(&[Role::Coordinator]));
    }

    #[test]
    fn test_load_local_node_uuid() {
        assert!(!load_local_node_uuid().is_empty());
    }
}
