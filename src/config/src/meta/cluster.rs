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

use std::{collections::BTreeMap, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::meta::index::{IndexMeta, IndexState};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: i32,
    pub uuid: String,
    pub name: String,
    pub grpc_addr: String,
    pub role: Vec<Role>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub state: NodeState,
    #[serde(default)]
    pub last_seen_micros: i64,
    #[serde(default)]
    pub cpu_num: u64,
    #[serde(default)]
    pub stats: NodeStats,
}

impl Node {
    fn new() -> Self {
        Node {
            id: 0,
            uuid: "".to_string(),
            name: "".to_string(),
            grpc_addr: "".to_string(),
            role: vec![],
            attributes: BTreeMap::new(),
            state: NodeState::Joining,
            last_seen_micros: 0,
            cpu_num: 0,
            stats: NodeStats::default(),
        }
    }
}

impl Default for Node {
    fn default() -> Self {
        Node::new()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub shard_count: u32,
    pub doc_count: u64,
    pub disk_usage_percent: f32,
    pub cpu_usage_percent: f32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeState {
    Joining,
    Active,
    Leaving,
    Down,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    All,
    Master,
    Coordinator,
    Data,
}

impl FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.to_lowercase();
        match s.as_str() {
            "all" => Ok(Role::All),
            "master" => Ok(Role::Master),
            "coordinator" | "coord" => Ok(Role::Coordinator),
            "data" => Ok(Role::Data),
            _ => Err(format!("Invalid cluster role: {s}")),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::All => write!(f, "all"),
            Role::Master => write!(f, "master"),
            Role::Coordinator => write!(f, "coordinator"),
            Role::Data => write!(f, "data"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ShardState {
    Initializing,
    Started,
    Relocating,
    Unassigned,
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardState::Initializing => write!(f, "INITIALIZING"),
            ShardState::Started => write!(f, "STARTED"),
            ShardState::Relocating => write!(f, "RELOCATING"),
            ShardState::Unassigned => write!(f, "UNASSIGNED"),
        }
    }
}

/// One copy of a shard. `node_uuid` is a lookup key into `ClusterState::nodes`,
/// never an owning reference; `None` while unassigned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShardAllocation {
    pub node_uuid: Option<String>,
    pub is_primary: bool,
    pub state: ShardState,
}

pub type IndexRouting = BTreeMap<u32, Vec<ShardAllocation>>;

/// The replicated cluster state. Mutated only through [`ClusterState::apply`]
/// on the master leader; everyone else sees version-stamped immutable
/// snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    pub nodes: BTreeMap<String, Node>,
    pub indices: BTreeMap<String, IndexMeta>,
    pub routing: BTreeMap<String, IndexRouting>,
}

/// A command proposed to the replicated log. Application must be
/// deterministic: all timestamps are set by the proposer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClusterCommand {
    RegisterNode { node: Node },
    UnregisterNode { uuid: String },
    Heartbeat { uuid: String, stats: NodeStats, at_micros: i64 },
    MarkNodeDown { uuid: String },
    CreateIndex { meta: IndexMeta },
    DeleteIndex { name: String },
    PurgeIndex { name: String },
    AllocateShard { index: String, shard_id: u32, node_uuid: String, is_primary: bool },
    UpdateShardState { index: String, shard_id: u32, node_uuid: String, state: ShardState },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClusterEvent {
    NodeJoined { version: u64, node: Node },
    NodeLeft { version: u64, uuid: String },
    IndexCreated { version: u64, index: String },
    IndexDeleted { version: u64, index: String },
    ShardAllocated { version: u64, index: String, shard_id: u32, node_uuid: String, is_primary: bool },
    ShardStateChanged {
        version: u64,
        index: String,
        shard_id: u32,
        node_uuid: Option<String>,
        state: ShardState,
    },
}

impl ClusterEvent {
    pub fn version(&self) -> u64 {
        match self {
            ClusterEvent::NodeJoined { version, .. } => *version,
            ClusterEvent::NodeLeft { version, .. } => *version,
            ClusterEvent::IndexCreated { version, .. } => *version,
            ClusterEvent::IndexDeleted { version, .. } => *version,
            ClusterEvent::ShardAllocated { version, .. } => *version,
            ClusterEvent::ShardStateChanged { version, .. } => *version,
        }
    }

    pub fn index_name(&self) -> Option<&str> {
        match self {
            ClusterEvent::IndexCreated { index, .. } => Some(index),
            ClusterEvent::IndexDeleted { index, .. } => Some(index),
            ClusterEvent::ShardAllocated { index, .. } => Some(index),
            ClusterEvent::ShardStateChanged { index, .. } => Some(index),
            _ => None,
        }
    }
}

/// Deterministic application failures. These are command rejections, not
/// machine faults: a rejected command does not bump the version.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ApplyError {
    #[error("index already exists: {0}")]
    IndexExists(String),
    #[error("index not found: {0}")]
    IndexNotFound(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("node is not active: {0}")]
    NodeDown(String),
    #[error("shard {1} out of range for index {0}")]
    ShardOutOfRange(String, u32),
    #[error("shard {1} of index {0} already has a primary")]
    PrimaryExists(String, u32),
    #[error("shard {1} of index {0} already allocated on node {2}")]
    AlreadyAllocated(String, u32, String),
    #[error("allocation not found for shard {1} of index {0} on node {2}")]
    AllocationNotFound(String, u32, String),
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

impl ClusterState {
    /// Apply one committed command, bumping `version` by exactly one and
    /// returning the watch events it produced (possibly none).
    pub fn apply(&mut self, cmd: &ClusterCommand) -> Result<Vec<ClusterEvent>, ApplyError> {
        let next = self.version + 1;
        let events = self.apply_at(cmd, next)?;
        self.version = next;
        Ok(events)
    }

    fn apply_at(
        &mut self,
        cmd: &ClusterCommand,
        version: u64,
    ) -> Result<Vec<ClusterEvent>, ApplyError> {
        match cmd {
            ClusterCommand::RegisterNode { node } => {
                let mut node = node.clone();
                node.state = NodeState::Active;
                if node.id == 0 {
                    // deterministic: next id after the largest in use
                    node.id = self.nodes.values().map(|n| n.id).max().unwrap_or(0) + 1;
                }
                let joined = ClusterEvent::NodeJoined {
                    version,
                    node: node.clone(),
                };
                self.nodes.insert(node.uuid.clone(), node);
                Ok(vec![joined])
            }
            ClusterCommand::UnregisterNode { uuid } => {
                if self.nodes.remove(uuid).is_none() {
                    return Err(ApplyError::NodeNotFound(uuid.clone()));
                }
                let mut events = vec![ClusterEvent::NodeLeft {
                    version,
                    uuid: uuid.clone(),
                }];
                events.extend(self.unassign_node_shards(uuid, version));
                Ok(events)
            }
            ClusterCommand::Heartbeat { uuid, stats, at_micros } => {
                let node = self
                    .nodes
                    .get_mut(uuid)
                    .ok_or_else(|| ApplyError::NodeNotFound(uuid.clone()))?;
                node.last_seen_micros = *at_micros;
                node.stats = *stats;
                if node.state == NodeState::Down {
                    node.state = NodeState::Active;
                }
                Ok(vec![])
            }
            ClusterCommand::MarkNodeDown { uuid } => {
                let node = self
                    .nodes
                    .get_mut(uuid)
                    .ok_or_else(|| ApplyError::NodeNotFound(uuid.clone()))?;
                node.state = NodeState::Down;
                let mut events = vec![ClusterEvent::NodeLeft {
                    version,
                    uuid: uuid.clone(),
                }];
                events.extend(self.unassign_node_shards(uuid, version));
                Ok(events)
            }
            ClusterCommand::CreateIndex { meta } => {
                if self.indices.contains_key(&meta.name) {
                    return Err(ApplyError::IndexExists(meta.name.clone()));
                }
                meta.validate().map_err(ApplyError::InvalidSettings)?;
                let mut routing: IndexRouting = BTreeMap::new();
                for shard_id in 0..meta.settings.shards {
                    routing.insert(shard_id, Vec::new());
                }
                self.routing.insert(meta.name.clone(), routing);
                self.indices.insert(meta.name.clone(), meta.clone());
                Ok(vec![ClusterEvent::IndexCreated {
                    version,
                    index: meta.name.clone(),
                }])
            }
            ClusterCommand::DeleteIndex { name } => {
                let meta = self
                    .indices
                    .get_mut(name)
                    .ok_or_else(|| ApplyError::IndexNotFound(name.clone()))?;
                meta.state = IndexState::Deleting;
                Ok(vec![ClusterEvent::IndexDeleted {
                    version,
                    index: name.clone(),
                }])
            }
            ClusterCommand::PurgeIndex { name } => {
                if self.indices.remove(name).is_none() {
                    return Err(ApplyError::IndexNotFound(name.clone()));
                }
                self.routing.remove(name);
                Ok(vec![])
            }
            ClusterCommand::AllocateShard { index, shard_id, node_uuid, is_primary } => {
                let node = self
                    .nodes
                    .get(node_uuid)
                    .ok_or_else(|| ApplyError::NodeNotFound(node_uuid.clone()))?;
                if node.state != NodeState::Active {
                    return Err(ApplyError::NodeDown(node_uuid.clone()));
                }
                if !self.indices.contains_key(index) {
                    return Err(ApplyError::IndexNotFound(index.clone()));
                }
                let routing = self
                    .routing
                    .get_mut(index)
                    .ok_or_else(|| ApplyError::IndexNotFound(index.clone()))?;
                let allocations = routing
                    .get_mut(shard_id)
                    .ok_or_else(|| ApplyError::ShardOutOfRange(index.clone(), *shard_id))?;
                if *is_primary
                    && allocations
                        .iter()
                        .any(|a| a.is_primary && a.state != ShardState::Unassigned)
                {
                    return Err(ApplyError::PrimaryExists(index.clone(), *shard_id));
                }
                if allocations
                    .iter()
                    .any(|a| a.node_uuid.as_deref() == Some(node_uuid))
                {
                    return Err(ApplyError::AlreadyAllocated(
                        index.clone(),
                        *shard_id,
                        node_uuid.clone(),
                    ));
                }
                let alloc = ShardAllocation {
                    node_uuid: Some(node_uuid.clone()),
                    is_primary: *is_primary,
                    state: ShardState::Initializing,
                };
                // a dead copy left behind by a node failure is replaced in place
                match allocations
                    .iter_mut()
                    .find(|a| a.state == ShardState::Unassigned && a.is_primary == *is_primary)
                {
                    Some(slot) => *slot = alloc,
                    None => allocations.push(alloc),
                }
                Ok(vec![ClusterEvent::ShardAllocated {
                    version,
                    index: index.clone(),
                    shard_id: *shard_id,
                    node_uuid: node_uuid.clone(),
                    is_primary: *is_primary,
                }])
            }
            ClusterCommand::UpdateShardState { index, shard_id, node_uuid, state } => {
                let routing = self
                    .routing
                    .get_mut(index)
                    .ok_or_else(|| ApplyError::IndexNotFound(index.clone()))?;
                let allocations = routing
                    .get_mut(shard_id)
                    .ok_or_else(|| ApplyError::ShardOutOfRange(index.clone(), *shard_id))?;
                let alloc = allocations
                    .iter_mut()
                    .find(|a| a.node_uuid.as_deref() == Some(node_uuid))
                    .ok_or_else(|| {
                        ApplyError::AllocationNotFound(
                            index.clone(),
                            *shard_id,
                            node_uuid.clone(),
                        )
                    })?;
                alloc.state = *state;
                if *state == ShardState::Unassigned {
                    alloc.node_uuid = None;
                }
                let events = vec![ClusterEvent::ShardStateChanged {
                    version,
                    index: index.clone(),
                    shard_id: *shard_id,
                    node_uuid: (*state != ShardState::Unassigned).then(|| node_uuid.clone()),
                    state: *state,
                }];
                self.maybe_activate_index(index);
                Ok(events)
            }
        }
    }

    /// An index leaves CREATING once every shard has a STARTED primary.
    fn maybe_activate_index(&mut self, index: &str) {
        let Some(meta) = self.indices.get(index) else {
            return;
        };
        if meta.state != IndexState::Creating {
            return;
        }
        let Some(routing) = self.routing.get(index) else {
            return;
        };
        let all_started = routing.values().all(|allocs| {
            allocs
                .iter()
                .any(|a| a.is_primary && a.state == ShardState::Started)
        });
        if all_started {
            if let Some(meta) = self.indices.get_mut(index) {
                meta.state = IndexState::Active;
            }
        }
    }

    fn unassign_node_shards(&mut self, uuid: &str, version: u64) -> Vec<ClusterEvent> {
        let mut events = Vec::new();
        for (index, routing) in self.routing.iter_mut() {
            for (shard_id, allocations) in routing.iter_mut() {
                for alloc in allocations.iter_mut() {
                    if alloc.node_uuid.as_deref() == Some(uuid) {
                        alloc.node_uuid = None;
                        alloc.state = ShardState::Unassigned;
                        events.push(ClusterEvent::ShardStateChanged {
                            version,
                            index: index.clone(),
                            shard_id: *shard_id,
                            node_uuid: None,
                            state: ShardState::Unassigned,
                        });
                    }
                }
            }
        }
        events
    }

    pub fn get_node(&self, uuid: &str) -> Option<&Node> {
        self.nodes.get(uuid)
    }

    pub fn active_data_nodes(&self) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|n| {
                n.state == NodeState::Active
                    && (n.role.contains(&Role::Data) || n.role.contains(&Role::All))
            })
            .collect()
    }

    /// The STARTED allocations of one index, preferring the primary copy.
    /// Returns `(shard_id, allocation)` for every shard that has at least one
    /// STARTED copy; shards with none are absent from the result.
    pub fn started_allocations(&self, index: &str) -> Option<Vec<(u32, &ShardAllocation)>> {
        let routing = self.routing.get(index)?;
        let mut out = Vec::with_capacity(routing.len());
        for (shard_id, allocations) in routing {
            let started = allocations
                .iter()
                .filter(|a| a.state == ShardState::Started)
                .max_by_key(|a| a.is_primary);
            if let Some(alloc) = started {
                out.push((*shard_id, alloc));
            }
        }
        Some(out)
    }

    /// Canonical dump used for snapshots: key order is stable (BTreeMap), so
    /// two machines with equal state produce identical bytes.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("cluster state is always serializable")
    }

    pub fn from_canonical_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
