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

//! The cluster-state machine as applied on every master. Application is
//! deterministic; the published snapshot is an immutable value swapped
//! atomically, so readers never block appliers.

use std::sync::Arc;

use arc_swap::ArcSwap;
use config::{
    meta::cluster::{ApplyError, ClusterCommand, ClusterState},
    metrics,
};
use hashbrown::HashMap;
use infra::errors::{Error, Result};

use super::watch::WatchHub;

pub struct MasterState {
    machine: parking_lot::Mutex<ClusterState>,
    published: ArcSwap<ClusterState>,
    pub watch: WatchHub,
    /// request-id -> committed version, for idempotent client retries.
    dedup: parking_lot::Mutex<HashMap<String, u64>>,
}

impl Default for MasterState {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterState {
    pub fn new() -> Self {
        MasterState {
            machine: parking_lot::Mutex::new(ClusterState::default()),
            published: ArcSwap::from(Arc::new(ClusterState::default())),
            watch: WatchHub::new(),
            dedup: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Apply one committed command. Returns the version it committed at.
    /// A request-id seen before returns the original version without
    /// re-applying.
    pub fn apply(&self, cmd: &ClusterCommand, request_id: Option<&str>) -> Result<u64> {
        self.apply_raw(cmd, request_id).map_err(map_apply_error)
    }

    /// Like [`MasterState::apply`] but keeps the typed rejection, so the
    /// replicated log can store cloneable apply outcomes for its waiters.
    pub fn apply_raw(
        &self,
        cmd: &ClusterCommand,
        request_id: Option<&str>,
    ) -> std::result::Result<u64, ApplyError> {
        if let Some(request_id) = request_id.filter(|id| !id.is_empty()) {
            if let Some(version) = self.dedup.lock().get(request_id) {
                return Ok(*version);
            }
        }
        let mut machine = self.machine.lock();
        let events = machine.apply(cmd)?;
        let version = machine.version;
        let snapshot = machine.clone();
        drop(machine);
        self.published.store(Arc::new(snapshot));
        metrics::CLUSTER_STATE_VERSION
            .with_label_values(&["master"])
            .set(version as i64);
        if let Some(request_id) = request_id.filter(|id| !id.is_empty()) {
            self.dedup.lock().insert(request_id.to_string(), version);
        }
        self.watch.publish(&events);
        Ok(version)
    }

    /// The immutable snapshot readers see; consistent multi-field views come
    /// from holding one of these.
    pub fn snapshot(&self) -> Arc<ClusterState> {
        self.published.load_full()
    }

    pub fn version(&self) -> u64 {
        self.published.load().version
    }

    /// Canonical dump for raft snapshots.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.machine.lock().to_canonical_bytes()
    }

    /// Replace the machine from a snapshot. Restoration yields byte-identical
    /// state to the machine the snapshot was taken from.
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let state = ClusterState::from_canonical_bytes(bytes)?;
        let version = state.version;
        *self.machine.lock() = state.clone();
        self.published.store(Arc::new(state));
        metrics::CLUSTER_STATE_VERSION
            .with_label_values(&["master"])
            .set(version as i64);
        log::info!("[MASTER] restored state machine at version {version}");
        Ok(())
    }
}

pub fn map_apply_error(err: ApplyError) -> Error {
    match &err {
        ApplyError::IndexExists(_) => Error::AlreadyExists(err.to_string()),
        ApplyError::IndexNotFound(_)
        | ApplyError::NodeNotFound(_)
        | ApplyError::AllocationNotFound(..) => Error::NotFound(err.to_string()),
        ApplyError::NodeDown(_) => Error::FailedPrecondition(err.to_string()),
        ApplyError::InvalidSettings(_) | ApplyError::ShardOutOfRange(..) => {
            Error::InvalidArgument(err.to_string())
        }
        ApplyError::PrimaryExists(..) | ApplyError::AlreadyAllocated(..) => {
            Error::AlreadyExists(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::meta::{
        cluster::{Node, NodeState, Role},
        index::{IndexMeta, IndexSettings},
    };

    fn node(uuid: &str) -> Node {
        Node {
            id: 0,
            uuid: uuid.to_string(),
            name: uuid.to_string(),
            grpc_addr: "http://127.0.0.1:5461".to_string(),
            role: vec![Role::Data],
            state: NodeState::Active,
            ..Default::default()
        }
    }

    fn create_index_cmd(name: &str) -> ClusterCommand {
        ClusterCommand::CreateIndex {
            meta: IndexMeta::new(name, IndexSettings::default(), Default::default(), 0),
        }
    }

    #[test]
    fn test_apply_publishes_snapshot() {
        let state = MasterState::new();
        let v = state
            .apply(&ClusterCommand::RegisterNode { node: node("n1") }, None)
            .unwrap();
        assert_eq!(v, 1);
        assert_eq!(state.snapshot().version, 1);
        assert!(state.snapshot().nodes.contains_key("n1"));
    }

    #[test]
    fn test_request_id_dedup() {
        let state = MasterState::new();
        let v1 = state
            .apply(&create_index_cmd("logs"), Some("req-1"))
            .unwrap();
        // a retry with the same request id is a no-op at the same version
        let v2 = state
            .apply(&create_index_cmd("logs"), Some("req-1"))
            .unwrap();
        assert_eq!(v1, v2);
        assert_eq!(state.version(), v1);
        // a different request id hits the real conflict
        let err = state
            .apply(&create_index_cmd("logs"), Some("req-2"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_snapshot_restore_byte_identical() {
        let state = MasterState::new();
        state
            .apply(&ClusterCommand::RegisterNode { node: node("n1") }, None)
            .unwrap();
        state.apply(&create_index_cmd("logs"), None).unwrap();
        let bytes = state.canonical_bytes();

        let restored = MasterState::new();
        restored.restore(&bytes).unwrap();
        assert_eq!(restored.canonical_bytes(), bytes);
        assert_eq!(restored.version(), state.version());
    }

    #[test]
    fn test_watchers_see_strictly_increasing_versions() {
        let state = MasterState::new();
        let (_id, mut rx) = state.watch.subscribe(0);
        state
            .apply(&ClusterCommand::RegisterNode { node: node("n1") }, None)
            .unwrap();
        state.apply(&create_index_cmd("logs"), None).unwrap();
        state.apply(&create_index_cmd("metrics"), None).unwrap();
        let mut last = 0;
        while let Ok(event) = rx.try_recv() {
            assert!(event.version() > last);
            last = event.version();
        }
        assert_eq!(last, 3);
    }
}
