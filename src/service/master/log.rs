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

//! The replicated log binding the masters: leader election with randomized
//! timeouts, quorum replication, snapshot plus truncation. Proposals block
//! until the log reports commit or the commit timeout fires. With no peers
//! configured the node is a quorum of one, the path local mode and most
//! tests take.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use config::{
    get_config,
    meta::cluster::{ApplyError, ClusterCommand},
    metrics,
    utils::{json, rand::jitter_millis},
    RwHashMap,
};
use hashbrown::HashMap;
use infra::errors::{Error, Result};
use proto::cluster_rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry, VoteRequest, VoteResponse,
};

use super::state::{map_apply_error, MasterState};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, peer: &str, req: VoteRequest) -> Result<VoteResponse>;
    async fn append_entries(&self, peer: &str, req: AppendEntriesRequest)
        -> Result<AppendEntriesResponse>;
    async fn install_snapshot(
        &self,
        peer: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

struct RaftCore {
    role: RaftRole,
    term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    snapshot_last_index: u64,
    snapshot_last_term: u64,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    election_deadline: Instant,
    /// apply outcome per log index, consumed by the proposing waiter
    results: HashMap<u64, std::result::Result<u64, ApplyError>>,
}

impl RaftCore {
    fn last_index(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_last_index)
    }

    fn last_term(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_last_term)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_last_index {
            return None;
        }
        let pos = (index - self.snapshot_last_index - 1) as usize;
        self.log.get(pos)
    }

    /// Term of an index, `None` if compacted away or beyond the log.
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        self.entry_at(index).map(|e| e.term)
    }

    fn truncate_from(&mut self, index: u64) {
        if index <= self.snapshot_last_index {
            self.log.clear();
            return;
        }
        let pos = (index - self.snapshot_last_index - 1) as usize;
        self.log.truncate(pos);
    }
}

pub struct RaftNode {
    /// This node's raft id; the grpc address peers reach it on.
    pub id: String,
    pub peers: Vec<String>,
    core: parking_lot::Mutex<RaftCore>,
    sm: Arc<MasterState>,
    transport: Arc<dyn RaftTransport>,
    commit_notify: tokio::sync::Notify,
}

fn election_deadline() -> Instant {
    let cfg = get_config();
    let ms = jitter_millis(
        cfg.raft.election_timeout_min_ms,
        cfg.raft.election_timeout_max_ms - cfg.raft.election_timeout_min_ms,
    );
    Instant::now() + Duration::from_millis(ms)
}

impl RaftNode {
    pub fn new(
        id: &str,
        peers: Vec<String>,
        sm: Arc<MasterState>,
        transport: Arc<dyn RaftTransport>,
    ) -> Arc<Self> {
        let single = peers.is_empty();
        let node = Arc::new(RaftNode {
            id: id.to_string(),
            peers,
            core: parking_lot::Mutex::new(RaftCore {
                // a quorum of one leads immediately
                role: if single {
                    RaftRole::Leader
                } else {
                    RaftRole::Follower
                },
                term: if single { 1 } else { 0 },
                voted_for: None,
                leader_id: single.then(|| id.to_string()),
                log: Vec::new(),
                commit_index: 0,
                last_applied: 0,
                snapshot_last_index: 0,
                snapshot_last_term: 0,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                election_deadline: election_deadline(),
                results: HashMap::new(),
            }),
            sm,
            transport,
            commit_notify: tokio::sync::Notify::new(),
        });
        if single {
            log::info!("[MASTER] single-master mode, {} is leader", node.id);
        }
        node
    }

    pub fn state_machine(&self) -> Arc<MasterState> {
        self.sm.clone()
    }

    pub fn role(&self) -> RaftRole {
        self.core.lock().role
    }

    pub fn term(&self) -> u64 {
        self.core.lock().term
    }

    pub fn is_leader(&self) -> bool {
        self.role() == RaftRole::Leader
    }

    pub fn leader_hint(&self) -> Option<String> {
        self.core.lock().leader_id.clone()
    }

    fn not_leader_error(&self) -> Error {
        match self.leader_hint() {
            Some(leader) if leader != self.id => {
                Error::FailedPrecondition(format!("not the leader; leader={leader}"))
            }
            _ => Error::FailedPrecondition("not the leader; no leader elected yet".to_string()),
        }
    }

    /// Spawn the background ticker driving heartbeats and elections.
    pub fn start(self: &Arc<Self>) {
        let node = self.clone();
        tokio::task::spawn(async move {
            let tick = Duration::from_millis(get_config().raft.tick_ms.max(10));
            loop {
                tokio::time::sleep(tick).await;
                node.on_tick().await;
            }
        });
    }

    /// Propose a command; resolves once the entry is committed and applied,
    /// or fails with `Unavailable` on commit timeout.
    pub async fn propose(&self, cmd: &ClusterCommand, request_id: &str) -> Result<u64> {
        let cfg = get_config();
        let index = {
            let mut core = self.core.lock();
            if core.role != RaftRole::Leader {
                metrics::RAFT_PROPOSALS.with_label_values(&["rejected"]).inc();
                drop(core);
                return Err(self.not_leader_error());
            }
            let index = core.last_index() + 1;
            let term = core.term;
            core.log.push(LogEntry {
                term,
                index,
                command: json::to_vec(cmd)?.into(),
                request_id: request_id.to_string(),
            });
            if self.peers.is_empty() {
                core.commit_index = index;
            }
            index
        };
        metrics::RAFT_PROPOSALS.with_label_values(&["proposed"]).inc();
        if self.peers.is_empty() {
            self.apply_committed();
        } else {
            // push replication now rather than waiting a tick
            self.replicate().await;
        }
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(cfg.raft.commit_timeout.max(1));
        loop {
            if let Some(outcome) = self.core.lock().results.remove(&index) {
                metrics::RAFT_PROPOSALS.with_label_values(&["committed"]).inc();
                return outcome.map_err(map_apply_error);
            }
            let notified = self.commit_notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                metrics::RAFT_PROPOSALS.with_label_values(&["timeout"]).inc();
                return Err(Error::Unavailable(format!(
                    "proposal did not reach quorum within {}s",
                    cfg.raft.commit_timeout
                )));
            }
        }
    }

    /// One tick: leaders replicate, followers and candidates check the
    /// election timer.
    pub async fn on_tick(&self) {
        let (role, election_due) = {
            let core = self.core.lock();
            (core.role, Instant::now() >= core.election_deadline)
        };
        match role {
            RaftRole::Leader => self.replicate().await,
            _ if election_due && !self.peers.is_empty() => self.campaign().await,
            _ => {}
        }
    }

    /// Stand for election now. Normally driven by the ticker when the
    /// election timer fires; exposed for harnesses that steer elections.
    pub async fn campaign(&self) {
        let req = {
            let mut core = self.core.lock();
            core.role = RaftRole::Candidate;
            core.term += 1;
            core.voted_for = Some(self.id.clone());
            core.leader_id = None;
            core.election_deadline = election_deadline();
            VoteRequest {
                term: core.term,
                candidate_id: self.id.clone(),
                last_log_index: core.last_index(),
                last_log_term: core.last_term(),
            }
        };
        log::info!("[MASTER] {} starting election for term {}", self.id, req.term);
        let mut votes = 1usize; // self
        let mut responses = Vec::new();
        for peer in &self.peers {
            responses.push((peer.clone(), self.transport.request_vote(peer, req.clone()).await));
        }
        for (peer, resp) in responses {
            match resp {
                Ok(resp) if resp.vote_granted => votes += 1,
                Ok(resp) => {
                    let mut core = self.core.lock();
                    if resp.term > core.term {
                        core.term = resp.term;
                        core.role = RaftRole::Follower;
                        core.voted_for = None;
                        return;
                    }
                }
                Err(e) => log::warn!("[MASTER] vote request to {peer} failed: {e}"),
            }
        }
        let quorum = (self.peers.len() + 1) / 2 + 1;
        let mut core = self.core.lock();
        if core.role != RaftRole::Candidate || core.term != req.term {
            return;
        }
        if votes >= quorum {
            core.role = RaftRole::Leader;
            core.leader_id = Some(self.id.clone());
            let next = core.last_index() + 1;
            for peer in &self.peers {
                core.next_index.insert(peer.clone(), next);
                core.match_index.insert(peer.clone(), 0);
            }
            log::info!(
                "[MASTER] {} elected leader for term {} with {votes} votes",
                self.id,
                core.term
            );
        }
    }

    /// Send append-entries (or a snapshot) to every peer and advance the
    /// commit index on quorum acknowledgement.
    async fn replicate(&self) {
        if self.peers.is_empty() {
            return;
        }
        for peer in &self.peers {
            enum Batch {
                Entries(AppendEntriesRequest),
                Snapshot(InstallSnapshotRequest),
            }
            let batch = {
                let core = self.core.lock();
                if core.role != RaftRole::Leader {
                    return;
                }
                let next = *core.next_index.get(peer).unwrap_or(&(core.last_index() + 1));
                if next <= core.snapshot_last_index {
                    Batch::Snapshot(InstallSnapshotRequest {
                        term: core.term,
                        leader_id: self.id.clone(),
                        last_included_index: core.snapshot_last_index,
                        last_included_term: core.snapshot_last_term,
                        snapshot: self.sm.canonical_bytes().into(),
                    })
                } else {
                    let prev_log_index = next - 1;
                    let entries: Vec<LogEntry> = core
                        .log
                        .iter()
                        .filter(|e| e.index >= next)
                        .cloned()
                        .collect();
                    Batch::Entries(AppendEntriesRequest {
                        term: core.term,
                        leader_id: self.id.clone(),
                        prev_log_index,
                        prev_log_term: core.term_at(prev_log_index).unwrap_or(0),
                        entries,
                        leader_commit: core.commit_index,
                    })
                }
            };
            match batch {
                Batch::Entries(req) => {
                    let sent_up_to = req.prev_log_index + req.entries.len() as u64;
                    match self.transport.append_entries(peer, req).await {
                        Ok(resp) => self.on_append_response(peer, resp, sent_up_to),
                        Err(e) => log::debug!("[MASTER] append to {peer} failed: {e}"),
                    }
                }
                Batch::Snapshot(req) => {
                    let last = req.last_included_index;
                    match self.transport.install_snapshot(peer, req).await {
                        Ok(resp) => {
                            let mut core = self.core.lock();
                            if resp.term > core.term {
                                core.term = resp.term;
                                core.role = RaftRole::Follower;
                                core.voted_for = None;
                                return;
                            }
                            core.next_index.insert(peer.clone(), last + 1);
                            core.match_index.insert(peer.clone(), last);
                        }
                        Err(e) => log::debug!("[MASTER] snapshot to {peer} failed: {e}"),
                    }
                }
            }
        }
        self.advance_commit();
        self.apply_committed();
    }

    fn on_append_response(&self, peer: &str, resp: AppendEntriesResponse, sent_up_to: u64) {
        let mut core = self.core.lock();
        if resp.term > core.term {
            core.term = resp.term;
            core.role = RaftRole::Follower;
            core.voted_for = None;
            core.leader_id = None;
            return;
        }
        if resp.success {
            core.match_index.insert(peer.to_string(), sent_up_to.max(resp.match_index));
            core.next_index.insert(peer.to_string(), sent_up_to + 1);
        } else {
            // back off one entry at a time; snapshots cover the long tail
            let next = core.next_index.entry(peer.to_string()).or_insert(1);
            *next = next.saturating_sub(1).max(1);
        }
    }

    fn advance_commit(&self) {
        let mut core = self.core.lock();
        if core.role != RaftRole::Leader {
            return;
        }
        let mut indexes: Vec<u64> = self
            .peers
            .iter()
            .map(|p| *core.match_index.get(p).unwrap_or(&0))
            .collect();
        indexes.push(core.last_index());
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = (self.peers.len() + 1) / 2 + 1;
        let candidate = indexes[quorum - 1];
        // only entries of the current term commit by counting
        if candidate > core.commit_index && core.term_at(candidate) == Some(core.term) {
            core.commit_index = candidate;
        }
    }

    /// Apply everything committed but not yet applied, record outcomes for
    /// waiters, and compact the log when it has grown past the snapshot
    /// threshold.
    fn apply_committed(&self) {
        let cfg = get_config();
        let mut core = self.core.lock();
        while core.last_applied < core.commit_index {
            let index = core.last_applied + 1;
            let Some(entry) = core.entry_at(index) else {
                log::error!("[MASTER] missing log entry {index}, cannot apply");
                break;
            };
            let request_id = entry.request_id.clone();
            let outcome = match json::from_slice::<ClusterCommand>(&entry.command) {
                Ok(cmd) => self.sm.apply_raw(
                    &cmd,
                    (!request_id.is_empty()).then_some(request_id.as_str()),
                ),
                Err(e) => {
                    log::error!("[MASTER] undecodable command at index {index}: {e}");
                    core.last_applied = index;
                    continue;
                }
            };
            core.results.insert(index, outcome);
            core.last_applied = index;
        }
        // drop outcomes nobody will claim anymore
        let floor = core.last_applied.saturating_sub(4096);
        core.results.retain(|idx, _| *idx > floor);

        if core.last_applied - core.snapshot_last_index >= cfg.raft.snapshot_entries.max(1) {
            let last_applied = core.last_applied;
            let last_term = core.term_at(last_applied).unwrap_or(core.term);
            core.log.retain(|e| e.index > last_applied);
            core.snapshot_last_index = last_applied;
            core.snapshot_last_term = last_term;
            log::info!("[MASTER] compacted replicated log through index {last_applied}");
        }
        drop(core);
        self.commit_notify.notify_waiters();
    }

    // ------------------------ follower-side handlers -----------------------

    pub fn handle_request_vote(&self, req: VoteRequest) -> VoteResponse {
        let mut core = self.core.lock();
        if req.term > core.term {
            core.term = req.term;
            core.role = RaftRole::Follower;
            core.voted_for = None;
        }
        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (core.last_term(), core.last_index());
        let grant = req.term == core.term
            && up_to_date
            && core
                .voted_for
                .as_ref()
                .map_or(true, |v| v == &req.candidate_id);
        if grant {
            core.voted_for = Some(req.candidate_id.clone());
            core.election_deadline = election_deadline();
        }
        VoteResponse {
            term: core.term,
            vote_granted: grant,
        }
    }

    pub fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let do_apply;
        let resp = {
            let mut core = self.core.lock();
            if req.term < core.term {
                return AppendEntriesResponse {
                    term: core.term,
                    success: false,
                    match_index: 0,
                };
            }
            core.term = req.term;
            core.role = RaftRole::Follower;
            core.leader_id = Some(req.leader_id.clone());
            core.election_deadline = election_deadline();

            if req.prev_log_index > 0 && core.term_at(req.prev_log_index) != Some(req.prev_log_term)
            {
                return AppendEntriesResponse {
                    term: core.term,
                    success: false,
                    match_index: 0,
                };
            }
            for entry in &req.entries {
                match core.term_at(entry.index) {
                    Some(term) if term == entry.term => continue,
                    Some(_) => {
                        core.truncate_from(entry.index);
                        core.log.push(entry.clone());
                    }
                    None => {
                        if entry.index == core.last_index() + 1 {
                            core.log.push(entry.clone());
                        }
                    }
                }
            }
            let last = core.last_index();
            if req.leader_commit > core.commit_index {
                core.commit_index = req.leader_commit.min(last);
            }
            do_apply = core.commit_index > core.last_applied;
            AppendEntriesResponse {
                term: core.term,
                success: true,
                match_index: last,
            }
        };
        if do_apply {
            self.apply_committed();
        }
        resp
    }

    pub fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut core = self.core.lock();
        if req.term < core.term {
            return InstallSnapshotResponse { term: core.term };
        }
        core.term = req.term;
        core.role = RaftRole::Follower;
        core.leader_id = Some(req.leader_id.clone());
        core.election_deadline = election_deadline();
        if let Err(e) = self.sm.restore(&req.snapshot) {
            log::error!("[MASTER] snapshot restore failed: {e}");
            return InstallSnapshotResponse { term: core.term };
        }
        core.log.clear();
        core.snapshot_last_index = req.last_included_index;
        core.snapshot_last_term = req.last_included_term;
        core.commit_index = req.last_included_index;
        core.last_applied = req.last_included_index;
        InstallSnapshotResponse { term: core.term }
    }
}

/// Transport wiring raft nodes in the same process, for local multi-master
/// harnesses and tests.
#[derive(Default)]
pub struct InProcessTransport {
    nodes: RwHashMap<String, Arc<RaftNode>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<RaftNode>) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn remove(&self, id: &str) {
        self.nodes.remove(id);
    }

    fn get(&self, peer: &str) -> Result<Arc<RaftNode>> {
        self.nodes
            .get(peer)
            .map(|n| n.clone())
            .ok_or_else(|| Error::Unavailable(format!("peer {peer} down")))
    }
}

#[async_trait]
impl RaftTransport for InProcessTransport {
    async fn request_vote(&self, peer: &str, req: VoteRequest) -> Result<VoteResponse> {
        Ok(self.get(peer)?.handle_request_vote(req))
    }

    async fn append_entries(
        &self,
        peer: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        Ok(self.get(peer)?.handle_append_entries(req))
    }

    async fn install_snapshot(
        &self,
        peer: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        Ok(self.get(peer)?.handle_install_snapshot(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::meta::{
        cluster::{Node, NodeState, Role},
        index::{IndexMeta, IndexSettings},
    };

    fn cmd(name: &str) -> ClusterCommand {
        ClusterCommand::CreateIndex {
            meta: IndexMeta::new(name, IndexSettings::default(), Default::default(), 0),
        }
    }

    fn register_cmd(uuid: &str) -> ClusterCommand {
        ClusterCommand::RegisterNode {
            node: Node {
                uuid: uuid.to_string(),
                name: uuid.to_string(),
                grpc_addr: format!("http://{uuid}:5461"),
                role: vec![Role::Data],
                state: NodeState::Active,
                ..Default::default()
            },
        }
    }

    fn single_node() -> Arc<RaftNode> {
        RaftNode::new(
            "m1",
            vec![],
            Arc::new(MasterState::new()),
            Arc::new(InProcessTransport::new()),
        )
    }

    fn trio() -> (Arc<InProcessTransport>, Vec<Arc<RaftNode>>) {
        let transport = Arc::new(InProcessTransport::new());
        let ids = ["m1", "m2", "m3"];
        let mut nodes = Vec::new();
        for id in ids {
            let peers = ids
                .iter()
                .filter(|p| **p != id)
                .map(|p| p.to_string())
                .collect();
            let node = RaftNode::new(
                id,
                peers,
                Arc::new(MasterState::new()),
                transport.clone() as Arc<dyn RaftTransport>,
            );
            transport.register(node.clone());
            nodes.push(node);
        }
        (transport, nodes)
    }

    async fn elect(node: &Arc<RaftNode>) {
        node.campaign().await;
        assert!(node.is_leader());
    }

    #[tokio::test]
    async fn test_single_node_commits_immediately() {
        let node = single_node();
        assert!(node.is_leader());
        let v1 = node.propose(&cmd("logs"), "r1").await.unwrap();
        let v2 = node.propose(&cmd("metrics"), "r2").await.unwrap();
        assert_eq!((v1, v2), (1, 2));
        assert!(node.state_machine().snapshot().indices.contains_key("logs"));
    }

    #[tokio::test]
    async fn test_follower_rejects_proposal_with_leader_hint() {
        let (_transport, nodes) = trio();
        elect(&nodes[0]).await;
        nodes[0].replicate().await;
        let err = nodes[1].propose(&cmd("logs"), "r1").await.unwrap_err();
        assert_eq!(err.leader_hint().as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_quorum_replication() {
        let (_transport, nodes) = trio();
        elect(&nodes[0]).await;
        let v = nodes[0].propose(&cmd("logs"), "r1").await.unwrap();
        assert_eq!(v, 1);
        // followers applied it too
        nodes[0].replicate().await;
        for node in &nodes[1..] {
            assert!(node.state_machine().snapshot().indices.contains_key("logs"));
        }
    }

    #[tokio::test]
    async fn test_failover_preserves_state() {
        let (transport, nodes) = trio();
        elect(&nodes[0]).await;
        let v_before = nodes[0].propose(&cmd("a"), "r1").await.unwrap();
        nodes[0].replicate().await;

        // kill the leader
        transport.remove("m1");
        elect(&nodes[1]).await;
        let state = nodes[1].state_machine().snapshot();
        assert!(state.indices.contains_key("a"));
        assert!(state.version >= v_before);

        // the new leader keeps serving writes with one dead peer
        let v_after = nodes[1].propose(&cmd("b"), "r2").await.unwrap();
        assert!(v_after > v_before);
    }

    #[tokio::test]
    async fn test_idempotent_retry_by_request_id() {
        let node = single_node();
        let v1 = node.propose(&cmd("logs"), "same-id").await.unwrap();
        let v2 = node.propose(&cmd("logs"), "same-id").await.unwrap();
        assert_eq!(v1, v2);
    }

    #[tokio::test]
    async fn test_rejected_command_surfaces_error() {
        let node = single_node();
        node.propose(&cmd("logs"), "r1").await.unwrap();
        let err = node.propose(&cmd("logs"), "r2").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_snapshot_compaction_and_catch_up() {
        std::env::set_var("QV_SNAPSHOT_ENTRIES", "4");
        config::refresh_config().unwrap();
        let (transport, nodes) = trio();
        elect(&nodes[0]).await;
        for i in 0..6 {
            nodes[0]
                .propose(&register_cmd(&format!("n{i}")), &format!("r{i}"))
                .await
                .unwrap();
        }
        // log was compacted on the leader
        assert!(nodes[0].core.lock().snapshot_last_index >= 4);

        // a fresh node joins and catches up from the snapshot
        let late = RaftNode::new(
            "m4",
            vec!["m1".to_string(), "m2".to_string(), "m3".to_string()],
            Arc::new(MasterState::new()),
            transport.clone() as Arc<dyn RaftTransport>,
        );
        transport.register(late.clone());
        {
            let mut core = nodes[0].core.lock();
            core.next_index.insert("m4".to_string(), 1);
            core.match_index.insert("m4".to_string(), 0);
        }
        nodes[0].replicate().await;
        nodes[0].replicate().await;
        let late_state = late.state_machine().snapshot();
        assert!(late_state.version >= 4);
        assert_eq!(
            late.state_machine().canonical_bytes(),
            nodes[0].state_machine().canonical_bytes()
        );
        std::env::remove_var("QV_SNAPSHOT_ENTRIES");
        config::refresh_config().unwrap();
    }

    #[tokio::test]
    async fn test_vote_denied_for_stale_log() {
        let (_transport, nodes) = trio();
        elect(&nodes[0]).await;
        nodes[0].propose(&cmd("logs"), "r1").await.unwrap();
        // a candidate with an empty log and lower term gets rejected
        let resp = nodes[0].handle_request_vote(VoteRequest {
            term: 1,
            candidate_id: "m3".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!resp.vote_granted);
    }
}
