//! Deterministic Raft protocol state.
//!
//! # Purpose
//! [`RaftCore`] owns the term, vote, log, commit index and membership of one
//! node and reacts to three inputs: [`RaftCore::tick`], [`RaftCore::step`] and
//! proposals. Outputs are collected rather than performed: messages to send,
//! a dirty flag for persistence, and a snapshot received from the leader.
//! The async driver in [`crate::node`] performs the I/O.
//!
//! # Notes
//! - Membership changes are single-server: a new configuration takes effect
//!   as soon as it is appended, and a second change is refused until the first
//!   commits.
//! - A new leader appends a blank entry so entries from earlier terms commit.
//! - A follower that heard from a leader within the minimum election timeout
//!   ignores vote requests, so a removed server cannot disrupt the cluster.
use crate::error::{ConsensusError, Result};
use crate::message::Message;
use crate::types::{
    EntryPayload, HardState, LogEntry, LogIndex, Membership, NodeId, Role, SnapshotMeta, Term,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    /// Minimum election timeout in ticks; the effective timeout is randomized
    /// in `[election_ticks, 2 * election_ticks)`.
    pub election_ticks: u64,
    pub heartbeat_ticks: u64,
    pub max_append_entries: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            election_ticks: 10,
            heartbeat_ticks: 2,
            max_append_entries: 64,
        }
    }
}

/// A message produced by the core, addressed to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: NodeId,
    pub message: Message,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Arc<Vec<u8>>,
}

/// Everything that must survive a restart, as stored in `raft.db`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub hard_state: HardState,
    pub snapshot: Option<SnapshotMeta>,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    next_index: LogIndex,
    match_index: LogIndex,
}

pub struct RaftCore {
    id: NodeId,
    config: CoreConfig,
    role: Role,
    term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
    membership: Membership,
    membership_index: LogIndex,
    commit_index: LogIndex,
    votes: BTreeSet<NodeId>,
    progress: BTreeMap<NodeId, Progress>,
    election_elapsed: u64,
    randomized_timeout: u64,
    heartbeat_elapsed: u64,
    rng: StdRng,
    outbox: Vec<Outbound>,
    dirty: bool,
    received_snapshot: Option<Snapshot>,
}

impl RaftCore {
    pub fn new(id: impl Into<NodeId>, config: CoreConfig, seed: u64) -> Self {
        let mut core = Self {
            id: id.into(),
            config,
            role: Role::Follower,
            term: 0,
            voted_for: None,
            leader_id: None,
            log: Vec::new(),
            snapshot: None,
            membership: Membership::default(),
            membership_index: 0,
            commit_index: 0,
            votes: BTreeSet::new(),
            progress: BTreeMap::new(),
            election_elapsed: 0,
            randomized_timeout: config.election_ticks,
            heartbeat_elapsed: 0,
            rng: StdRng::seed_from_u64(seed),
            outbox: Vec::new(),
            dirty: false,
            received_snapshot: None,
        };
        core.reset_election_timer();
        core
    }

    /// Rebuild a core from persisted state. The snapshot bytes, when present,
    /// must match `state.snapshot`.
    pub fn restore(
        id: impl Into<NodeId>,
        config: CoreConfig,
        seed: u64,
        state: PersistentState,
        snapshot_data: Option<Vec<u8>>,
    ) -> Self {
        let mut core = Self::new(id, config, seed);
        core.term = state.hard_state.term;
        core.voted_for = state.hard_state.voted_for;
        if let Some(meta) = state.snapshot {
            core.commit_index = meta.last_index;
            core.snapshot = Some(Snapshot {
                meta,
                data: Arc::new(snapshot_data.unwrap_or_default()),
            });
        }
        core.log = state.entries;
        core.recompute_membership();
        core
    }

    /// Seed an empty node with the initial configuration at index 1, term 1.
    pub fn bootstrap(&mut self, membership: Membership) {
        if self.last_index() > 0 || self.term > 0 {
            return;
        }
        self.term = 1;
        self.log.push(LogEntry {
            term: 1,
            index: 1,
            payload: EntryPayload::Membership { membership },
        });
        self.recompute_membership();
        self.dirty = true;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn leader_id(&self) -> Option<&NodeId> {
        self.leader_id.as_ref()
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot.as_ref().map_or(0, |s| s.meta.last_index)
    }

    fn first_index(&self) -> LogIndex {
        self.snapshot_index() + 1
    }

    pub fn last_index(&self) -> LogIndex {
        self.log
            .last()
            .map_or_else(|| self.snapshot_index(), |entry| entry.index)
    }

    pub fn last_term(&self) -> Term {
        self.term_at(self.last_index()).unwrap_or(0)
    }

    /// Term of the entry at `index`, if it is still known.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if let Some(snapshot) = &self.snapshot
            && index == snapshot.meta.last_index
        {
            return Some(snapshot.meta.last_term);
        }
        self.entry(index).map(|entry| entry.term)
    }

    fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index() {
            return None;
        }
        self.log.get((index - self.first_index()) as usize)
    }

    /// Entries in `(after, upto]` that are still in the log.
    pub fn entries_between(&self, after: LogIndex, upto: LogIndex) -> Vec<LogEntry> {
        let start = after.max(self.snapshot_index()) + 1;
        (start..=upto)
            .filter_map(|index| self.entry(index).cloned())
            .collect()
    }

    pub fn persistent_state(&self) -> PersistentState {
        PersistentState {
            hard_state: HardState {
                term: self.term,
                voted_for: self.voted_for.clone(),
            },
            snapshot: self.snapshot.as_ref().map(|s| s.meta.clone()),
            entries: self.log.clone(),
        }
    }

    /// Returns whether persistent state changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn take_messages(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// A snapshot installed from the leader that the state machine must load.
    pub fn take_received_snapshot(&mut self) -> Option<Snapshot> {
        self.received_snapshot.take()
    }

    pub fn tick(&mut self) {
        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_ticks {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_append();
                }
            }
            Role::Follower | Role::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_timeout {
                    self.campaign();
                }
            }
        }
    }

    /// Start an election. Nodes outside the membership never campaign.
    pub fn campaign(&mut self) {
        if !self.membership.contains(&self.id) {
            self.reset_election_timer();
            return;
        }
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id.clone());
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.dirty = true;
        self.reset_election_timer();
        metrics::counter!("raft_elections_total").increment(1);
        tracing::debug!(node = %self.id, term = self.term, "starting election");

        if self.has_quorum(&self.votes) {
            self.become_leader();
            return;
        }
        let (last_log_index, last_log_term) = (self.last_index(), self.last_term());
        let peers: Vec<NodeId> = self.other_voters();
        for peer in peers {
            self.send(
                peer,
                Message::RequestVote {
                    term: self.term,
                    last_log_index,
                    last_log_term,
                },
            );
        }
    }

    /// Append a command. Returns the `(term, index)` the entry was written at.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(Term, LogIndex)> {
        self.ensure_leader()?;
        let index = self.append_local(EntryPayload::Command { data });
        self.maybe_commit();
        self.broadcast_append();
        Ok((self.term, index))
    }

    /// Append a configuration that differs from the current one by exactly one
    /// voter.
    pub fn propose_membership(&mut self, membership: Membership) -> Result<(Term, LogIndex)> {
        self.ensure_leader()?;
        if self.membership_index > self.commit_index {
            return Err(ConsensusError::ChangeInProgress);
        }
        let current: BTreeSet<&NodeId> = self.membership.voters.keys().collect();
        let next: BTreeSet<&NodeId> = membership.voters.keys().collect();
        let changed = current.symmetric_difference(&next).count();
        if changed != 1 {
            return Err(ConsensusError::InvalidMembership(format!(
                "expected a single voter change, got {changed}"
            )));
        }
        let index = self.append_local(EntryPayload::Membership { membership });
        self.maybe_commit();
        self.broadcast_append();
        Ok((self.term, index))
    }

    /// Replace the log prefix up to `index` with a snapshot of the state
    /// machine taken at that index.
    pub fn compact(&mut self, index: LogIndex, data: Vec<u8>) {
        if index <= self.snapshot_index() || index > self.commit_index {
            return;
        }
        let Some(last_term) = self.term_at(index) else {
            return;
        };
        let membership = self.membership_at(index);
        self.log.retain(|entry| entry.index > index);
        self.snapshot = Some(Snapshot {
            meta: SnapshotMeta {
                last_index: index,
                last_term,
                membership,
            },
            data: Arc::new(data),
        });
        self.dirty = true;
    }

    pub fn step(&mut self, from: &str, message: Message) {
        let term = message.term();
        if term > self.term {
            let is_vote_request = matches!(message, Message::RequestVote { .. });
            if is_vote_request
                && self.leader_id.is_some()
                && self.election_elapsed < self.config.election_ticks
            {
                tracing::debug!(node = %self.id, from, "ignoring vote request while leader is live");
                return;
            }
            let leader = match message {
                Message::AppendEntries { .. } | Message::InstallSnapshot { .. } => {
                    Some(from.to_string())
                }
                _ => None,
            };
            self.become_follower(term, leader);
        } else if term < self.term {
            self.reject_stale(from, &message);
            return;
        }

        match message {
            Message::RequestVote {
                last_log_index,
                last_log_term,
                ..
            } => self.handle_vote_request(from, last_log_index, last_log_term),
            Message::RequestVoteResponse { granted, .. } => {
                if self.role == Role::Candidate && granted {
                    self.votes.insert(from.to_string());
                    if self.has_quorum(&self.votes) {
                        self.become_leader();
                    }
                }
            }
            Message::AppendEntries {
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                ..
            } => {
                self.follow(from);
                self.handle_append(from, prev_log_index, prev_log_term, entries, leader_commit);
            }
            Message::AppendEntriesResponse {
                success,
                match_index,
                conflict_index,
                ..
            } => {
                if self.role == Role::Leader {
                    self.handle_append_response(from, success, match_index, conflict_index);
                }
            }
            Message::InstallSnapshot { meta, data, .. } => {
                self.follow(from);
                self.handle_install_snapshot(from, meta, data);
            }
            Message::InstallSnapshotResponse { last_index, .. } => {
                if self.role == Role::Leader {
                    self.handle_append_response(from, true, last_index, 0);
                }
            }
        }
    }

    fn reject_stale(&mut self, from: &str, message: &Message) {
        let reply = match message {
            Message::RequestVote { .. } => Message::RequestVoteResponse {
                term: self.term,
                granted: false,
            },
            Message::AppendEntries { .. } => Message::AppendEntriesResponse {
                term: self.term,
                success: false,
                match_index: 0,
                conflict_index: 0,
            },
            Message::InstallSnapshot { .. } => Message::InstallSnapshotResponse {
                term: self.term,
                last_index: 0,
            },
            _ => return,
        };
        self.send(from.to_string(), reply);
    }

    fn follow(&mut self, leader: &str) {
        if self.role != Role::Follower {
            self.become_follower(self.term, Some(leader.to_string()));
        }
        self.leader_id = Some(leader.to_string());
        self.election_elapsed = 0;
    }

    fn handle_vote_request(&mut self, from: &str, last_log_index: LogIndex, last_log_term: Term) {
        let my_last_term = self.last_term();
        let up_to_date = last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= self.last_index());
        let can_vote = match &self.voted_for {
            None => self.role == Role::Follower,
            Some(voted) => voted == from,
        };
        let granted = can_vote && up_to_date;
        if granted {
            self.voted_for = Some(from.to_string());
            self.dirty = true;
            self.election_elapsed = 0;
        }
        self.send(
            from.to_string(),
            Message::RequestVoteResponse {
                term: self.term,
                granted,
            },
        );
    }

    fn handle_append(
        &mut self,
        from: &str,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) {
        if prev_log_index > self.last_index() {
            self.reject_append(from, self.last_index() + 1);
            return;
        }
        let snapshot_index = self.snapshot_index();
        if prev_log_index >= snapshot_index {
            match self.term_at(prev_log_index) {
                Some(term) if term == prev_log_term => {}
                Some(term) => {
                    let conflict = self.first_index_of_term(term, prev_log_index);
                    self.reject_append(from, conflict);
                    return;
                }
                None => {
                    self.reject_append(from, snapshot_index + 1);
                    return;
                }
            }
        }

        let mut last_new = prev_log_index;
        let mut changed = false;
        for entry in entries {
            last_new = entry.index;
            if entry.index <= snapshot_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    let keep = (entry.index - self.first_index()) as usize;
                    self.log.truncate(keep);
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
            changed = true;
        }
        if changed {
            self.dirty = true;
            self.recompute_membership();
        }
        if leader_commit > self.commit_index {
            self.commit_index = self.commit_index.max(leader_commit.min(last_new));
        }
        self.send(
            from.to_string(),
            Message::AppendEntriesResponse {
                term: self.term,
                success: true,
                match_index: last_new,
                conflict_index: 0,
            },
        );
    }

    fn reject_append(&mut self, from: &str, conflict_index: LogIndex) {
        self.send(
            from.to_string(),
            Message::AppendEntriesResponse {
                term: self.term,
                success: false,
                match_index: 0,
                conflict_index,
            },
        );
    }

    fn first_index_of_term(&self, term: Term, from: LogIndex) -> LogIndex {
        let mut index = from;
        while index > self.first_index() && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    fn handle_append_response(
        &mut self,
        from: &str,
        success: bool,
        match_index: LogIndex,
        conflict_index: LogIndex,
    ) {
        let last_index = self.last_index();
        let Some(progress) = self.progress.get_mut(from) else {
            return;
        };
        if success {
            if match_index > progress.match_index {
                progress.match_index = match_index;
            }
            progress.next_index = progress.match_index + 1;
            let needs_more = progress.next_index <= last_index;
            self.maybe_commit();
            if needs_more && self.role == Role::Leader {
                self.send_append(from.to_string());
            }
        } else {
            let retry = conflict_index.min(progress.next_index.saturating_sub(1));
            progress.next_index = retry.max(progress.match_index + 1).max(1);
            self.send_append(from.to_string());
        }
    }

    fn handle_install_snapshot(&mut self, from: &str, meta: SnapshotMeta, data: Vec<u8>) {
        if meta.last_index <= self.commit_index {
            self.send(
                from.to_string(),
                Message::InstallSnapshotResponse {
                    term: self.term,
                    last_index: self.commit_index,
                },
            );
            return;
        }
        if self.term_at(meta.last_index) == Some(meta.last_term) {
            self.log.retain(|entry| entry.index > meta.last_index);
        } else {
            self.log.clear();
        }
        let last_index = meta.last_index;
        let snapshot = Snapshot {
            meta,
            data: Arc::new(data),
        };
        self.snapshot = Some(snapshot.clone());
        self.received_snapshot = Some(snapshot);
        self.commit_index = last_index;
        self.dirty = true;
        self.recompute_membership();
        tracing::info!(node = %self.id, last_index, "installed snapshot from leader");
        self.send(
            from.to_string(),
            Message::InstallSnapshotResponse {
                term: self.term,
                last_index,
            },
        );
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term != self.term {
            self.term = term;
            self.voted_for = None;
            self.dirty = true;
        }
        self.role = Role::Follower;
        self.leader_id = leader;
        self.votes.clear();
        self.progress.clear();
        self.reset_election_timer();
    }

    fn become_leader(&mut self) {
        tracing::info!(node = %self.id, term = self.term, "became leader");
        self.role = Role::Leader;
        self.leader_id = Some(self.id.clone());
        self.heartbeat_elapsed = 0;
        self.votes.clear();
        self.progress.clear();
        let next_index = self.last_index() + 1;
        for peer in self.other_voters() {
            self.progress.insert(
                peer,
                Progress {
                    next_index,
                    match_index: 0,
                },
            );
        }
        self.append_local(EntryPayload::Blank);
        self.maybe_commit();
        self.broadcast_append();
    }

    pub fn ensure_leader(&self) -> Result<()> {
        match self.role {
            Role::Leader => Ok(()),
            Role::Follower => Err(ConsensusError::NotLeader {
                leader: self.leader_id.clone(),
            }),
            Role::Candidate => Err(ConsensusError::ClusterUnavailable),
        }
    }

    fn append_local(&mut self, payload: EntryPayload) -> LogIndex {
        let index = self.last_index() + 1;
        let is_membership = matches!(payload, EntryPayload::Membership { .. });
        self.log.push(LogEntry {
            term: self.term,
            index,
            payload,
        });
        self.dirty = true;
        if is_membership {
            self.recompute_membership();
        }
        index
    }

    fn maybe_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let last_index = self.last_index();
        let mut new_commit = self.commit_index;
        for index in (self.commit_index + 1..=last_index).rev() {
            if self.term_at(index) != Some(self.term) {
                break;
            }
            let acks = self
                .membership
                .voters
                .keys()
                .filter(|voter| {
                    if **voter == self.id {
                        true
                    } else {
                        self.progress
                            .get(*voter)
                            .is_some_and(|p| p.match_index >= index)
                    }
                })
                .count();
            if acks >= self.membership.quorum() {
                new_commit = index;
                break;
            }
        }
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            if !self.membership.contains(&self.id) && self.commit_index >= self.membership_index {
                tracing::info!(node = %self.id, "removed from membership, stepping down");
                self.broadcast_append();
                self.become_follower(self.term, None);
            }
        }
    }

    fn broadcast_append(&mut self) {
        let peers: Vec<NodeId> = self.progress.keys().cloned().collect();
        for peer in peers {
            self.send_append(peer);
        }
    }

    fn send_append(&mut self, peer: NodeId) {
        let Some(progress) = self.progress.get(&peer).copied() else {
            return;
        };
        if let Some(snapshot) = &self.snapshot
            && progress.next_index <= snapshot.meta.last_index
        {
            let message = Message::InstallSnapshot {
                term: self.term,
                meta: snapshot.meta.clone(),
                data: snapshot.data.as_ref().clone(),
            };
            self.send(peer, message);
            return;
        }
        let prev_log_index = progress.next_index - 1;
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(0);
        let entries: Vec<LogEntry> = (progress.next_index..=self.last_index())
            .take(self.config.max_append_entries)
            .filter_map(|index| self.entry(index).cloned())
            .collect();
        let message = Message::AppendEntries {
            term: self.term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        self.send(peer, message);
    }

    fn send(&mut self, to: NodeId, message: Message) {
        if to != self.id {
            self.outbox.push(Outbound { to, message });
        }
    }

    fn has_quorum(&self, votes: &BTreeSet<NodeId>) -> bool {
        let granted = self
            .membership
            .voters
            .keys()
            .filter(|voter| votes.contains(*voter))
            .count();
        granted >= self.membership.quorum()
    }

    fn other_voters(&self) -> Vec<NodeId> {
        self.membership
            .voters
            .keys()
            .filter(|voter| **voter != self.id)
            .cloned()
            .collect()
    }

    fn membership_at(&self, index: LogIndex) -> Membership {
        self.log
            .iter()
            .rev()
            .filter(|entry| entry.index <= index)
            .find_map(|entry| match &entry.payload {
                EntryPayload::Membership { membership } => Some(membership.clone()),
                _ => None,
            })
            .or_else(|| self.snapshot.as_ref().map(|s| s.meta.membership.clone()))
            .unwrap_or_default()
    }

    fn recompute_membership(&mut self) {
        let latest = self.log.iter().rev().find_map(|entry| match &entry.payload {
            EntryPayload::Membership { membership } => Some((membership.clone(), entry.index)),
            _ => None,
        });
        let (membership, index) = match latest {
            Some(found) => found,
            None => match &self.snapshot {
                Some(snapshot) => (snapshot.meta.membership.clone(), snapshot.meta.last_index),
                None => (Membership::default(), 0),
            },
        };
        self.membership = membership;
        self.membership_index = index;
        if self.role == Role::Leader {
            let next_index = self.last_index() + 1;
            let others = self.other_voters();
            self.progress.retain(|peer, _| others.contains(peer));
            for peer in others {
                self.progress.entry(peer).or_insert(Progress {
                    next_index,
                    match_index: 0,
                });
            }
        }
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        let base = self.config.election_ticks.max(1);
        self.randomized_timeout = self.rng.gen_range(base..base * 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Net {
        nodes: BTreeMap<NodeId, RaftCore>,
        partitioned: BTreeSet<NodeId>,
    }

    impl Net {
        fn new(ids: &[&str]) -> Self {
            let nodes = ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    (
                        id.to_string(),
                        RaftCore::new(*id, CoreConfig::default(), i as u64 + 1),
                    )
                })
                .collect();
            Self {
                nodes,
                partitioned: BTreeSet::new(),
            }
        }

        fn membership(ids: &[&str]) -> Membership {
            Membership {
                voters: ids
                    .iter()
                    .map(|id| (id.to_string(), format!("{id}:7000")))
                    .collect(),
            }
        }

        fn node(&mut self, id: &str) -> &mut RaftCore {
            self.nodes.get_mut(id).unwrap()
        }

        fn deliver(&mut self) {
            loop {
                let mut batch = Vec::new();
                for (id, node) in self.nodes.iter_mut() {
                    for out in node.take_messages() {
                        batch.push((id.clone(), out));
                    }
                }
                if batch.is_empty() {
                    return;
                }
                for (from, out) in batch {
                    if self.partitioned.contains(&from) || self.partitioned.contains(&out.to) {
                        continue;
                    }
                    if let Some(node) = self.nodes.get_mut(&out.to) {
                        node.step(&from, out.message);
                    }
                }
            }
        }

        fn heartbeat(&mut self, leader: &str) {
            let ticks = self.node(leader).config.heartbeat_ticks;
            for _ in 0..ticks {
                self.node(leader).tick();
            }
            self.deliver();
        }

        fn elect(ids: &[&str]) -> Self {
            let mut net = Self::new(ids);
            let membership = Self::membership(ids);
            net.node(ids[0]).bootstrap(membership);
            net.node(ids[0]).campaign();
            net.deliver();
            assert!(net.node(ids[0]).is_leader());
            net.heartbeat(ids[0]);
            net
        }
    }

    fn command(node: &RaftCore, index: LogIndex) -> Option<Vec<u8>> {
        node.entries_between(index - 1, index)
            .into_iter()
            .find_map(|entry| match entry.payload {
                EntryPayload::Command { data } => Some(data),
                _ => None,
            })
    }

    #[test]
    fn single_node_elects_itself_and_commits_immediately() {
        let mut core = RaftCore::new("solo", CoreConfig::default(), 7);
        core.bootstrap(Membership::single("solo", "127.0.0.1:7000"));
        assert!(core.take_dirty());
        core.campaign();
        assert!(core.is_leader());
        assert_eq!(core.term(), 2);
        assert_eq!(core.commit_index(), 2);

        let (term, index) = core.propose(b"first".to_vec()).unwrap();
        assert_eq!((term, index), (2, 3));
        assert_eq!(core.commit_index(), 3);
        assert!(core.take_messages().is_empty());
    }

    #[test]
    fn bootstrap_is_ignored_once_state_exists() {
        let mut core = RaftCore::new("a", CoreConfig::default(), 1);
        core.bootstrap(Membership::single("a", "x"));
        core.bootstrap(Membership::single("b", "y"));
        assert!(core.membership().contains("a"));
        assert_eq!(core.last_index(), 1);
    }

    #[test]
    fn election_timeout_triggers_campaign() {
        let mut core = RaftCore::new("solo", CoreConfig::default(), 3);
        core.bootstrap(Membership::single("solo", "x"));
        for _ in 0..CoreConfig::default().election_ticks * 2 {
            core.tick();
        }
        assert!(core.is_leader());
    }

    #[test]
    fn node_outside_membership_never_campaigns() {
        let mut core = RaftCore::new("waiting", CoreConfig::default(), 3);
        for _ in 0..100 {
            core.tick();
        }
        assert_eq!(core.role(), Role::Follower);
        assert_eq!(core.term(), 0);
    }

    #[test]
    fn three_nodes_replicate_and_commit() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        for id in ["n2", "n3"] {
            assert_eq!(net.node(id).leader_id().map(String::as_str), Some("n1"));
            assert_eq!(net.node(id).membership().voters.len(), 3);
        }

        let (_, index) = net.node("n1").propose(b"payload".to_vec()).unwrap();
        net.deliver();
        assert_eq!(net.node("n1").commit_index(), index);
        net.heartbeat("n1");
        for id in ["n2", "n3"] {
            assert_eq!(net.node(id).commit_index(), index);
            assert_eq!(command(net.node(id), index), Some(b"payload".to_vec()));
        }
    }

    #[test]
    fn followers_refuse_proposals_with_leader_hint() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        let err = net.node("n2").propose(b"x".to_vec()).unwrap_err();
        match err {
            ConsensusError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("n1")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn leader_without_quorum_cannot_commit() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        let before = net.node("n1").commit_index();
        net.partitioned.insert("n2".into());
        net.partitioned.insert("n3".into());
        net.node("n1").propose(b"lost".to_vec()).unwrap();
        net.deliver();
        assert_eq!(net.node("n1").commit_index(), before);
    }

    #[test]
    fn stale_candidate_does_not_win_votes() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        net.partitioned.insert("n3".into());
        net.node("n1").propose(b"a".to_vec()).unwrap();
        net.deliver();
        net.heartbeat("n1");
        net.partitioned.clear();

        // n3 missed an entry; its log is behind n2's.
        let n3_last = net.node("n3").last_index();
        let n2_last = net.node("n2").last_index();
        assert!(n3_last < n2_last);

        let (term, last_term) = (net.node("n3").term() + 5, net.node("n3").last_term());
        let n2 = net.node("n2");
        n2.election_elapsed = n2.config.election_ticks;
        n2.step(
            "n3",
            Message::RequestVote {
                term,
                last_log_index: n3_last,
                last_log_term: last_term,
            },
        );
        let replies = n2.take_messages();
        assert!(replies.iter().any(|out| matches!(
            out.message,
            Message::RequestVoteResponse { granted: false, .. }
        )));
    }

    #[test]
    fn live_leader_suppresses_disruptive_votes() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        let term = net.node("n2").term();
        net.node("n2").step(
            "n3",
            Message::RequestVote {
                term: term + 1,
                last_log_index: 100,
                last_log_term: 100,
            },
        );
        assert_eq!(net.node("n2").term(), term);
        assert!(net.node("n2").take_messages().is_empty());
    }

    #[test]
    fn conflicting_follower_entries_are_overwritten() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        let base = net.node("n1").last_index();
        let term = net.node("n1").term();

        // n3 holds an uncommitted entry from a leader that lost its term.
        net.node("n3").log.push(LogEntry {
            term: term - 1,
            index: base + 1,
            payload: EntryPayload::Command {
                data: b"stale".to_vec(),
            },
        });
        let (_, index) = net.node("n1").propose(b"fresh".to_vec()).unwrap();
        net.deliver();
        net.heartbeat("n1");
        assert_eq!(index, base + 1);
        assert_eq!(command(net.node("n3"), index), Some(b"fresh".to_vec()));
        assert_eq!(net.node("n3").commit_index(), index);
    }

    #[test]
    fn higher_term_forces_leader_to_step_down() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        let term = net.node("n1").term();
        net.node("n1").step(
            "n2",
            Message::AppendEntriesResponse {
                term: term + 1,
                success: false,
                match_index: 0,
                conflict_index: 0,
            },
        );
        assert_eq!(net.node("n1").role(), Role::Follower);
        assert_eq!(net.node("n1").term(), term + 1);
        assert!(net.node("n1").propose(b"x".to_vec()).is_err());
    }

    #[test]
    fn stale_term_messages_get_current_term_reply() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        let term = net.node("n2").term();
        net.node("n2").step(
            "n9",
            Message::AppendEntries {
                term: term - 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
            },
        );
        let replies = net.node("n2").take_messages();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message.term(), term);
        assert_eq!(net.node("n2").leader_id().map(String::as_str), Some("n1"));
    }

    #[test]
    fn membership_changes_one_server_at_a_time() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        let mut grown = net.node("n1").membership().clone();
        grown.voters.insert("n4".into(), "n4:7000".into());
        grown.voters.insert("n5".into(), "n5:7000".into());
        assert!(matches!(
            net.node("n1").propose_membership(grown),
            Err(ConsensusError::InvalidMembership(_))
        ));

        let mut plus_one = net.node("n1").membership().clone();
        plus_one.voters.insert("n4".into(), "n4:7000".into());
        net.partitioned.insert("n2".into());
        net.partitioned.insert("n3".into());
        net.node("n1").propose_membership(plus_one.clone()).unwrap();
        assert_eq!(net.node("n1").membership(), &plus_one);

        let mut again = plus_one.clone();
        again.voters.remove("n3");
        assert!(matches!(
            net.node("n1").propose_membership(again),
            Err(ConsensusError::ChangeInProgress)
        ));
    }

    #[test]
    fn new_member_catches_up_from_snapshot() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        for i in 0..5u8 {
            net.node("n1").propose(vec![i]).unwrap();
        }
        net.deliver();
        net.heartbeat("n1");
        let commit = net.node("n1").commit_index();
        net.node("n1").compact(commit, b"state".to_vec());
        assert_eq!(net.node("n1").snapshot_index(), commit);
        assert!(net.node("n1").entries_between(0, commit).is_empty());

        net.nodes.insert(
            "n4".into(),
            RaftCore::new("n4", CoreConfig::default(), 99),
        );
        let mut grown = net.node("n1").membership().clone();
        grown.voters.insert("n4".into(), "n4:7000".into());
        net.node("n1").propose_membership(grown).unwrap();
        net.deliver();
        net.heartbeat("n1");

        let n4 = net.node("n4");
        let received = n4.take_received_snapshot().expect("snapshot installed");
        assert_eq!(received.meta.last_index, commit);
        assert_eq!(received.data.as_slice(), b"state");
        assert_eq!(n4.membership().voters.len(), 4);
        assert_eq!(n4.commit_index(), net.node("n1").commit_index());
    }

    #[test]
    fn removed_leader_steps_down_after_commit() {
        let mut net = Net::elect(&["n1", "n2", "n3"]);
        let mut shrunk = net.node("n1").membership().clone();
        shrunk.voters.remove("n1");
        net.node("n1").propose_membership(shrunk).unwrap();
        net.deliver();
        assert_eq!(net.node("n1").role(), Role::Follower);
        assert!(!net.node("n2").membership().contains("n1"));
    }

    #[test]
    fn restore_round_trips_persistent_state() {
        let mut core = RaftCore::new("solo", CoreConfig::default(), 1);
        core.bootstrap(Membership::single("solo", "x"));
        core.campaign();
        core.propose(b"one".to_vec()).unwrap();
        core.compact(2, b"snap".to_vec());
        let state = core.persistent_state();

        let restored = RaftCore::restore("solo", CoreConfig::default(), 2, state, Some(b"snap".to_vec()));
        assert_eq!(restored.term(), core.term());
        assert_eq!(restored.last_index(), 3);
        assert_eq!(restored.snapshot_index(), 2);
        assert_eq!(restored.commit_index(), 2);
        assert!(restored.membership().contains("solo"));
        assert_eq!(restored.role(), Role::Follower);
    }
}
