use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type NodeId = String;
pub type Term = u64;
pub type LogIndex = u64;

/// The voting configuration: node id -> advertised address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub voters: BTreeMap<NodeId, String>,
}

impl Membership {
    pub fn single(id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        let mut voters = BTreeMap::new();
        voters.insert(id.into(), addr.into());
        Self { voters }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.voters.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }

    /// Number of votes needed for a majority.
    pub fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryPayload {
    /// Appended by a new leader to commit entries from earlier terms.
    Blank,
    Command {
        #[serde(with = "crate::message::base64_bytes")]
        data: Vec<u8>,
    },
    Membership { membership: Membership },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub payload: EntryPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub membership: Membership,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftStats {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
    pub last_log_index: LogIndex,
    pub peer_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_a_strict_majority() {
        let mut membership = Membership::single("a", "x");
        assert_eq!(membership.quorum(), 1);
        membership.voters.insert("b".into(), "y".into());
        assert_eq!(membership.quorum(), 2);
        membership.voters.insert("c".into(), "z".into());
        assert_eq!(membership.quorum(), 2);
    }

    #[test]
    fn command_payload_serializes_as_base64() {
        let entry = LogEntry {
            term: 2,
            index: 7,
            payload: EntryPayload::Command {
                data: b"{}".to_vec(),
            },
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"kind\":\"command\""));
        assert!(json.contains("\"data\":\"e30=\""));
        let decoded: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, entry);
    }
}
