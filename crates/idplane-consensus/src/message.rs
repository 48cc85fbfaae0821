//! Peer-to-peer messages and their on-wire framing.
//!
//! Every frame is a 12-byte header (magic, version, flags, payload length,
//! network byte order) followed by a JSON-encoded [`Envelope`].
use crate::error::{ConsensusError, Result};
use crate::types::{LogEntry, LogIndex, NodeId, SnapshotMeta, Term};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: u32 = 0x4944_5052;
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 12;
/// Snapshots travel in a single frame, so the cap is generous.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    RequestVote {
        term: Term,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    RequestVoteResponse {
        term: Term,
        granted: bool,
    },
    AppendEntries {
        term: Term,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    AppendEntriesResponse {
        term: Term,
        success: bool,
        /// Highest index known to match the leader on success.
        match_index: LogIndex,
        /// On rejection, the index the leader should retry from.
        conflict_index: LogIndex,
    },
    InstallSnapshot {
        term: Term,
        meta: SnapshotMeta,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    InstallSnapshotResponse {
        term: Term,
        last_index: LogIndex,
    },
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote { term, .. }
            | Message::RequestVoteResponse { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendEntriesResponse { term, .. }
            | Message::InstallSnapshot { term, .. }
            | Message::InstallSnapshotResponse { term, .. } => *term,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote { .. } => "request_vote",
            Message::RequestVoteResponse { .. } => "request_vote_response",
            Message::AppendEntries { .. } => "append_entries",
            Message::AppendEntriesResponse { .. } => "append_entries_response",
            Message::InstallSnapshot { .. } => "install_snapshot",
            Message::InstallSnapshotResponse { .. } => "install_snapshot_response",
        }
    }
}

/// A message addressed between two nodes. `from_addr` lets the receiver reply
/// before it has learned the sender's address from the membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub from_addr: String,
    pub to: NodeId,
    pub message: Message,
}

pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(envelope)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ConsensusError::Codec(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&MAGIC.to_be_bytes());
    buf.extend_from_slice(&VERSION.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != MAGIC {
        return Err(ConsensusError::Codec("invalid magic number".into()));
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(ConsensusError::Codec(format!("unsupported version {version}")));
    }
    let length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if length > MAX_FRAME_LEN {
        return Err(ConsensusError::Codec("frame too large".into()));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

pub(crate) mod base64_bytes {
    use base64::Engine;
    use serde::Deserialize;
    use serde::de::Error;

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntryPayload, Membership};

    fn sample() -> Envelope {
        Envelope {
            from: "n1".into(),
            from_addr: "127.0.0.1:7001".into(),
            to: "n2".into(),
            message: Message::AppendEntries {
                term: 3,
                prev_log_index: 4,
                prev_log_term: 2,
                entries: vec![LogEntry {
                    term: 3,
                    index: 5,
                    payload: EntryPayload::Membership {
                        membership: Membership::single("n1", "127.0.0.1:7001"),
                    },
                }],
                leader_commit: 4,
            },
        }
    }

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let envelope = sample();
        write_frame(&mut client, &envelope).await.unwrap();
        drop(client);
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(envelope));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_invalid_magic() {
        let mut frame = encode_frame(&sample()).unwrap();
        frame[0] ^= 0xFF;
        let mut reader = frame.as_slice();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, ConsensusError::Codec(_)));
    }

    #[tokio::test]
    async fn rejects_oversized_length() {
        let mut frame = encode_frame(&sample()).unwrap();
        frame[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        let mut reader = frame.as_slice();
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[test]
    fn snapshot_data_is_base64_on_the_wire() {
        let message = Message::InstallSnapshot {
            term: 1,
            meta: SnapshotMeta::default(),
            data: vec![0, 1, 2],
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"data\":\"AAEC\""));
        assert_eq!(message.kind(), "install_snapshot");
        assert_eq!(message.term(), 1);
    }
}
