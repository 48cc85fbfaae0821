use crate::error::BoxError;
use crate::types::LogIndex;
use async_trait::async_trait;
use std::io::{self, Write};

/// Destination for a state machine snapshot.
pub trait SnapshotSink: Write + Send {
    /// Abandon the snapshot; anything written so far is discarded.
    fn cancel(&mut self);
}

/// The replicated application. Every node applies the same committed commands
/// in the same order, so `apply` must be deterministic.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    async fn apply(&self, index: LogIndex, command: &[u8]) -> Result<(), BoxError>;

    /// Serialize the full state into `sink`. Implementations cancel the sink
    /// on failure.
    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), BoxError>;

    /// Replace the full state with a snapshot produced by `persist`.
    fn restore(&self, snapshot: &[u8]) -> Result<(), BoxError>;
}

/// In-memory sink used by the node when taking snapshots.
#[derive(Debug, Default)]
pub struct MemorySnapshotSink {
    buf: Vec<u8>,
    cancelled: bool,
}

impl MemorySnapshotSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The written bytes, or `None` when the sink was cancelled.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        (!self.cancelled).then_some(self.buf)
    }
}

impl Write for MemorySnapshotSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.cancelled {
            return Err(io::Error::other("snapshot sink cancelled"));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SnapshotSink for MemorySnapshotSink {
    fn cancel(&mut self) {
        self.cancelled = true;
        self.buf.clear();
    }
}
