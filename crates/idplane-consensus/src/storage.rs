//! On-disk persistence for one consensus node.
//!
//! `raft.db` holds the hard state, the snapshot metadata and the log suffix as
//! a single JSON document rewritten atomically. Snapshot bytes live next to it
//! in `snapshots/<term>-<index>.snap`.
use crate::error::{ConsensusError, Result};
use crate::protocol::PersistentState;
use crate::types::SnapshotMeta;
use idplane_storage::{DEFAULT_FILE_MODE, atomic_write, read_optional};
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "raft.db";
const SNAPSHOT_DIR: &str = "snapshots";

#[derive(Debug, Clone)]
pub struct FileLogStore {
    dir: PathBuf,
}

impl FileLogStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(SNAPSHOT_DIR))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn has_state(&self) -> bool {
        self.dir.join(STATE_FILE).exists()
    }

    /// Load the persisted state and the bytes of its snapshot. `Ok(None)` means
    /// this node has never written state.
    pub fn load(&self) -> Result<Option<(PersistentState, Option<Vec<u8>>)>> {
        let Some(raw) = read_optional(&self.dir.join(STATE_FILE))? else {
            return Ok(None);
        };
        let state: PersistentState = serde_json::from_slice(&raw)?;
        let data = match &state.snapshot {
            Some(meta) => {
                let path = self.snapshot_path(meta);
                let bytes = read_optional(&path)?.ok_or_else(|| {
                    ConsensusError::Codec(format!("missing snapshot file {}", path.display()))
                })?;
                Some(bytes)
            }
            None => None,
        };
        Ok(Some((state, data)))
    }

    pub fn save_state(&self, state: &PersistentState) -> Result<()> {
        let encoded = serde_json::to_vec(state)?;
        atomic_write(&self.dir.join(STATE_FILE), &encoded, DEFAULT_FILE_MODE)?;
        Ok(())
    }

    /// Write snapshot bytes. Older snapshots stay until [`Self::prune_snapshots`]
    /// runs, so `raft.db` never points at a missing file.
    pub fn save_snapshot(&self, meta: &SnapshotMeta, data: &[u8]) -> Result<()> {
        atomic_write(&self.snapshot_path(meta), data, DEFAULT_FILE_MODE)?;
        Ok(())
    }

    /// Remove every snapshot file except the one described by `keep`.
    pub fn prune_snapshots(&self, keep: &SnapshotMeta) -> Result<()> {
        let keep = self.snapshot_path(keep);
        for entry in fs::read_dir(self.dir.join(SNAPSHOT_DIR))? {
            let path = entry?.path();
            if path != keep
                && let Err(err) = fs::remove_file(&path)
            {
                tracing::warn!(path = %path.display(), error = %err, "failed to prune snapshot");
            }
        }
        Ok(())
    }

    fn snapshot_path(&self, meta: &SnapshotMeta) -> PathBuf {
        self.dir
            .join(SNAPSHOT_DIR)
            .join(format!("{:020}-{:020}.snap", meta.last_term, meta.last_index))
    }
}
