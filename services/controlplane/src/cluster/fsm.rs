//! Replicated state machine over the filesystem store.
//!
//! # Purpose
//! Feeds committed log entries to the [`Applier`] and implements snapshot and
//! restore of the replicated trees (`tenants/` and `keys/`).
//!
//! # Key invariants
//! - Snapshots are deterministic tar+gzip streams of exactly those two trees.
//! - Restore never extracts outside them: entries are unpacked into a staging
//!   directory with confined paths, then swapped in under the store's write
//!   lock, keeping the previous tree as `.bak` until both swaps succeed.
//!
//! # Notes
//! `admins/` is node-local and never part of a snapshot.
use super::applier::Applier;
use super::mutation::Mutation;
use crate::store::fs::{FsStore, KEYS_DIR, TENANTS_DIR};
use async_trait::async_trait;
use idplane_consensus::{BoxError, LogIndex, SnapshotSink, StateMachine};
use idplane_storage::{pack, unpack_confined};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SNAPSHOT_SUBTREES: [&str; 2] = [TENANTS_DIR, KEYS_DIR];

const STAGING_DIR: &str = ".restore-staging";

pub struct ControlPlaneFsm {
    applier: Applier,
    store: Arc<FsStore>,
}

impl ControlPlaneFsm {
    pub fn new(applier: Applier, store: Arc<FsStore>) -> Self {
        Self { applier, store }
    }

    pub fn applier(&self) -> &Applier {
        &self.applier
    }

    fn root(&self) -> &Path {
        self.store.root()
    }

    fn invalidate_caches(&self) {
        let jwks = self.applier.jwks();
        jwks.invalidate_all();
        let tenants = self.root().join(TENANTS_DIR);
        if let Ok(entries) = fs::read_dir(&tenants) {
            for entry in entries.flatten() {
                if let Some(slug) = entry.file_name().to_str() {
                    jwks.invalidate(slug);
                }
            }
        }
    }
}

#[async_trait]
impl StateMachine for ControlPlaneFsm {
    async fn apply(&self, index: LogIndex, command: &[u8]) -> Result<(), BoxError> {
        let mutation = Mutation::decode(command)?;
        self.applier.apply(index, &mutation).await?;
        Ok(())
    }

    fn persist(&self, sink: &mut dyn SnapshotSink) -> Result<(), BoxError> {
        let result = {
            let _guard = self.store.read_guard();
            pack(self.root(), &SNAPSHOT_SUBTREES, &mut *sink).map(|_| ())
        };
        if let Err(err) = result {
            sink.cancel();
            tracing::error!(error = %err, "snapshot failed");
            return Err(err.into());
        }
        tracing::info!(root = %self.root().display(), "snapshot written");
        Ok(())
    }

    fn restore(&self, snapshot: &[u8]) -> Result<(), BoxError> {
        let root = self.root().to_path_buf();
        let staging = root.join(STAGING_DIR);
        remove_dir_if_exists(&staging)?;

        // Step 1: unpack into staging; entries outside the subtrees are dropped.
        let report = match unpack_confined(snapshot, &staging, &SNAPSHOT_SUBTREES) {
            Ok(report) => report,
            Err(err) => {
                let _ = remove_dir_if_exists(&staging);
                return Err(err.into());
            }
        };
        if report.skipped > 0 {
            tracing::warn!(skipped = report.skipped, "snapshot contained entries outside the replicated trees");
        }

        // Step 2: swap the staged trees in while no reader or writer runs.
        let swapped = {
            let _guard = self.store.write_guard();
            swap_in(&root, &staging)
        };
        let cleanup = remove_dir_if_exists(&staging);
        swapped?;
        if let Err(err) = cleanup {
            tracing::warn!(error = %err, "failed to remove restore staging directory");
        }

        // Step 3: nothing cached before the restore is valid any more.
        self.invalidate_caches();
        tracing::info!(files = report.files, dirs = report.dirs, "snapshot restored");
        Ok(())
    }
}

fn backup_path(root: &Path, subtree: &str) -> PathBuf {
    root.join(format!(".{subtree}.bak"))
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn swap_in(root: &Path, staging: &Path) -> io::Result<()> {
    let mut swapped: Vec<&str> = Vec::with_capacity(SNAPSHOT_SUBTREES.len());
    for subtree in SNAPSHOT_SUBTREES {
        if let Err(err) = swap_one(root, staging, subtree) {
            for done in swapped.iter().rev() {
                if let Err(rollback) = roll_back(root, done) {
                    tracing::error!(subtree = done, error = %rollback, "restore rollback failed");
                }
            }
            return Err(err);
        }
        swapped.push(subtree);
    }
    for subtree in swapped {
        remove_dir_if_exists(&backup_path(root, subtree))?;
    }
    Ok(())
}

fn swap_one(root: &Path, staging: &Path, subtree: &str) -> io::Result<()> {
    let current = root.join(subtree);
    let backup = backup_path(root, subtree);
    let staged = staging.join(subtree);
    // A snapshot of an empty tree carries no entry for it.
    fs::create_dir_all(&staged)?;
    remove_dir_if_exists(&backup)?;

    let had_current = current.exists();
    if had_current {
        fs::rename(&current, &backup)?;
    }
    if let Err(err) = fs::rename(&staged, &current) {
        if had_current {
            fs::rename(&backup, &current)?;
        }
        return Err(err);
    }
    Ok(())
}

fn roll_back(root: &Path, subtree: &str) -> io::Result<()> {
    let current = root.join(subtree);
    let backup = backup_path(root, subtree);
    remove_dir_if_exists(&current)?;
    if backup.exists() {
        fs::rename(&backup, &current)?;
    } else {
        fs::create_dir_all(&current)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::mutation::MutationType;
    use crate::keys::{JwksCache, KeyStore};
    use crate::model::{ClientType, OidcClient, Scope, Tenant, TenantSettings};
    use crate::store::{ClientRepository, ScopeRepository, TenantRepository};
    use chrono::{TimeZone, Utc};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use idplane_consensus::MemorySnapshotSink;
    use idplane_crypto::SigningMasterKey;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn node(root: &Path) -> ControlPlaneFsm {
        let store = Arc::new(FsStore::open(root).unwrap());
        let keys = KeyStore::new(root.join(KEYS_DIR), Some(SigningMasterKey::from_bytes([9u8; 32])));
        let applier = Applier::new(
            store.clone(),
            store.clone(),
            store.clone(),
            keys,
            Arc::new(JwksCache::new(Duration::from_secs(60))),
        );
        ControlPlaneFsm::new(applier, store)
    }

    fn seed_commands() -> Vec<Vec<u8>> {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let tenant = Tenant {
            id: "t-acme".into(),
            slug: "acme".into(),
            name: "Acme Inc".into(),
            language: "en".into(),
            settings: TenantSettings::default(),
            created_at: at,
            updated_at: at,
        };
        let scope = Scope {
            name: "read:reports".into(),
            description: "Read reports".into(),
            display_name: None,
            claims: Vec::new(),
            depends_on: Vec::new(),
            system: false,
        };
        let client = OidcClient {
            client_id: "web".into(),
            name: "Web".into(),
            client_type: ClientType::Public,
            redirect_uris: vec!["https://app.example.com/cb".into()],
            allowed_origins: Vec::new(),
            providers: Vec::new(),
            scopes: vec!["openid".into()],
            secret: String::new(),
            secret_enc: String::new(),
            require_email_verification: true,
            reset_password_url: None,
            verify_email_url: None,
            claim_schema: None,
            claim_mapping: BTreeMap::new(),
        };
        [
            Mutation::tenant_upsert(MutationType::TenantCreate, &tenant, at).unwrap(),
            Mutation::scope_create("acme", &scope, at).unwrap(),
            Mutation::client_upsert(MutationType::ClientCreate, "acme", &client, at).unwrap(),
        ]
        .iter()
        .map(|m| m.encode().unwrap())
        .collect()
    }

    fn tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        fn walk(base: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
            for entry in fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(base, &path, out);
                } else {
                    let rel = path.strip_prefix(base).unwrap().to_string_lossy().into_owned();
                    out.insert(rel, fs::read(&path).unwrap());
                }
            }
        }
        let mut out = BTreeMap::new();
        for subtree in SNAPSHOT_SUBTREES {
            let dir = root.join(subtree);
            if dir.exists() {
                walk(root, &dir, &mut out);
            }
        }
        out
    }

    fn snapshot(fsm: &ControlPlaneFsm) -> Vec<u8> {
        let mut sink = MemorySnapshotSink::new();
        fsm.persist(&mut sink).unwrap();
        sink.into_bytes().unwrap()
    }

    #[tokio::test]
    async fn snapshot_restores_on_an_empty_node() {
        let (a_dir, b_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let a = node(a_dir.path());
        for (index, command) in seed_commands().iter().enumerate() {
            a.apply(index as u64 + 1, command).await.unwrap();
        }
        a.applier().keys().rotate("acme", 60).unwrap();

        let b = node(b_dir.path());
        b.restore(&snapshot(&a)).unwrap();

        assert_eq!(tree(a_dir.path()), tree(b_dir.path()));
        let store_a = FsStore::open(a_dir.path()).unwrap();
        let store_b = FsStore::open(b_dir.path()).unwrap();
        assert_eq!(
            TenantRepository::get_by_slug(&store_a, "acme").await.unwrap(),
            TenantRepository::get_by_slug(&store_b, "acme").await.unwrap()
        );
        assert_eq!(
            ClientRepository::list(&store_a, "acme").await.unwrap(),
            ClientRepository::list(&store_b, "acme").await.unwrap()
        );
        assert_eq!(ScopeRepository::list(&store_b, "acme").await.unwrap().len(), 7);
        assert!(!b_dir.path().join(STAGING_DIR).exists());
        assert!(!backup_path(b_dir.path(), TENANTS_DIR).exists());
    }

    #[tokio::test]
    async fn restore_replaces_existing_state() {
        let (a_dir, b_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let a = node(a_dir.path());
        let b = node(b_dir.path());
        let commands = seed_commands();
        a.apply(1, &commands[0]).await.unwrap();
        for (index, command) in commands.iter().enumerate() {
            b.apply(index as u64 + 1, command).await.unwrap();
        }
        fs::write(b_dir.path().join("tenants/stray.txt"), b"left over").unwrap();

        b.restore(&snapshot(&a)).unwrap();
        assert_eq!(tree(a_dir.path()), tree(b_dir.path()));
    }

    #[tokio::test]
    async fn two_snapshots_of_the_same_state_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = node(dir.path());
        for (index, command) in seed_commands().iter().enumerate() {
            fsm.apply(index as u64 + 1, command).await.unwrap();
        }
        assert_eq!(snapshot(&fsm), snapshot(&fsm));
    }

    #[test]
    fn restore_ignores_entries_outside_the_replicated_trees() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, data) in [
            ("tenants/acme/tenant.yaml", &b"id: t1\nslug: acme\nname: Acme\ncreatedAt: 2024-01-01T00:00:00Z\nupdatedAt: 2024-01-01T00:00:00Z\n"[..]),
            ("admins/admins.yaml", &b"- evil\n"[..]),
            ("raft/raft.db", &b"junk"[..]),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, data).unwrap();
        }
        let archive = builder.into_inner().unwrap().finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let fsm = node(dir.path());
        fsm.restore(&archive).unwrap();
        assert!(dir.path().join("tenants/acme/tenant.yaml").is_file());
        assert!(!dir.path().join("admins/admins.yaml").exists());
        assert!(!dir.path().join("raft").exists());
        assert!(dir.path().join(KEYS_DIR).is_dir());
    }

    #[test]
    fn corrupt_snapshots_leave_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = node(dir.path());
        fs::create_dir_all(dir.path().join("tenants/acme")).unwrap();
        fs::write(dir.path().join("tenants/acme/tenant.yaml"), b"kept").unwrap();
        assert!(fsm.restore(b"definitely not gzip").is_err());
        assert!(!dir.path().join(STAGING_DIR).exists());
        assert_eq!(fs::read(dir.path().join("tenants/acme/tenant.yaml")).unwrap(), b"kept");
    }

    #[tokio::test]
    async fn restore_invalidates_jwks() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = node(dir.path());
        fsm.apply(1, &seed_commands()[0]).await.unwrap();
        fsm.applier()
            .jwks()
            .get_or_load("acme", || Ok(crate::keys::Jwks::default()))
            .unwrap();
        let bytes = snapshot(&fsm);
        fsm.restore(&bytes).unwrap();
        assert!(fsm.applier().jwks().is_empty());
    }
}
