#![allow(dead_code)]

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use controlplane::cluster::{Applier, LocalCluster};
use controlplane::keys::JwksCache;
use controlplane::service::ControlPlaneService;
use controlplane::store::fs::FsConnection;
use controlplane::store::noop::NoopConnection;
use controlplane::store::{AdapterConfig, Connection, DataAccess};
use idplane_crypto::{SigningMasterKey, secretbox};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const SIGNING_KEY_BYTES: [u8; 32] = [21u8; 32];

pub fn init_secretbox() {
    secretbox::load_master_key(&STANDARD.encode([5u8; 32])).expect("secretbox key");
}

pub fn adapter_config(root: &Path) -> AdapterConfig {
    AdapterConfig {
        fs_root: root.to_path_buf(),
        signing_master_key: Some(SigningMasterKey::from_bytes(SIGNING_KEY_BYTES)),
        ..AdapterConfig::default()
    }
}

/// A single-node service over `root` with `data` as its data plane.
pub fn single_node(root: &Path, data: Arc<dyn Connection>) -> ControlPlaneService {
    init_secretbox();
    let config = adapter_config(root);
    let dal = DataAccess::new(
        Arc::new(FsConnection::open(&config).expect("fs connection")),
        data,
    );
    let jwks = Arc::new(JwksCache::new(Duration::from_secs(60)));
    let applier = Applier::from_dal(&dal, jwks.clone()).expect("applier");
    let cluster = Arc::new(LocalCluster::new("solo", Arc::new(applier)));
    ControlPlaneService::new(dal, cluster, jwks)
}

pub fn control_only(root: &Path) -> ControlPlaneService {
    single_node(root, Arc::new(NoopConnection::new()))
}

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

pub async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
