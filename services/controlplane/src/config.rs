//! Control-plane configuration.
//!
//! # Purpose
//! Reads the process configuration from environment variables, then applies
//! optional overrides from the YAML file named by `CONTROL_PLANE_CONFIG`.
//!
//! # Notes
//! `SECRETBOX_MASTER_KEY` is not held here; the process-wide secretbox reads
//! it directly at start-up. The signing master key is parsed here so a bad
//! value fails before anything is opened.
use crate::keys::MAX_GRACE_SECONDS;
use crate::store::AdapterConfig;
use anyhow::{Context, Result, bail};
use idplane_consensus::{RaftConfig, TlsSettings};
use idplane_crypto::SigningMasterKey;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub fs_root: PathBuf,
    /// Health, JWKS and metrics listener.
    pub bind_addr: SocketAddr,
    pub signing_master_key: Option<SigningMasterKey>,
    pub data_plane: DataPlaneConfig,
    pub migrations_dir: PathBuf,
    pub migration_lock_timeout: Duration,
    pub jwks_cache_ttl: Duration,
    pub key_rotation_grace_secs: u64,
    pub cleanup_interval: Duration,
    /// `None` runs a single node without consensus.
    pub cluster: Option<ClusterConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPlaneConfig {
    /// Adapter name: `postgres` or `noop`.
    pub driver: String,
    pub dsn: Option<String>,
    pub schema: Option<String>,
    pub max_open: u32,
    pub max_idle: u32,
    pub conn_max_lifetime: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub node_id: String,
    pub raft_addr: String,
    pub peers: BTreeMap<String, String>,
    pub bootstrap_preferred: bool,
    pub apply_timeout: Duration,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub server_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ControlPlaneConfigOverride {
    fs_root: Option<PathBuf>,
    bind_addr: Option<String>,
    data_plane_driver: Option<String>,
    data_plane_schema: Option<String>,
    migrations_dir: Option<PathBuf>,
    jwks_cache_ttl_secs: Option<u64>,
    key_rotation_grace_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    cluster: Option<ClusterOverride>,
}

#[derive(Debug, Default, Deserialize)]
struct ClusterOverride {
    enabled: Option<bool>,
    node_id: Option<String>,
    raft_addr: Option<String>,
    peers: Option<BTreeMap<String, String>>,
    bootstrap_preferred: Option<bool>,
    tls: Option<TlsConfig>,
}

fn parse_or<T>(vars: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match vars(key).filter(|v| !v.trim().is_empty()) {
        Some(value) => value.trim().parse().with_context(|| format!("parse {key}")),
        None => Ok(default),
    }
}

fn parse_bool(vars: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match vars(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if v.is_empty() || v == "0" || v == "false" || v == "no" => Ok(false),
        Some(v) if v == "1" || v == "true" || v == "yes" => Ok(true),
        Some(v) => bail!("parse {key}: {v:?} is not a boolean"),
    }
}

/// `id=addr,id=addr`
fn parse_peers(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut peers = BTreeMap::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (id, addr) = item
            .split_once('=')
            .with_context(|| format!("parse RAFT_PEERS entry {item:?}: expected id=addr"))?;
        let (id, addr) = (id.trim(), addr.trim());
        if id.is_empty() || addr.is_empty() {
            bail!("parse RAFT_PEERS entry {item:?}: empty id or address");
        }
        peers.insert(id.to_string(), addr.to_string());
    }
    Ok(peers)
}

impl ControlPlaneConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(vars: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| vars(key).filter(|v| !v.trim().is_empty());

        let signing_master_key = match non_empty("SIGNING_MASTER_KEY") {
            Some(value) => Some(SigningMasterKey::parse(&value).context("parse SIGNING_MASTER_KEY")?),
            None => None,
        };

        let data_plane = DataPlaneConfig {
            driver: non_empty("DATA_PLANE_DRIVER").unwrap_or_else(|| "noop".to_string()),
            dsn: non_empty("DATA_PLANE_DSN"),
            schema: non_empty("DATA_PLANE_SCHEMA"),
            max_open: parse_or(&vars, "DB_MAX_OPEN", 10)?,
            max_idle: parse_or(&vars, "DB_MAX_IDLE", 2)?,
            conn_max_lifetime: Duration::from_secs(parse_or(&vars, "DB_CONN_MAX_LIFETIME_SECS", 1800)?),
        };

        let cluster = if parse_bool(&vars, "CLUSTER_ENABLED")? {
            let tls = match (
                non_empty("RAFT_TLS_CERT"),
                non_empty("RAFT_TLS_KEY"),
                non_empty("RAFT_TLS_CA"),
            ) {
                (Some(cert), Some(key), Some(ca)) => Some(TlsConfig {
                    cert_path: cert.into(),
                    key_path: key.into(),
                    ca_path: ca.into(),
                    server_name: non_empty("RAFT_TLS_SERVER_NAME")
                        .unwrap_or_else(|| "controlplane".to_string()),
                }),
                (None, None, None) => None,
                _ => bail!("RAFT_TLS_CERT, RAFT_TLS_KEY and RAFT_TLS_CA must be set together"),
            };
            Some(ClusterConfig {
                node_id: non_empty("NODE_ID").context("NODE_ID is required when CLUSTER_ENABLED")?,
                raft_addr: non_empty("RAFT_ADDR").unwrap_or_else(|| "127.0.0.1:7000".to_string()),
                peers: parse_peers(&non_empty("RAFT_PEERS").unwrap_or_default())?,
                bootstrap_preferred: parse_bool(&vars, "RAFT_BOOTSTRAP_PREFERRED")?,
                apply_timeout: Duration::from_millis(parse_or(&vars, "RAFT_APPLY_TIMEOUT_MS", 5000)?),
                tls,
            })
        } else {
            None
        };

        let config = Self {
            fs_root: non_empty("CONTROL_PLANE_FS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            bind_addr: parse_or(&vars, "CONTROL_PLANE_BIND", "0.0.0.0:8080".parse()?)?,
            signing_master_key,
            data_plane,
            migrations_dir: non_empty("TENANT_MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("migrations/tenant")),
            migration_lock_timeout: Duration::from_secs(parse_or(&vars, "MIGRATION_LOCK_TIMEOUT_SECS", 30)?),
            jwks_cache_ttl: Duration::from_secs(parse_or(&vars, "JWKS_CACHE_TTL_SECS", 60)?),
            key_rotation_grace_secs: parse_or(&vars, "KEY_ROTATION_GRACE_SECS", 86_400)?,
            cleanup_interval: Duration::from_secs(parse_or(&vars, "CLEANUP_INTERVAL_SECS", 300)?),
            cluster,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.key_rotation_grace_secs > MAX_GRACE_SECONDS {
            bail!(
                "KEY_ROTATION_GRACE_SECS {} exceeds {MAX_GRACE_SECONDS}",
                self.key_rotation_grace_secs
            );
        }
        Ok(())
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("CONTROL_PLANE_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read CONTROL_PLANE_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let overrides: ControlPlaneConfigOverride =
            serde_yaml::from_str(contents).context("parse control plane config yaml")?;
        if let Some(value) = overrides.fs_root {
            self.fs_root = value;
        }
        if let Some(value) = overrides.bind_addr {
            self.bind_addr = value.parse().context("parse bind_addr")?;
        }
        if let Some(value) = overrides.data_plane_driver {
            self.data_plane.driver = value;
        }
        if let Some(value) = overrides.data_plane_schema {
            self.data_plane.schema = Some(value);
        }
        if let Some(value) = overrides.migrations_dir {
            self.migrations_dir = value;
        }
        if let Some(value) = overrides.jwks_cache_ttl_secs {
            self.jwks_cache_ttl = Duration::from_secs(value);
        }
        if let Some(value) = overrides.key_rotation_grace_secs {
            self.key_rotation_grace_secs = value;
        }
        if let Some(value) = overrides.cleanup_interval_secs {
            self.cleanup_interval = Duration::from_secs(value);
        }
        if let Some(cluster) = overrides.cluster {
            self.apply_cluster_override(cluster)?;
        }
        self.validate()
    }

    fn apply_cluster_override(&mut self, cluster: ClusterOverride) -> Result<()> {
        if cluster.enabled == Some(false) {
            self.cluster = None;
            return Ok(());
        }
        let current = match self.cluster.take() {
            Some(current) => current,
            None if cluster.enabled == Some(true) => ClusterConfig {
                node_id: cluster
                    .node_id
                    .clone()
                    .context("cluster.node_id is required when enabling the cluster")?,
                raft_addr: "127.0.0.1:7000".to_string(),
                peers: BTreeMap::new(),
                bootstrap_preferred: false,
                apply_timeout: Duration::from_millis(5000),
                tls: None,
            },
            None => return Ok(()),
        };
        let mut next = current;
        if let Some(value) = cluster.node_id {
            next.node_id = value;
        }
        if let Some(value) = cluster.raft_addr {
            next.raft_addr = value;
        }
        if let Some(value) = cluster.peers {
            next.peers = value;
        }
        if let Some(value) = cluster.bootstrap_preferred {
            next.bootstrap_preferred = value;
        }
        if let Some(value) = cluster.tls {
            next.tls = Some(value);
        }
        self.cluster = Some(next);
        Ok(())
    }

    /// Adapter settings shared by the control-plane and data-plane
    /// connections.
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            dsn: self.data_plane.dsn.clone(),
            schema: self.data_plane.schema.clone(),
            fs_root: self.fs_root.clone(),
            max_open: self.data_plane.max_open,
            max_idle: self.data_plane.max_idle,
            conn_max_lifetime: self.data_plane.conn_max_lifetime,
            signing_master_key: self.signing_master_key.clone(),
            migrations_dir: self.migrations_dir.clone(),
            lock_timeout: self.migration_lock_timeout,
        }
    }
}

impl ClusterConfig {
    /// Consensus settings with the log under `<fs_root>/raft`.
    pub fn raft_config(&self, fs_root: &std::path::Path) -> RaftConfig {
        RaftConfig {
            node_id: self.node_id.clone(),
            raft_addr: self.raft_addr.clone(),
            peers: self.peers.clone(),
            bootstrap_preferred: self.bootstrap_preferred,
            data_dir: fs_root.join("raft"),
            apply_timeout: self.apply_timeout,
            tls: self.tls.as_ref().map(|tls| TlsSettings {
                cert_path: tls.cert_path.clone(),
                key_path: tls.key_path.clone(),
                ca_path: tls.ca_path.clone(),
                server_name: tls.server_name.clone(),
            }),
            ..RaftConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = ControlPlaneConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config.fs_root, PathBuf::from("./data"));
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.data_plane.driver, "noop");
        assert_eq!(config.data_plane.max_open, 10);
        assert_eq!(config.data_plane.max_idle, 2);
        assert_eq!(config.migration_lock_timeout, Duration::from_secs(30));
        assert_eq!(config.jwks_cache_ttl, Duration::from_secs(60));
        assert_eq!(config.key_rotation_grace_secs, 86_400);
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert!(config.signing_master_key.is_none());
        assert!(config.cluster.is_none());
    }

    #[test]
    fn cluster_settings_are_parsed() {
        let config = ControlPlaneConfig::from_vars(vars(&[
            ("CLUSTER_ENABLED", "true"),
            ("NODE_ID", "n1"),
            ("RAFT_ADDR", "10.0.0.1:7000"),
            ("RAFT_PEERS", "n2=10.0.0.2:7000, n3=10.0.0.3:7000"),
            ("RAFT_APPLY_TIMEOUT_MS", "2500"),
            ("RAFT_TLS_CERT", "/tls/node.pem"),
            ("RAFT_TLS_KEY", "/tls/node.key"),
            ("RAFT_TLS_CA", "/tls/ca.pem"),
        ]))
        .unwrap();
        let cluster = config.cluster.clone().unwrap();
        assert_eq!(cluster.node_id, "n1");
        assert_eq!(cluster.peers.len(), 2);
        assert_eq!(cluster.peers["n3"], "10.0.0.3:7000");
        assert_eq!(cluster.tls.as_ref().unwrap().server_name, "controlplane");

        let raft = cluster.raft_config(&config.fs_root);
        assert_eq!(raft.data_dir, PathBuf::from("./data/raft"));
        assert_eq!(raft.apply_timeout, Duration::from_millis(2500));
        assert!(raft.tls.is_some());
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = ControlPlaneConfig::from_vars(vars(&[("DB_MAX_OPEN", "many")])).unwrap_err();
        assert!(err.to_string().contains("DB_MAX_OPEN"));
        assert!(ControlPlaneConfig::from_vars(vars(&[("CLUSTER_ENABLED", "true")])).is_err());
        assert!(
            ControlPlaneConfig::from_vars(vars(&[
                ("CLUSTER_ENABLED", "1"),
                ("NODE_ID", "n1"),
                ("RAFT_TLS_CERT", "/tls/node.pem"),
            ]))
            .is_err()
        );
        assert!(parse_peers("n2").is_err());
        assert!(ControlPlaneConfig::from_vars(vars(&[("SIGNING_MASTER_KEY", "short")])).is_err());
        let err = ControlPlaneConfig::from_vars(vars(&[(
            "KEY_ROTATION_GRACE_SECS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("KEY_ROTATION_GRACE_SECS"));
    }

    #[test]
    fn signing_master_key_accepts_hex() {
        let hex_key = "00".repeat(32);
        let config =
            ControlPlaneConfig::from_vars(vars(&[("SIGNING_MASTER_KEY", &hex_key)])).unwrap();
        assert!(config.signing_master_key.is_some());
        assert!(config.adapter_config().signing_master_key.is_some());
    }

    #[test]
    fn yaml_overrides_env() {
        let mut config = ControlPlaneConfig::from_vars(vars(&[])).unwrap();
        config
            .apply_yaml(
                r#"
fs_root: /var/lib/idplane
bind_addr: 127.0.0.1:9090
jwks_cache_ttl_secs: 5
cluster:
  enabled: true
  node_id: n1
  peers:
    n2: 10.0.0.2:7000
"#,
            )
            .unwrap();
        assert_eq!(config.fs_root, PathBuf::from("/var/lib/idplane"));
        assert_eq!(config.bind_addr.port(), 9090);
        assert_eq!(config.jwks_cache_ttl, Duration::from_secs(5));
        let cluster = config.cluster.clone().unwrap();
        assert_eq!(cluster.node_id, "n1");
        assert_eq!(cluster.peers.len(), 1);

        config.apply_yaml("cluster:\n  enabled: false\n").unwrap();
        assert!(config.cluster.is_none());
        assert!(config.apply_yaml("bind_addr: nowhere").is_err());
        assert!(config.apply_yaml("key_rotation_grace_secs: 9223372036854775807").is_err());
    }

    #[test]
    #[serial]
    fn from_env_or_yaml_reads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controlplane.yaml");
        std::fs::write(&path, "data_plane_driver: postgres\n").unwrap();
        unsafe {
            std::env::set_var("CONTROL_PLANE_CONFIG", &path);
        }
        let result = ControlPlaneConfig::from_env_or_yaml();
        unsafe {
            std::env::remove_var("CONTROL_PLANE_CONFIG");
        }
        assert_eq!(result.unwrap().data_plane.driver, "postgres");
    }
}
