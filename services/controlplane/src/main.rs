//! Identity control-plane entry point.
//!
//! # Purpose
//! Wires configuration, storage, the replicated log and the service, then
//! serves the health surface and runs the cleanup loop until shutdown.
//!
//! # Notes
//! The `build_runtime` helper keeps wiring testable and minimizes main setup
//! logic.
use anyhow::Context;
use controlplane::app::{AppState, build_router};
use controlplane::cluster::{self, Applier, Cluster};
use controlplane::config::ControlPlaneConfig;
use controlplane::jobs;
use controlplane::keys::JwksCache;
use controlplane::observability;
use controlplane::service::ControlPlaneService;
use controlplane::store::fs::FsConnection;
use controlplane::store::{AdapterRegistry, DataAccess};
use controlplane::tenancy::TenantResources;
use idplane_crypto::secretbox;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControlPlaneConfig::from_env_or_yaml().context("control plane config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

struct Runtime {
    service: ControlPlaneService,
    cluster: Arc<dyn Cluster>,
    resources: Arc<TenantResources>,
}

async fn run_with_shutdown<F>(config: ControlPlaneConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("idplane-controlplane");
    let runtime = build_runtime(&config).await?;

    match runtime.service.bootstrap_signing_key().await {
        Ok(Some(kid)) => tracing::info!(%kid, "global signing key ready"),
        Ok(None) => tracing::info!("waiting for the leader to publish a global signing key"),
        Err(err) => tracing::warn!(error = %err, "global signing key bootstrap failed"),
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let cleanup = jobs::spawn_cleanup(
        runtime.service.dal().clone(),
        config.cleanup_interval,
        stop_rx,
    );

    let app = build_router(app_state(&runtime, metrics_handle));
    let addr = config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, clustered = runtime.cluster.is_clustered(), "control plane listening");

    tokio::pin!(shutdown);
    let served = tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => result.context("serve"),
        _ = &mut shutdown => Ok(()),
    };

    tracing::info!("control plane shutting down");
    let _ = stop_tx.send(true);
    let _ = cleanup.await;
    runtime.cluster.shutdown().await;
    runtime.resources.close().await;
    runtime.service.dal().close().await;
    served
}

fn app_state(runtime: &Runtime, metrics: PrometheusHandle) -> AppState {
    AppState {
        service: runtime.service.clone(),
        metrics: Some(metrics),
    }
}

async fn build_runtime(config: &ControlPlaneConfig) -> anyhow::Result<Runtime> {
    if let Err(err) = secretbox::init_from_env() {
        tracing::warn!(error = %err, "secretbox master key unavailable; sealing secrets will fail");
    }
    if config.signing_master_key.is_none() {
        tracing::warn!("SIGNING_MASTER_KEY is not set; this node cannot generate signing keys");
    }

    let adapter_config = config.adapter_config();
    let control = Arc::new(FsConnection::open(&adapter_config).context("open control-plane store")?);
    let fs_store = control.store();
    let data = AdapterRegistry::with_defaults()
        .open(&config.data_plane.driver, adapter_config.clone())
        .await
        .with_context(|| format!("open {} data plane", config.data_plane.driver))?;
    let dal = DataAccess::new(control, data);

    let jwks = Arc::new(JwksCache::new(config.jwks_cache_ttl));
    let applier = Applier::from_dal(&dal, jwks.clone()).context("build applier")?;
    let cluster: Arc<dyn Cluster> = match &config.cluster {
        Some(cluster_config) => {
            let raft_config = cluster_config.raft_config(&config.fs_root);
            tracing::info!(
                node = %raft_config.node_id,
                addr = %raft_config.raft_addr,
                peers = raft_config.peers.len(),
                tls = raft_config.tls.is_some(),
                "starting raft"
            );
            Arc::new(
                cluster::start_raft(raft_config, applier, fs_store)
                    .await
                    .context("start raft")?,
            )
        }
        None => Arc::new(cluster::local("local", applier)),
    };

    let resources = Arc::new(TenantResources::new(dal.tenants()?, &adapter_config));
    let service = ControlPlaneService::new(dal, cluster.clone(), jwks)
        .with_tenant_resources(resources.clone())
        .with_rotation_grace(config.key_rotation_grace_secs);
    Ok(Runtime {
        service,
        cluster,
        resources,
    })
}
