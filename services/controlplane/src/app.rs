//! Control-plane HTTP surface.
//!
//! # Purpose
//! Builds the Axum router for the operational endpoints: system health, the
//! per-tenant JWKS document and the Prometheus scrape route.
//!
//! # Key invariants
//! - Handlers only read. Writes go through [`ControlPlaneService`] callers,
//!   not through this router.
//! - Error bodies carry a stable `code` and never include internal details.
//! - The JWKS document never contains private key material.
use crate::keys::{GLOBAL_OWNER, Jwks};
use crate::observability;
use crate::service::{ControlPlaneService, ServiceError};
use crate::store::RepositoryHealth;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use idplane_consensus::RaftStats;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub service: ControlPlaneService,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}

/// Service error with the HTTP status it maps to.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::TenantNotFound(_) | ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) | ServiceError::ScopeInUse(_) | ServiceError::SystemScope(_) => {
                StatusCode::CONFLICT
            }
            ServiceError::Invalid { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized(_) | ServiceError::TokenExpired(_) => StatusCode::UNAUTHORIZED,
            ServiceError::NotLeader { .. }
            | ServiceError::ClusterUnavailable
            | ServiceError::NoDatabase(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "request failed");
            "internal error".to_string()
        } else {
            err.to_string()
        };
        let leader = match &err {
            ServiceError::NotLeader { leader } => leader.clone(),
            _ => None,
        };
        ApiError {
            status,
            body: ErrorResponse {
                code: err.code().to_string(),
                message,
                leader,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// `ok` when every repository answered, `degraded` otherwise.
    pub status: &'static str,
    pub cluster: RaftStats,
    pub clustered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_kid: Option<String>,
    pub repositories: Vec<RepositoryHealth>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/system/health", axum::routing::get(system_health))
        .route(
            "/v1/tenants/:slug/.well-known/jwks.json",
            axum::routing::get(tenant_jwks),
        )
        .route("/metrics", axum::routing::get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn system_health(State(state): State<AppState>) -> (StatusCode, Json<HealthStatus>) {
    let service = &state.service;
    let repositories = service.dal().ping_all().await;
    let active_kid = match service.active_kid(GLOBAL_OWNER).await {
        Ok(kid) => Some(kid),
        Err(err) => {
            tracing::debug!(error = %err, "no active global signing key");
            None
        }
    };
    let healthy = repositories.iter().all(|r| r.ok);
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthStatus {
            status: if healthy { "ok" } else { "degraded" },
            cluster: service.cluster().stats(),
            clustered: service.cluster().is_clustered(),
            active_kid,
            repositories,
        }),
    )
}

async fn tenant_jwks(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Response, ApiError> {
    let jwks = state.service.jwks(&slug).await?;
    let body: &Jwks = &jwks;
    Ok((
        [(header::CACHE_CONTROL, "public, max-age=60")],
        Json(body.clone()),
    )
        .into_response())
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            observability::render_metrics(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::CreateTenant;
    use crate::service::test_support::service;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_cluster_keys_and_repositories() {
        let (_dir, svc) = service();
        let kid = svc.bootstrap_signing_key().await.unwrap().unwrap();
        let router = build_router(AppState {
            service: svc,
            metrics: None,
        });

        let (status, body) = get(router, "/v1/system/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_kid"], kid.as_str());
        assert_eq!(body["clustered"], false);
        assert_eq!(body["cluster"]["node_id"], "test-node");
        assert_eq!(body["repositories"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn jwks_is_served_per_tenant() {
        let (_dir, svc) = service();
        svc.create_tenant(CreateTenant {
            name: "Acme".into(),
            slug: "acme".into(),
            ..CreateTenant::default()
        })
        .await
        .unwrap();
        let active = svc.rotate_signing_key("acme", None).await.unwrap();
        let router = build_router(AppState {
            service: svc,
            metrics: None,
        });

        let (status, body) = get(router.clone(), "/v1/tenants/acme/.well-known/jwks.json").await;
        assert_eq!(status, StatusCode::OK);
        let keys = body["keys"].as_array().unwrap();
        assert!(keys.iter().any(|k| k["kid"] == active.kid.as_str()));
        assert!(keys.iter().all(|k| k.get("d").is_none()));

        let (status, body) = get(router, "/v1/tenants/ghost/.well-known/jwks.json").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn metrics_route_needs_a_recorder() {
        let (_dir, svc) = service();
        let router = build_router(AppState {
            service: svc,
            metrics: None,
        });
        let (status, _) = get(router, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn service_errors_map_to_statuses() {
        let err = ApiError::from(ServiceError::NotLeader {
            leader: Some("n2".into()),
        });
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.body.leader.as_deref(), Some("n2"));

        let err = ApiError::from(ServiceError::ScopeInUse("billing".into()));
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.body.code, "scope_in_use");

        let err = ApiError::from(ServiceError::invalid("slug", "bad"));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
