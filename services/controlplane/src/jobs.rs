//! Background maintenance.
//!
//! # Purpose
//! Periodically deletes expired refresh tokens, sessions, email tokens and
//! admin refresh tokens.
//!
//! # Notes
//! Every sweep is best-effort: a failing repository is logged and the rest
//! still run. Repositories the deployment does not have are skipped quietly.
use crate::store::{DataAccess, StoreErrorKind, StoreResult};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub refresh_tokens: u64,
    pub sessions: u64,
    pub email_tokens: u64,
    pub admin_tokens: u64,
    pub failures: u32,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.refresh_tokens + self.sessions + self.email_tokens + self.admin_tokens
    }
}

async fn sweep<F, Fut>(name: &str, failures: &mut u32, run: F) -> u64
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = StoreResult<u64>>,
{
    match run().await {
        Ok(removed) => removed,
        Err(err) if matches!(err.kind(), StoreErrorKind::NoDatabase | StoreErrorKind::NotImplemented) => 0,
        Err(err) => {
            *failures += 1;
            tracing::warn!(sweep = name, error = %err, "cleanup sweep failed");
            0
        }
    }
}

/// Run one pass of every sweep against `dal`.
pub async fn run_cleanup_once(dal: &DataAccess, now: DateTime<Utc>) -> CleanupReport {
    let mut report = CleanupReport::default();
    report.refresh_tokens = sweep("refresh_tokens", &mut report.failures, || async {
        match dal.refresh_tokens() {
            Ok(repo) => repo.cleanup_expired(now).await,
            Err(err) => Err(err),
        }
    })
    .await;
    report.sessions = sweep("sessions", &mut report.failures, || async {
        match dal.sessions() {
            Ok(repo) => repo.delete_expired(now).await,
            Err(err) => Err(err),
        }
    })
    .await;
    report.email_tokens = sweep("email_tokens", &mut report.failures, || async {
        match dal.email_tokens() {
            Ok(repo) => repo.delete_expired(now).await,
            Err(err) => Err(err),
        }
    })
    .await;
    report.admin_tokens = sweep("admin_tokens", &mut report.failures, || async {
        match dal.admin_tokens() {
            Ok(repo) => repo.cleanup_expired(now).await,
            Err(err) => Err(err),
        }
    })
    .await;
    if report.total() > 0 {
        tracing::info!(
            refresh_tokens = report.refresh_tokens,
            sessions = report.sessions,
            email_tokens = report.email_tokens,
            admin_tokens = report.admin_tokens,
            "expired records removed"
        );
    }
    report
}

/// Sweep every `interval` until `shutdown` flips to `true`.
pub fn spawn_cleanup(
    dal: DataAccess,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so start-up stays quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_cleanup_once(&dal, Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("cleanup loop stopped");
    })
}
