//! Browser sessions and their derived status.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Inactivity after which an unexpired session counts as idle.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub session_id_hash: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked_by: Option<String>,
    #[serde(default)]
    pub revoke_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Revoked,
    Expired,
    Idle,
    Active,
}

impl SessionStatus {
    /// Revocation wins over expiry, expiry over idleness.
    pub fn derive(session: &Session, now: DateTime<Utc>, idle_after: Duration) -> Self {
        if session.revoked_at.is_some() {
            SessionStatus::Revoked
        } else if now >= session.expires_at {
            SessionStatus::Expired
        } else if (now - session.last_activity)
            .to_std()
            .is_ok_and(|inactive| inactive > idle_after)
        {
            SessionStatus::Idle
        } else {
            SessionStatus::Active
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Revoked => "revoked",
            SessionStatus::Expired => "expired",
            SessionStatus::Idle => "idle",
            SessionStatus::Active => "active",
        }
    }
}

/// A session together with its status at query time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: Session,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub device: Option<String>,
    pub status: Option<SessionStatus>,
    /// Case-insensitive substring over ip, city and country.
    pub search: Option<String>,
    pub limit: i64,
    pub offset: i64,
}
