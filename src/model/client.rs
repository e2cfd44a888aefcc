use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ALL_APP;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientStatus {
    ActiveIdle,
    ActiveBusy,
    Suspend,
    Deleted,
}

impl ClientStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ClientStatus::ActiveIdle | ClientStatus::ActiveBusy)
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientStatus::ActiveIdle => "active-idle",
            ClientStatus::ActiveBusy => "active-busy",
            ClientStatus::Suspend => "suspend",
            ClientStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Registration payload a worker presents; an omitted id means a fresh
/// registration, a supplied one a re-registration after a worker restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientProfile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    pub group: String,
    #[serde(default)]
    pub apps: Vec<String>,
    /// Workunit ids the worker believes it still holds.
    #[serde(default)]
    pub current_work: Vec<String>,
}

/// Worker agent as tracked by the client manager. Memory-only; workers
/// re-register after a scheduler restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub name: String,
    pub host: String,
    pub group: String,
    pub status: ClientStatus,
    pub apps: Vec<String>,
    /// Workunit ids this client must never be offered again.
    #[serde(default)]
    pub skip_work: HashSet<String>,
    /// Workunit ids currently checked out to this client.
    #[serde(default)]
    pub current_work: HashSet<String>,
    /// Set by each heartbeat, cleared by the liveness sweep.
    #[serde(default)]
    pub tag: bool,
    pub reg_time: DateTime<Utc>,
    /// Total registered seconds.
    #[serde(default)]
    pub serve_time: u64,
    /// Consecutive seconds without checked-out work.
    #[serde(default)]
    pub idle_time: u64,
    #[serde(default)]
    pub sub_clients: u32,
}

impl Client {
    pub fn from_profile(profile: ClientProfile) -> Self {
        Self {
            id: profile
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: profile.name,
            host: profile.host,
            group: profile.group,
            status: ClientStatus::ActiveIdle,
            apps: profile.apps,
            skip_work: HashSet::new(),
            current_work: profile.current_work.into_iter().collect(),
            // survives the first sweep without a heartbeat
            tag: true,
            reg_time: Utc::now(),
            serve_time: 0,
            idle_time: 0,
            sub_clients: 0,
        }
    }

    /// Whether this client may run `app` (exact match or wildcard).
    pub fn supports(&self, app: &str) -> bool {
        self.apps.iter().any(|a| a == app || a == ALL_APP)
    }

    pub fn skips(&self, work_id: &str) -> bool {
        self.skip_work.contains(work_id)
    }
}
