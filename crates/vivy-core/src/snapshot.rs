//! Persisted terminal collection.
//!
//! Only identity and presentation fields are stored. Live fields are reset on
//! load: a terminal restored from disk was never connected in this process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::ids::{ServerId, TerminalId};
use crate::layout::TabLayout;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Settings key the snapshot is stored under.
pub const SNAPSHOT_KEY: &str = "terminal_snapshot.v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalSnapshot {
    pub id: TerminalId,
    pub server: ServerId,
    #[serde(default)]
    pub title: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_activity: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub seed: Option<TerminalId>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

fn default_true() -> bool {
    true
}

/// What the user last looked at on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectedView {
    #[default]
    Terminal,
    Stats,
    Files,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSelectionSnapshot {
    pub server: ServerId,
    #[serde(default)]
    pub selected_terminal: Option<TerminalId>,
    #[serde(default)]
    pub selected_view: SelectedView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub version: u32,
    pub terminals: Vec<TerminalSnapshot>,
    pub servers: Vec<ServerSelectionSnapshot>,
    pub tabs: Vec<TabLayout>,
    pub active: Option<TerminalId>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            terminals: Vec::new(),
            servers: Vec::new(),
            tabs: Vec::new(),
            active: None,
        }
    }
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a stored snapshot. Returns `None` for snapshots written by a
    /// newer schema version.
    pub fn from_json(json: &str) -> Result<Option<Self>, serde_json::Error> {
        let snapshot: Snapshot = serde_json::from_str(json)?;
        if snapshot.version > SNAPSHOT_VERSION {
            log::warn!(
                "ignoring snapshot version {} (supported: {SNAPSHOT_VERSION})",
                snapshot.version
            );
            return Ok(None);
        }
        Ok(Some(snapshot))
    }
}

/// Storage for the snapshot. Called from a blocking task.
pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> Result<Option<Snapshot>, ServiceError>;
    fn save(&self, snapshot: &Snapshot) -> Result<(), ServiceError>;
}

/// Write access to server configurations the lifecycle needs.
pub trait ServerStore: Send + Sync {
    fn remember_session(&self, server: ServerId, name: Option<&str>) -> Result<(), ServiceError>;
}
