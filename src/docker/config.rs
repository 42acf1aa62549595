//! Serde mapping of Docker's on-disk container configuration
//! (`containers/<id>/config.v2.json`).
//!
//! Only the attributes the explorer consumes are mapped; everything else in
//! the file is ignored. Field names follow Docker's PascalCase JSON.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;

use crate::runtime::TaskStatus;

/// Container state flags from `config.v2.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct State {
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
    pub dead: bool,
    pub pid: i64,
    pub exit_code: i64,
    pub error: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl State {
    /// A never-started container carries Go's zero time (year 1).
    fn never_started(&self) -> bool {
        match self.started_at {
            None => true,
            Some(t) => t.year() <= 1,
        }
    }

    /// Derive the execution status from the recorded flags.
    pub fn status(&self) -> TaskStatus {
        if self.never_started() {
            TaskStatus::Created
        } else if self.running && self.paused {
            TaskStatus::Paused
        } else if self.running {
            TaskStatus::Running
        } else if !self.paused {
            TaskStatus::Stopped
        } else {
            TaskStatus::Unknown
        }
    }
}

/// Container runtime configuration from `config.v2.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
    pub hostname: String,
    pub domainname: String,
    pub user: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    /// Image reference as configured (often an id digest).
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
}

/// The `config.v2.json` document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ConfigFile {
    #[serde(rename = "ID")]
    pub id: String,
    pub state: State,
    pub created: Option<DateTime<Utc>>,
    pub managed: bool,
    pub config: Config,
    /// Image id digest (`sha256:...`) the container was created from.
    pub image: String,
    pub name: String,
    /// Storage driver, e.g. `overlay2`.
    pub driver: String,
    pub log_path: String,
    pub restart_count: i64,
}
