//! Run data model: identity, lifecycle status, configuration snapshot and
//! summary counters.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::probes::OutcomeKind;

/// Identifier of a measurement run. Assigned by the store, monotonically
/// increasing within one database.
pub type RunId = i64;

/// Lifecycle of a run. Only `InProgress -> Completed` and
/// `InProgress -> Failed` are valid transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "in-progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// The configuration a run was started with, stored alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub input_path: String,
    pub exclusion_path: Option<String>,
    pub dns_servers: Vec<String>,
    pub concurrency: usize,
    pub query_timeout_ms: u64,
    pub query_type: String,
    pub debug: bool,
    pub verbose: bool,
    pub enrichment: bool,
}

/// Per-outcome result counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub resolved: u64,
    pub nxdomain: u64,
    pub timeout: u64,
    pub server_error: u64,
    pub malformed_response: u64,
}

impl OutcomeCounts {
    pub fn record(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Resolved => self.resolved += 1,
            OutcomeKind::NxDomain => self.nxdomain += 1,
            OutcomeKind::Timeout => self.timeout += 1,
            OutcomeKind::ServerError => self.server_error += 1,
            OutcomeKind::MalformedResponse => self.malformed_response += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.resolved + self.nxdomain + self.timeout + self.server_error + self.malformed_response
    }

    /// Results that did not resolve. NXDOMAIN is an answer, not an error.
    pub fn errors(&self) -> u64 {
        self.timeout + self.server_error + self.malformed_response
    }
}

/// Counters handed to the store when a run is finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTally {
    pub targets_probed: u64,
    pub targets_skipped: u64,
    pub targets_excluded: u64,
    pub results_written: u64,
    pub results_failed: u64,
    pub outcomes: OutcomeCounts,
}

/// A run as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub tag: uuid::Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config: ConfigSnapshot,
    pub tally: RunTally,
}
