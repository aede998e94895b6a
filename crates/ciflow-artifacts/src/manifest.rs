use std::collections::BTreeMap;

use ciflow_core::{FailureKind, JobPhase, JobStatus, StepStatus};
use serde::{Deserialize, Serialize};

/// Which lifecycle stage produced a step log.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    Provision,
    Check,
    Notify,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub role: StepRole,
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: i64,
    /// Log files relative to the job directory.
    #[serde(default)]
    pub logs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobManifest {
    pub run_id: String,
    pub instance_id: String,
    pub workflow: String,
    pub workflow_hash: String,
    pub job: String,
    pub matrix: BTreeMap<String, String>,
    pub phases: Vec<JobPhase>,
    pub steps: Vec<StepRecord>,
    pub status: JobStatus,
    pub failure: Option<FailureKind>,
    pub notified: bool,
}
