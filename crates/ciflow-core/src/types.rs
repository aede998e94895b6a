use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ids::*, model::*, phase::JobPhase};

/// Identifies the run being executed and what triggered it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunContext {
    pub actor: String,
    pub workflow: String,
    pub repository: String,
    pub run_id: String,
    pub run_attempt: u32,
    pub run_number: u64,
    pub event: TriggerEvent,
    /// Full git ref, e.g. `refs/heads/main` or `refs/pull/12/merge`.
    pub git_ref: String,
    /// Target branch of a pull request, when the event is one.
    #[serde(default)]
    pub base_ref: Option<String>,
    pub server_url: String,
    /// Paths changed by the push or pull request, relative to repo root.
    #[serde(default)]
    pub changed_files: Vec<String>,
}

impl RunContext {
    /// Branch name for branch refs; `None` for tags and pull-request refs.
    pub fn branch(&self) -> Option<&str> {
        if let Some(b) = self.git_ref.strip_prefix("refs/heads/") {
            return Some(b);
        }
        if self.git_ref.starts_with("refs/") || self.git_ref.is_empty() {
            return None;
        }
        Some(self.git_ref.as_str())
    }

    pub fn tag(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/tags/")
    }

    pub fn repository_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.repository)
    }

    pub fn run_url(&self) -> String {
        format!("{}/actions/runs/{}", self.repository_url(), self.run_id)
    }

    /// Environment exposed to every command a job spawns.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("CIFLOW_ACTOR".into(), self.actor.clone());
        env.insert("CIFLOW_WORKFLOW".into(), self.workflow.clone());
        env.insert("CIFLOW_REPOSITORY".into(), self.repository.clone());
        env.insert("CIFLOW_RUN_ID".into(), self.run_id.clone());
        env.insert("CIFLOW_RUN_ATTEMPT".into(), self.run_attempt.to_string());
        env.insert("CIFLOW_RUN_NUMBER".into(), self.run_number.to_string());
        env.insert("CIFLOW_EVENT".into(), self.event.name().to_string());
        env.insert("CIFLOW_REF".into(), self.git_ref.clone());
        env
    }
}

/// Record assembled when a job fails and handed to the notifier once.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationEvent {
    pub actor: String,
    pub job_name: String,
    pub workflow: String,
    pub repository: String,
    pub run_id: String,
    pub run_attempt: u32,
    pub run_number: u64,
    pub event_name: String,
    pub git_ref: String,
    pub server_url: String,
}

impl NotificationEvent {
    pub fn from_context(ctx: &RunContext, job_name: &str) -> Self {
        Self {
            actor: ctx.actor.clone(),
            job_name: job_name.to_string(),
            workflow: ctx.workflow.clone(),
            repository: ctx.repository.clone(),
            run_id: ctx.run_id.clone(),
            run_attempt: ctx.run_attempt,
            run_number: ctx.run_number,
            event_name: ctx.event.name().to_string(),
            git_ref: ctx.git_ref.clone(),
            server_url: ctx.server_url.clone(),
        }
    }

    pub fn repository_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.repository)
    }

    pub fn run_url(&self) -> String {
        format!("{}/actions/runs/{}", self.repository_url(), self.run_id)
    }

    pub fn actor_url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.actor)
    }

    pub fn actor_avatar_url(&self) -> String {
        format!("{}.png?size=32", self.actor_url())
    }
}

/// One installed package as reported by a listing command.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dependency {
    pub name: String,
    pub version: String,
}

/// Timing line from a test tool's slowest-tests report.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TestTiming {
    pub seconds: f64,
    pub phase: String,
    pub test: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamedStep {
    pub name: String,
    pub status: StepStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CheckSummary {
    pub kind: CheckKind,
    pub status: StepStatus,
    pub summary: String,
    #[serde(default)]
    pub remediation: Vec<String>,
    #[serde(default)]
    pub slowest: Vec<TestTiming>,
    /// Individual steps of the check in execution order.
    #[serde(default)]
    pub steps: Vec<NamedStep>,
}

/// Final record of one job instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    pub instance_id: JobInstanceId,
    pub job_id: String,
    pub display_name: String,
    pub status: JobStatus,
    pub failure: Option<FailureKind>,
    pub phases: Vec<JobPhase>,
    pub check: Option<CheckSummary>,
    pub notified: bool,
    pub error: Option<String>,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
}

impl JobOutcome {
    pub fn skipped(job_id: &str, display_name: &str, reason: impl Into<String>) -> Self {
        let now = crate::now_ms();
        Self {
            instance_id: JobInstanceId::new(),
            job_id: job_id.to_string(),
            display_name: display_name.to_string(),
            status: JobStatus::Skipped,
            failure: None,
            phases: vec![],
            check: None,
            notified: false,
            error: Some(reason.into()),
            started_at_ms: now,
            finished_at_ms: now,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        crate::elapsed_ms(self.started_at_ms, self.finished_at_ms)
    }
}
