use serde::{Deserialize, Serialize};

/// Which check a job runs once its environment is provisioned.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Format,
    License,
    TestSuite,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Format => "format",
            CheckKind::License => "license",
            CheckKind::TestSuite => "test_suite",
        }
    }
}

/// Dependency set a license check enumerates.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DependencyVariant {
    Cpu,
    Gpu,
}

impl DependencyVariant {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(Self::Cpu),
            "gpu" => Some(Self::Gpu),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyVariant::Cpu => "cpu",
            DependencyVariant::Gpu => "gpu",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed)
    }
}

/// Where in the lifecycle a job failed. Delivery failures never appear here.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Provisioning,
    Check,
    Internal,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pass,
    Fail,
    Skipped,
}

/// Source-control event that started a run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    Push,
    PullRequest { action: String },
    Schedule { cron: String },
    #[serde(rename = "workflow_dispatch")]
    Dispatch,
}

impl TriggerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerEvent::Push => "push",
            TriggerEvent::PullRequest { .. } => "pull_request",
            TriggerEvent::Schedule { .. } => "schedule",
            TriggerEvent::Dispatch => "workflow_dispatch",
        }
    }

    /// Builds an event from its wire name plus the optional detail the
    /// event kind needs (pull-request action or cron line).
    pub fn from_parts(name: &str, detail: Option<&str>) -> Option<Self> {
        match name {
            "push" => Some(Self::Push),
            "pull_request" => Some(Self::PullRequest {
                action: detail.unwrap_or("opened").to_string(),
            }),
            "schedule" => detail.map(|c| Self::Schedule { cron: c.to_string() }),
            "workflow_dispatch" | "dispatch" => Some(Self::Dispatch),
            _ => None,
        }
    }
}
