//! The three check kinds behind one [`Check`] contract.

pub mod format;
pub mod license;
pub mod test_suite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use ciflow_artifacts::{StepRecord, StepRole};
use ciflow_core::{CheckKind, CheckSummary, NamedStep, RunContext, StepStatus, TestTiming};
use ciflow_scan::{LicenseScanner, PollPolicy};
use ciflow_spec::CheckSpec;

use crate::exec::{CommandExecutor, CommandResult, ExecEnv};

pub use format::FormatCheck;
pub use license::LicenseCheck;
pub use test_suite::TestSuiteCheck;

/// Everything a check may touch while it runs.
pub struct CheckContext<'a> {
    pub run: &'a RunContext,
    pub exec: &'a dyn CommandExecutor,
    pub env: &'a ExecEnv,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckReport {
    pub status: StepStatus,
    pub summary: String,
    pub remediation: Vec<String>,
    pub slowest: Vec<TestTiming>,
    pub steps: Vec<StepRecord>,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.status == StepStatus::Pass
    }

    pub fn to_summary(&self, kind: CheckKind) -> CheckSummary {
        CheckSummary {
            kind,
            status: self.status,
            summary: self.summary.clone(),
            remediation: self.remediation.clone(),
            slowest: self.slowest.clone(),
            steps: self
                .steps
                .iter()
                .map(|s| NamedStep { name: s.name.clone(), status: s.status })
                .collect(),
        }
    }
}

/// A check runs against a provisioned environment. `Err` means the check
/// could not be carried out at all; a failing check is `Ok` with status
/// [`StepStatus::Fail`].
#[async_trait]
pub trait Check: Send + Sync {
    fn kind(&self) -> CheckKind;
    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckReport>;
}

/// Services checks depend on beyond command execution.
#[derive(Clone)]
pub struct CheckDeps {
    pub scanner: Arc<dyn LicenseScanner>,
    pub poll: PollPolicy,
}

pub fn build_check(spec: &CheckSpec, deps: &CheckDeps) -> Box<dyn Check> {
    match spec {
        CheckSpec::Format(f) => Box::new(FormatCheck::new(f.clone())),
        CheckSpec::License(l) => Box::new(LicenseCheck::new(l.clone(), deps.scanner.clone(), deps.poll.clone())),
        CheckSpec::TestSuite(t) => Box::new(TestSuiteCheck::new(t.clone())),
    }
}

pub(crate) fn step_status(ok: bool) -> StepStatus {
    if ok {
        StepStatus::Pass
    } else {
        StepStatus::Fail
    }
}

pub(crate) fn command_step(name: impl Into<String>, res: &CommandResult) -> StepRecord {
    StepRecord {
        role: StepRole::Check,
        name: name.into(),
        status: step_status(res.success),
        duration_ms: res.duration_ms(),
        logs: res.logs(),
    }
}

pub(crate) fn plain_step(name: impl Into<String>, status: StepStatus, duration_ms: i64) -> StepRecord {
    StepRecord {
        role: StepRole::Check,
        name: name.into(),
        status,
        duration_ms,
        logs: vec![],
    }
}
