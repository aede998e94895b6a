use anyhow::Result;
use async_trait::async_trait;
use ciflow_core::{CheckKind, StepStatus};
use ciflow_spec::FormatCheckSpec;
use tracing::{info, warn};

use super::{command_step, Check, CheckContext, CheckReport};

pub const DEFAULT_HOOK_HINT: &str = "pre-commit install --hook-type pre-push";

const VERIFY_FLAGS: [&str; 3] = ["--check", "--diff", "--verify"];

/// Runs a formatter in verification mode. Exit 0 means nothing would change.
pub struct FormatCheck {
    spec: FormatCheckSpec,
}

impl FormatCheck {
    pub fn new(spec: FormatCheckSpec) -> Self {
        Self { spec }
    }

    /// The configured fix command, or the verification command with its
    /// verification flags removed.
    pub fn fix_hint(&self) -> String {
        if let Some(h) = &self.spec.fix_hint {
            return h.clone();
        }
        let mut parts = vec![self.spec.command.program.clone()];
        parts.extend(
            self.spec
                .command
                .args
                .iter()
                .filter(|a| !VERIFY_FLAGS.contains(&a.as_str()))
                .cloned(),
        );
        parts.join(" ")
    }

    pub fn remediation(&self) -> Vec<String> {
        let hook = self.spec.hook_hint.as_deref().unwrap_or(DEFAULT_HOOK_HINT);
        vec![
            format!("run `{}` locally and commit the result", self.fix_hint()),
            format!("install the pre-push hook with `{hook}` to catch this before pushing"),
        ]
    }
}

#[async_trait]
impl Check for FormatCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Format
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckReport> {
        let cmd_display = self.spec.command.display();
        let res = ctx.exec.run(&self.spec.command, ctx.env, 0).await?;
        let steps = vec![command_step(cmd_display.clone(), &res)];

        if res.success {
            info!(command = %cmd_display, "formatting check passed");
            return Ok(CheckReport {
                status: StepStatus::Pass,
                summary: "formatting is clean".to_string(),
                remediation: vec![],
                slowest: vec![],
                steps,
            });
        }

        let remediation = self.remediation();
        warn!(command = %cmd_display, result = %res.describe(), "formatting check failed");
        for line in &remediation {
            warn!("{line}");
        }
        Ok(CheckReport {
            status: StepStatus::Fail,
            summary: format!("`{cmd_display}` reported files that need formatting ({})", res.describe()),
            remediation,
            slowest: vec![],
            steps,
        })
    }
}
