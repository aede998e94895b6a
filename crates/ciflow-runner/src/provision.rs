use std::path::PathBuf;

use ciflow_artifacts::{StepRecord, StepRole};
use ciflow_core::StepStatus;
use ciflow_spec::{CommandSpec, ProvisionSpec, RuntimeSpec};
use thiserror::Error;
use tracing::{info, warn};

use crate::exec::{CommandExecutor, CommandResult, ExecEnv};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("could not run {step}: {message}")]
    Spawn { step: String, message: String },
    #[error("runtime {program} {wanted} not available (found {found})")]
    RuntimeMismatch { program: String, wanted: String, found: String },
    #[error("install target '{target}' failed ({detail})")]
    InstallFailed { target: String, detail: String },
    #[error("required tool '{0}' not found on PATH")]
    MissingTool(String),
}

#[derive(Clone, Debug, Default)]
pub struct ProvisionReport {
    pub runtime_version: Option<String>,
    pub tools: Vec<(String, PathBuf)>,
}

/// `3.8` matches `3.8.10` but not `3.80`; every declared component must
/// equal the reported one.
pub fn version_matches(declared: &str, reported: &str) -> bool {
    let declared: Vec<&str> = declared.trim().split('.').collect();
    let reported: Vec<&str> = reported.trim().split('.').collect();
    declared.len() <= reported.len() && declared.iter().zip(&reported).all(|(d, r)| d == r)
}

/// First whitespace token that starts with a digit, trimmed of trailing
/// punctuation. Looks at stdout first, then stderr.
pub fn parse_version(stdout: &str, stderr: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .chain(stderr.split_whitespace())
        .map(|t| t.trim_start_matches('v').trim_end_matches(|c: char| !c.is_ascii_alphanumeric()))
        .find(|t| t.starts_with(|c: char| c.is_ascii_digit()))
        .map(str::to_string)
}

fn record(steps: &mut Vec<StepRecord>, name: String, res: Option<&CommandResult>, status: StepStatus) {
    steps.push(StepRecord {
        role: StepRole::Provision,
        name,
        status,
        duration_ms: res.map(CommandResult::duration_ms).unwrap_or(0),
        logs: res.map(CommandResult::logs).unwrap_or_default(),
    });
}

async fn check_runtime(
    rt: &RuntimeSpec,
    exec: &dyn CommandExecutor,
    env: &ExecEnv,
    steps: &mut Vec<StepRecord>,
    index: usize,
) -> Result<String, ProvisionError> {
    let step = format!("runtime {} {}", rt.program, rt.version);
    let cmd = CommandSpec {
        program: rt.program.clone(),
        args: rt.version_args.clone(),
        ..Default::default()
    };
    let res = match exec.run(&cmd, env, index).await {
        Ok(r) => r,
        Err(e) => {
            record(steps, step.clone(), None, StepStatus::Fail);
            return Err(ProvisionError::Spawn { step, message: format!("{e:#}") });
        }
    };
    let found = parse_version(&res.stdout, &res.stderr);
    match found {
        Some(v) if res.success && version_matches(&rt.version, &v) => {
            record(steps, step, Some(&res), StepStatus::Pass);
            Ok(v)
        }
        other => {
            record(steps, step, Some(&res), StepStatus::Fail);
            Err(ProvisionError::RuntimeMismatch {
                program: rt.program.clone(),
                wanted: rt.version.clone(),
                found: other.unwrap_or_else(|| res.describe()),
            })
        }
    }
}

/// Prepares the job environment: runtime version, install targets in order,
/// then required tools. Stops at the first failure; nothing is retried.
/// Every attempted step is appended to `steps`.
pub async fn provision(
    spec: &ProvisionSpec,
    exec: &dyn CommandExecutor,
    env: &ExecEnv,
    steps: &mut Vec<StepRecord>,
) -> Result<ProvisionReport, ProvisionError> {
    let mut report = ProvisionReport::default();
    let mut index = 0;

    if let Some(rt) = &spec.runtime {
        let v = check_runtime(rt, exec, env, steps, index).await?;
        info!(runtime = %rt.program, version = %v, "runtime ready");
        report.runtime_version = Some(v);
        index += 1;
    }

    for target in &spec.install {
        let step = format!("install {}", target.name);
        let res = match exec.run(&target.command, env, index).await {
            Ok(r) => r,
            Err(e) => {
                record(steps, step.clone(), None, StepStatus::Fail);
                return Err(ProvisionError::Spawn { step, message: format!("{e:#}") });
            }
        };
        index += 1;
        if !res.success {
            record(steps, step, Some(&res), StepStatus::Fail);
            warn!(target = %target.name, result = %res.describe(), "install failed");
            return Err(ProvisionError::InstallFailed {
                target: target.name.clone(),
                detail: res.describe(),
            });
        }
        record(steps, step, Some(&res), StepStatus::Pass);
    }

    for tool in &spec.tools {
        match exec.resolve_tool(tool, env) {
            Some(path) => {
                record(steps, format!("tool {tool}"), None, StepStatus::Pass);
                report.tools.push((tool.clone(), path));
            }
            None => {
                record(steps, format!("tool {tool}"), None, StepStatus::Fail);
                return Err(ProvisionError::MissingTool(tool.clone()));
            }
        }
    }

    Ok(report)
}
