use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ciflow_artifacts::StepRecord;
use ciflow_core::{CheckKind, Dependency, StepStatus};
use ciflow_scan::{wait_for_verdict, LicenseScanner, PollPolicy, ScanReport, Verdict};
use ciflow_spec::LicenseCheckSpec;
use tracing::{debug, info, warn};

use super::{command_step, plain_step, Check, CheckContext, CheckReport};

pub const STEP_SUBMIT: &str = "submit dependency list";
pub const STEP_VERDICT: &str = "license verdict";

/// Lowercase, with runs of `-`, `_` and `.` collapsed to one `-`.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut sep = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            sep = true;
            continue;
        }
        if sep && !out.is_empty() {
            out.push('-');
        }
        sep = false;
        out.push(c.to_ascii_lowercase());
    }
    out
}

fn strip_extras(name: &str) -> &str {
    name.split('[').next().unwrap_or(name)
}

fn split_pin(line: &str) -> Option<(&str, &str)> {
    if let Some(pair) = line.split_once("===") {
        return Some(pair);
    }
    if let Some(pair) = line.split_once("==") {
        return Some(pair);
    }
    if let Some(pair) = line.split_once(" @ ") {
        return Some(pair);
    }
    // `name version` rows of a table listing; the header row has no digit
    let mut tokens = line.split_whitespace();
    let n = tokens.next()?;
    let v = tokens.next()?;
    if tokens.next().is_some() || !v.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some((n, v))
}

fn parse_line(line: &str) -> Option<Dependency> {
    let line = line.split(';').next().unwrap_or(line).trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
        return None;
    }
    let Some((name, version)) = split_pin(line) else {
        debug!(line, "not a pinned requirement; skipped");
        return None;
    };
    let name = normalize_name(strip_extras(name.trim()));
    // drop trailing options such as `--hash=sha256:...`
    let version = version.split_whitespace().next().unwrap_or_default();
    if name.is_empty() || version.is_empty() {
        debug!(line, "incomplete requirement; skipped");
        return None;
    }
    Some(Dependency { name, version: version.to_string() })
}

/// Parses listing output into a sorted, de-duplicated dependency set.
/// Accepts `name==version`, `name===version`, `name @ url` and
/// `name version` lines; comments, option lines and table headers are
/// skipped.
pub fn parse_dependencies(output: &str) -> Vec<Dependency> {
    output.lines().filter_map(parse_line).collect::<BTreeSet<_>>().into_iter().collect()
}

/// Enumerates one dependency variant and asks the scanning service for a
/// verdict on exactly that set.
pub struct LicenseCheck {
    spec: LicenseCheckSpec,
    scanner: Arc<dyn LicenseScanner>,
    poll: PollPolicy,
}

impl LicenseCheck {
    pub fn new(spec: LicenseCheckSpec, scanner: Arc<dyn LicenseScanner>, poll: PollPolicy) -> Self {
        Self { spec, scanner, poll }
    }

    fn fail(summary: String, steps: Vec<StepRecord>, remediation: Vec<String>) -> CheckReport {
        CheckReport {
            status: StepStatus::Fail,
            summary,
            remediation,
            slowest: vec![],
            steps,
        }
    }
}

#[async_trait]
impl Check for LicenseCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::License
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckReport> {
        let variant = self
            .spec
            .dependency_variant()
            .ok_or_else(|| anyhow!("unknown dependency variant '{}'", self.spec.variant))?;
        let list_name = format!("list {} dependencies", variant.as_str());
        let res = ctx.exec.run(&self.spec.list, ctx.env, 0).await?;
        let mut steps = vec![command_step(list_name, &res)];
        if !res.success {
            steps.push(plain_step(STEP_SUBMIT, StepStatus::Skipped, 0));
            steps.push(plain_step(STEP_VERDICT, StepStatus::Skipped, 0));
            return Ok(Self::fail(
                format!("`{}` failed ({})", self.spec.list.display(), res.describe()),
                steps,
                vec![],
            ));
        }

        let report = ScanReport {
            project: self.spec.project.clone().unwrap_or_else(|| ctx.run.repository.clone()),
            revision: ctx.run.git_ref.clone(),
            variant,
            dependencies: parse_dependencies(&res.stdout),
        };
        info!(variant = variant.as_str(), count = report.dependencies.len(), "submitting dependency list");

        let t = Instant::now();
        let report_id = match self.scanner.submit(&report).await {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "license submission failed");
                steps.push(plain_step(STEP_SUBMIT, StepStatus::Fail, t.elapsed().as_millis() as i64));
                steps.push(plain_step(STEP_VERDICT, StepStatus::Skipped, 0));
                return Ok(Self::fail(format!("submission failed: {e}"), steps, vec![]));
            }
        };
        steps.push(plain_step(STEP_SUBMIT, StepStatus::Pass, t.elapsed().as_millis() as i64));

        let t = Instant::now();
        let verdict = wait_for_verdict(self.scanner.as_ref(), &report_id, &self.poll).await;
        let elapsed = t.elapsed().as_millis() as i64;
        match verdict {
            Ok(Verdict::Passed) => {
                steps.push(plain_step(STEP_VERDICT, StepStatus::Pass, elapsed));
                Ok(CheckReport {
                    status: StepStatus::Pass,
                    summary: format!(
                        "{} {} dependencies comply",
                        report.dependencies.len(),
                        variant.as_str()
                    ),
                    remediation: vec![],
                    slowest: vec![],
                    steps,
                })
            }
            Ok(Verdict::Failed { violations }) => {
                steps.push(plain_step(STEP_VERDICT, StepStatus::Fail, elapsed));
                let lines: Vec<String> = violations
                    .iter()
                    .map(|v| match &v.reason {
                        Some(r) => format!("{} is licensed {}: {}", v.dependency, v.license, r),
                        None => format!("{} is licensed {}", v.dependency, v.license),
                    })
                    .collect();
                for line in &lines {
                    warn!(variant = variant.as_str(), "{line}");
                }
                Ok(Self::fail(
                    format!("{} license violation(s) in {} dependencies", violations.len(), variant.as_str()),
                    steps,
                    lines,
                ))
            }
            // wait_for_verdict never yields Pending
            Ok(Verdict::Pending) => {
                steps.push(plain_step(STEP_VERDICT, StepStatus::Fail, elapsed));
                Ok(Self::fail("verdict still pending".to_string(), steps, vec![]))
            }
            Err(e) => {
                warn!(report = report_id.as_str(), error = %e, "no license verdict");
                steps.push(plain_step(STEP_VERDICT, StepStatus::Fail, elapsed));
                Ok(Self::fail(format!("verdict unavailable: {e}"), steps, vec![]))
            }
        }
    }
}
