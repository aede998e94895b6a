use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;
use ciflow_spec::{load_workflow_dir, CheckSpec, Workflow};
use serde::Serialize;

use crate::Config;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DoctorReport {
    pub findings: Vec<Finding>,
}

impl DoctorReport {
    fn push(&mut self, severity: Severity, message: impl Into<String>) {
        self.findings.push(Finding { severity, message: message.into() });
    }

    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }
}

fn programs(workflows: &[(String, Workflow)]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for (_, wf) in workflows {
        for job in wf.jobs.values() {
            if let Some(rt) = &job.provision.runtime {
                out.insert(rt.program.clone());
            }
            out.extend(job.provision.tools.iter().cloned());
            out.extend(job.provision.install.iter().map(|t| t.command.program.clone()));
            match &job.check {
                CheckSpec::Format(f) => {
                    out.insert(f.command.program.clone());
                }
                CheckSpec::License(l) => {
                    out.insert(l.list.program.clone());
                }
                CheckSpec::TestSuite(t) => {
                    out.insert(t.command.program.clone());
                }
            }
        }
    }
    // templated programs cannot be resolved before planning
    out.retain(|p| !p.contains("${{"));
    out
}

/// Checks configuration, service endpoints and tool availability. Problems
/// that make `run` fail outright are errors; the rest are warnings.
pub fn doctor(repo_root: &Path, cfg: &Config) -> Result<DoctorReport> {
    let mut report = DoctorReport::default();

    if cfg.project.primary_branch.trim().is_empty() {
        report.push(Severity::Error, "project.primary_branch is empty");
    } else {
        report.push(Severity::Ok, format!("primary branch: {}", cfg.project.primary_branch));
    }

    let artifact_root = cfg.artifact_root();
    match std::fs::create_dir_all(&artifact_root) {
        Ok(()) => report.push(Severity::Ok, format!("artifact root: {}", artifact_root.display())),
        Err(e) => report.push(
            Severity::Error,
            format!("artifact root {} not writable: {e}", artifact_root.display()),
        ),
    }

    let dir = cfg.workflows_dir(repo_root);
    let workflows = match load_workflow_dir(&dir) {
        Ok(w) if w.is_empty() => {
            report.push(Severity::Warn, format!("no workflows in {}", dir.display()));
            w
        }
        Ok(w) => {
            report.push(Severity::Ok, format!("{} workflow(s) valid", w.len()));
            w
        }
        Err(e) => {
            report.push(Severity::Error, format!("{e:#}"));
            Vec::new()
        }
    };

    let wants_scan = workflows
        .iter()
        .any(|(_, wf)| wf.jobs.values().any(|j| matches!(j.check, CheckSpec::License(_))));
    match (&cfg.scan.base_url, wants_scan) {
        (None, true) => report.push(
            Severity::Error,
            "license checks declared but no scanning service configured (scan.base_url or CIFLOW_SCAN_URL)",
        ),
        (Some(url), _) => {
            report.push(Severity::Ok, format!("scanning service: {url}"));
            if cfg.scan.api_key.is_none() {
                report.push(Severity::Warn, "CIFLOW_SCAN_API_KEY not set; requests are unauthenticated");
            }
        }
        (None, false) => {}
    }

    if cfg.notify.webhook_url.is_some() {
        report.push(Severity::Ok, format!("webhook type: {:?}", cfg.notify.webhook_type));
    } else {
        report.push(
            Severity::Warn,
            "CIFLOW_WEBHOOK_URL not set; failure notifications will be dropped",
        );
    }

    for program in programs(&workflows) {
        if which::which(&program).is_err() {
            report.push(Severity::Warn, format!("'{program}' not found on PATH"));
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(workflow: Option<&str>) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default_for_repo("w");
        cfg.project.artifact_root = dir.path().join("runs").display().to_string();
        let wf_dir = cfg.workflows_dir(dir.path());
        std::fs::create_dir_all(&wf_dir).unwrap();
        if let Some(w) = workflow {
            std::fs::write(wf_dir.join("license.yml"), w).unwrap();
        }
        (dir, cfg)
    }

    const LICENSE: &str = r#"
name: license_compliance
jobs:
  license:
    check: { kind: license, variant: cpu, list: { program: ciflow-missing-lister } }
"#;

    #[test]
    fn license_workflow_without_scanner_is_an_error() {
        let (dir, cfg) = setup(Some(LICENSE));
        let report = doctor(dir.path(), &cfg).unwrap();
        assert!(report.has_errors());
        assert!(report
            .findings
            .iter()
            .any(|f| f.severity == Severity::Warn && f.message.contains("ciflow-missing-lister")));
    }

    #[test]
    fn configured_scanner_and_no_webhook_only_warns() {
        let (dir, mut cfg) = setup(Some(LICENSE));
        cfg.scan.base_url = Some("https://scan.example.com".into());
        cfg.scan.api_key = Some("k".into());
        let report = doctor(dir.path(), &cfg).unwrap();
        assert!(!report.has_errors());
        assert!(report.findings.iter().any(|f| f.message.contains("CIFLOW_WEBHOOK_URL")));
    }

    #[test]
    fn broken_workflow_is_an_error() {
        let (dir, cfg) = setup(Some("name: x\njobs: {}\n"));
        let report = doctor(dir.path(), &cfg).unwrap();
        assert!(report.has_errors());
    }
}
