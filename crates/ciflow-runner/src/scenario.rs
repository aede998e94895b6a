use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ciflow_artifacts::FsArtifactStore;
use ciflow_core::{FailureKind, JobStatus, NotificationEvent, RunContext, StepStatus, TriggerEvent};
use ciflow_notify::MemoryNotifier;
use ciflow_scan::{MemoryScanner, PollPolicy, ScanReport, Verdict, VerdictBody};
use ciflow_spec::load_workflow_dir;
use serde::Deserialize;

use crate::events::OutcomeLog;
use crate::job::JobDeps;
use crate::pipeline::{run_pipeline, PipelineOptions};
use crate::scripted::{Script, ScriptedExecutor};

/// `event.yaml`: the source-control event a scenario replays.
#[derive(Debug, Deserialize)]
pub struct ScenarioEvent {
    pub event: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub base_ref: Option<String>,
    #[serde(default = "default_actor")]
    pub actor: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default = "default_primary")]
    pub primary_branch: String,
    #[serde(default)]
    pub runtime_version: Option<String>,
}

fn default_actor() -> String {
    "scenario-bot".to_string()
}

fn default_primary() -> String {
    "main".to_string()
}

impl ScenarioEvent {
    pub fn to_context(&self) -> Result<RunContext> {
        let detail = self.action.as_deref().or(self.cron.as_deref());
        let event = TriggerEvent::from_parts(&self.event, detail)
            .ok_or_else(|| anyhow!("unknown event '{}'", self.event))?;
        Ok(RunContext {
            actor: self.actor.clone(),
            workflow: String::new(),
            repository: "scenario/repo".into(),
            run_id: "1".into(),
            run_attempt: 1,
            run_number: 1,
            event,
            git_ref: self.git_ref.clone(),
            base_ref: self.base_ref.clone(),
            server_url: "https://git.example.com".into(),
            changed_files: self.changed_files.clone(),
        })
    }
}

/// `scanner.yaml`: verdicts the scanning service hands out, in order.
#[derive(Debug, Default, Deserialize)]
pub struct ScannerScript {
    #[serde(default)]
    pub verdicts: Vec<VerdictBody>,
}

/// `expected.yaml`.
#[derive(Debug, Deserialize)]
pub struct ScenarioExpected {
    pub scenario_id: String,
    #[serde(default)]
    pub triggered: Vec<String>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobStatus>,
    #[serde(default)]
    pub notifications: Vec<String>,
}

#[derive(Debug)]
pub struct ScenarioResult {
    pub triggered: Vec<String>,
    pub jobs: BTreeMap<String, JobStatus>,
    pub failures: BTreeMap<String, FailureKind>,
    /// Check steps per job instance, in execution order.
    pub steps: BTreeMap<String, Vec<(String, StepStatus)>>,
    pub remediation: BTreeMap<String, Vec<String>>,
    pub notifications: Vec<NotificationEvent>,
    pub submitted: Vec<ScanReport>,
    /// Every command line the jobs ran.
    pub commands: Vec<String>,
    pub exit_code: i32,
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_yaml::from_str(&s).with_context(|| format!("parse {}", path.display()))
}

pub fn load_expected(dir: &Path) -> Result<ScenarioExpected> {
    read_yaml(&dir.join("expected.yaml"))
}

/// Replays a scenario directory through trigger matching, matrix expansion
/// and the job lifecycle. Commands come from `outcomes.yaml`, verdicts from
/// `scanner.yaml`; nothing is spawned and nothing leaves the process.
pub async fn simulate(dir: &Path) -> Result<ScenarioResult> {
    let workflows = load_workflow_dir(&dir.join("workflows"))?;
    let event: ScenarioEvent = read_yaml(&dir.join("event.yaml"))?;
    let ctx = event.to_context()?;

    let outcomes = dir.join("outcomes.yaml");
    let script = if outcomes.exists() { Script::load(&outcomes)? } else { Script::default() };
    let scanner_path = dir.join("scanner.yaml");
    let scanner_script: ScannerScript = if scanner_path.exists() {
        read_yaml(&scanner_path)?
    } else {
        ScannerScript::default()
    };
    let verdicts = scanner_script
        .verdicts
        .into_iter()
        .map(Verdict::try_from)
        .collect::<Result<Vec<_>, _>>()
        .context("scanner.yaml")?;
    let verdicts = if verdicts.is_empty() { vec![Verdict::Passed] } else { verdicts };

    let scratch = tempfile::tempdir().context("create scratch dir")?;
    let exec = Arc::new(ScriptedExecutor::new(script));
    let scanner = Arc::new(MemoryScanner::new(verdicts));
    let notifier = Arc::new(MemoryNotifier::new());
    let deps = Arc::new(JobDeps {
        store: Arc::new(FsArtifactStore::new(scratch.path().join("runs"))),
        exec: exec.clone(),
        scanner: scanner.clone(),
        notifier: notifier.clone(),
        poll: PollPolicy { interval_ms: 1, max_interval_ms: 5, timeout_ms: 2_000 },
        primary_branch: event.primary_branch.clone(),
        workdir: scratch.path().to_path_buf(),
        events: OutcomeLog::new(),
    });

    let opts = PipelineOptions { runtime_version: event.runtime_version.clone(), only_job: None };
    let report = run_pipeline(&workflows, &ctx, &opts, deps).await?;

    let mut result = ScenarioResult {
        triggered: report
            .workflows
            .iter()
            .filter(|w| w.triggered)
            .map(|w| w.name.clone())
            .collect(),
        jobs: BTreeMap::new(),
        failures: BTreeMap::new(),
        steps: BTreeMap::new(),
        remediation: BTreeMap::new(),
        notifications: notifier.events(),
        submitted: scanner.submitted(),
        commands: exec.calls(),
        exit_code: report.exit_code(),
    };
    for job in report.jobs() {
        result.jobs.insert(job.display_name.clone(), job.status);
        if let Some(f) = job.failure {
            result.failures.insert(job.display_name.clone(), f);
        }
        if let Some(check) = &job.check {
            let steps = check.steps.iter().map(|s| (s.name.clone(), s.status)).collect();
            result.steps.insert(job.display_name.clone(), steps);
            if !check.remediation.is_empty() {
                result.remediation.insert(job.display_name.clone(), check.remediation.clone());
            }
        }
    }
    Ok(result)
}
