use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use ciflow_artifacts::{ArtifactStore, JobManifest, StepRecord, StepRole};
use ciflow_core::{
    millis, now_ms, CheckSummary, FailureKind, JobInstanceId, JobOutcome, JobPhase, JobStatus, NotificationEvent, Outcome,
    PhaseError, RunContext, RunId, StepStatus,
};
use ciflow_notify::{notify_best_effort, should_notify, Notifier};
use ciflow_scan::{LicenseScanner, PollPolicy};
use ciflow_spec::JobPlan;
use tracing::{debug, error, info, warn};

use crate::checks::{build_check, CheckContext, CheckDeps};
use crate::events::OutcomeLog;
use crate::exec::{CommandExecutor, ExecEnv};
use crate::provision::provision;

/// Services shared by every job of a pipeline run.
pub struct JobDeps {
    pub store: Arc<dyn ArtifactStore>,
    pub exec: Arc<dyn CommandExecutor>,
    pub scanner: Arc<dyn LicenseScanner>,
    pub notifier: Arc<dyn Notifier>,
    pub poll: PollPolicy,
    pub primary_branch: String,
    pub workdir: PathBuf,
    pub events: OutcomeLog,
}

/// The workflow a job belongs to, fixed for the whole run.
#[derive(Clone, Debug)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub workflow: String,
    pub workflow_hash: String,
    pub ctx: RunContext,
}

/// Environment for every command of one job instance: resolved job env,
/// one `CIFLOW_MATRIX_<AXIS>` per matrix value, then the run context.
pub fn job_env(plan: &JobPlan, ctx: &RunContext) -> BTreeMap<String, String> {
    let mut env = plan.env.clone();
    for (axis, value) in &plan.matrix {
        let key = axis.to_ascii_uppercase().replace(|c: char| !c.is_ascii_alphanumeric(), "_");
        env.insert(format!("CIFLOW_MATRIX_{key}"), value.clone());
    }
    env.extend(ctx.to_env());
    env.insert("CIFLOW_JOB".into(), plan.display_name.clone());
    env
}

struct PhaseTracker<'a> {
    current: JobPhase,
    history: Vec<JobPhase>,
    instance: &'a JobInstanceId,
    events: &'a OutcomeLog,
}

impl<'a> PhaseTracker<'a> {
    fn start(instance: &'a JobInstanceId, events: &'a OutcomeLog) -> Self {
        events.push(Outcome::PhaseEntered { instance: instance.clone(), phase: JobPhase::Provisioning });
        Self {
            current: JobPhase::Provisioning,
            history: vec![JobPhase::Provisioning],
            instance,
            events,
        }
    }

    fn enter(&mut self, next: JobPhase) -> Result<(), PhaseError> {
        self.current.advance(next)?;
        self.history.push(next);
        self.events.push(Outcome::PhaseEntered { instance: self.instance.clone(), phase: next });
        debug!(instance = self.instance.as_str(), phase = ?next, "phase");
        Ok(())
    }
}

/// Worklog lines are diagnostics; a failed write never changes the verdict.
fn worklog(deps: &JobDeps, job_dir: &Path, line: &str) {
    if let Err(e) = deps.store.append_worklog(job_dir, line) {
        warn!(error = %format!("{e:#}"), "could not append to worklog");
    }
}

struct JobResult {
    status: JobStatus,
    failure: Option<FailureKind>,
    check: Option<CheckSummary>,
    error: Option<String>,
}

async fn execute(
    plan: &JobPlan,
    run: &WorkflowRun,
    deps: &JobDeps,
    instance: &JobInstanceId,
    job_dir: &Path,
    phases: &mut PhaseTracker<'_>,
    steps: &mut Vec<StepRecord>,
) -> Result<JobResult> {
    let env = job_env(plan, &run.ctx);

    let prov_env = ExecEnv {
        workdir: deps.workdir.clone(),
        env: env.clone(),
        log_dir: deps.store.step_dir(job_dir, StepRole::Provision)?,
        log_rel: "provision".into(),
    };
    if let Err(e) = provision(&plan.provision, deps.exec.as_ref(), &prov_env, steps).await {
        warn!(job = %plan.display_name, error = %e, "provisioning failed; check skipped");
        deps.events.push(Outcome::ProvisionFailed { instance: instance.clone(), reason: e.to_string() });
        worklog(deps, job_dir, &format!("provisioning failed: {e}"));
        return Ok(JobResult {
            status: JobStatus::Failed,
            failure: Some(FailureKind::Provisioning),
            check: None,
            error: Some(e.to_string()),
        });
    }

    phases.enter(JobPhase::Running)?;
    let check_env = ExecEnv {
        workdir: deps.workdir.clone(),
        env,
        log_dir: deps.store.step_dir(job_dir, StepRole::Check)?,
        log_rel: "check".into(),
    };
    let check = build_check(
        &plan.check,
        &CheckDeps { scanner: deps.scanner.clone(), poll: deps.poll.clone() },
    );
    let ctx = CheckContext { run: &run.ctx, exec: deps.exec.as_ref(), env: &check_env };
    let report = check.run(&ctx).await?;
    steps.extend(report.steps.iter().cloned());

    worklog(deps, job_dir, &format!("{}: {}", check.kind().as_str(), report.summary));
    for line in &report.remediation {
        worklog(deps, job_dir, &format!("- {line}"));
    }
    deps.events.push(Outcome::CheckCompleted {
        instance: instance.clone(),
        kind: check.kind(),
        status: report.status,
    });

    let passed = report.passed();
    Ok(JobResult {
        status: if passed { JobStatus::Succeeded } else { JobStatus::Failed },
        failure: (!passed).then_some(FailureKind::Check),
        error: (!passed).then(|| report.summary.clone()),
        check: Some(report.to_summary(check.kind())),
    })
}

/// Runs one job instance to completion: provision, check, notify, record.
/// Never returns an error; anything unexpected becomes a failed job with
/// [`FailureKind::Internal`].
pub async fn run_job(plan: JobPlan, run: Arc<WorkflowRun>, deps: Arc<JobDeps>) -> JobOutcome {
    let instance = JobInstanceId::new();
    let started_at_ms = now_ms();
    deps.events.push(Outcome::JobStarted { instance: instance.clone(), name: plan.display_name.clone() });
    info!(job = %plan.display_name, workflow = %run.workflow, instance = instance.as_str(), "job started");

    let mut phases = PhaseTracker::start(&instance, &deps.events);
    let mut steps = Vec::new();
    let job_dir = deps.store.create_job_dir(&run.run_id, &instance);

    let result = match &job_dir {
        Ok(dir) => execute(&plan, &run, &deps, &instance, dir, &mut phases, &mut steps).await,
        Err(e) => Err(anyhow!("{e:#}")),
    };
    let JobResult { status, failure, check, error } = result.unwrap_or_else(|e| {
        error!(job = %plan.display_name, error = %format!("{e:#}"), "job failed internally");
        JobResult {
            status: JobStatus::Failed,
            failure: Some(FailureKind::Internal),
            check: None,
            error: Some(format!("{e:#}")),
        }
    });

    let mut notified = false;
    if should_notify(status, &run.ctx, &deps.primary_branch, plan.notify) {
        if let Err(e) = phases.enter(JobPhase::Notifying) {
            warn!(error = %e, "phase transition rejected");
        }
        let event = NotificationEvent::from_context(&run.ctx, &plan.display_name);
        let t = Instant::now();
        notified = notify_best_effort(deps.notifier.as_ref(), &event).await;
        deps.events.push(if notified {
            Outcome::NotificationSent { instance: instance.clone() }
        } else {
            Outcome::NotificationDropped { instance: instance.clone(), reason: "delivery failed".into() }
        });
        steps.push(StepRecord {
            role: StepRole::Notify,
            name: "failure notification".into(),
            status: if notified { StepStatus::Pass } else { StepStatus::Fail },
            duration_ms: millis(t.elapsed()),
            logs: vec![],
        });
    }
    if let Err(e) = phases.enter(JobPhase::Done) {
        warn!(error = %e, "phase transition rejected");
    }

    if let Ok(dir) = &job_dir {
        let manifest = JobManifest {
            run_id: run.run_id.as_str().to_string(),
            instance_id: instance.as_str().to_string(),
            workflow: run.workflow.clone(),
            workflow_hash: run.workflow_hash.clone(),
            job: plan.display_name.clone(),
            matrix: plan.matrix.clone(),
            phases: phases.history.clone(),
            steps,
            status,
            failure,
            notified,
        };
        if let Err(e) = deps.store.write_manifest(dir, &manifest) {
            error!(job = %plan.display_name, error = %format!("{e:#}"), "could not write job manifest");
        }
    }

    let phases = phases.history;
    deps.events.push(Outcome::JobFinished { instance: instance.clone(), status });
    info!(job = %plan.display_name, status = ?status, failure = ?failure, notified, "job finished");

    JobOutcome {
        instance_id: instance,
        job_id: plan.job_id.clone(),
        display_name: plan.display_name.clone(),
        status,
        failure,
        phases,
        check,
        notified,
        error,
        started_at_ms,
        finished_at_ms: now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{Script, ScriptedExecutor};
    use async_trait::async_trait;
    use ciflow_artifacts::FsArtifactStore;
    use ciflow_core::TriggerEvent;
    use ciflow_notify::MemoryNotifier;
    use ciflow_scan::MemoryScanner;
    use ciflow_spec::{parse_workflow, plan_jobs, CommandSpec};

    const WF: &str = r#"
name: tests
jobs:
  format:
    provision:
      runtime: { program: python, version: "3.8" }
      install:
        - { name: black, program: pip, args: [install, black] }
    check:
      kind: format
      command: { program: black, args: [--check, .] }
"#;

    fn ctx(git_ref: &str) -> RunContext {
        RunContext {
            actor: "octo".into(),
            workflow: "tests".into(),
            repository: "acme/widgets".into(),
            run_id: "77".into(),
            run_attempt: 1,
            run_number: 12,
            event: TriggerEvent::Push,
            git_ref: git_ref.into(),
            base_ref: None,
            server_url: "https://git.example.com".into(),
            changed_files: vec![],
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        deps: Arc<JobDeps>,
        exec: Arc<ScriptedExecutor>,
        notifier: Arc<MemoryNotifier>,
    }

    fn harness(script: &str, notifier: MemoryNotifier) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let exec = Arc::new(ScriptedExecutor::new(serde_yaml::from_str::<Script>(script).unwrap()));
        let notifier = Arc::new(notifier);
        let deps = Arc::new(JobDeps {
            store: Arc::new(FsArtifactStore::new(root.join("runs"))),
            exec: exec.clone(),
            scanner: Arc::new(MemoryScanner::passing()),
            notifier: notifier.clone(),
            poll: PollPolicy::default(),
            primary_branch: "main".into(),
            workdir: root.clone(),
            events: OutcomeLog::new(),
        });
        Harness { _dir: dir, root, deps, exec, notifier }
    }

    fn run_for(git_ref: &str) -> Arc<WorkflowRun> {
        Arc::new(WorkflowRun {
            run_id: RunId::from_str("run-1"),
            workflow: "tests".into(),
            workflow_hash: "h".into(),
            ctx: ctx(git_ref),
        })
    }

    fn plan() -> JobPlan {
        plan_jobs(&parse_workflow(WF).unwrap()).unwrap().remove(0)
    }

    const PY38: &str = r#"{ match: "python --version", stdout: "Python 3.8.18" }"#;

    #[tokio::test]
    async fn provision_failure_skips_check_and_notifies_on_primary() {
        let h = harness(r#"commands: [ { match: "python --version", stdout: "Python 3.11.2" } ]"#, MemoryNotifier::new());
        let out = run_job(plan(), run_for("refs/heads/main"), h.deps.clone()).await;

        assert_eq!(out.status, JobStatus::Failed);
        assert_eq!(out.failure, Some(FailureKind::Provisioning));
        assert!(out.check.is_none());
        assert!(!h.exec.calls().iter().any(|c| c.starts_with("black")));
        assert_eq!(out.phases, vec![JobPhase::Provisioning, JobPhase::Notifying, JobPhase::Done]);
        assert!(out.notified);
        let sent = h.notifier.events();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].job_name, "format");

        let manifest_path = h
            .root
            .join("runs/run-1")
            .join(out.instance_id.as_str())
            .join("job_manifest.json");
        let manifest: JobManifest = serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.failure, Some(FailureKind::Provisioning));
        assert_eq!(manifest.steps.last().unwrap().role, StepRole::Notify);
    }

    #[tokio::test]
    async fn check_failure_off_primary_writes_remediation_without_notifying() {
        let script = format!("commands: [ {PY38}, {{ match: black, exit: 1 }} ]");
        let h = harness(&script, MemoryNotifier::new());
        let out = run_job(plan(), run_for("refs/heads/feature/x"), h.deps.clone()).await;

        assert_eq!(out.status, JobStatus::Failed);
        assert_eq!(out.failure, Some(FailureKind::Check));
        assert!(!out.notified);
        assert!(h.notifier.events().is_empty());
        assert_eq!(out.phases, vec![JobPhase::Provisioning, JobPhase::Running, JobPhase::Done]);
        let worklog = std::fs::read_to_string(
            h.root.join("runs/run-1").join(out.instance_id.as_str()).join("worklog.md"),
        )
        .unwrap();
        assert!(worklog.contains("pre-commit install --hook-type pre-push"));
    }

    #[tokio::test]
    async fn success_on_primary_is_silent() {
        let h = harness(&format!("commands: [ {PY38} ]"), MemoryNotifier::new());
        let out = run_job(plan(), run_for("refs/heads/main"), h.deps.clone()).await;
        assert_eq!(out.status, JobStatus::Succeeded);
        assert_eq!(out.check.as_ref().unwrap().status, StepStatus::Pass);
        assert!(h.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_leaves_status_alone() {
        let script = format!("commands: [ {PY38}, {{ match: black, exit: 1 }} ]");
        let h = harness(&script, MemoryNotifier::failing());
        let out = run_job(plan(), run_for("refs/heads/main"), h.deps.clone()).await;
        assert_eq!(out.status, JobStatus::Failed);
        assert_eq!(out.failure, Some(FailureKind::Check));
        assert!(!out.notified);
        assert_eq!(h.notifier.events().len(), 1);
        assert!(h
            .deps
            .events
            .snapshot()
            .iter()
            .any(|o| matches!(o, Outcome::NotificationDropped { .. })));
    }

    struct BrokenExecutor;

    #[async_trait]
    impl CommandExecutor for BrokenExecutor {
        async fn run(&self, cmd: &CommandSpec, _env: &ExecEnv, _index: usize) -> Result<crate::exec::CommandResult> {
            Err(anyhow!("spawn '{}': no such file", cmd.program))
        }

        fn resolve_tool(&self, _name: &str, _env: &ExecEnv) -> Option<PathBuf> {
            None
        }
    }

    #[tokio::test]
    async fn executor_error_during_check_is_internal() {
        let wf = parse_workflow("name: w\njobs:\n  f: { check: { kind: format, command: { program: black } } }\n").unwrap();
        let plan = plan_jobs(&wf).unwrap().remove(0);
        let h = harness("commands: []", MemoryNotifier::new());
        let deps = Arc::new(JobDeps {
            store: h.deps.store.clone(),
            exec: Arc::new(BrokenExecutor),
            scanner: h.deps.scanner.clone(),
            notifier: h.deps.notifier.clone(),
            poll: PollPolicy::default(),
            primary_branch: "main".into(),
            workdir: h.root.clone(),
            events: OutcomeLog::new(),
        });
        let out = run_job(plan, run_for("refs/heads/main"), deps).await;
        assert_eq!(out.status, JobStatus::Failed);
        assert_eq!(out.failure, Some(FailureKind::Internal));
        assert!(out.error.unwrap().contains("no such file"));
        assert!(out.notified);
    }

    /// Real job dirs, but the worklog cannot be written.
    struct NoWorklogStore(FsArtifactStore);

    impl ArtifactStore for NoWorklogStore {
        fn create_job_dir(&self, run_id: &RunId, instance: &JobInstanceId) -> Result<PathBuf> {
            self.0.create_job_dir(run_id, instance)
        }
        fn write_manifest(&self, job_dir: &Path, manifest: &JobManifest) -> Result<()> {
            self.0.write_manifest(job_dir, manifest)
        }
        fn append_worklog(&self, _job_dir: &Path, _line: &str) -> Result<()> {
            Err(anyhow!("No space left on device"))
        }
        fn step_dir(&self, job_dir: &Path, role: StepRole) -> Result<PathBuf> {
            self.0.step_dir(job_dir, role)
        }
    }

    fn with_store(h: &Harness) -> Arc<JobDeps> {
        Arc::new(JobDeps {
            store: Arc::new(NoWorklogStore(FsArtifactStore::new(h.root.join("runs")))),
            exec: h.exec.clone(),
            scanner: h.deps.scanner.clone(),
            notifier: h.deps.notifier.clone(),
            poll: PollPolicy::default(),
            primary_branch: "main".into(),
            workdir: h.root.clone(),
            events: OutcomeLog::new(),
        })
    }

    #[tokio::test]
    async fn worklog_write_failure_keeps_provisioning_failure() {
        let h = harness(r#"commands: [ { match: "python --version", stdout: "Python 3.11.2" } ]"#, MemoryNotifier::new());
        let out = run_job(plan(), run_for("refs/heads/main"), with_store(&h)).await;
        assert_eq!(out.failure, Some(FailureKind::Provisioning));
        let err = out.error.unwrap();
        assert!(err.contains("3.11.2"), "{err}");
        assert!(!err.contains("No space left"));
        assert!(out.notified);
    }

    #[tokio::test]
    async fn worklog_write_failure_keeps_check_verdict() {
        let script = format!("commands: [ {PY38}, {{ match: black, exit: 1 }} ]");
        let h = harness(&script, MemoryNotifier::new());
        let out = run_job(plan(), run_for("refs/heads/feature/x"), with_store(&h)).await;
        assert_eq!(out.failure, Some(FailureKind::Check));
        assert_eq!(out.check.unwrap().remediation.len(), 2);

        let h = harness(&format!("commands: [ {PY38} ]"), MemoryNotifier::new());
        let out = run_job(plan(), run_for("refs/heads/main"), with_store(&h)).await;
        assert_eq!(out.status, JobStatus::Succeeded);
    }

    #[test]
    fn env_carries_matrix_and_context() {
        let wf = parse_workflow(
            "name: w\njobs:\n  t:\n    strategy: { matrix: { os: [ubuntu-latest] } }\n    check: { kind: test_suite, command: { program: pytest } }\n",
        )
        .unwrap();
        let plan = plan_jobs(&wf).unwrap().remove(0);
        let env = job_env(&plan, &ctx("refs/heads/main"));
        assert_eq!(env["CIFLOW_MATRIX_OS"], "ubuntu-latest");
        assert_eq!(env["CIFLOW_REF"], "refs/heads/main");
        assert_eq!(env["CIFLOW_JOB"], "t (ubuntu-latest)");
    }
}
