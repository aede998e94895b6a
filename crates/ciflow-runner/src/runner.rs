use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ciflow_artifacts::FsArtifactStore;
use ciflow_core::{NotificationEvent, ReportId, RunContext};
use ciflow_notify::{DisabledNotifier, Notifier, WebhookNotifier};
use ciflow_scan::{HttpScanner, LicenseScanner, ScanError, ScanReport, Verdict};
use ciflow_spec::{load_workflow_dir, matches_trigger, JobPlan, Workflow};
use tracing::info;

use crate::doctor::{doctor, DoctorReport};
use crate::events::OutcomeLog;
use crate::exec::ProcessExecutor;
use crate::job::JobDeps;
use crate::pipeline::{plan_workflow, run_pipeline, PipelineOptions, PipelineReport};
use crate::Config;

/// Stands in when no scanning service is configured; every license check
/// fails with a clear reason instead of the run aborting.
pub struct UnconfiguredScanner;

#[async_trait]
impl LicenseScanner for UnconfiguredScanner {
    async fn submit(&self, _report: &ScanReport) -> Result<ReportId, ScanError> {
        Err(ScanError::NotConfigured("set scan.base_url or CIFLOW_SCAN_URL".into()))
    }

    async fn verdict(&self, _report_id: &ReportId) -> Result<Verdict, ScanError> {
        Err(ScanError::NotConfigured("set scan.base_url or CIFLOW_SCAN_URL".into()))
    }
}

#[derive(Clone, Debug)]
pub struct PlannedWorkflow {
    pub file: String,
    pub name: String,
    pub triggered: bool,
    pub jobs: Vec<JobPlan>,
}

pub struct Runner {
    pub repo_root: PathBuf,
    pub cfg: Config,
    pub deps: Arc<JobDeps>,
}

impl Runner {
    pub fn open(repo_root: PathBuf) -> Result<Self> {
        let cfg = Config::open(&repo_root)?;
        let deps = Arc::new(Self::build_deps(&repo_root, &cfg)?);
        Ok(Self { repo_root, cfg, deps })
    }

    fn build_deps(repo_root: &Path, cfg: &Config) -> Result<JobDeps> {
        let scanner: Arc<dyn LicenseScanner> = match &cfg.scan.base_url {
            Some(url) => Arc::new(
                HttpScanner::new(url, cfg.scan.api_key.clone(), cfg.scan.request_timeout())
                    .context("build scanning service client")?,
            ),
            None => Arc::new(UnconfiguredScanner),
        };
        let notifier = Self::notifier(cfg)?;
        Ok(JobDeps {
            store: Arc::new(FsArtifactStore::new(cfg.artifact_root())),
            exec: Arc::new(ProcessExecutor),
            scanner,
            notifier,
            poll: cfg.scan.poll_policy(),
            primary_branch: cfg.project.primary_branch.clone(),
            workdir: repo_root.to_path_buf(),
            events: OutcomeLog::new(),
        })
    }

    fn notifier(cfg: &Config) -> Result<Arc<dyn Notifier>> {
        Ok(match &cfg.notify.webhook_url {
            Some(url) => Arc::new(
                WebhookNotifier::new(url, cfg.notify.webhook_type, Duration::from_secs(cfg.notify.timeout_secs))
                    .context("build webhook client")?,
            ),
            None => Arc::new(DisabledNotifier),
        })
    }

    /// Writes a default `.ciflow/ciflow.toml` and an empty workflows dir if
    /// missing. Returns the config path.
    pub fn init_repo(repo_root: &Path) -> Result<PathBuf> {
        let cfg_path = Config::config_path(repo_root);
        let cfg = if cfg_path.exists() {
            Config::load_from(&cfg_path)?
        } else {
            let project_id = repo_root.file_name().and_then(|s| s.to_str()).unwrap_or("repo");
            let cfg = Config::default_for_repo(project_id);
            cfg.save_to(&cfg_path)?;
            cfg
        };
        let wf_dir = cfg.workflows_dir(repo_root);
        std::fs::create_dir_all(&wf_dir).with_context(|| format!("create {}", wf_dir.display()))?;
        Ok(cfg_path)
    }

    pub fn workflows(&self) -> Result<Vec<(String, Workflow)>> {
        load_workflow_dir(&self.cfg.workflows_dir(&self.repo_root))
    }

    pub fn options(&self, only_job: Option<String>) -> PipelineOptions {
        PipelineOptions {
            runtime_version: self.cfg.runtime.version.clone(),
            only_job,
        }
    }

    /// Which workflows `ctx` triggers and the job instances each would run.
    pub fn plan(&self, ctx: &RunContext) -> Result<Vec<PlannedWorkflow>> {
        let opts = self.options(None);
        let mut out = Vec::new();
        for (file, wf) in self.workflows()? {
            let triggered = matches_trigger(&wf, ctx)?;
            let jobs = if triggered {
                plan_workflow(&wf, &opts).with_context(|| format!("plan {file}"))?
            } else {
                Vec::new()
            };
            out.push(PlannedWorkflow { file, name: wf.name.clone(), triggered, jobs });
        }
        Ok(out)
    }

    pub async fn run(&self, ctx: &RunContext, only_job: Option<String>) -> Result<PipelineReport> {
        let workflows = self.workflows()?;
        let report = run_pipeline(&workflows, ctx, &self.options(only_job), self.deps.clone()).await?;
        info!(run = %report.run_id, failed = report.failed(), "pipeline finished");
        Ok(report)
    }

    pub fn doctor(&self) -> Result<DoctorReport> {
        doctor(&self.repo_root, &self.cfg)
    }

    /// Sends one sample notification for `ctx`. Unlike job notifications,
    /// delivery errors are returned to the caller.
    pub async fn notify_test(&self, ctx: &RunContext, job_name: &str) -> Result<NotificationEvent> {
        let event = NotificationEvent::from_context(ctx, job_name);
        self.deps.notifier.notify(&event).await.context("deliver test notification")?;
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_open_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = Runner::init_repo(dir.path()).unwrap();
        assert!(path.ends_with(".ciflow/ciflow.toml"));
        assert!(dir.path().join(".ciflow/workflows").is_dir());

        // init is idempotent
        Runner::init_repo(dir.path()).unwrap();

        let runner = Runner::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(runner.cfg.project.primary_branch, "main");
        assert!(runner.workflows().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_scanner_refuses() {
        let err = UnconfiguredScanner
            .verdict(&ReportId::from_str("r"))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::NotConfigured(_)));
    }
}
