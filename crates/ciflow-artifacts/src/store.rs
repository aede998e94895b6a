use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ciflow_core::{JobInstanceId, RunId};

use crate::manifest::{JobManifest, StepRole};

pub trait ArtifactStore: Send + Sync {
    fn create_job_dir(&self, run_id: &RunId, instance: &JobInstanceId) -> Result<PathBuf>;
    fn write_manifest(&self, job_dir: &Path, manifest: &JobManifest) -> Result<()>;
    fn append_worklog(&self, job_dir: &Path, line: &str) -> Result<()>;
    fn step_dir(&self, job_dir: &Path, role: StepRole) -> Result<PathBuf>;
}

#[derive(Clone)]
pub struct FsArtifactStore {
    pub root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn role_dir(role: StepRole) -> &'static str {
        match role {
            StepRole::Provision => "provision",
            StepRole::Check => "check",
            StepRole::Notify => "notify",
        }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn create_job_dir(&self, run_id: &RunId, instance: &JobInstanceId) -> Result<PathBuf> {
        let dir = self.root.join(run_id.as_str()).join(instance.as_str());
        std::fs::create_dir_all(&dir).with_context(|| format!("create job dir {}", dir.display()))?;
        Ok(dir)
    }

    fn write_manifest(&self, job_dir: &Path, manifest: &JobManifest) -> Result<()> {
        let path = job_dir.join("job_manifest.json");
        let bytes = serde_json::to_vec_pretty(manifest)?;
        std::fs::write(&path, bytes).with_context(|| format!("write manifest {}", path.display()))?;
        Ok(())
    }

    fn append_worklog(&self, job_dir: &Path, line: &str) -> Result<()> {
        let path = job_dir.join("worklog.md");
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open worklog {}", path.display()))?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    fn step_dir(&self, job_dir: &Path, role: StepRole) -> Result<PathBuf> {
        let dir = job_dir.join(Self::role_dir(role));
        std::fs::create_dir_all(&dir).with_context(|| format!("create step dir {}", dir.display()))?;
        Ok(dir)
    }
}
