use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ciflow_notify::WebhookType;
use ciflow_scan::PollPolicy;
use serde::{Deserialize, Serialize};

pub const ENV_SCAN_API_KEY: &str = "CIFLOW_SCAN_API_KEY";
pub const ENV_SCAN_URL: &str = "CIFLOW_SCAN_URL";
pub const ENV_WEBHOOK_URL: &str = "CIFLOW_WEBHOOK_URL";
pub const ENV_WEBHOOK_TYPE: &str = "CIFLOW_WEBHOOK_TYPE";
pub const ENV_RUNTIME_VERSION: &str = "CIFLOW_RUNTIME_VERSION";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    pub primary_branch: String,
    pub artifact_root: String,
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,
}

fn default_workflows_dir() -> String {
    ".ciflow/workflows".to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Pinned runtime version; exposed to workflows as `env.CIFLOW_RUNTIME_VERSION`.
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default, skip_serializing)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_type: WebhookType,
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

fn default_notify_timeout() -> u64 {
    10
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_type: WebhookType::IncomingWebhook,
            timeout_secs: default_notify_timeout(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_max_interval")]
    pub poll_max_interval_ms: u64,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    2_000
}

fn default_poll_max_interval() -> u64 {
    30_000
}

fn default_poll_timeout() -> u64 {
    900
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            request_timeout_secs: default_request_timeout(),
            poll_interval_ms: default_poll_interval(),
            poll_max_interval_ms: default_poll_max_interval(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl ScanConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval_ms: self.poll_interval_ms,
            max_interval_ms: self.poll_max_interval_ms.max(self.poll_interval_ms),
            timeout_ms: self.poll_timeout_secs.saturating_mul(1_000),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    pub fn default_for_repo(project_id: &str) -> Self {
        Self {
            project: ProjectConfig {
                id: project_id.to_string(),
                primary_branch: "main".to_string(),
                artifact_root: "~/.ciflow/runs".to_string(),
                workflows_dir: default_workflows_dir(),
            },
            runtime: RuntimeConfig::default(),
            notify: NotifyConfig::default(),
            scan: ScanConfig::default(),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: Config = toml::from_str(&s).with_context(|| "parse ciflow.toml")?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Loads `.ciflow/ciflow.toml` under `repo_root`, falling back to defaults,
    /// then applies environment overrides.
    pub fn open(repo_root: &Path) -> Result<Self> {
        let path = Self::config_path(repo_root);
        let mut cfg = if path.exists() {
            Self::load_from(&path)?
        } else {
            let project_id = repo_root.file_name().and_then(|s| s.to_str()).unwrap_or("repo");
            Self::default_for_repo(project_id)
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    /// Secrets and the pinned runtime come from the environment and win over
    /// the file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let non_empty = |k: &str| lookup(k).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty(ENV_SCAN_API_KEY) {
            self.scan.api_key = Some(v);
        }
        if let Some(v) = non_empty(ENV_SCAN_URL) {
            self.scan.base_url = Some(v);
        }
        if let Some(v) = non_empty(ENV_WEBHOOK_URL) {
            self.notify.webhook_url = Some(v);
        }
        if let Some(v) = non_empty(ENV_WEBHOOK_TYPE) {
            self.notify.webhook_type =
                WebhookType::parse(&v).ok_or_else(|| anyhow!("invalid {ENV_WEBHOOK_TYPE}: {v}"))?;
        }
        if let Some(v) = non_empty(ENV_RUNTIME_VERSION) {
            self.runtime.version = Some(v);
        }
        Ok(())
    }

    pub fn artifact_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.project.artifact_root).to_string())
    }

    pub fn workflows_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.project.workflows_dir)
    }

    pub fn config_path(repo_root: &Path) -> PathBuf {
        repo_root.join(".ciflow").join("ciflow.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn round_trips_without_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = Config::config_path(dir.path());
        let mut cfg = Config::default_for_repo("widgets");
        cfg.notify.webhook_url = Some("https://hooks.example.com/secret".into());
        cfg.scan.api_key = Some("k".into());
        cfg.save_to(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("secret"));
        let back = Config::load_from(&path).unwrap();
        assert_eq!(back.project.id, "widgets");
        assert_eq!(back.project.primary_branch, "main");
        assert_eq!(back.notify.webhook_url, None);
        assert_eq!(back.scan.api_key, None);
    }

    #[test]
    fn minimal_file_gets_defaults() {
        let cfg: Config = toml::from_str(
            r#"
[project]
id = "w"
primary_branch = "trunk"
artifact_root = "/tmp/runs"
"#,
        )
        .unwrap();
        assert_eq!(cfg.project.workflows_dir, ".ciflow/workflows");
        assert_eq!(cfg.scan.poll_policy().timeout_ms, 900_000);
        assert_eq!(cfg.notify.webhook_type, WebhookType::IncomingWebhook);
    }

    #[test]
    fn env_overrides_secrets_and_runtime() {
        let env: HashMap<&str, &str> = [
            (ENV_SCAN_API_KEY, "abc"),
            (ENV_WEBHOOK_URL, "https://hooks.example.com/x"),
            (ENV_WEBHOOK_TYPE, "WORKFLOW_TRIGGER"),
            (ENV_RUNTIME_VERSION, "3.8"),
            (ENV_SCAN_URL, " "),
        ]
        .into_iter()
        .collect();
        let mut cfg = Config::default_for_repo("w");
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.scan.api_key.as_deref(), Some("abc"));
        assert_eq!(cfg.scan.base_url, None);
        assert_eq!(cfg.notify.webhook_type, WebhookType::WorkflowTrigger);
        assert_eq!(cfg.runtime.version.as_deref(), Some("3.8"));
    }

    #[test]
    fn bad_webhook_type_is_rejected() {
        let mut cfg = Config::default_for_repo("w");
        let err = cfg
            .apply_env(|k| (k == ENV_WEBHOOK_TYPE).then(|| "carrier-pigeon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn save_reports_unwritable_parent() {
        let dir = tempfile::tempdir().unwrap();
        // a plain file where the `.ciflow` directory should go
        std::fs::write(dir.path().join(".ciflow"), "").unwrap();
        let err = Config::default_for_repo("w")
            .save_to(&Config::config_path(dir.path()))
            .unwrap_err();
        assert!(format!("{err:#}").starts_with("create "), "{err:#}");
    }

    #[test]
    fn poll_policy_never_caps_below_interval() {
        let mut scan = ScanConfig::default();
        scan.poll_interval_ms = 5_000;
        scan.poll_max_interval_ms = 1_000;
        assert_eq!(scan.poll_policy().max_interval_ms, 5_000);
    }
}
