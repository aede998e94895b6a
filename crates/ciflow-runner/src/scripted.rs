use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ciflow_core::now_ms;
use ciflow_spec::CommandSpec;
use serde::Deserialize;

use crate::exec::{write_logs, CommandExecutor, CommandResult, ExecEnv};

/// Canned result for every command whose display line starts with `match`
/// and whose environment contains all of `env`.
#[derive(Clone, Debug, Deserialize)]
pub struct ScriptedCommand {
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub exit: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub timeout: bool,
}

impl ScriptedCommand {
    fn matches(&self, display: &str, env: &ExecEnv) -> bool {
        display.starts_with(&self.pattern) && self.env.iter().all(|(k, v)| env.env.get(k) == Some(v))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub commands: Vec<ScriptedCommand>,
    /// Tools that never resolve on PATH.
    #[serde(default)]
    pub missing_tools: Vec<String>,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_yaml::from_str(&s).with_context(|| format!("parse {}", path.display()))
    }
}

/// Replays a [`Script`] instead of spawning processes. Commands without a
/// matching entry succeed with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Script,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(script: Script) -> Self {
        Self { script, calls: Mutex::new(Vec::new()) }
    }

    /// Display lines of every command run so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn run(&self, cmd: &CommandSpec, env: &ExecEnv, index: usize) -> Result<CommandResult> {
        let started_at_ms = now_ms();
        let display = cmd.display();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(display.clone());
        }
        let rule = self.script.commands.iter().find(|r| r.matches(&display, env));
        let (exit, stdout, stderr, timed_out) = match rule {
            Some(r) => (r.exit, r.stdout.clone(), r.stderr.clone(), r.timeout),
            None => (0, String::new(), String::new(), false),
        };
        let (out_name, err_name) = write_logs(&env.log_dir, index, stdout.as_bytes(), stderr.as_bytes()).await?;
        Ok(CommandResult {
            index,
            program: cmd.program.clone(),
            args: cmd.args.clone(),
            exit_code: if timed_out { None } else { Some(exit) },
            success: !timed_out && exit == 0,
            timed_out,
            started_at_ms,
            finished_at_ms: now_ms(),
            stdout_path: env.rel(&out_name),
            stderr_path: env.rel(&err_name),
            stdout,
            stderr,
        })
    }

    fn resolve_tool(&self, name: &str, _env: &ExecEnv) -> Option<PathBuf> {
        if self.script.missing_tools.iter().any(|t| t == name) {
            None
        } else {
            Some(PathBuf::from("/usr/bin").join(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_matching_rule_wins_and_env_narrows() {
        let script: Script = serde_yaml::from_str(
            r#"
commands:
  - { match: "pytest", env: { CIFLOW_MATRIX_OS: windows-latest }, exit: 1, stdout: "1 failed" }
  - { match: "pytest", stdout: "3 passed" }
missing_tools: [hatch]
"#,
        )
        .unwrap();
        let exec = ScriptedExecutor::new(script);
        let dir = tempfile::tempdir().unwrap();
        let mut env = ExecEnv {
            workdir: dir.path().to_path_buf(),
            env: BTreeMap::new(),
            log_dir: dir.path().join("check"),
            log_rel: "check".into(),
        };
        let cmd = CommandSpec { program: "pytest".into(), args: vec!["test".into()], ..Default::default() };

        let ok = exec.run(&cmd, &env, 0).await.unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout, "3 passed");

        env.env.insert("CIFLOW_MATRIX_OS".into(), "windows-latest".into());
        let bad = exec.run(&cmd, &env, 1).await.unwrap();
        assert!(!bad.success);
        assert_eq!(bad.exit_code, Some(1));
        assert!(dir.path().join("check/cmd-001.stdout.log").exists());

        assert_eq!(exec.calls(), vec!["pytest test", "pytest test"]);
        assert!(exec.resolve_tool("hatch", &env).is_none());
        assert!(exec.resolve_tool("git", &env).is_some());
    }
}
