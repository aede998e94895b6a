use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ciflow_core::{elapsed_ms, now_ms};
use ciflow_spec::CommandSpec;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::warn;

/// Where and with what environment a job's commands run.
#[derive(Clone, Debug)]
pub struct ExecEnv {
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Absolute directory receiving `cmd-NNN.*.log` files.
    pub log_dir: PathBuf,
    /// `log_dir` relative to the job directory, used in manifests.
    pub log_rel: String,
}

impl ExecEnv {
    pub fn rel(&self, name: &str) -> String {
        if self.log_rel.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.log_rel, name)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub index: usize,
    pub program: String,
    pub args: Vec<String>,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub started_at_ms: i64,
    pub finished_at_ms: i64,
    /// Paths relative to the job directory.
    pub stdout_path: String,
    pub stderr_path: String,
    #[serde(skip)]
    pub stdout: String,
    #[serde(skip)]
    pub stderr: String,
}

impl CommandResult {
    pub fn duration_ms(&self) -> i64 {
        elapsed_ms(self.started_at_ms, self.finished_at_ms)
    }

    pub fn logs(&self) -> Vec<String> {
        vec![self.stdout_path.clone(), self.stderr_path.clone()]
    }

    /// One-line description for summaries and errors.
    pub fn describe(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else {
            match self.exit_code {
                Some(c) => format!("exit={c}"),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

/// Runs commands and resolves tools. Errors are reserved for the executor
/// itself (spawn, log I/O); a command that ran and failed is `Ok` with
/// `success == false`.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, cmd: &CommandSpec, env: &ExecEnv, index: usize) -> Result<CommandResult>;
    fn resolve_tool(&self, name: &str, env: &ExecEnv) -> Option<PathBuf>;
}

/// Spawns real processes with `tokio::process`. No implicit shell.
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn run(&self, cmd: &CommandSpec, env: &ExecEnv, index: usize) -> Result<CommandResult> {
        exec_command(cmd, env, index).await
    }

    fn resolve_tool(&self, name: &str, env: &ExecEnv) -> Option<PathBuf> {
        let path = env
            .env
            .get("PATH")
            .cloned()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_default();
        which::which_in(name, Some(path), &env.workdir).ok()
    }
}

pub fn log_names(index: usize) -> (String, String) {
    (format!("cmd-{index:03}.stdout.log"), format!("cmd-{index:03}.stderr.log"))
}

/// Writes captured output next to the other step logs.
pub async fn write_logs(log_dir: &Path, index: usize, stdout: &[u8], stderr: &[u8]) -> Result<(String, String)> {
    tokio::fs::create_dir_all(log_dir)
        .await
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let (out_name, err_name) = log_names(index);
    let out_path = log_dir.join(&out_name);
    let err_path = log_dir.join(&err_name);
    tokio::fs::write(&out_path, stdout)
        .await
        .with_context(|| format!("write {}", out_path.display()))?;
    tokio::fs::write(&err_path, stderr)
        .await
        .with_context(|| format!("write {}", err_path.display()))?;
    Ok((out_name, err_name))
}

/// How long readers may keep draining after the child exits. A killed
/// command can leave grandchildren holding the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

type Captured = Arc<Mutex<Vec<u8>>>;

/// Copies a pipe into a shared buffer as it arrives, so output written
/// before a timeout survives the kill.
fn drain<R>(pipe: Option<R>) -> (Captured, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf: Captured = Arc::default();
    let sink = buf.clone();
    let task = tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(&chunk[..n]),
            }
        }
    });
    (buf, task)
}

async fn finish(task: JoinHandle<()>, buf: &Captured) -> Vec<u8> {
    let abort = task.abort_handle();
    if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
        abort.abort();
    }
    std::mem::take(&mut *buf.lock().unwrap_or_else(PoisonError::into_inner))
}

pub async fn exec_command(cmd: &CommandSpec, env: &ExecEnv, index: usize) -> Result<CommandResult> {
    let started_at_ms = now_ms();
    let cwd = cmd
        .cwd
        .as_ref()
        .map(|rel| env.workdir.join(rel))
        .unwrap_or_else(|| env.workdir.clone());

    let mut child = tokio::process::Command::new(&cmd.program)
        .args(&cmd.args)
        .current_dir(&cwd)
        .envs(env.env.iter())
        .envs(cmd.env.iter())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn '{}' in {}", cmd.program, cwd.display()))?;

    let (out_buf, out_task) = drain(child.stdout.take());
    let (err_buf, err_task) = drain(child.stderr.take());

    let status = match cmd.timeout_sec {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), child.wait()).await {
            Ok(status) => Some(status),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(program = %cmd.program, error = %e, "could not kill timed-out command");
                }
                None
            }
        },
        None => Some(child.wait().await),
    };
    let status = status.transpose().with_context(|| format!("wait for '{}'", cmd.program))?;

    let stdout = finish(out_task, &out_buf).await;
    let mut stderr = finish(err_task, &err_buf).await;

    let (exit_code, success, timed_out) = match status {
        Some(st) => (st.code(), st.success(), false),
        None => {
            let secs = cmd.timeout_sec.unwrap_or_default();
            stderr.extend_from_slice(format!("\n[ciflow] timed out after {secs}s; process killed\n").as_bytes());
            (None, false, true)
        }
    };

    let (out_name, err_name) = write_logs(&env.log_dir, index, &stdout, &stderr).await?;
    Ok(CommandResult {
        index,
        program: cmd.program.clone(),
        args: cmd.args.clone(),
        exit_code,
        success,
        timed_out,
        started_at_ms,
        finished_at_ms: now_ms(),
        stdout_path: env.rel(&out_name),
        stderr_path: env.rel(&err_name),
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn env(dir: &Path) -> ExecEnv {
        let mut vars = BTreeMap::new();
        vars.insert("GREETING".to_string(), "hi".to_string());
        ExecEnv {
            workdir: dir.to_path_buf(),
            env: vars,
            log_dir: dir.join("check"),
            log_rel: "check".into(),
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn captures_output_and_writes_logs() {
        let dir = tempfile::tempdir().unwrap();
        let res = exec_command(&sh("echo $GREETING; echo oops >&2"), &env(dir.path()), 3)
            .await
            .unwrap();
        assert!(res.success);
        assert_eq!(res.exit_code, Some(0));
        assert_eq!(res.stdout.trim(), "hi");
        assert_eq!(res.stdout_path, "check/cmd-003.stdout.log");
        let err = std::fs::read_to_string(dir.path().join("check/cmd-003.stderr.log")).unwrap();
        assert_eq!(err.trim(), "oops");
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let res = exec_command(&sh("exit 3"), &env(dir.path()), 0).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.describe(), "exit=3");
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = sh("sleep 5");
        cmd.timeout_sec = Some(1);
        let res = exec_command(&cmd, &env(dir.path()), 0).await.unwrap();
        assert!(res.timed_out);
        assert!(!res.success);
        assert!(res.duration_ms() < 5_000);
    }

    #[tokio::test]
    async fn timeout_keeps_partial_output_and_marks_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = sh("echo collecting; echo warming up >&2; sleep 5");
        cmd.timeout_sec = Some(1);
        let res = exec_command(&cmd, &env(dir.path()), 4).await.unwrap();
        assert!(res.timed_out);
        assert_eq!(res.describe(), "timed out");
        let out = std::fs::read_to_string(dir.path().join("check/cmd-004.stdout.log")).unwrap();
        assert_eq!(out.trim(), "collecting");
        let err = std::fs::read_to_string(dir.path().join("check/cmd-004.stderr.log")).unwrap();
        assert!(err.starts_with("warming up"), "{err}");
        assert!(err.contains("timed out after 1s"), "{err}");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = CommandSpec {
            program: "ciflow-definitely-not-installed".into(),
            ..Default::default()
        };
        let err = exec_command(&cmd, &env(dir.path()), 0).await.unwrap_err();
        assert!(format!("{err:#}").contains("spawn"));
    }

    #[test]
    fn resolves_tools_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let e = env(dir.path());
        assert!(ProcessExecutor.resolve_tool("sh", &e).is_some());
        assert!(ProcessExecutor.resolve_tool("ciflow-definitely-not-installed", &e).is_none());
    }
}
