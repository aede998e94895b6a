use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use ciflow_core::{RunContext, TriggerEvent};
use ciflow_runner::{Runner, Severity};
use ciflow_spec::{load_workflow, workflow_hash};

#[derive(Parser)]
#[command(name = "ciflow", version, about = "Run provision/check/notify workflows")]
struct Cli {
    /// Repository root holding `.ciflow/ciflow.toml`.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config and workflows directory
    Init,

    /// Parse and validate workflow files, printing each content hash
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show which workflows the event triggers and their job instances
    Plan {
        /// Workflows directory; a relative path resolves against `--repo`,
        /// not the current directory.
        #[arg(long)]
        workflows: Option<PathBuf>,
        #[command(flatten)]
        ctx: ContextArgs,
    },

    /// Run every triggered workflow
    Run {
        /// Workflows directory; a relative path resolves against `--repo`,
        /// not the current directory.
        #[arg(long)]
        workflows: Option<PathBuf>,
        /// Run only this job id; its needs are treated as satisfied.
        #[arg(long)]
        job: Option<String>,
        /// Print the full report as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
        #[command(flatten)]
        ctx: ContextArgs,
    },

    /// Check config, service endpoints and tools
    Doctor,

    /// Send one sample failure notification
    NotifyTest {
        #[arg(long, default_value = "notify-test")]
        job_name: String,
        #[command(flatten)]
        ctx: ContextArgs,
    },
}

#[derive(Args)]
struct ContextArgs {
    #[arg(long, env = "CIFLOW_ACTOR", default_value = "local")]
    actor: String,
    #[arg(long, env = "CIFLOW_WORKFLOW", default_value = "")]
    workflow: String,
    #[arg(long, env = "CIFLOW_REPOSITORY", default_value = "local/repo")]
    repository: String,
    #[arg(long, env = "CIFLOW_RUN_ID", default_value = "0")]
    run_id: String,
    #[arg(long, env = "CIFLOW_RUN_ATTEMPT", default_value_t = 1)]
    run_attempt: u32,
    #[arg(long, env = "CIFLOW_RUN_NUMBER", default_value_t = 0)]
    run_number: u64,
    /// push, pull_request, schedule or workflow_dispatch.
    #[arg(long, env = "CIFLOW_EVENT", default_value = "push")]
    event: String,
    #[arg(long = "ref", env = "CIFLOW_REF", default_value = "refs/heads/main")]
    git_ref: String,
    #[arg(long, env = "CIFLOW_BASE_REF")]
    base_ref: Option<String>,
    #[arg(long, env = "CIFLOW_SERVER_URL", default_value = "https://github.com")]
    server_url: String,
    /// Pull request action, e.g. opened or synchronize.
    #[arg(long, env = "CIFLOW_EVENT_ACTION")]
    action: Option<String>,
    #[arg(long, env = "CIFLOW_CRON")]
    cron: Option<String>,
    /// Path changed by the push or pull request; repeatable.
    #[arg(long = "changed-file")]
    changed_files: Vec<String>,
}

impl ContextArgs {
    fn into_context(self) -> anyhow::Result<RunContext> {
        let detail = self.action.as_deref().or(self.cron.as_deref());
        let event = TriggerEvent::from_parts(&self.event, detail)
            .ok_or_else(|| anyhow!("unsupported event '{}'", self.event))?;
        Ok(RunContext {
            actor: self.actor,
            workflow: self.workflow,
            repository: self.repository,
            run_id: self.run_id,
            run_attempt: self.run_attempt,
            run_number: self.run_number,
            event,
            git_ref: self.git_ref,
            base_ref: self.base_ref,
            server_url: self.server_url,
            changed_files: self.changed_files,
        })
    }
}

/// Loads (which validates) one workflow file and returns its content hash.
fn validate_file(path: &Path) -> anyhow::Result<String> {
    workflow_hash(&load_workflow(path)?)
}

fn open_runner(repo: &Path, workflows: Option<PathBuf>) -> anyhow::Result<Runner> {
    let mut r = Runner::open(repo.to_path_buf())?;
    if let Some(dir) = workflows {
        r.cfg.project.workflows_dir = dir.display().to_string();
    }
    Ok(r)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    fmt().with_target(false).with_env_filter(filter).init();

    let repo_root = std::fs::canonicalize(&cli.repo).unwrap_or_else(|_| cli.repo.clone());

    match cli.cmd {
        Command::Init => {
            let path = Runner::init_repo(&repo_root)?;
            println!("Initialized ciflow in {} ({})", repo_root.display(), path.display());
        }
        Command::Validate { files } => {
            let mut bad = 0;
            for file in files {
                match validate_file(&file) {
                    Ok(hash) => println!("{}  {}", hash, file.display()),
                    Err(e) => {
                        eprintln!("{}: {e:#}", file.display());
                        bad += 1;
                    }
                }
            }
            if bad > 0 {
                std::process::exit(1);
            }
        }
        Command::Plan { workflows, ctx } => {
            let r = open_runner(&repo_root, workflows)?;
            let ctx = ctx.into_context()?;
            for wf in r.plan(&ctx)? {
                if !wf.triggered {
                    println!("- {} ({}): not triggered", wf.name, wf.file);
                    continue;
                }
                println!("- {} ({}):", wf.name, wf.file);
                for job in wf.jobs {
                    if job.needs.is_empty() {
                        println!("    {}", job.display_name);
                    } else {
                        println!("    {} (needs {})", job.display_name, job.needs.join(", "));
                    }
                }
            }
        }
        Command::Run { workflows, job, json, ctx } => {
            let r = open_runner(&repo_root, workflows)?;
            let ctx = ctx.into_context()?;
            let report = r.run(&ctx, job).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for wf in report.workflows.iter().filter(|w| w.triggered) {
                    println!("{}:", wf.name);
                    if let Some(err) = &wf.error {
                        println!("  error: {err}");
                    }
                    for j in &wf.jobs {
                        match j.failure {
                            Some(kind) => println!("  {:<40} {:?} ({:?})", j.display_name, j.status, kind),
                            None => println!("  {:<40} {:?}", j.display_name, j.status),
                        }
                    }
                }
            }
            let code = report.exit_code();
            info!(run = %report.run_id, code, "done");
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::Doctor => {
            let r = Runner::open(repo_root)?;
            let report = r.doctor()?;
            for f in &report.findings {
                let tag = match f.severity {
                    Severity::Ok => "ok",
                    Severity::Warn => "warn",
                    Severity::Error => "error",
                };
                println!("[{tag:>5}] {}", f.message);
            }
            if report.has_errors() {
                std::process::exit(1);
            }
        }
        Command::NotifyTest { job_name, ctx } => {
            let r = Runner::open(repo_root)?;
            let ctx = ctx.into_context()?;
            let event = r
                .notify_test(&ctx, &job_name)
                .await
                .context("notify-test")?;
            println!("sent notification for '{}' on {}", event.job_name, event.git_ref);
        }
    }

    Ok(())
}
