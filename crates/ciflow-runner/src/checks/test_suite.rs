use anyhow::Result;
use async_trait::async_trait;
use ciflow_core::{CheckKind, StepStatus, TestTiming};
use ciflow_spec::{CommandSpec, TestSuiteSpec};
use tracing::{info, warn};

use super::{command_step, plain_step, Check, CheckContext, CheckReport};

/// Installs the component under test, then runs its suite with a failure
/// cap and a slowest-tests report.
pub struct TestSuiteCheck {
    spec: TestSuiteSpec,
}

impl TestSuiteCheck {
    pub fn new(spec: TestSuiteSpec) -> Self {
        Self { spec }
    }

    /// The test command with `--maxfail=N` / `--durations=K` appended; a zero
    /// bound leaves its flag out.
    pub fn test_command(&self) -> CommandSpec {
        let mut cmd = self.spec.command.clone();
        if self.spec.max_failures > 0 {
            cmd.args.push(format!("{}={}", self.spec.max_failures_flag, self.spec.max_failures));
        }
        if self.spec.slowest > 0 {
            cmd.args.push(format!("{}={}", self.spec.durations_flag, self.spec.slowest));
        }
        cmd
    }
}

fn parse_timing(line: &str) -> Option<TestTiming> {
    let mut tokens = line.split_whitespace();
    let secs = tokens.next()?.strip_suffix('s')?.parse::<f64>().ok()?;
    let phase = tokens.next()?;
    let test = tokens.next()?;
    if !matches!(phase, "call" | "setup" | "teardown") {
        return None;
    }
    Some(TestTiming { seconds: secs, phase: phase.to_string(), test: test.to_string() })
}

/// Slowest `limit` entries of a durations report (`0.52s call  path::test`),
/// slowest first.
pub fn parse_durations(output: &str, limit: usize) -> Vec<TestTiming> {
    let mut timings: Vec<TestTiming> = output.lines().filter_map(parse_timing).collect();
    timings.sort_by(|a, b| b.seconds.total_cmp(&a.seconds));
    timings.truncate(limit);
    timings
}

/// The tool's own result line, e.g. `3 failed, 120 passed in 9.81s`.
fn result_line(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .map(|l| l.trim().trim_matches('=').trim())
        .find(|l| l.contains(" passed") || l.contains(" failed") || l.contains(" error"))
        .map(str::to_string)
}

#[async_trait]
impl Check for TestSuiteCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::TestSuite
    }

    async fn run(&self, ctx: &CheckContext<'_>) -> Result<CheckReport> {
        let mut steps = Vec::new();
        let mut index = 0;

        for target in &self.spec.install {
            let res = ctx.exec.run(&target.command, ctx.env, index).await?;
            index += 1;
            steps.push(command_step(format!("install {}", target.name), &res));
            if !res.success {
                warn!(target = %target.name, result = %res.describe(), "test dependency install failed");
                steps.push(plain_step(self.spec.command.display(), StepStatus::Skipped, 0));
                return Ok(CheckReport {
                    status: StepStatus::Fail,
                    summary: format!("install '{}' failed ({})", target.name, res.describe()),
                    remediation: vec![],
                    slowest: vec![],
                    steps,
                });
            }
        }

        let cmd = self.test_command();
        let cmd_display = cmd.display();
        let res = ctx.exec.run(&cmd, ctx.env, index).await?;
        steps.push(command_step(cmd_display.clone(), &res));

        let slowest = parse_durations(&res.stdout, self.spec.slowest as usize);
        let summary = result_line(&res.stdout).unwrap_or_else(|| format!("`{cmd_display}` {}", res.describe()));
        if res.success {
            info!(command = %cmd_display, %summary, "test suite passed");
        } else {
            warn!(command = %cmd_display, %summary, "test suite failed");
        }
        Ok(CheckReport {
            status: if res.success { StepStatus::Pass } else { StepStatus::Fail },
            summary,
            remediation: vec![],
            slowest,
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ExecEnv;
    use crate::scripted::{Script, ScriptedExecutor};
    use ciflow_core::{RunContext, TriggerEvent};
    use std::collections::BTreeMap;

    fn spec(yaml: &str) -> TestSuiteSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    const SPEC: &str = r#"
install:
  - { name: component, program: pip, args: [install, "./rest_api"] }
command: { program: pytest, args: [rest_api/test] }
slowest: 2
"#;

    const REPORT: &str = "\
============================= slowest 2 durations ==============================
1.20s call     rest_api/test/test_api.py::test_upload
0.05s setup    rest_api/test/test_api.py::test_health
3.40s call     rest_api/test/test_api.py::test_search
========================= 1 failed, 40 passed in 9.81s =========================
";

    #[test]
    fn appends_bounds_and_omits_zero() {
        let check = TestSuiteCheck::new(spec(SPEC));
        assert_eq!(check.test_command().display(), "pytest rest_api/test --maxfail=5 --durations=2");

        let mut s = spec(SPEC);
        s.max_failures = 0;
        s.durations_flag = "--slowest".into();
        assert_eq!(TestSuiteCheck::new(s).test_command().args, vec!["rest_api/test", "--slowest=2"]);
    }

    #[test]
    fn keeps_slowest_first_and_caps() {
        let t = parse_durations(REPORT, 2);
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].test, "rest_api/test/test_api.py::test_search");
        assert_eq!(t[1].seconds, 1.20);
        assert_eq!(result_line(REPORT).as_deref(), Some("1 failed, 40 passed in 9.81s"));
    }

    async fn run(script: &str) -> (CheckReport, Vec<String>) {
        let exec = ScriptedExecutor::new(serde_yaml::from_str::<Script>(script).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let env = ExecEnv {
            workdir: dir.path().to_path_buf(),
            env: BTreeMap::new(),
            log_dir: dir.path().join("check"),
            log_rel: "check".into(),
        };
        let run = RunContext {
            actor: "dev".into(),
            workflow: "rest_api".into(),
            repository: "o/r".into(),
            run_id: "3".into(),
            run_attempt: 1,
            run_number: 3,
            event: TriggerEvent::Push,
            git_ref: "refs/heads/main".into(),
            base_ref: None,
            server_url: "https://git.example.com".into(),
            changed_files: vec![],
        };
        let ctx = CheckContext { run: &run, exec: &exec, env: &env };
        let report = TestSuiteCheck::new(spec(SPEC)).run(&ctx).await.unwrap();
        (report, exec.calls())
    }

    #[tokio::test]
    async fn failing_suite_reports_timings() {
        let script = format!(
            "commands:\n  - match: pytest\n    exit: 1\n    stdout: |\n{}",
            REPORT.lines().map(|l| format!("      {l}\n")).collect::<String>()
        );
        let (report, calls) = run(&script).await;
        assert_eq!(report.status, StepStatus::Fail);
        assert_eq!(report.summary, "1 failed, 40 passed in 9.81s");
        assert_eq!(report.slowest.len(), 2);
        assert_eq!(calls, vec!["pip install ./rest_api", "pytest rest_api/test --maxfail=5 --durations=2"]);
    }

    #[tokio::test]
    async fn install_failure_skips_the_suite() {
        let (report, calls) = run(r#"commands: [ { match: "pip install", exit: 1 } ]"#).await;
        assert_eq!(report.status, StepStatus::Fail);
        assert_eq!(calls.len(), 1);
        assert_eq!(report.steps[1].status, StepStatus::Skipped);
    }
}
