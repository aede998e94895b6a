use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use ciflow_core::{CheckKind, DependencyVariant};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("workflow missing name")]
    MissingName,
    #[error("workflow {0} declares no jobs")]
    NoJobs(String),
    #[error("job {job} needs unknown job {missing}")]
    UnknownNeed { job: String, missing: String },
    #[error("job dependency graph contains a cycle through {0}")]
    Cycle(String),
    #[error("job {job}: {what} has an empty program")]
    EmptyProgram { job: String, what: String },
    #[error("invalid cron expression '{0}': expected 5 fields")]
    BadCron(String),
    #[error("job {job}: matrix axis '{axis}' has no values")]
    EmptyAxis { job: String, axis: String },
    #[error("job {job}: unknown dependency variant '{variant}' (expected cpu or gpu)")]
    BadVariant { job: String, variant: String },
    #[error("unterminated expression in '{0}'")]
    UnterminatedExpr(String),
    #[error("unknown expression '{0}'")]
    UnknownExpr(String),
    #[error("unknown reference '{0}'")]
    UnknownRef(String),
}

/// Declarative workflow loaded from YAML.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(rename = "on", default)]
    pub triggers: Triggers,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub jobs: BTreeMap<String, JobDef>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Triggers {
    #[serde(default, deserialize_with = "declared")]
    pub push: Option<PushTrigger>,
    #[serde(default, deserialize_with = "declared")]
    pub pull_request: Option<PullRequestTrigger>,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
    #[serde(default, deserialize_with = "declared")]
    pub workflow_dispatch: Option<DispatchTrigger>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PushTrigger {
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default, rename = "branches-ignore", alias = "branches_ignore")]
    pub branches_ignore: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default, rename = "paths-ignore", alias = "paths_ignore")]
    pub paths_ignore: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PullRequestTrigger {
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default, rename = "paths-ignore", alias = "paths_ignore")]
    pub paths_ignore: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub cron: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DispatchTrigger {}

/// A trigger key that is present but empty (`push:`) still counts as declared.
fn declared<'de, D, T>(d: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(d).map(|o| Some(o.unwrap_or_default()))
}

fn one_or_many<'de, D>(d: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobDef {
    /// Display name; defaults to the job id.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub needs: Vec<String>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub provision: ProvisionSpec,
    pub check: CheckSpec,
    /// Post a failure notification for this job on the primary branch.
    #[serde(default = "default_true")]
    pub notify: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: MatrixSpec,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MatrixSpec {
    #[serde(default)]
    pub include: Vec<BTreeMap<String, serde_yaml::Value>>,
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, serde_yaml::Value>>,
    #[serde(flatten)]
    pub axes: BTreeMap<String, Vec<serde_yaml::Value>>,
}

/// Command spec: program + args. No implicit shell.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory relative to the job workdir.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Kill the command after this many seconds.
    #[serde(default)]
    pub timeout_sec: Option<u64>,
}

impl CommandSpec {
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionSpec {
    #[serde(default)]
    pub runtime: Option<RuntimeSpec>,
    #[serde(default)]
    pub install: Vec<InstallTarget>,
    /// Binaries that must resolve on PATH before the check runs.
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeSpec {
    pub program: String,
    pub version: String,
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,
}

fn default_version_args() -> Vec<String> {
    vec!["--version".to_string()]
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallTarget {
    pub name: String,
    #[serde(flatten)]
    pub command: CommandSpec,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckSpec {
    Format(FormatCheckSpec),
    License(LicenseCheckSpec),
    TestSuite(TestSuiteSpec),
}

impl CheckSpec {
    pub fn kind(&self) -> CheckKind {
        match self {
            CheckSpec::Format(_) => CheckKind::Format,
            CheckSpec::License(_) => CheckKind::License,
            CheckSpec::TestSuite(_) => CheckKind::TestSuite,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatCheckSpec {
    /// Formatter invocation in verification-only mode.
    pub command: CommandSpec,
    /// What to run locally to fix formatting, shown on failure.
    #[serde(default)]
    pub fix_hint: Option<String>,
    /// How to install the pre-push hook, shown on failure.
    #[serde(default)]
    pub hook_hint: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LicenseCheckSpec {
    /// `cpu` or `gpu`, usually `${{ matrix.variant }}`.
    pub variant: String,
    /// Command that prints the installed dependency set.
    pub list: CommandSpec,
    /// Project name reported to the scanning service; defaults to the repository.
    #[serde(default)]
    pub project: Option<String>,
}

impl LicenseCheckSpec {
    pub fn dependency_variant(&self) -> Option<DependencyVariant> {
        DependencyVariant::parse(&self.variant)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestSuiteSpec {
    /// Installs the component under test and its test dependencies.
    #[serde(default)]
    pub install: Vec<InstallTarget>,
    pub command: CommandSpec,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_slowest")]
    pub slowest: u32,
    #[serde(default = "default_max_failures_flag")]
    pub max_failures_flag: String,
    #[serde(default = "default_durations_flag")]
    pub durations_flag: String,
}

fn default_max_failures() -> u32 {
    5
}

fn default_slowest() -> u32 {
    10
}

fn default_max_failures_flag() -> String {
    "--maxfail".to_string()
}

fn default_durations_flag() -> String {
    "--durations".to_string()
}

impl JobDef {
    pub fn display_name<'a>(&'a self, job_id: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(job_id)
    }

    fn commands(&self) -> Vec<(String, &CommandSpec)> {
        let mut out = Vec::new();
        for t in &self.provision.install {
            out.push((format!("install target '{}'", t.name), &t.command));
        }
        match &self.check {
            CheckSpec::Format(f) => out.push(("format command".into(), &f.command)),
            CheckSpec::License(l) => out.push(("license listing command".into(), &l.list)),
            CheckSpec::TestSuite(t) => {
                for i in &t.install {
                    out.push((format!("test install '{}'", i.name), &i.command));
                }
                out.push(("test command".into(), &t.command));
            }
        }
        out
    }
}

pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read workflow: {}", path.display()))?;
    parse_workflow(&s).with_context(|| format!("parse workflow {}", path.display()))
}

pub fn parse_workflow(s: &str) -> Result<Workflow> {
    let wf: Workflow = serde_yaml::from_str(s).with_context(|| "parse workflow yaml")?;
    validate_workflow(&wf)?;
    Ok(wf)
}

/// Loads every `*.yml`/`*.yaml` file in `dir`, sorted by file name.
pub fn load_workflow_dir(dir: &Path) -> Result<Vec<(String, Workflow)>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let p = entry?.path();
        let is_yaml = matches!(p.extension().and_then(|e| e.to_str()), Some("yml") | Some("yaml"));
        if p.is_file() && is_yaml {
            paths.push(p);
        }
    }
    paths.sort();
    paths
        .into_iter()
        .map(|p| {
            let file = p.file_name().and_then(|s| s.to_str()).unwrap_or_default().to_string();
            load_workflow(&p).map(|wf| (file, wf))
        })
        .collect()
}

pub fn validate_workflow(wf: &Workflow) -> std::result::Result<(), SpecError> {
    if wf.name.trim().is_empty() {
        return Err(SpecError::MissingName);
    }
    if wf.jobs.is_empty() {
        return Err(SpecError::NoJobs(wf.name.clone()));
    }

    for entry in &wf.triggers.schedule {
        if entry.cron.split_whitespace().count() != 5 {
            return Err(SpecError::BadCron(entry.cron.clone()));
        }
    }

    for (id, job) in &wf.jobs {
        for need in &job.needs {
            if !wf.jobs.contains_key(need) {
                return Err(SpecError::UnknownNeed { job: id.clone(), missing: need.clone() });
            }
        }
        for (what, cmd) in job.commands() {
            if cmd.program.trim().is_empty() {
                return Err(SpecError::EmptyProgram { job: id.clone(), what });
            }
        }
        if let Some(rt) = &job.provision.runtime {
            if rt.program.trim().is_empty() {
                return Err(SpecError::EmptyProgram { job: id.clone(), what: "runtime".into() });
            }
        }
        if let Some(strategy) = &job.strategy {
            for (axis, values) in &strategy.matrix.axes {
                if values.is_empty() {
                    return Err(SpecError::EmptyAxis { job: id.clone(), axis: axis.clone() });
                }
            }
        }
        // Literal variants can be checked now; templated ones are checked at plan time.
        if let CheckSpec::License(l) = &job.check {
            if !l.variant.contains("${{") && l.dependency_variant().is_none() {
                return Err(SpecError::BadVariant { job: id.clone(), variant: l.variant.clone() });
            }
        }
    }

    check_acyclic(wf)
}

fn check_acyclic(wf: &Workflow) -> std::result::Result<(), SpecError> {
    let graph: HashMap<&str, Vec<&str>> = wf
        .jobs
        .iter()
        .map(|(id, j)| (id.as_str(), j.needs.iter().map(String::as_str).collect()))
        .collect();

    fn visit<'a>(
        v: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        temp: &mut HashSet<&'a str>,
        perm: &mut HashSet<&'a str>,
    ) -> bool {
        if perm.contains(v) {
            return false;
        }
        if !temp.insert(v) {
            return true;
        }
        if let Some(ns) = graph.get(v) {
            for &n in ns {
                if visit(n, graph, temp, perm) {
                    return true;
                }
            }
        }
        temp.remove(v);
        perm.insert(v);
        false
    }

    let mut temp = HashSet::new();
    let mut perm = HashSet::new();
    for id in wf.jobs.keys() {
        if visit(id, &graph, &mut temp, &mut perm) {
            return Err(SpecError::Cycle(id.clone()));
        }
    }
    Ok(())
}

/// Recursively sort object keys for stable hashing.
fn sort_json(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new_map = serde_json::Map::new();
            for k in keys {
                let child = map.get(&k).cloned().unwrap_or(serde_json::Value::Null);
                new_map.insert(k, sort_json(child));
            }
            serde_json::Value::Object(new_map)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.into_iter().map(sort_json).collect()),
        other => other,
    }
}

pub fn workflow_hash(wf: &Workflow) -> Result<String> {
    let v = sort_json(serde_json::to_value(wf).context("serialize workflow")?);
    let bytes = serde_json::to_vec(&v)?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LICENSE_WF: &str = r#"
name: license_compliance
on:
  push:
    branches: [main]
  pull_request:
    paths: [pyproject.toml]
  schedule:
    - cron: "0 0 * * *"
  workflow_dispatch:
env:
  RUNTIME_VERSION: "3.8"
jobs:
  license:
    strategy:
      matrix:
        variant: [cpu, gpu]
    provision:
      runtime: { program: python, version: "${{ env.RUNTIME_VERSION }}" }
      install:
        - name: deps
          program: pip
          args: [install, ".[${{ matrix.variant }}]"]
    check:
      kind: license
      variant: "${{ matrix.variant }}"
      list: { program: pip, args: [freeze] }
"#;

    #[test]
    fn parses_triggers_and_check() {
        let wf = parse_workflow(LICENSE_WF).unwrap();
        assert!(wf.triggers.push.is_some());
        assert!(wf.triggers.workflow_dispatch.is_some());
        assert_eq!(wf.triggers.pull_request.as_ref().unwrap().paths, vec!["pyproject.toml"]);
        let job = &wf.jobs["license"];
        assert_eq!(job.check.kind(), CheckKind::License);
        assert!(job.notify);
        assert_eq!(job.strategy.as_ref().unwrap().matrix.axes["variant"].len(), 2);
        assert_eq!(job.provision.runtime.as_ref().unwrap().version_args, vec!["--version"]);
    }

    #[test]
    fn needs_accepts_single_string() {
        let wf = parse_workflow(
            r#"
name: tests
on: { push: {} }
jobs:
  format:
    check: { kind: format, command: { program: black, args: [--check, .] } }
  unit:
    needs: format
    check: { kind: test_suite, command: { program: pytest } }
"#,
        )
        .unwrap();
        assert_eq!(wf.jobs["unit"].needs, vec!["format"]);
        match &wf.jobs["unit"].check {
            CheckSpec::TestSuite(t) => {
                assert_eq!(t.max_failures, 5);
                assert_eq!(t.max_failures_flag, "--maxfail");
            }
            other => panic!("unexpected check {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_need_and_cycles() {
        let unknown = r#"
name: w
jobs:
  a: { needs: [zz], check: { kind: format, command: { program: fmt } } }
"#;
        let err = parse_workflow(unknown).unwrap_err();
        assert!(format!("{err:#}").contains("needs unknown job zz"));

        let cyclic = r#"
name: w
jobs:
  a: { needs: [b], check: { kind: format, command: { program: fmt } } }
  b: { needs: [a], check: { kind: format, command: { program: fmt } } }
"#;
        let err = parse_workflow(cyclic).unwrap_err();
        assert!(format!("{err:#}").contains("cycle"));
    }

    #[test]
    fn rejects_bad_cron_and_literal_variant() {
        let bad_cron = r#"
name: w
on: { schedule: [ { cron: "0 0 *" } ] }
jobs:
  a: { check: { kind: format, command: { program: fmt } } }
"#;
        assert!(format!("{:#}", parse_workflow(bad_cron).unwrap_err()).contains("5 fields"));

        let bad_variant = r#"
name: w
jobs:
  a: { check: { kind: license, variant: tpu, list: { program: pip } } }
"#;
        assert!(format!("{:#}", parse_workflow(bad_variant).unwrap_err()).contains("tpu"));
    }

    #[test]
    fn rejects_empty_program() {
        let wf = r#"
name: w
jobs:
  a: { check: { kind: format, command: { program: "" } } }
"#;
        assert!(format!("{:#}", parse_workflow(wf).unwrap_err()).contains("empty program"));
    }

    #[test]
    fn hash_is_stable() {
        let wf = parse_workflow(LICENSE_WF).unwrap();
        let h1 = workflow_hash(&wf).unwrap();
        let h2 = workflow_hash(&parse_workflow(LICENSE_WF).unwrap()).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn loads_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.yml"), LICENSE_WF).unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "name: fmt\njobs:\n  f: { check: { kind: format, command: { program: fmt } } }\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let all = load_workflow_dir(dir.path()).unwrap();
        let names: Vec<_> = all.iter().map(|(f, w)| (f.as_str(), w.name.as_str())).collect();
        assert_eq!(names, vec![("a.yaml", "fmt"), ("b.yml", "license_compliance")]);
    }
}
