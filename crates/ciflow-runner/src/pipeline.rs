use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ciflow_core::{JobOutcome, JobStatus, Outcome, RunContext, RunId};
use ciflow_spec::{matches_trigger, plan_jobs, workflow_hash, JobPlan, Workflow};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::ENV_RUNTIME_VERSION;
use crate::job::{run_job, JobDeps, WorkflowRun};

#[derive(Clone, Debug, Serialize)]
pub struct WorkflowReport {
    pub name: String,
    pub file: String,
    pub triggered: bool,
    pub jobs: Vec<JobOutcome>,
    /// Set when the workflow could not be planned at all.
    pub error: Option<String>,
}

impl WorkflowReport {
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.jobs.iter().any(|j| j.status.is_failure())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub workflows: Vec<WorkflowReport>,
}

impl PipelineReport {
    pub fn failed(&self) -> bool {
        self.workflows.iter().any(WorkflowReport::failed)
    }

    /// 0 iff no job instance failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed() {
            1
        } else {
            0
        }
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobOutcome> {
        self.workflows.iter().flat_map(|w| w.jobs.iter())
    }
}

/// Knobs that apply to a whole pipeline invocation.
#[derive(Clone, Debug, Default)]
pub struct PipelineOptions {
    /// Pinned runtime version, visible as `env.CIFLOW_RUNTIME_VERSION`.
    pub runtime_version: Option<String>,
    /// Run just this job; its `needs` are treated as satisfied.
    pub only_job: Option<String>,
}

/// Expands a workflow into job instances with the pipeline-level env applied.
pub fn plan_workflow(wf: &Workflow, opts: &PipelineOptions) -> Result<Vec<JobPlan>> {
    let mut wf = wf.clone();
    if let Some(v) = &opts.runtime_version {
        wf.env.entry(ENV_RUNTIME_VERSION.to_string()).or_insert_with(|| v.clone());
    }
    let mut plans = plan_jobs(&wf)?;
    if let Some(only) = &opts.only_job {
        if !wf.jobs.contains_key(only) {
            return Err(anyhow!("workflow {} has no job '{only}'", wf.name));
        }
        plans.retain(|p| &p.job_id == only);
        for p in &mut plans {
            p.needs.clear();
        }
    }
    Ok(plans)
}

fn skip(plans: Vec<JobPlan>, reason: &str, deps: &JobDeps) -> Vec<JobOutcome> {
    plans
        .into_iter()
        .map(|p| {
            warn!(job = %p.display_name, reason, "job skipped");
            deps.events.push(Outcome::JobSkipped { name: p.display_name.clone(), reason: reason.to_string() });
            JobOutcome::skipped(&p.job_id, &p.display_name, reason)
        })
        .collect()
}

/// Runs every instance of `plans` concurrently. A job starts once every
/// instance of each job it needs has finished; it is skipped if any of them
/// did not succeed. Instances of one job never affect each other.
pub async fn run_plans(plans: Vec<JobPlan>, run: Arc<WorkflowRun>, deps: Arc<JobDeps>) -> Vec<JobOutcome> {
    let mut waiting: BTreeMap<String, Vec<JobPlan>> = BTreeMap::new();
    let mut needs: HashMap<String, Vec<String>> = HashMap::new();
    for p in plans {
        needs.entry(p.job_id.clone()).or_insert_with(|| p.needs.clone());
        waiting.entry(p.job_id.clone()).or_default().push(p);
    }

    // job id -> every instance succeeded
    let mut finished: HashMap<String, bool> = HashMap::new();
    let mut running: HashMap<String, (usize, bool)> = HashMap::new();
    let mut outcomes = Vec::new();
    let mut set: JoinSet<(String, JobOutcome)> = JoinSet::new();

    loop {
        // Start (or skip) everything whose needs are settled; skipping can
        // settle further jobs, so repeat until nothing changes.
        loop {
            let ready: Vec<String> = waiting
                .keys()
                .filter(|id| needs[*id].iter().all(|n| finished.contains_key(n) || !needs.contains_key(n)))
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                let Some(instances) = waiting.remove(&id) else { continue };
                let blocked = needs[&id].iter().find_map(|n| match finished.get(n) {
                    Some(true) => None,
                    Some(false) => Some(format!("needed job '{n}' did not succeed")),
                    // every matrix combination of it was excluded
                    None => Some(format!("needed job '{n}' has no matrix instances")),
                });
                if let Some(reason) = blocked {
                    outcomes.extend(skip(instances, &reason, &deps));
                    finished.insert(id, false);
                    continue;
                }
                running.insert(id.clone(), (instances.len(), true));
                for plan in instances {
                    let (run, deps) = (run.clone(), deps.clone());
                    let job_id = id.clone();
                    let job_display = plan.display_name.clone();
                    set.spawn(async move {
                        let handle = tokio::spawn(run_job(plan, run, deps));
                        let outcome = match handle.await {
                            Ok(o) => o,
                            Err(e) => {
                                error!(job = %job_display, error = %e, "job task aborted");
                                let mut o = JobOutcome::skipped(&job_id, &job_display, format!("job task aborted: {e}"));
                                o.status = JobStatus::Failed;
                                o.failure = Some(ciflow_core::FailureKind::Internal);
                                o
                            }
                        };
                        (job_id, outcome)
                    });
                }
            }
        }

        let Some(joined) = set.join_next().await else { break };
        let (job_id, outcome) = match joined {
            Ok(v) => v,
            Err(e) => {
                // The wrapper task only awaits; reaching this means the runtime is shutting down.
                error!(error = %e, "job wrapper failed");
                continue;
            }
        };
        if let Some((left, ok)) = running.get_mut(&job_id) {
            *left -= 1;
            *ok &= outcome.status == JobStatus::Succeeded;
            if *left == 0 {
                let ok = *ok;
                running.remove(&job_id);
                finished.insert(job_id, ok);
            }
        }
        outcomes.push(outcome);
    }

    // Unreachable with validated workflows; keeps every instance accounted for.
    for (_, instances) in std::mem::take(&mut waiting) {
        outcomes.extend(skip(instances, "dependencies never settled", &deps));
    }
    outcomes
}

/// Plans and runs one workflow for `ctx`, whether or not it was triggered;
/// callers filter with [`matches_trigger`] first.
pub async fn run_workflow(
    file: &str,
    wf: &Workflow,
    ctx: &RunContext,
    run_id: &RunId,
    opts: &PipelineOptions,
    deps: Arc<JobDeps>,
) -> WorkflowReport {
    let mut report = WorkflowReport {
        name: wf.name.clone(),
        file: file.to_string(),
        triggered: true,
        jobs: vec![],
        error: None,
    };
    let planned = plan_workflow(wf, opts).and_then(|plans| Ok((plans, workflow_hash(wf)?)));
    let (plans, hash) = match planned {
        Ok(v) => v,
        Err(e) => {
            error!(workflow = %wf.name, error = %format!("{e:#}"), "workflow could not be planned");
            report.error = Some(format!("{e:#}"));
            return report;
        }
    };

    let mut ctx = ctx.clone();
    ctx.workflow = wf.name.clone();
    let run = Arc::new(WorkflowRun {
        run_id: run_id.clone(),
        workflow: wf.name.clone(),
        workflow_hash: hash,
        ctx,
    });
    info!(workflow = %wf.name, instances = plans.len(), "workflow started");
    report.jobs = run_plans(plans, run, deps).await;
    report
}

/// Runs every workflow whose triggers match `ctx`. Workflows run
/// concurrently with each other.
pub async fn run_pipeline(
    workflows: &[(String, Workflow)],
    ctx: &RunContext,
    opts: &PipelineOptions,
    deps: Arc<JobDeps>,
) -> Result<PipelineReport> {
    let run_id = RunId::new();
    let mut set = JoinSet::new();
    let mut ignored = Vec::new();

    for (idx, (file, wf)) in workflows.iter().enumerate() {
        if let Some(only) = &opts.only_job {
            if !wf.jobs.contains_key(only) {
                continue;
            }
        }
        let triggered = matches_trigger(wf, ctx).with_context(|| format!("match triggers of {file}"))?;
        if !triggered {
            info!(workflow = %wf.name, event = ctx.event.name(), "workflow not triggered");
            deps.events.push(Outcome::WorkflowIgnored { workflow: wf.name.clone() });
            ignored.push((
                idx,
                WorkflowReport {
                    name: wf.name.clone(),
                    file: file.clone(),
                    triggered: false,
                    jobs: vec![],
                    error: None,
                },
            ));
            continue;
        }
        deps.events.push(Outcome::WorkflowTriggered { workflow: wf.name.clone() });
        let (file, wf, ctx, run_id, opts, deps) =
            (file.clone(), wf.clone(), ctx.clone(), run_id.clone(), opts.clone(), deps.clone());
        set.spawn(async move { (idx, run_workflow(&file, &wf, &ctx, &run_id, &opts, deps).await) });
    }

    let mut reports = ignored;
    while let Some(joined) = set.join_next().await {
        reports.push(joined.context("workflow task failed")?);
    }
    reports.sort_by_key(|(idx, _)| *idx);

    Ok(PipelineReport {
        run_id: run_id.as_str().to_string(),
        workflows: reports.into_iter().map(|(_, r)| r).collect(),
    })
}
