use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::expr::{interpolate, interpolate_json, ExprScope};
use crate::matrix::{expand_matrix, instance_name, Combination};
use crate::workflow::{CheckSpec, JobDef, ProvisionSpec, SpecError, Workflow};

/// One runnable job instance: a job definition bound to one matrix combination
/// with every expression resolved.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JobPlan {
    pub job_id: String,
    pub display_name: String,
    pub matrix: Combination,
    pub needs: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub provision: ProvisionSpec,
    pub check: CheckSpec,
    pub notify: bool,
}

/// Expands one job into its matrix instances.
pub fn plan_job(wf: &Workflow, job_id: &str, job: &JobDef) -> Result<Vec<JobPlan>> {
    let matrix = job.strategy.as_ref().map(|s| s.matrix.clone()).unwrap_or_default();
    let mut plans = Vec::new();

    for combo in expand_matrix(&matrix) {
        let mut scope = ExprScope {
            matrix: combo.clone(),
            env: wf.env.clone(),
        };
        let mut env = wf.env.clone();
        for (k, v) in &job.env {
            let resolved = interpolate(v, &scope).with_context(|| format!("job {job_id} env {k}"))?;
            env.insert(k.clone(), resolved);
        }
        scope.env = env.clone();

        let provision: ProvisionSpec = resolve(&job.provision, &scope)
            .with_context(|| format!("job {job_id}: resolve provision"))?;
        let check: CheckSpec = resolve(&job.check, &scope).with_context(|| format!("job {job_id}: resolve check"))?;
        if let CheckSpec::License(l) = &check {
            if l.dependency_variant().is_none() {
                return Err(SpecError::BadVariant {
                    job: job_id.to_string(),
                    variant: l.variant.clone(),
                }
                .into());
            }
        }

        plans.push(JobPlan {
            job_id: job_id.to_string(),
            display_name: instance_name(job.display_name(job_id), &combo),
            matrix: combo,
            needs: job.needs.clone(),
            env,
            provision,
            check,
            notify: job.notify,
        });
    }

    Ok(plans)
}

/// Expands every job of the workflow, in job-id order.
pub fn plan_jobs(wf: &Workflow) -> Result<Vec<JobPlan>> {
    let mut all = Vec::new();
    for (id, job) in &wf.jobs {
        all.extend(plan_job(wf, id, job)?);
    }
    Ok(all)
}

fn resolve<T>(value: &T, scope: &ExprScope) -> Result<T>
where
    T: Serialize + for<'de> Deserialize<'de>,
{
    let json = serde_json::to_value(value)?;
    let resolved = interpolate_json(json, scope)?;
    Ok(serde_json::from_value(resolved)?)
}
