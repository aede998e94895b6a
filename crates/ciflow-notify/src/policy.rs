use ciflow_core::{JobStatus, RunContext};

/// A notification goes out only for a failed job that opted in, on a run
/// whose ref is the primary branch.
pub fn should_notify(status: JobStatus, ctx: &RunContext, primary_branch: &str, job_opt_in: bool) -> bool {
    job_opt_in && status.is_failure() && ctx.branch() == Some(primary_branch)
}
