use ciflow_core::{RunContext, TriggerEvent};
use globset::{GlobBuilder, GlobMatcher};

use crate::workflow::Workflow;

const DEFAULT_PR_TYPES: [&str; 3] = ["opened", "synchronize", "reopened"];

/// Ordered include/exclude glob list. A leading `!` negates a pattern and
/// the last matching pattern decides.
pub struct PatternList {
    patterns: Vec<(bool, GlobMatcher)>,
}

impl PatternList {
    pub fn new(patterns: &[String]) -> anyhow::Result<Self> {
        let mut out = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let (negated, pat) = match raw.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, raw.as_str()),
            };
            let glob = GlobBuilder::new(pat)
                .literal_separator(true)
                .build()
                .map_err(|e| anyhow::anyhow!("invalid pattern '{raw}': {e}"))?;
            out.push((negated, glob.compile_matcher()));
        }
        Ok(Self { patterns: out })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let mut hit = false;
        for (negated, m) in &self.patterns {
            if m.is_match(candidate) {
                hit = !negated;
            }
        }
        hit
    }
}

/// `paths`: some changed file must match. `paths-ignore`: some changed file
/// must fall outside the ignore list. No changed files never satisfies a
/// path filter.
fn paths_match(paths: &[String], ignore: &[String], changed: &[String]) -> anyhow::Result<bool> {
    if paths.is_empty() && ignore.is_empty() {
        return Ok(true);
    }
    if changed.is_empty() {
        return Ok(false);
    }
    if !paths.is_empty() {
        let list = PatternList::new(paths)?;
        if !changed.iter().any(|f| list.matches(f)) {
            return Ok(false);
        }
    }
    if !ignore.is_empty() {
        let list = PatternList::new(ignore)?;
        if changed.iter().all(|f| list.matches(f)) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn normalize_cron(c: &str) -> String {
    c.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decides whether `wf` runs for the event described by `ctx`.
pub fn matches_trigger(wf: &Workflow, ctx: &RunContext) -> anyhow::Result<bool> {
    match &ctx.event {
        TriggerEvent::Push => {
            let Some(push) = &wf.triggers.push else {
                return Ok(false);
            };
            let ref_ok = if let Some(tag) = ctx.tag() {
                if push.tags.is_empty() {
                    push.branches.is_empty() && push.branches_ignore.is_empty()
                } else {
                    PatternList::new(&push.tags)?.matches(tag)
                }
            } else if let Some(branch) = ctx.branch() {
                if !push.branches_ignore.is_empty() && PatternList::new(&push.branches_ignore)?.matches(branch) {
                    false
                } else if push.branches.is_empty() {
                    push.tags.is_empty()
                } else {
                    PatternList::new(&push.branches)?.matches(branch)
                }
            } else {
                false
            };
            Ok(ref_ok && paths_match(&push.paths, &push.paths_ignore, &ctx.changed_files)?)
        }
        TriggerEvent::PullRequest { action } => {
            let Some(pr) = &wf.triggers.pull_request else {
                return Ok(false);
            };
            let type_ok = if pr.types.is_empty() {
                DEFAULT_PR_TYPES.contains(&action.as_str())
            } else {
                pr.types.iter().any(|t| t == action)
            };
            if !type_ok {
                return Ok(false);
            }
            if !pr.branches.is_empty() {
                let base = ctx.base_ref.as_deref().map(|b| b.trim_start_matches("refs/heads/"));
                match base {
                    Some(b) if PatternList::new(&pr.branches)?.matches(b) => {}
                    _ => return Ok(false),
                }
            }
            paths_match(&pr.paths, &pr.paths_ignore, &ctx.changed_files)
        }
        TriggerEvent::Schedule { cron } => {
            let wanted = normalize_cron(cron);
            Ok(wf.triggers.schedule.iter().any(|s| normalize_cron(&s.cron) == wanted))
        }
        TriggerEvent::Dispatch => Ok(wf.triggers.workflow_dispatch.is_some()),
    }
}
