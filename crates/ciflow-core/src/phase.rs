use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a single job instance. Transitions only move forward.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Provisioning,
    Running,
    Notifying,
    Done,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhaseError {
    #[error("job already done; cannot move to {0:?}")]
    AlreadyDone(JobPhase),
    #[error("illegal phase transition {from:?} -> {to:?}")]
    Backward { from: JobPhase, to: JobPhase },
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Done)
    }

    /// Moves to `next`, skipping intermediate phases is allowed (early exit),
    /// staying in place or going back is not.
    pub fn advance(&mut self, next: JobPhase) -> Result<(), PhaseError> {
        if self.is_terminal() {
            return Err(PhaseError::AlreadyDone(next));
        }
        if next <= *self {
            return Err(PhaseError::Backward { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_path_is_accepted() {
        let mut p = JobPhase::Provisioning;
        p.advance(JobPhase::Running).unwrap();
        p.advance(JobPhase::Notifying).unwrap();
        p.advance(JobPhase::Done).unwrap();
        assert!(p.is_terminal());
    }

    #[test]
    fn early_exit_from_provisioning() {
        let mut p = JobPhase::Provisioning;
        p.advance(JobPhase::Notifying).unwrap();
        p.advance(JobPhase::Done).unwrap();

        let mut q = JobPhase::Provisioning;
        q.advance(JobPhase::Done).unwrap();
    }

    #[test]
    fn backward_and_repeat_are_rejected() {
        let mut p = JobPhase::Running;
        assert_eq!(
            p.advance(JobPhase::Provisioning),
            Err(PhaseError::Backward { from: JobPhase::Running, to: JobPhase::Provisioning })
        );
        assert!(p.advance(JobPhase::Running).is_err());
        assert_eq!(p, JobPhase::Running);
    }

    #[test]
    fn done_is_final() {
        let mut p = JobPhase::Done;
        assert_eq!(p.advance(JobPhase::Done), Err(PhaseError::AlreadyDone(JobPhase::Done)));
    }
}
