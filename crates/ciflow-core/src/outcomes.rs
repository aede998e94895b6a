use crate::{ids::*, model::*, phase::JobPhase};

/// Lifecycle events emitted while a pipeline runs.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    WorkflowTriggered { workflow: String },
    WorkflowIgnored { workflow: String },
    JobStarted { instance: JobInstanceId, name: String },
    PhaseEntered { instance: JobInstanceId, phase: JobPhase },
    ProvisionFailed { instance: JobInstanceId, reason: String },
    CheckCompleted { instance: JobInstanceId, kind: CheckKind, status: StepStatus },
    NotificationSent { instance: JobInstanceId },
    NotificationDropped { instance: JobInstanceId, reason: String },
    JobSkipped { name: String, reason: String },
    JobFinished { instance: JobInstanceId, status: JobStatus },
}
