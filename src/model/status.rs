use serde::{Deserialize, Serialize};

/// Fine-grained status of one job execution or step-thread execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Completed,
    Abandoned,
}

impl BatchStatus {
    /// Statuses from which the unit of work will make no further progress.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped
                | BatchStatus::Failed
                | BatchStatus::Completed
                | BatchStatus::Abandoned
        )
    }

    /// Statuses a step thread may be in when its job is restarted.
    pub fn is_terminal_step_status(self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped | BatchStatus::Failed | BatchStatus::Completed
        )
    }

    /// Whether an execution in this status may move to `next`.
    ///
    /// Re-applying the current status is accepted so that duplicate
    /// deliveries from an at-least-once transport are harmless.
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        if self == next {
            return true;
        }
        match self {
            Starting => matches!(next, Started | Stopping | Stopped | Failed | Abandoned),
            Started => matches!(next, Stopping | Stopped | Failed | Completed | Abandoned),
            Stopping => matches!(next, Stopped | Failed | Completed | Abandoned),
            Stopped | Failed | Completed => next == Abandoned,
            Abandoned => false,
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Starting => write!(f, "STARTING"),
            BatchStatus::Started => write!(f, "STARTED"),
            BatchStatus::Stopping => write!(f, "STOPPING"),
            BatchStatus::Stopped => write!(f, "STOPPED"),
            BatchStatus::Failed => write!(f, "FAILED"),
            BatchStatus::Completed => write!(f, "COMPLETED"),
            BatchStatus::Abandoned => write!(f, "ABANDONED"),
        }
    }
}

/// Coarse lifecycle state of a job instance.
///
/// `QueuedForDispatch` and `DispatchConsumed` are only visited on the queued
/// dispatch path; local dispatch moves straight from `Submitted` to
/// `Dispatched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Submitted,
    QueuedForDispatch,
    DispatchConsumed,
    Dispatched,
    Failed,
    Stopped,
    Completed,
    Abandoned,
}

impl InstanceState {
    /// `Completed` and `Abandoned` admit no further executions.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Completed | InstanceState::Abandoned)
    }

    /// Only failed or stopped instances may be restarted.
    pub fn is_restartable(self) -> bool {
        matches!(self, InstanceState::Failed | InstanceState::Stopped)
    }

    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        if self == next {
            return true;
        }
        match self {
            Submitted => matches!(
                next,
                QueuedForDispatch | Dispatched | Failed | Stopped | Abandoned
            ),
            QueuedForDispatch => matches!(next, DispatchConsumed | Failed | Stopped | Abandoned),
            DispatchConsumed => matches!(next, Dispatched | Failed | Stopped | Abandoned),
            Dispatched => matches!(next, Failed | Stopped | Completed | Abandoned),
            Failed | Stopped => matches!(next, Submitted | Abandoned),
            Completed | Abandoned => false,
        }
    }

    /// Instance state mirroring a final execution status, if there is one.
    pub fn from_final_status(status: BatchStatus) -> Option<InstanceState> {
        match status {
            BatchStatus::Stopped => Some(InstanceState::Stopped),
            BatchStatus::Failed => Some(InstanceState::Failed),
            BatchStatus::Completed => Some(InstanceState::Completed),
            BatchStatus::Abandoned => Some(InstanceState::Abandoned),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Submitted => write!(f, "SUBMITTED"),
            InstanceState::QueuedForDispatch => write!(f, "QUEUED_FOR_DISPATCH"),
            InstanceState::DispatchConsumed => write!(f, "DISPATCH_CONSUMED"),
            InstanceState::Dispatched => write!(f, "DISPATCHED"),
            InstanceState::Failed => write!(f, "FAILED"),
            InstanceState::Stopped => write!(f, "STOPPED"),
            InstanceState::Completed => write!(f, "COMPLETED"),
            InstanceState::Abandoned => write!(f, "ABANDONED"),
        }
    }
}
