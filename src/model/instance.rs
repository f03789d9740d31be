use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::status::{BatchStatus, InstanceState};

/// Job, restart and partition properties. Ordered so serialized forms are stable.
pub type Properties = BTreeMap<String, String>;

/// One logical submission of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInstance {
    pub instance_id: u64,
    pub job_name: String,
    pub submitter: String,
    /// Reference handed to the job-definition resolver.
    pub definition_ref: String,
    pub state: InstanceState,
    pub batch_status: BatchStatus,
    pub number_of_executions: u32,
    /// Most recent first.
    pub execution_ids: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub version: u64,
}

impl JobInstance {
    pub fn new(
        instance_id: u64,
        job_name: String,
        submitter: String,
        definition_ref: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id,
            job_name,
            submitter,
            definition_ref,
            state: InstanceState::Submitted,
            batch_status: BatchStatus::Starting,
            number_of_executions: 0,
            execution_ids: Vec::new(),
            created_at,
            last_updated_at: created_at,
            version: 0,
        }
    }

    pub fn most_recent_execution_id(&self) -> Option<u64> {
        self.execution_ids.first().copied()
    }
}

/// One attempt (start or restart) to run a job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecution {
    pub execution_id: u64,
    pub instance_id: u64,
    /// 0 for the initial attempt, +1 per restart.
    pub execution_number: u32,
    pub status: BatchStatus,
    pub exit_status: Option<String>,
    pub parameters: Properties,
    /// Node actually running this execution, once one has picked it up.
    pub server_id: Option<String>,
    pub rest_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
    pub version: u64,
}

/// Whether a step-thread record belongs to the step itself or to one partition of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepThreadKind {
    TopLevel,
    Partition { number: u32 },
}

impl StepThreadKind {
    pub fn partition_number(self) -> Option<u32> {
        match self {
            StepThreadKind::TopLevel => None,
            StepThreadKind::Partition { number } => Some(number),
        }
    }
}

/// One execution record per step (and per partition) per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepThreadExecution {
    pub step_execution_id: u64,
    pub execution_id: u64,
    pub instance_id: u64,
    pub step_name: String,
    pub kind: StepThreadKind,
    pub status: BatchStatus,
    pub exit_status: Option<String>,
    pub server_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl StepThreadExecution {
    pub fn is_partition(&self) -> bool {
        matches!(self.kind, StepThreadKind::Partition { .. })
    }
}
