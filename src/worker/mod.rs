//! Seam between dispatch and the code that actually runs a job.
//!
//! Step semantics belong to the [`JobRunner`]. The dispatch layer only
//! hands it a context and records what comes back:
//! - **Jobs**: a [`JobContext`] with step bookkeeping, restart resume and
//!   partitioned-step coordination
//! - **Partitions**: a [`PartitionContext`] with the plan, a stop signal and
//!   a reply channel back to the coordinating task
//!
//! # Execution Flow
//!
//! 1. The internal dispatcher marks the execution started and spawns a task
//! 2. [`JobRunner::prepare_context`] rebuilds the job's runtime context
//! 3. [`JobRunner::run_job`] runs the steps, observing the stop token at safe points
//! 4. The returned [`JobOutcome`] becomes the execution's final status

pub mod context;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{BatchStatus, JobInstance};

pub use context::{JobContext, PartitionContext};

/// Final status and exit status reported by a runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: BatchStatus,
    pub exit_status: String,
}

impl JobOutcome {
    pub fn new(status: BatchStatus, exit_status: impl Into<String>) -> Self {
        Self {
            status,
            exit_status: exit_status.into(),
        }
    }

    pub fn completed() -> Self {
        Self::from_status(BatchStatus::Completed)
    }

    pub fn stopped() -> Self {
        Self::from_status(BatchStatus::Stopped)
    }

    pub fn failed(exit_status: impl Into<String>) -> Self {
        Self::new(BatchStatus::Failed, exit_status)
    }

    /// Exit status defaults to the status name.
    pub fn from_status(status: BatchStatus) -> Self {
        Self::new(status, status.to_string())
    }
}

#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Rebuilds whatever the job's code needs on this node before it runs.
    async fn prepare_context(&self, _instance: &JobInstance) -> Result<()> {
        Ok(())
    }

    async fn run_job(&self, context: &JobContext) -> Result<JobOutcome>;

    /// The partition's final status is sent to the coordinator by the caller.
    async fn run_partition(&self, context: &PartitionContext) -> Result<JobOutcome>;
}
