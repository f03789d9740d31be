//! Execution-record store seam.
//!
//! The store exclusively owns the canonical instance, execution and
//! step-thread records. Everything else in the crate works on snapshots and
//! routes every transition through one of the atomic update operations below,
//! which reject illegal transitions instead of applying them.
//!
//! [`InMemoryExecutionStore`] is the reference implementation used by the
//! binary and the test suites.

pub mod memory;

use std::collections::BTreeSet;
use std::future::Future;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{
    BatchStatus, InstanceState, JobExecution, JobInstance, Properties, StepThreadExecution,
};

pub use memory::InMemoryExecutionStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Outcome of an idempotent partition record creation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepThreadCreation {
    Created(StepThreadExecution),
    /// A record for the same execution, step and partition already existed.
    Existing(StepThreadExecution),
}

impl StepThreadCreation {
    pub fn record(&self) -> &StepThreadExecution {
        match self {
            StepThreadCreation::Created(record) | StepThreadCreation::Existing(record) => record,
        }
    }
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_job_instance(
        &self,
        job_name: &str,
        submitter: &str,
        definition_ref: &str,
    ) -> StoreResult<JobInstance>;

    /// Appends a new `STARTING` execution to the instance. Its execution
    /// number equals the number of executions the instance already had.
    async fn create_job_execution(
        &self,
        instance_id: u64,
        parameters: Properties,
    ) -> StoreResult<JobExecution>;

    async fn get_job_instance(&self, instance_id: u64) -> StoreResult<JobInstance>;

    async fn get_job_execution(&self, execution_id: u64) -> StoreResult<JobExecution>;

    async fn get_instance_for_execution(&self, execution_id: u64) -> StoreResult<JobInstance>;

    async fn list_job_instances(&self) -> StoreResult<Vec<JobInstance>>;

    /// Most recent first.
    async fn executions_for_instance(&self, instance_id: u64) -> StoreResult<Vec<JobExecution>>;

    async fn most_recent_execution_id(&self, instance_id: u64) -> StoreResult<Option<u64>>;

    async fn update_instance_state(
        &self,
        instance_id: u64,
        state: InstanceState,
    ) -> StoreResult<JobInstance>;

    /// `FAILED | STOPPED -> SUBMITTED`, atomically. Any other state yields
    /// [`StoreError::NotRestartable`].
    async fn update_instance_on_restart(&self, instance_id: u64) -> StoreResult<JobInstance>;

    /// `SUBMITTED -> QUEUED_FOR_DISPATCH`.
    async fn update_instance_on_queued(&self, instance_id: u64) -> StoreResult<JobInstance>;

    /// `QUEUED_FOR_DISPATCH -> DISPATCH_CONSUMED`. Any other state yields
    /// [`StoreError::NotQueued`], which is how duplicate deliveries and
    /// requests stopped while queued are recognised.
    async fn update_instance_on_consumed(&self, instance_id: u64) -> StoreResult<JobInstance>;

    /// Execution `STARTED` on `server_id`, instance `DISPATCHED`.
    async fn update_execution_on_started(
        &self,
        execution_id: u64,
        server_id: &str,
        rest_url: &str,
    ) -> StoreResult<JobExecution>;

    async fn update_execution_status(
        &self,
        execution_id: u64,
        status: BatchStatus,
    ) -> StoreResult<JobExecution>;

    /// Records the final status; the instance state mirrors it when final.
    async fn update_execution_on_end(
        &self,
        execution_id: u64,
        status: BatchStatus,
        exit_status: &str,
    ) -> StoreResult<JobExecution>;

    /// Stops an execution no server has picked up yet. Fails with
    /// [`StoreError::AlreadyAssigned`] once a server owns it.
    async fn update_execution_on_stop_before_dispatch(
        &self,
        execution_id: u64,
    ) -> StoreResult<JobExecution>;

    async fn create_top_level_step_execution(
        &self,
        execution_id: u64,
        step_name: &str,
        server_id: &str,
    ) -> StoreResult<StepThreadExecution>;

    async fn create_partition_step_execution(
        &self,
        execution_id: u64,
        step_name: &str,
        partition: u32,
        server_id: &str,
    ) -> StoreResult<StepThreadCreation>;

    async fn update_step_thread_status(
        &self,
        step_execution_id: u64,
        status: BatchStatus,
        exit_status: Option<&str>,
    ) -> StoreResult<StepThreadExecution>;

    /// Non-final executions recorded as running on `server_id`.
    async fn job_executions_running_on(&self, server_id: &str) -> StoreResult<Vec<JobExecution>>;

    /// Non-final top-level and partition records recorded on `server_id`.
    async fn step_threads_running_on(
        &self,
        server_id: &str,
    ) -> StoreResult<Vec<StepThreadExecution>>;

    /// Top-level and partition records of one execution, in creation order.
    async fn step_thread_executions(
        &self,
        execution_id: u64,
    ) -> StoreResult<Vec<StepThreadExecution>>;

    /// Partition numbers of `step_name` that completed in any execution of the instance.
    async fn completed_partitions(
        &self,
        instance_id: u64,
        step_name: &str,
    ) -> StoreResult<BTreeSet<u32>>;

    /// Status of the most recent top-level record of `step_name` in the instance.
    async fn last_top_level_status(
        &self,
        instance_id: u64,
        step_name: &str,
    ) -> StoreResult<Option<BatchStatus>>;
}

/// Re-runs `op` while it loses optimistic-concurrency races, up to
/// `max_retries` extra attempts. Other errors are returned unchanged.
pub async fn retry_on_conflict<T, F, Fut>(max_retries: u32, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(StoreError::Conflict { record, id }) if attempt < max_retries => {
                attempt += 1;
                tracing::debug!(record, id, attempt, "Conflicting update, retrying");
                tokio::task::yield_now().await;
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(error = %e, "Execution-record store reported a broken state");
                return Err(e);
            }
            other => return other,
        }
    }
}
