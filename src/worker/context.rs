use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::coordinator::{
    PartitionAnalyzer, PartitionCoordinator, PartitionedStep, PartitionedStepOutcome,
};
use crate::error::Result;
use crate::model::{BatchStatus, JobExecution, JobInstance, Properties, StepThreadExecution};
use crate::partition::{JobIdentity, PartitionPlan, ReplySender, StepDefinition};
use crate::store::{retry_on_conflict, ExecutionStore};

/// What a running job sees of its own execution.
pub struct JobContext {
    instance: JobInstance,
    execution: JobExecution,
    restart: bool,
    store: Arc<dyn ExecutionStore>,
    coordinator: PartitionCoordinator,
    server_id: String,
    stop: CancellationToken,
    max_conflict_retries: u32,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        instance: JobInstance,
        execution: JobExecution,
        restart: bool,
        store: Arc<dyn ExecutionStore>,
        coordinator: PartitionCoordinator,
        server_id: String,
        stop: CancellationToken,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            instance,
            execution,
            restart,
            store,
            coordinator,
            server_id,
            stop,
            max_conflict_retries,
        }
    }

    pub fn instance(&self) -> &JobInstance {
        &self.instance
    }

    pub fn execution(&self) -> &JobExecution {
        &self.execution
    }

    pub fn execution_id(&self) -> u64 {
        self.execution.execution_id
    }

    pub fn job_name(&self) -> &str {
        &self.instance.job_name
    }

    pub fn parameters(&self) -> &Properties {
        &self.execution.parameters
    }

    pub fn is_restart(&self) -> bool {
        self.restart
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn identity(&self) -> JobIdentity {
        JobIdentity {
            job_name: self.instance.job_name.clone(),
            instance_id: self.instance.instance_id,
            execution_id: self.execution.execution_id,
        }
    }

    /// False when the step already completed in an earlier execution of this
    /// instance; a restart resumes at the first step that did not.
    pub async fn should_run_step(&self, step_name: &str) -> Result<bool> {
        let last = self
            .store
            .last_top_level_status(self.instance.instance_id, step_name)
            .await?;
        if last == Some(BatchStatus::Completed) {
            tracing::info!(
                execution_id = self.execution.execution_id,
                step = step_name,
                "Skipping step completed by an earlier execution"
            );
            return Ok(false);
        }
        Ok(true)
    }

    pub async fn begin_step(&self, step_name: &str) -> Result<StepThreadExecution> {
        let record = retry_on_conflict(self.max_conflict_retries, || {
            self.store.create_top_level_step_execution(
                self.execution.execution_id,
                step_name,
                &self.server_id,
            )
        })
        .await?;
        let record = retry_on_conflict(self.max_conflict_retries, || {
            self.store
                .update_step_thread_status(record.step_execution_id, BatchStatus::Started, None)
        })
        .await?;
        tracing::debug!(
            execution_id = self.execution.execution_id,
            step = step_name,
            step_execution_id = record.step_execution_id,
            "Step started"
        );
        Ok(record)
    }

    pub async fn end_step(
        &self,
        step: &StepThreadExecution,
        status: BatchStatus,
        exit_status: &str,
    ) -> Result<StepThreadExecution> {
        let record = retry_on_conflict(self.max_conflict_retries, || {
            self.store
                .update_step_thread_status(step.step_execution_id, status, Some(exit_status))
        })
        .await?;
        tracing::debug!(
            execution_id = self.execution.execution_id,
            step = %step.step_name,
            %status,
            "Step ended"
        );
        Ok(record)
    }

    /// Runs one partition per entry of `partitions` (the index is the
    /// partition number) and records the reduced outcome on the step.
    pub async fn run_partitioned_step(
        &self,
        step: StepDefinition,
        partitions: Vec<Properties>,
        analyzer: &mut dyn PartitionAnalyzer,
    ) -> Result<PartitionedStepOutcome> {
        let record = self.begin_step(&step.name).await?;
        let request = PartitionedStep {
            job: self.identity(),
            step,
            top_level_step_execution_id: record.step_execution_id,
            job_properties: self.execution.parameters.clone(),
            partitions,
        };
        self.coordinator.run(request, analyzer, &self.stop).await
    }
}

/// What a running partition sees.
pub struct PartitionContext {
    step: StepDefinition,
    step_execution_id: u64,
    stop: CancellationToken,
    replies: ReplySender,
}

impl PartitionContext {
    pub(crate) fn new(
        step: StepDefinition,
        step_execution_id: u64,
        stop: CancellationToken,
        replies: ReplySender,
    ) -> Self {
        Self {
            step,
            step_execution_id,
            stop,
            replies,
        }
    }

    pub fn plan(&self) -> &PartitionPlan {
        self.replies.plan()
    }

    pub fn partition_number(&self) -> u32 {
        self.plan().partition_number
    }

    pub fn properties(&self) -> &Properties {
        &self.plan().partition_properties
    }

    pub fn step(&self) -> &StepDefinition {
        &self.step
    }

    pub fn step_execution_id(&self) -> u64 {
        self.step_execution_id
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub(crate) fn replies(&self) -> &ReplySender {
        &self.replies
    }

    /// Sends an intermediate result to the coordinating task.
    pub async fn send_collector_data(&self, data: Vec<u8>) -> Result<()> {
        self.replies.send_collector_data(data).await
    }
}
