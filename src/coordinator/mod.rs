//! Top-level side of a partitioned step.
//!
//! The coordinator plans the partitions that still need to run, starts them
//! through the node's dispatcher, then collects replies from one reply queue
//! with a bounded wait per `take`. Collection ends when every partition has
//! reported, when the wait elapses (see [`TimeoutPolicy`]) or when the step
//! is asked to stop, in which case partitions are told to stop and replies
//! already in flight are drained after a settle delay. Partitions still
//! pending when collection gives up are told to stop as well.

pub mod reduce;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{PartitionConfig, TimeoutPolicy};
use crate::dispatcher::BatchDispatcher;
use crate::error::{DispatchError, Result};
use crate::model::{BatchStatus, Properties};
use crate::partition::{
    JobIdentity, LocalReplyQueue, PartitionPlan, PartitionReplyMessage, PartitionReplyQueue,
    ReplyKind, StepDefinition,
};
use crate::store::{retry_on_conflict, ExecutionStore};

pub use reduce::{
    reduce, CollectingAnalyzer, PartitionAnalyzer, PartitionOutcome, PARTITIONS_INCOMPLETE,
};

/// One attempt at a partitioned step.
#[derive(Debug, Clone)]
pub struct PartitionedStep {
    pub job: JobIdentity,
    pub step: StepDefinition,
    pub top_level_step_execution_id: u64,
    pub job_properties: Properties,
    /// Index is the partition number.
    pub partitions: Vec<Properties>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionedStepOutcome {
    pub status: BatchStatus,
    pub exit_status: String,
    pub correlation_id: Uuid,
    pub partitions: BTreeMap<u32, PartitionOutcome>,
    /// Collector payloads handed to the analyzer.
    pub merges: usize,
    pub stop_requested: bool,
}

pub struct PartitionCoordinator {
    dispatcher: Arc<BatchDispatcher>,
    store: Arc<dyn ExecutionStore>,
    config: PartitionConfig,
    max_conflict_retries: u32,
}

impl PartitionCoordinator {
    pub fn new(
        dispatcher: Arc<BatchDispatcher>,
        store: Arc<dyn ExecutionStore>,
        config: PartitionConfig,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            dispatcher,
            store,
            config,
            max_conflict_retries,
        }
    }

    pub async fn run(
        &self,
        request: PartitionedStep,
        analyzer: &mut dyn PartitionAnalyzer,
        stop: &CancellationToken,
    ) -> Result<PartitionedStepOutcome> {
        let job_execution_id = request.job.execution_id;
        let step_name = request.step.name.clone();
        let correlation_id = Uuid::new_v4();

        let already_completed = self
            .store
            .completed_partitions(request.job.instance_id, &step_name)
            .await?;

        let mut outcomes = BTreeMap::new();
        let mut plans = Vec::new();
        for (index, partition_properties) in request.partitions.into_iter().enumerate() {
            let partition_number = u32::try_from(index)
                .map_err(|_| DispatchError::Internal(format!("too many partitions: {}", index)))?;
            if already_completed.contains(&partition_number) {
                outcomes.insert(partition_number, PartitionOutcome::PreviouslyCompleted);
                continue;
            }
            plans.push(PartitionPlan {
                partition_number,
                partition_properties,
                job: request.job.clone(),
                top_level_step_execution_id: request.top_level_step_execution_id,
                step_name: step_name.clone(),
                job_properties: request.job_properties.clone(),
                correlation_id,
                created_at: Utc::now(),
            });
        }

        tracing::info!(
            execution_id = job_execution_id,
            step = %step_name,
            %correlation_id,
            dispatcher = self.dispatcher.name(),
            to_run = plans.len(),
            skipped = outcomes.len(),
            "Coordinating partitioned step"
        );

        let mut collector = Collector {
            pending: BTreeSet::new(),
            outcomes,
            merges: 0,
            analyzer,
        };
        let mut stop_requested = false;

        if !plans.is_empty() {
            let queue = self.reply_queue(correlation_id).await?;
            for plan in plans {
                let partition = plan.partition_number;
                match self
                    .dispatcher
                    .start_partition(plan, request.step.clone(), queue.clone())
                    .await
                {
                    Ok(()) => {
                        collector.pending.insert(partition);
                    }
                    Err(e) => {
                        tracing::error!(
                            execution_id = job_execution_id,
                            step = %step_name,
                            partition,
                            error = %e,
                            "Failed to start partition"
                        );
                        collector.outcomes.insert(
                            partition,
                            PartitionOutcome::DispatchFailed {
                                error: e.to_string(),
                            },
                        );
                    }
                }
            }

            let collected = self
                .collect(queue.as_ref(), &mut collector, stop, job_execution_id)
                .await;
            if let Err(e) = queue.release().await {
                tracing::warn!(execution_id = job_execution_id, error = %e, "Failed to release reply queue");
            }
            stop_requested = collected?;

            if !stop_requested && !collector.pending.is_empty() {
                tracing::info!(
                    execution_id = job_execution_id,
                    step = %step_name,
                    pending = ?collector.pending,
                    "Stopping partitions that did not report"
                );
                if let Err(e) = self.dispatcher.stop_partitions(job_execution_id).await {
                    tracing::warn!(execution_id = job_execution_id, error = %e, "Failed to signal partitions to stop");
                }
            }

            for partition in std::mem::take(&mut collector.pending) {
                tracing::warn!(
                    execution_id = job_execution_id,
                    step = %step_name,
                    partition,
                    "Partition did not report a final status"
                );
                collector
                    .outcomes
                    .insert(partition, PartitionOutcome::Incomplete);
            }
        }

        let (status, exit_status) = reduce(&collector.outcomes);
        retry_on_conflict(self.max_conflict_retries, || {
            self.store.update_step_thread_status(
                request.top_level_step_execution_id,
                status,
                Some(&exit_status),
            )
        })
        .await?;

        tracing::info!(
            execution_id = job_execution_id,
            step = %step_name,
            %status,
            exit_status = %exit_status,
            merges = collector.merges,
            "Partitioned step finished"
        );

        Ok(PartitionedStepOutcome {
            status,
            exit_status,
            correlation_id,
            partitions: collector.outcomes,
            merges: collector.merges,
            stop_requested,
        })
    }

    /// Cross-node queue when the dispatcher can make one, in-process otherwise.
    async fn reply_queue(&self, correlation_id: Uuid) -> Result<Arc<dyn PartitionReplyQueue>> {
        match self.dispatcher.create_reply_queue(correlation_id).await {
            Ok(queue) => Ok(queue),
            Err(DispatchError::Unsupported { .. }) => Ok(Arc::new(LocalReplyQueue::new())),
            Err(e) => Err(e),
        }
    }

    /// Returns whether collection ended because of a stop request.
    async fn collect(
        &self,
        queue: &dyn PartitionReplyQueue,
        collector: &mut Collector<'_>,
        stop: &CancellationToken,
        job_execution_id: u64,
    ) -> Result<bool> {
        let wait = self.config.reply_wait_timeout();
        while !collector.pending.is_empty() {
            let taken = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    self.drain(queue, collector, job_execution_id).await?;
                    return Ok(true);
                }
                taken = queue.take(wait) => taken,
            };
            match taken {
                Ok(Some(message)) => collector.receive(message),
                Ok(None) => match self.config.timeout_policy {
                    TimeoutPolicy::FailMissing => {
                        tracing::warn!(
                            execution_id = job_execution_id,
                            pending = ?collector.pending,
                            wait_ms = self.config.reply_wait_timeout_ms,
                            "Timed out waiting for partition replies"
                        );
                        return Ok(false);
                    }
                    TimeoutPolicy::KeepWaiting => {
                        tracing::warn!(
                            execution_id = job_execution_id,
                            pending = ?collector.pending,
                            "Still waiting for partition replies"
                        );
                    }
                },
                Err(DispatchError::QueueClosed) => {
                    tracing::warn!(execution_id = job_execution_id, "Reply queue closed during collection");
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    async fn drain(
        &self,
        queue: &dyn PartitionReplyQueue,
        collector: &mut Collector<'_>,
        job_execution_id: u64,
    ) -> Result<()> {
        tracing::info!(
            execution_id = job_execution_id,
            pending = ?collector.pending,
            "Stop requested, stopping partitions"
        );
        if let Err(e) = self.dispatcher.stop_partitions(job_execution_id).await {
            tracing::warn!(execution_id = job_execution_id, error = %e, "Failed to signal partitions to stop");
        }
        tokio::time::sleep(self.config.stop_settle_delay()).await;

        while !collector.pending.is_empty() {
            match queue.take_without_waiting().await {
                Ok(Some(message)) => collector.receive(message),
                Ok(None) | Err(DispatchError::QueueClosed) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

struct Collector<'a> {
    pending: BTreeSet<u32>,
    outcomes: BTreeMap<u32, PartitionOutcome>,
    merges: usize,
    analyzer: &'a mut dyn PartitionAnalyzer,
}

impl Collector<'_> {
    fn receive(&mut self, message: PartitionReplyMessage) {
        let partition = message.partition_number;
        if !self.pending.contains(&partition) {
            tracing::warn!(partition, kind = ?message.kind, "Ignoring reply for a partition that is not pending");
            return;
        }
        match message.kind {
            ReplyKind::CollectorData => {
                if let Some(data) = &message.collector_data {
                    self.analyzer.analyze_collector_data(partition, data);
                    self.merges += 1;
                }
            }
            ReplyKind::FinalStatus => {
                let status = message.batch_status.unwrap_or(BatchStatus::Failed);
                let exit_status = message.exit_status.unwrap_or_else(|| status.to_string());
                self.analyzer.analyze_status(partition, status, &exit_status);
                tracing::debug!(partition, %status, "Partition reported final status");
                self.pending.remove(&partition);
                self.outcomes.insert(
                    partition,
                    PartitionOutcome::Finished {
                        status,
                        exit_status,
                    },
                );
            }
        }
    }
}
