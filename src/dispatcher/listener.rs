use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::dispatcher::internal::InternalDispatcher;
use crate::dispatcher::{DispatchRequest, DISPATCH_FAILED};
use crate::error::{DispatchError, Result, StoreError};
use crate::partition::{PartitionPlan, StepDefinition, TransportReplyQueue};
use crate::transport::{codec, Envelope, MessageTransport};

/// Consumes queued dispatch requests on behalf of this node.
///
/// Delivery is at-least-once. Duplicates are recognised through the store:
/// a job request whose instance is no longer `QUEUED_FOR_DISPATCH` is
/// skipped, as is a partition request whose step-thread record already exists.
pub struct DispatchListener {
    internal: Arc<InternalDispatcher>,
    transport: Arc<dyn MessageTransport>,
    config: DispatchConfig,
}

impl DispatchListener {
    pub fn new(
        internal: Arc<InternalDispatcher>,
        transport: Arc<dyn MessageTransport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            internal,
            transport,
            config,
        }
    }

    /// Subscribes before returning, so nothing sent afterwards is missed,
    /// then consumes until `shutdown` is cancelled.
    pub async fn spawn(self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let mut jobs = self.transport.subscribe(&self.config.job_destination).await?;
        let mut partitions = self
            .transport
            .subscribe(&self.config.partition_destination)
            .await?;
        let mut control = self.transport.subscribe(&self.config.control_topic).await?;

        tracing::info!(
            server_id = %self.internal.server_id(),
            jobs = %self.config.job_destination,
            partitions = %self.config.partition_destination,
            control = %self.config.control_topic,
            "Dispatch listener started"
        );

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(envelope) = jobs.recv() => self.handle(envelope).await,
                    Some(envelope) = partitions.recv() => self.handle(envelope).await,
                    Some(envelope) = control.recv() => self.handle(envelope).await,
                    else => break,
                }
            }
            tracing::info!(server_id = %self.internal.server_id(), "Dispatch listener stopped");
        }))
    }

    async fn handle(&self, envelope: Envelope) {
        let request: DispatchRequest = match codec::decode(&envelope) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(envelope_id = %envelope.id, error = %e, "Dropping undecodable dispatch request");
                return;
            }
        };

        match request {
            DispatchRequest::StartJob {
                instance_id,
                execution_id,
                ..
            } => self.consume_job(instance_id, execution_id, false).await,
            DispatchRequest::RestartJob {
                instance_id,
                execution_id,
                ..
            } => self.consume_job(instance_id, execution_id, true).await,
            DispatchRequest::StartPartition {
                plan,
                step,
                reply_to,
            } => self.consume_partition(plan, step, reply_to).await,
            DispatchRequest::StopPartitions { job_execution_id } => {
                self.internal.stop_partitions(job_execution_id).await;
            }
        }
    }

    async fn consume_job(&self, instance_id: u64, execution_id: u64, restart: bool) {
        match self
            .internal
            .store()
            .update_instance_on_consumed(instance_id)
            .await
        {
            Ok(_) => {}
            Err(StoreError::NotQueued { state, .. }) => {
                tracing::info!(
                    instance_id,
                    execution_id,
                    %state,
                    "Skipping job request that is no longer queued"
                );
                return;
            }
            Err(e) => {
                tracing::error!(instance_id, execution_id, error = %e, "Failed to consume job request");
                return;
            }
        }

        let started = if restart {
            self.internal.restart_instance(instance_id, execution_id).await
        } else {
            self.internal.start(instance_id, execution_id).await
        };
        match started {
            Ok(handle) => {
                tracing::debug!(execution_id = handle.id(), restart, "Consumed job request");
            }
            Err(DispatchError::NotRunning { status, .. }) => {
                tracing::info!(execution_id, %status, "Job execution ended before it could start");
            }
            Err(e) => {
                tracing::error!(instance_id, execution_id, error = %e, "Failed to start consumed job");
                self.internal
                    .mark_execution_failed(execution_id, DISPATCH_FAILED)
                    .await;
            }
        }
    }

    async fn consume_partition(&self, plan: PartitionPlan, step: StepDefinition, reply_to: String) {
        let execution_id = plan.job.execution_id;
        let partition = plan.partition_number;
        let replies = Arc::new(TransportReplyQueue::attach(
            self.transport.clone(),
            reply_to,
            plan.correlation_id,
        ));
        if let Err(e) = self.internal.start_partition(plan, step, replies).await {
            tracing::error!(execution_id, partition, error = %e, "Failed to start consumed partition");
        }
    }
}
