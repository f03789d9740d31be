use std::sync::Arc;

use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::dispatcher::internal::InternalDispatcher;
use crate::dispatcher::DispatchRequest;
use crate::error::{DispatchError, Result};
use crate::locality::NodeLocality;
use crate::model::{JobInstance, Properties};
use crate::partition::{PartitionPlan, PartitionReplyQueue, StepDefinition, TransportReplyQueue};
use crate::store::retry_on_conflict;
use crate::transport::{codec, MessageTransport};

/// Hands jobs and partitions to whichever node consumes them from the
/// message transport, this one included.
pub struct QueuedDispatcher {
    internal: Arc<InternalDispatcher>,
    locality: Arc<dyn NodeLocality>,
    transport: Arc<dyn MessageTransport>,
    config: DispatchConfig,
}

impl QueuedDispatcher {
    pub fn new(
        internal: Arc<InternalDispatcher>,
        locality: Arc<dyn NodeLocality>,
        transport: Arc<dyn MessageTransport>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            internal,
            locality,
            transport,
            config,
        }
    }

    pub(crate) fn internal(&self) -> &Arc<InternalDispatcher> {
        &self.internal
    }

    pub(crate) fn locality(&self) -> &dyn NodeLocality {
        self.locality.as_ref()
    }

    async fn send(&self, destination: &str, execution_id: u64, request: &DispatchRequest) -> Result<()> {
        let envelope = codec::encode(request.kind(), request)
            .map_err(|source| DispatchError::Routing { execution_id, source })?;
        self.transport
            .send(destination, envelope)
            .await
            .map_err(|source| DispatchError::Routing { execution_id, source })
    }

    async fn enqueue_job(&self, instance_id: u64, execution_id: u64, request: DispatchRequest) -> Result<()> {
        let retries = self.internal.max_conflict_retries();
        let store = self.internal.store();
        retry_on_conflict(retries, || store.update_instance_on_queued(instance_id)).await?;
        self.send(&self.config.job_destination, execution_id, &request)
            .await?;
        tracing::info!(
            instance_id,
            execution_id,
            destination = %self.config.job_destination,
            kind = request.kind(),
            "Job queued for dispatch"
        );
        Ok(())
    }

    pub async fn start(
        &self,
        instance: &JobInstance,
        parameters: &Properties,
        execution_id: u64,
    ) -> Result<()> {
        let request = DispatchRequest::StartJob {
            instance_id: instance.instance_id,
            execution_id,
            job_name: instance.job_name.clone(),
            parameters: parameters.clone(),
        };
        self.enqueue_job(instance.instance_id, execution_id, request)
            .await
    }

    pub async fn restart_instance(
        &self,
        instance_id: u64,
        restart_parameters: &Properties,
        execution_id: u64,
    ) -> Result<()> {
        let instance = self.internal.get_job_instance(instance_id).await?;
        let request = DispatchRequest::RestartJob {
            instance_id,
            execution_id,
            job_name: instance.job_name,
            parameters: restart_parameters.clone(),
        };
        self.enqueue_job(instance_id, execution_id, request).await
    }

    pub async fn start_partition(
        &self,
        plan: PartitionPlan,
        step: StepDefinition,
        reply_queue: Arc<dyn PartitionReplyQueue>,
    ) -> Result<()> {
        let reply_to = reply_queue
            .reply_to()
            .ok_or(DispatchError::Unsupported {
                dispatcher: "queued",
                operation: "partition replies over an in-process queue",
            })?
            .to_string();
        let execution_id = plan.job.execution_id;
        let partition = plan.partition_number;
        let request = DispatchRequest::StartPartition {
            plan,
            step,
            reply_to,
        };
        self.send(&self.config.partition_destination, execution_id, &request)
            .await?;
        tracing::debug!(execution_id, partition, "Partition queued for dispatch");
        Ok(())
    }

    pub async fn create_reply_queue(
        &self,
        correlation_id: Uuid,
    ) -> Result<Arc<dyn PartitionReplyQueue>> {
        let queue = TransportReplyQueue::open(self.transport.clone(), correlation_id).await?;
        Ok(Arc::new(queue))
    }

    /// Cancels local partitions, then tells every other node to do the same.
    pub async fn stop_partitions(&self, job_execution_id: u64) -> Result<()> {
        self.internal.stop_partitions(job_execution_id).await;
        let request = DispatchRequest::StopPartitions { job_execution_id };
        let envelope = codec::encode(request.kind(), &request)?;
        self.transport
            .publish(&self.config.control_topic, envelope)
            .await?;
        Ok(())
    }
}
