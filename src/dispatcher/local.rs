use std::sync::Arc;

use crate::dispatcher::internal::InternalDispatcher;
use crate::error::Result;
use crate::locality::NodeLocality;
use crate::model::{JobInstance, Properties};
use crate::partition::{PartitionPlan, PartitionReplyQueue, StepDefinition};

/// Runs every job and partition in-process on this node.
pub struct LocalDispatcher {
    internal: Arc<InternalDispatcher>,
    locality: Arc<dyn NodeLocality>,
}

impl LocalDispatcher {
    pub fn new(internal: Arc<InternalDispatcher>, locality: Arc<dyn NodeLocality>) -> Self {
        Self { internal, locality }
    }

    pub(crate) fn internal(&self) -> &Arc<InternalDispatcher> {
        &self.internal
    }

    pub(crate) fn locality(&self) -> &dyn NodeLocality {
        self.locality.as_ref()
    }

    pub async fn start(
        &self,
        instance: &JobInstance,
        _parameters: &Properties,
        execution_id: u64,
    ) -> Result<()> {
        let handle = self
            .internal
            .start(instance.instance_id, execution_id)
            .await?;
        tracing::debug!(execution_id = handle.id(), "Job dispatched locally");
        Ok(())
    }

    pub async fn restart_instance(
        &self,
        instance_id: u64,
        _restart_parameters: &Properties,
        execution_id: u64,
    ) -> Result<()> {
        let handle = self
            .internal
            .restart_instance(instance_id, execution_id)
            .await?;
        tracing::debug!(execution_id = handle.id(), "Restart dispatched locally");
        Ok(())
    }

    pub async fn start_partition(
        &self,
        plan: PartitionPlan,
        step: StepDefinition,
        reply_queue: Arc<dyn PartitionReplyQueue>,
    ) -> Result<()> {
        self.internal
            .start_partition(plan, step, reply_queue)
            .await
            .map(|_| ())
    }

    pub async fn stop_partitions(&self, job_execution_id: u64) -> Result<()> {
        self.internal.stop_partitions(job_execution_id).await;
        Ok(())
    }
}
