//! Job and partition routing.
//!
//! [`BatchDispatcher`] decides where work runs; [`InternalDispatcher`]
//! actually runs it on the node that ends up owning it. The variant is
//! chosen once from [`DispatchConfig`]:
//!
//! - [`LocalDispatcher`] calls the internal dispatcher in-process
//! - [`QueuedDispatcher`] enqueues a [`DispatchRequest`] on the message
//!   transport for any [`DispatchListener`] (possibly this node's) to consume
//!
//! Partition fan-out goes through the same variant as whole-job dispatch, so
//! a partitioned step's coordinator never knows which one it is using.

pub mod internal;
pub mod listener;
pub mod local;
pub mod queued;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DispatchConfig, DispatchMode};
use crate::error::{DispatchError, Result, StoreError};
use crate::locality::{Location, NodeLocality};
use crate::model::{JobInstance, Properties};
use crate::partition::{PartitionPlan, PartitionReplyQueue, StepDefinition};
use crate::transport::MessageTransport;

pub use internal::{ExecutionHandle, InternalDispatcher};
pub use listener::DispatchListener;
pub use local::LocalDispatcher;
pub use queued::QueuedDispatcher;

/// Exit status recorded when dispatch itself could not be completed.
pub const DISPATCH_FAILED: &str = "DISPATCH_FAILED";

/// Requests carried by the message transport between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchRequest {
    StartJob {
        instance_id: u64,
        execution_id: u64,
        job_name: String,
        parameters: Properties,
    },
    RestartJob {
        instance_id: u64,
        execution_id: u64,
        job_name: String,
        parameters: Properties,
    },
    StartPartition {
        plan: PartitionPlan,
        step: StepDefinition,
        /// Reply destination of the coordinating node's queue
        reply_to: String,
    },
    StopPartitions {
        job_execution_id: u64,
    },
}

impl DispatchRequest {
    /// Value of the envelope's `kind` header.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchRequest::StartJob { .. } => "start_job",
            DispatchRequest::RestartJob { .. } => "restart_job",
            DispatchRequest::StartPartition { .. } => "start_partition",
            DispatchRequest::StopPartitions { .. } => "stop_partitions",
        }
    }
}

pub enum BatchDispatcher {
    Local(LocalDispatcher),
    Queued(QueuedDispatcher),
}

impl BatchDispatcher {
    pub fn new(
        config: &DispatchConfig,
        internal: Arc<InternalDispatcher>,
        locality: Arc<dyn NodeLocality>,
        transport: Option<Arc<dyn MessageTransport>>,
    ) -> Result<Self> {
        match config.mode {
            DispatchMode::Local => Ok(BatchDispatcher::Local(LocalDispatcher::new(
                internal, locality,
            ))),
            DispatchMode::Queued => {
                let transport = transport.ok_or_else(|| {
                    DispatchError::Internal(
                        "queued dispatch requires a message transport".to_string(),
                    )
                })?;
                Ok(BatchDispatcher::Queued(QueuedDispatcher::new(
                    internal,
                    locality,
                    transport,
                    config.clone(),
                )))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BatchDispatcher::Local(_) => "local",
            BatchDispatcher::Queued(_) => "queued",
        }
    }

    fn internal(&self) -> &Arc<InternalDispatcher> {
        match self {
            BatchDispatcher::Local(d) => d.internal(),
            BatchDispatcher::Queued(d) => d.internal(),
        }
    }

    fn locality(&self) -> &dyn NodeLocality {
        match self {
            BatchDispatcher::Local(d) => d.locality(),
            BatchDispatcher::Queued(d) => d.locality(),
        }
    }

    /// Begins the initial execution of a newly created instance.
    pub async fn start(
        &self,
        instance: &JobInstance,
        parameters: &Properties,
        execution_id: u64,
    ) -> Result<()> {
        match self {
            BatchDispatcher::Local(d) => d.start(instance, parameters, execution_id).await,
            BatchDispatcher::Queued(d) => d.start(instance, parameters, execution_id).await,
        }
    }

    /// Begins a restart execution already created in the store.
    pub async fn restart_instance(
        &self,
        instance_id: u64,
        restart_parameters: &Properties,
        execution_id: u64,
    ) -> Result<()> {
        match self {
            BatchDispatcher::Local(d) => {
                d.restart_instance(instance_id, restart_parameters, execution_id)
                    .await
            }
            BatchDispatcher::Queued(d) => {
                d.restart_instance(instance_id, restart_parameters, execution_id)
                    .await
            }
        }
    }

    /// Best effort: records the execution and its instance as failed after a
    /// dispatch that could not be completed. Never fails.
    pub async fn mark_instance_execution_failed(
        &self,
        instance_id: u64,
        execution_id: u64,
        correlation_id: Option<Uuid>,
    ) {
        tracing::warn!(
            instance_id,
            execution_id,
            correlation_id = ?correlation_id,
            dispatcher = self.name(),
            "Marking job execution failed after dispatch failure"
        );
        self.internal()
            .mark_execution_failed(execution_id, DISPATCH_FAILED)
            .await;
    }

    /// Requests cooperative termination of an execution owned by this node.
    ///
    /// An execution no server has picked up yet is stopped in the store
    /// directly. One running elsewhere yields [`DispatchError::NotLocal`]
    /// without touching any state.
    pub async fn stop(&self, execution_id: u64) -> Result<()> {
        let internal = self.internal();
        let execution = internal.get_job_execution(execution_id).await?;
        if execution.status.is_final() {
            return Err(DispatchError::NotRunning {
                execution_id,
                status: execution.status,
            });
        }

        match self.locality().locate(execution_id).await? {
            Location::Local => internal.stop(execution_id).await,
            Location::Remote { server_id, rest_url } => {
                tracing::debug!(execution_id, server_id = %server_id, "Stop refused, execution is not local");
                Err(DispatchError::NotLocal {
                    execution_id,
                    server_id,
                    rest_url,
                })
            }
            Location::Unassigned => {
                match internal
                    .store()
                    .update_execution_on_stop_before_dispatch(execution_id)
                    .await
                {
                    Ok(_) => {
                        tracing::info!(execution_id, "Stopped job execution before dispatch");
                        Ok(())
                    }
                    // Picked up between the locate and the update.
                    Err(StoreError::AlreadyAssigned { server_id, .. }) => {
                        if server_id == self.locality().server_id() {
                            internal.stop(execution_id).await
                        } else {
                            Err(DispatchError::NotLocal {
                                execution_id,
                                server_id,
                                rest_url: None,
                            })
                        }
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    pub async fn start_partition(
        &self,
        plan: PartitionPlan,
        step: StepDefinition,
        reply_queue: Arc<dyn PartitionReplyQueue>,
    ) -> Result<()> {
        match self {
            BatchDispatcher::Local(d) => d.start_partition(plan, step, reply_queue).await,
            BatchDispatcher::Queued(d) => d.start_partition(plan, step, reply_queue).await,
        }
    }

    /// Only the queued variant can create a cross-node reply queue; the local
    /// variant returns [`DispatchError::Unsupported`].
    pub async fn create_reply_queue(
        &self,
        correlation_id: Uuid,
    ) -> Result<Arc<dyn PartitionReplyQueue>> {
        match self {
            BatchDispatcher::Local(_) => Err(DispatchError::Unsupported {
                dispatcher: "local",
                operation: "cross-node reply queues",
            }),
            BatchDispatcher::Queued(d) => d.create_reply_queue(correlation_id).await,
        }
    }

    /// Signals every partition of `job_execution_id` to stop, wherever it runs.
    pub async fn stop_partitions(&self, job_execution_id: u64) -> Result<()> {
        match self {
            BatchDispatcher::Local(d) => d.stop_partitions(job_execution_id).await,
            BatchDispatcher::Queued(d) => d.stop_partitions(job_execution_id).await,
        }
    }
}
