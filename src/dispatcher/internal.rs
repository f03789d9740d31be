use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::coordinator::PartitionCoordinator;
use crate::dispatcher::BatchDispatcher;
use crate::error::{DispatchError, Result, StoreError};
use crate::locality::NodeLocality;
use crate::model::{BatchStatus, JobExecution, JobInstance};
use crate::partition::{PartitionPlan, PartitionReplyQueue, ReplySender, StepDefinition};
use crate::store::{retry_on_conflict, ExecutionStore, StepThreadCreation};
use crate::transport::MessageTransport;
use crate::worker::{JobContext, JobOutcome, JobRunner, PartitionContext};

/// In-flight unit of work. Dropping it detaches the task.
#[derive(Debug)]
pub struct ExecutionHandle {
    id: u64,
    task: JoinHandle<BatchStatus>,
}

impl ExecutionHandle {
    /// Execution id for jobs, step execution id for partitions.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the final status the work was recorded with.
    pub async fn wait(self) -> Result<BatchStatus> {
        let id = self.id;
        self.task
            .await
            .map_err(|e| DispatchError::Internal(format!("execution task {} failed: {}", id, e)))
    }
}

struct RunningPartition {
    job_execution_id: u64,
    partition: u32,
    stop: CancellationToken,
}

/// Runs jobs and partitions on the node that owns them.
///
/// Every in-flight job is registered with a stop token. Partitions started
/// on the same node as their job get a child of the job's token, so one
/// `stop` reaches them all; partitions consumed from the transport get their
/// own token and are reached through [`InternalDispatcher::stop_partitions`].
pub struct InternalDispatcher {
    config: NodeConfig,
    store: Arc<dyn ExecutionStore>,
    runner: Arc<dyn JobRunner>,
    locality: Arc<dyn NodeLocality>,
    transport: Option<Arc<dyn MessageTransport>>,
    jobs: Mutex<HashMap<u64, CancellationToken>>,
    partitions: Mutex<HashMap<u64, RunningPartition>>,
}

impl InternalDispatcher {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn ExecutionStore>,
        runner: Arc<dyn JobRunner>,
        locality: Arc<dyn NodeLocality>,
        transport: Option<Arc<dyn MessageTransport>>,
    ) -> Self {
        Self {
            config,
            store,
            runner,
            locality,
            transport,
            jobs: Mutex::new(HashMap::new()),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub(crate) fn max_conflict_retries(&self) -> u32 {
        self.config.store.max_conflict_retries
    }

    pub async fn get_job_execution(&self, execution_id: u64) -> Result<JobExecution> {
        self.store
            .get_job_execution(execution_id)
            .await
            .map_err(|e| match e {
                StoreError::NoSuchExecution(id) => DispatchError::NotFound(id),
                other => other.into(),
            })
    }

    pub async fn get_job_instance(&self, instance_id: u64) -> Result<JobInstance> {
        Ok(self.store.get_job_instance(instance_id).await?)
    }

    pub async fn is_running(&self, execution_id: u64) -> bool {
        self.jobs.lock().await.contains_key(&execution_id)
    }

    /// Job executions currently in flight on this node, ascending.
    pub async fn running_executions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.jobs.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// `(job execution id, partition number)` of partitions in flight on this node.
    pub async fn running_partitions(&self) -> Vec<(u64, u32)> {
        let mut running: Vec<(u64, u32)> = self
            .partitions
            .lock()
            .await
            .values()
            .map(|p| (p.job_execution_id, p.partition))
            .collect();
        running.sort_unstable();
        running
    }

    pub async fn start(self: &Arc<Self>, instance_id: u64, execution_id: u64) -> Result<ExecutionHandle> {
        self.launch(instance_id, execution_id, false).await
    }

    pub async fn restart_instance(
        self: &Arc<Self>,
        instance_id: u64,
        execution_id: u64,
    ) -> Result<ExecutionHandle> {
        self.launch(instance_id, execution_id, true).await
    }

    /// The dispatcher partitioned steps of jobs running here fan out through.
    fn partition_coordinator(self: &Arc<Self>) -> Result<PartitionCoordinator> {
        let dispatcher = BatchDispatcher::new(
            &self.config.dispatch,
            self.clone(),
            self.locality.clone(),
            self.transport.clone(),
        )?;
        Ok(PartitionCoordinator::new(
            Arc::new(dispatcher),
            self.store.clone(),
            self.config.partition.clone(),
            self.max_conflict_retries(),
        ))
    }

    async fn launch(
        self: &Arc<Self>,
        instance_id: u64,
        execution_id: u64,
        restart: bool,
    ) -> Result<ExecutionHandle> {
        let execution = self.get_job_execution(execution_id).await?;
        if execution.instance_id != instance_id {
            return Err(StoreError::Corrupt(format!(
                "job execution {} belongs to instance {}, not {}",
                execution_id, execution.instance_id, instance_id
            ))
            .into());
        }
        // Stopped while still queued.
        if execution.status != BatchStatus::Starting {
            return Err(DispatchError::NotRunning {
                execution_id,
                status: execution.status,
            });
        }
        let instance = self.get_job_instance(instance_id).await?;
        let coordinator = self.partition_coordinator()?;

        // Registered before the record names this server, so a stop routed
        // here always finds the token.
        let stop = CancellationToken::new();
        self.jobs.lock().await.insert(execution_id, stop.clone());

        let server_id = self.config.server_id.clone();
        let rest_url = self.config.rest_url.clone();
        let started = retry_on_conflict(self.max_conflict_retries(), || {
            self.store
                .update_execution_on_started(execution_id, &server_id, &rest_url)
        })
        .await;
        let execution = match started {
            Ok(execution) => execution,
            Err(e) => {
                self.jobs.lock().await.remove(&execution_id);
                return Err(match e {
                    // Stopped between registration and start.
                    StoreError::IllegalStatusTransition {
                        from: BatchStatus::Stopping,
                        ..
                    } => {
                        let stopped = BatchStatus::Stopped;
                        retry_on_conflict(self.max_conflict_retries(), || {
                            self.store
                                .update_execution_on_end(execution_id, stopped, "STOPPED")
                        })
                        .await?;
                        DispatchError::NotRunning {
                            execution_id,
                            status: stopped,
                        }
                    }
                    StoreError::IllegalStatusTransition { from, .. } if from.is_final() => {
                        DispatchError::NotRunning {
                            execution_id,
                            status: from,
                        }
                    }
                    other => other.into(),
                });
            }
        };

        tracing::info!(
            execution_id,
            instance_id,
            job_name = %instance.job_name,
            execution_number = execution.execution_number,
            restart,
            server_id = %self.config.server_id,
            "Starting job execution"
        );

        let this = self.clone();
        let task = tokio::spawn(async move {
            this.run_job(instance, execution, restart, coordinator, stop)
                .await
        });
        Ok(ExecutionHandle {
            id: execution_id,
            task,
        })
    }

    async fn run_job(
        self: Arc<Self>,
        instance: JobInstance,
        execution: JobExecution,
        restart: bool,
        coordinator: PartitionCoordinator,
        stop: CancellationToken,
    ) -> BatchStatus {
        let execution_id = execution.execution_id;
        let result = match self.runner.prepare_context(&instance).await {
            Ok(()) => {
                let context = JobContext::new(
                    instance,
                    execution,
                    restart,
                    self.store.clone(),
                    coordinator,
                    self.config.server_id.clone(),
                    stop.clone(),
                    self.max_conflict_retries(),
                );
                self.runner.run_job(&context).await
            }
            Err(e) => Err(e),
        };
        let (status, exit_status) = settle(result, &stop, execution_id);

        if let Err(e) = retry_on_conflict(self.max_conflict_retries(), || {
            self.store
                .update_execution_on_end(execution_id, status, &exit_status)
        })
        .await
        {
            tracing::error!(execution_id, %status, error = %e, "Failed to record job execution end");
        }
        self.jobs.lock().await.remove(&execution_id);
        // Reaches local partitions the job left behind.
        stop.cancel();

        tracing::info!(execution_id, %status, exit_status = %exit_status, "Job execution ended");
        status
    }

    /// Starts one partition here. `Ok(None)` means a record for the same
    /// execution, step and partition already exists, so this is a
    /// redelivery and nothing was started.
    pub async fn start_partition(
        self: &Arc<Self>,
        plan: PartitionPlan,
        step: StepDefinition,
        reply_queue: Arc<dyn PartitionReplyQueue>,
    ) -> Result<Option<ExecutionHandle>> {
        let job_execution_id = plan.job.execution_id;
        let partition = plan.partition_number;
        let server_id = self.config.server_id.clone();

        let created = retry_on_conflict(self.max_conflict_retries(), || {
            self.store.create_partition_step_execution(
                job_execution_id,
                &plan.step_name,
                partition,
                &server_id,
            )
        })
        .await?;
        let record = match created {
            StepThreadCreation::Created(record) => record,
            StepThreadCreation::Existing(record) => {
                tracing::info!(
                    execution_id = job_execution_id,
                    partition,
                    step_execution_id = record.step_execution_id,
                    "Partition already started, ignoring duplicate request"
                );
                return Ok(None);
            }
        };
        let step_execution_id = record.step_execution_id;
        retry_on_conflict(self.max_conflict_retries(), || {
            self.store
                .update_step_thread_status(step_execution_id, BatchStatus::Started, None)
        })
        .await?;

        let parent = self.jobs.lock().await.get(&job_execution_id).cloned();
        let stop = match parent {
            Some(job) => job.child_token(),
            None => CancellationToken::new(),
        };
        self.partitions.lock().await.insert(
            step_execution_id,
            RunningPartition {
                job_execution_id,
                partition,
                stop: stop.clone(),
            },
        );

        tracing::info!(
            execution_id = job_execution_id,
            step = %plan.step_name,
            partition,
            step_execution_id,
            correlation_id = %plan.correlation_id,
            "Starting partition"
        );

        let replies = ReplySender::new(reply_queue, plan);
        let context = PartitionContext::new(step, step_execution_id, stop, replies);
        let this = self.clone();
        let task = tokio::spawn(async move { this.run_partition(context).await });
        Ok(Some(ExecutionHandle {
            id: step_execution_id,
            task,
        }))
    }

    async fn run_partition(self: Arc<Self>, context: PartitionContext) -> BatchStatus {
        let step_execution_id = context.step_execution_id();
        let partition = context.partition_number();
        let result = self.runner.run_partition(&context).await;
        let (status, exit_status) = settle(result, context.stop_token(), step_execution_id);

        if let Err(e) = retry_on_conflict(self.max_conflict_retries(), || {
            self.store
                .update_step_thread_status(step_execution_id, status, Some(&exit_status))
        })
        .await
        {
            tracing::error!(step_execution_id, partition, error = %e, "Failed to record partition end");
        }
        // Record first, so a coordinator that sees the reply also sees the record.
        if let Err(e) = context
            .replies()
            .send_final_status(status, exit_status.clone())
            .await
        {
            tracing::warn!(step_execution_id, partition, error = %e, "Could not deliver partition final status");
        }
        self.partitions.lock().await.remove(&step_execution_id);

        tracing::debug!(step_execution_id, partition, %status, "Partition ended");
        status
    }

    /// Cooperative: marks the execution `STOPPING` and signals its token.
    pub async fn stop(&self, execution_id: u64) -> Result<()> {
        let token = self.jobs.lock().await.get(&execution_id).cloned();
        let Some(token) = token else {
            let execution = self.get_job_execution(execution_id).await?;
            return Err(DispatchError::NotRunning {
                execution_id,
                status: execution.status,
            });
        };

        match retry_on_conflict(self.max_conflict_retries(), || {
            self.store
                .update_execution_status(execution_id, BatchStatus::Stopping)
        })
        .await
        {
            Ok(_) => {}
            Err(StoreError::IllegalStatusTransition { from, .. }) if from.is_final() => {
                return Err(DispatchError::NotRunning {
                    execution_id,
                    status: from,
                });
            }
            Err(e) => return Err(e.into()),
        }
        token.cancel();
        tracing::info!(execution_id, "Stop requested for job execution");
        Ok(())
    }

    /// Cancels this node's partitions of `job_execution_id`; returns how many.
    pub async fn stop_partitions(&self, job_execution_id: u64) -> usize {
        let partitions = self.partitions.lock().await;
        let mut stopped = 0;
        for running in partitions
            .values()
            .filter(|p| p.job_execution_id == job_execution_id)
        {
            running.stop.cancel();
            stopped += 1;
        }
        if stopped > 0 {
            tracing::info!(execution_id = job_execution_id, partitions = stopped, "Stop requested for partitions");
        }
        stopped
    }

    /// Best effort; failures are logged.
    pub async fn mark_execution_failed(&self, execution_id: u64, exit_status: &str) {
        match retry_on_conflict(self.max_conflict_retries(), || {
            self.store
                .update_execution_on_end(execution_id, BatchStatus::Failed, exit_status)
        })
        .await
        {
            Ok(_) => tracing::info!(execution_id, exit_status, "Job execution marked failed"),
            Err(e) => tracing::error!(execution_id, error = %e, "Failed to mark job execution failed"),
        }
    }
}

/// Maps a runner result to the final `(status, exit_status)` to record.
fn settle(result: Result<JobOutcome>, stop: &CancellationToken, id: u64) -> (BatchStatus, String) {
    match result {
        Ok(outcome) if outcome.status.is_final() => (outcome.status, outcome.exit_status),
        Ok(outcome) => {
            let status = if stop.is_cancelled() {
                BatchStatus::Stopped
            } else {
                BatchStatus::Failed
            };
            tracing::warn!(id, reported = %outcome.status, recorded = %status, "Runner returned a non-final status");
            (status, status.to_string())
        }
        Err(e) => {
            tracing::error!(id, error = %e, "Runner failed");
            (BatchStatus::Failed, e.to_string())
        }
    }
}
