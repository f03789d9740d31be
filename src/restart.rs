//! Restart-eligibility gate.
//!
//! Rules run in a fixed order and stop at the first violation, so the same
//! unchanged state always yields the same decision and the same error.

use std::sync::Arc;

use crate::error::{DispatchError, RestartError, Result, StoreError};
use crate::model::{BatchStatus, InstanceState, JobExecution, JobInstance, Properties};
use crate::resolver::JobDefinitionResolver;
use crate::store::ExecutionStore;

pub struct RestartValidator {
    store: Arc<dyn ExecutionStore>,
    resolver: Arc<dyn JobDefinitionResolver>,
}

impl RestartValidator {
    pub fn new(store: Arc<dyn ExecutionStore>, resolver: Arc<dyn JobDefinitionResolver>) -> Self {
        Self { store, resolver }
    }

    /// Accepts a restart of `previous_execution_id` or names the rule that rejects it.
    pub async fn validate(
        &self,
        previous_execution_id: u64,
        restart_parameters: &Properties,
    ) -> Result<()> {
        let not_found = |e: StoreError| match e {
            StoreError::NoSuchExecution(id) => DispatchError::NotFound(id),
            other => other.into(),
        };
        let execution = self
            .store
            .get_job_execution(previous_execution_id)
            .await
            .map_err(not_found)?;
        let instance = self
            .store
            .get_instance_for_execution(previous_execution_id)
            .await
            .map_err(not_found)?;
        let instance_id = instance.instance_id;

        let result = self
            .check(previous_execution_id, restart_parameters, &execution, &instance)
            .await;
        if let Err(DispatchError::Restart(e)) = &result {
            tracing::info!(instance_id, execution_id = previous_execution_id, error = %e, "Restart rejected");
        }
        result
    }

    async fn check(
        &self,
        execution_id: u64,
        restart_parameters: &Properties,
        execution: &JobExecution,
        instance: &JobInstance,
    ) -> Result<()> {
        let instance_id = instance.instance_id;

        if !self.resolver.is_restartable(instance, restart_parameters)? {
            return Err(RestartError::NotRestartable {
                instance_id,
                job_name: instance.job_name.clone(),
            }
            .into());
        }

        if let Some(most_recent) = self.store.most_recent_execution_id(instance_id).await? {
            if most_recent != execution_id {
                return Err(RestartError::NotMostRecent {
                    instance_id,
                    execution_id,
                    most_recent,
                }
                .into());
            }
        }

        if instance.state == InstanceState::Completed || execution.status == BatchStatus::Completed {
            return Err(RestartError::AlreadyComplete {
                instance_id,
                execution_id,
            }
            .into());
        }
        if instance.state == InstanceState::Abandoned || execution.status == BatchStatus::Abandoned {
            return Err(RestartError::Abandoned {
                instance_id,
                execution_id,
            }
            .into());
        }

        // STARTING stays restartable: the record exists before the work runs.
        if !matches!(
            execution.status,
            BatchStatus::Failed | BatchStatus::Stopped | BatchStatus::Starting
        ) {
            return Err(RestartError::NotTerminal {
                instance_id,
                execution_id,
                status: execution.status,
            }
            .into());
        }

        if !instance.state.is_restartable() {
            return Err(RestartError::InstanceNotRestartable {
                instance_id,
                state: instance.state,
            }
            .into());
        }

        let step_threads = self.store.step_thread_executions(execution_id).await?;
        if let Some(running) = step_threads
            .iter()
            .find(|s| !s.status.is_terminal_step_status())
        {
            return Err(RestartError::NonFinalStepThread {
                instance_id,
                execution_id,
                step_name: running.step_name.clone(),
                partition: running.kind.partition_number(),
                status: running.status,
            }
            .into());
        }

        Ok(())
    }
}
