use std::sync::Arc;

use crate::dispatcher::BatchDispatcher;
use crate::error::{DispatchError, RestartError, Result, StoreError};
use crate::model::{BatchStatus, InstanceState, JobExecution, JobInstance, Properties};
use crate::restart::RestartValidator;
use crate::store::{retry_on_conflict, ExecutionStore};

/// Submit, restart, stop and abandon, composed from the store, the restart
/// gate and the dispatcher. Callers are expected to have authorized the
/// request already.
pub struct BatchOperator {
    store: Arc<dyn ExecutionStore>,
    dispatcher: Arc<BatchDispatcher>,
    validator: RestartValidator,
    max_conflict_retries: u32,
}

impl BatchOperator {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        dispatcher: Arc<BatchDispatcher>,
        validator: RestartValidator,
        max_conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            dispatcher,
            validator,
            max_conflict_retries,
        }
    }

    pub async fn submit(
        &self,
        job_name: &str,
        submitter: &str,
        definition_ref: &str,
        parameters: Properties,
    ) -> Result<JobExecution> {
        let instance = self
            .store
            .create_job_instance(job_name, submitter, definition_ref)
            .await?;
        let execution = self
            .store
            .create_job_execution(instance.instance_id, parameters.clone())
            .await?;
        tracing::info!(
            instance_id = instance.instance_id,
            execution_id = execution.execution_id,
            job_name,
            submitter,
            "Job submitted"
        );

        self.dispatch(&instance, &execution, &parameters, false)
            .await?;
        Ok(self.store.get_job_execution(execution.execution_id).await?)
    }

    /// Restarts from `previous_execution_id`, which must be the instance's
    /// most recent execution. Returns the new execution.
    pub async fn restart(
        &self,
        previous_execution_id: u64,
        restart_parameters: Properties,
    ) -> Result<JobExecution> {
        self.validator
            .validate(previous_execution_id, &restart_parameters)
            .await?;

        let instance = self
            .store
            .get_instance_for_execution(previous_execution_id)
            .await?;
        let instance_id = instance.instance_id;
        let instance = retry_on_conflict(self.max_conflict_retries, || {
            self.store.update_instance_on_restart(instance_id)
        })
        .await
        .map_err(|e| match e {
            StoreError::NotRestartable { instance_id, state } => {
                DispatchError::Restart(RestartError::InstanceNotRestartable { instance_id, state })
            }
            other => other.into(),
        })?;
        let execution = self
            .store
            .create_job_execution(instance_id, restart_parameters.clone())
            .await?;
        tracing::info!(
            instance_id,
            previous_execution_id,
            execution_id = execution.execution_id,
            execution_number = execution.execution_number,
            "Job restart accepted"
        );

        self.dispatch(&instance, &execution, &restart_parameters, true)
            .await?;
        Ok(self.store.get_job_execution(execution.execution_id).await?)
    }

    async fn dispatch(
        &self,
        instance: &JobInstance,
        execution: &JobExecution,
        parameters: &Properties,
        restart: bool,
    ) -> Result<()> {
        let execution_id = execution.execution_id;
        let result = if restart {
            self.dispatcher
                .restart_instance(instance.instance_id, parameters, execution_id)
                .await
        } else {
            self.dispatcher
                .start(instance, parameters, execution_id)
                .await
        };
        if let Err(e) = result {
            tracing::error!(
                instance_id = instance.instance_id,
                execution_id,
                error = %e,
                "Dispatch failed"
            );
            self.dispatcher
                .mark_instance_execution_failed(instance.instance_id, execution_id, None)
                .await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn stop(&self, execution_id: u64) -> Result<()> {
        self.dispatcher.stop(execution_id).await
    }

    /// Abandons a finished execution, closing its instance for good.
    pub async fn abandon(&self, execution_id: u64) -> Result<JobInstance> {
        let execution = self.store.get_job_execution(execution_id).await.map_err(|e| match e {
            StoreError::NoSuchExecution(id) => DispatchError::NotFound(id),
            other => other.into(),
        })?;
        if !execution.status.is_final() {
            return Err(DispatchError::StillRunning {
                execution_id,
                status: execution.status,
            });
        }
        // Checked up front so a rejected abandon leaves the execution untouched.
        let instance = self.store.get_job_instance(execution.instance_id).await?;
        if !instance.state.can_transition_to(InstanceState::Abandoned) {
            return Err(StoreError::IllegalTransition {
                instance_id: instance.instance_id,
                from: instance.state,
                to: InstanceState::Abandoned,
            }
            .into());
        }
        retry_on_conflict(self.max_conflict_retries, || {
            self.store
                .update_execution_status(execution_id, BatchStatus::Abandoned)
        })
        .await?;
        let instance = retry_on_conflict(self.max_conflict_retries, || {
            self.store
                .update_instance_state(execution.instance_id, InstanceState::Abandoned)
        })
        .await?;
        tracing::info!(
            instance_id = instance.instance_id,
            execution_id,
            "Job instance abandoned"
        );
        Ok(instance)
    }
}
