use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::model::{
    BatchStatus, InstanceState, JobExecution, JobInstance, Properties, StepThreadExecution,
    StepThreadKind,
};
use crate::store::{ExecutionStore, StepThreadCreation, StoreResult};

#[derive(Debug)]
struct StoreState {
    next_instance_id: u64,
    next_execution_id: u64,
    next_step_execution_id: u64,
    instances: HashMap<u64, JobInstance>,
    executions: HashMap<u64, JobExecution>,
    // Keyed by id, so iteration is creation order.
    step_threads: BTreeMap<u64, StepThreadExecution>,
}

impl StoreState {
    fn instance_mut(&mut self, instance_id: u64) -> StoreResult<&mut JobInstance> {
        self.instances
            .get_mut(&instance_id)
            .ok_or(StoreError::NoSuchInstance(instance_id))
    }

    fn execution_mut(&mut self, execution_id: u64) -> StoreResult<&mut JobExecution> {
        self.executions
            .get_mut(&execution_id)
            .ok_or(StoreError::NoSuchExecution(execution_id))
    }

    fn instance_id_of(&self, execution_id: u64) -> StoreResult<u64> {
        self.executions
            .get(&execution_id)
            .map(|e| e.instance_id)
            .ok_or(StoreError::NoSuchExecution(execution_id))
    }

    /// Moves an instance to `to`, rejecting transitions the state machine forbids.
    fn transition_instance(
        &mut self,
        instance_id: u64,
        to: InstanceState,
    ) -> StoreResult<&mut JobInstance> {
        let instance = self.instance_mut(instance_id)?;
        if !instance.state.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                instance_id,
                from: instance.state,
                to,
            });
        }
        if instance.state != to {
            instance.state = to;
            instance.last_updated_at = Utc::now();
            instance.version += 1;
        }
        Ok(instance)
    }

    fn transition_execution(
        &mut self,
        execution_id: u64,
        to: BatchStatus,
    ) -> StoreResult<&mut JobExecution> {
        let execution = self.execution_mut(execution_id)?;
        if !execution.status.can_transition_to(to) {
            return Err(StoreError::IllegalStatusTransition {
                record_id: execution_id,
                from: execution.status,
                to,
            });
        }
        execution.status = to;
        execution.last_updated_at = Utc::now();
        execution.version += 1;
        Ok(execution)
    }

    fn mirror_status_on_instance(&mut self, instance_id: u64, status: BatchStatus) -> StoreResult<()> {
        let instance = self.instance_mut(instance_id)?;
        instance.batch_status = status;
        instance.last_updated_at = Utc::now();
        Ok(())
    }
}

/// Execution-record store held entirely in memory.
///
/// Every operation takes the single write lock for its whole duration, so
/// each update is atomic and concurrent updates to the same record are
/// serialized.
#[derive(Debug)]
pub struct InMemoryExecutionStore {
    state: RwLock<StoreState>,
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState {
                next_instance_id: 1,
                next_execution_id: 1,
                next_step_execution_id: 1,
                instances: HashMap::new(),
                executions: HashMap::new(),
                step_threads: BTreeMap::new(),
            }),
        }
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_job_instance(
        &self,
        job_name: &str,
        submitter: &str,
        definition_ref: &str,
    ) -> StoreResult<JobInstance> {
        let mut state = self.state.write().await;
        let instance_id = state.next_instance_id;
        state.next_instance_id += 1;
        let instance = JobInstance::new(
            instance_id,
            job_name.to_string(),
            submitter.to_string(),
            definition_ref.to_string(),
            Utc::now(),
        );
        state.instances.insert(instance_id, instance.clone());
        tracing::debug!(instance_id, job_name, "Job instance created");
        Ok(instance)
    }

    async fn create_job_execution(
        &self,
        instance_id: u64,
        parameters: Properties,
    ) -> StoreResult<JobExecution> {
        let mut state = self.state.write().await;
        let execution_id = state.next_execution_id;
        let now = Utc::now();

        let instance = state.instance_mut(instance_id)?;
        if instance.state.is_terminal() {
            return Err(StoreError::IllegalTransition {
                instance_id,
                from: instance.state,
                to: InstanceState::Submitted,
            });
        }
        // Prior execution count doubles as this execution's zero-based number.
        let execution_number = instance.number_of_executions;
        instance.number_of_executions += 1;
        instance.execution_ids.insert(0, execution_id);
        instance.batch_status = BatchStatus::Starting;
        instance.last_updated_at = now;
        instance.version += 1;

        let execution = JobExecution {
            execution_id,
            instance_id,
            execution_number,
            status: BatchStatus::Starting,
            exit_status: None,
            parameters,
            server_id: None,
            rest_url: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            last_updated_at: now,
            version: 0,
        };
        state.next_execution_id += 1;
        state.executions.insert(execution_id, execution.clone());
        tracing::debug!(instance_id, execution_id, execution_number, "Job execution created");
        Ok(execution)
    }

    async fn get_job_instance(&self, instance_id: u64) -> StoreResult<JobInstance> {
        self.state
            .read()
            .await
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or(StoreError::NoSuchInstance(instance_id))
    }

    async fn get_job_execution(&self, execution_id: u64) -> StoreResult<JobExecution> {
        self.state
            .read()
            .await
            .executions
            .get(&execution_id)
            .cloned()
            .ok_or(StoreError::NoSuchExecution(execution_id))
    }

    async fn get_instance_for_execution(&self, execution_id: u64) -> StoreResult<JobInstance> {
        let state = self.state.read().await;
        let instance_id = state.instance_id_of(execution_id)?;
        state.instances.get(&instance_id).cloned().ok_or_else(|| {
            StoreError::Corrupt(format!(
                "execution {} references missing instance {}",
                execution_id, instance_id
            ))
        })
    }

    async fn list_job_instances(&self) -> StoreResult<Vec<JobInstance>> {
        let state = self.state.read().await;
        let mut instances: Vec<JobInstance> = state.instances.values().cloned().collect();
        instances.sort_by_key(|i| i.instance_id);
        Ok(instances)
    }

    async fn executions_for_instance(&self, instance_id: u64) -> StoreResult<Vec<JobExecution>> {
        let state = self.state.read().await;
        let instance = state
            .instances
            .get(&instance_id)
            .ok_or(StoreError::NoSuchInstance(instance_id))?;
        instance
            .execution_ids
            .iter()
            .map(|id| {
                state.executions.get(id).cloned().ok_or_else(|| {
                    StoreError::Corrupt(format!(
                        "instance {} references missing execution {}",
                        instance_id, id
                    ))
                })
            })
            .collect()
    }

    async fn most_recent_execution_id(&self, instance_id: u64) -> StoreResult<Option<u64>> {
        let state = self.state.read().await;
        let instance = state
            .instances
            .get(&instance_id)
            .ok_or(StoreError::NoSuchInstance(instance_id))?;
        Ok(instance.most_recent_execution_id())
    }

    async fn update_instance_state(
        &self,
        instance_id: u64,
        to: InstanceState,
    ) -> StoreResult<JobInstance> {
        let mut state = self.state.write().await;
        let instance = state.transition_instance(instance_id, to)?;
        Ok(instance.clone())
    }

    async fn update_instance_on_restart(&self, instance_id: u64) -> StoreResult<JobInstance> {
        let mut state = self.state.write().await;
        let instance = state.instance_mut(instance_id)?;
        if !instance.state.is_restartable() {
            return Err(StoreError::NotRestartable {
                instance_id,
                state: instance.state,
            });
        }
        instance.state = InstanceState::Submitted;
        instance.batch_status = BatchStatus::Starting;
        instance.last_updated_at = Utc::now();
        instance.version += 1;
        Ok(instance.clone())
    }

    async fn update_instance_on_queued(&self, instance_id: u64) -> StoreResult<JobInstance> {
        let mut state = self.state.write().await;
        let instance = state.instance_mut(instance_id)?;
        if instance.state != InstanceState::Submitted {
            return Err(StoreError::IllegalTransition {
                instance_id,
                from: instance.state,
                to: InstanceState::QueuedForDispatch,
            });
        }
        let instance = state.transition_instance(instance_id, InstanceState::QueuedForDispatch)?;
        Ok(instance.clone())
    }

    async fn update_instance_on_consumed(&self, instance_id: u64) -> StoreResult<JobInstance> {
        let mut state = self.state.write().await;
        let instance = state.instance_mut(instance_id)?;
        if instance.state != InstanceState::QueuedForDispatch {
            return Err(StoreError::NotQueued {
                instance_id,
                state: instance.state,
            });
        }
        let instance = state.transition_instance(instance_id, InstanceState::DispatchConsumed)?;
        Ok(instance.clone())
    }

    async fn update_execution_on_started(
        &self,
        execution_id: u64,
        server_id: &str,
        rest_url: &str,
    ) -> StoreResult<JobExecution> {
        let mut state = self.state.write().await;
        let instance_id = state.instance_id_of(execution_id)?;

        // Validate both records before mutating either.
        let current = state.execution_mut(execution_id)?.status;
        if !current.can_transition_to(BatchStatus::Started) {
            return Err(StoreError::IllegalStatusTransition {
                record_id: execution_id,
                from: current,
                to: BatchStatus::Started,
            });
        }
        state.transition_instance(instance_id, InstanceState::Dispatched)?;
        state.mirror_status_on_instance(instance_id, BatchStatus::Started)?;

        let now = Utc::now();
        let execution = state.transition_execution(execution_id, BatchStatus::Started)?;
        execution.server_id = Some(server_id.to_string());
        execution.rest_url = Some(rest_url.to_string());
        execution.started_at = Some(now);
        Ok(execution.clone())
    }

    async fn update_execution_status(
        &self,
        execution_id: u64,
        status: BatchStatus,
    ) -> StoreResult<JobExecution> {
        let mut state = self.state.write().await;
        let instance_id = state.instance_id_of(execution_id)?;
        let execution = state.transition_execution(execution_id, status)?.clone();
        state.mirror_status_on_instance(instance_id, status)?;
        Ok(execution)
    }

    async fn update_execution_on_end(
        &self,
        execution_id: u64,
        status: BatchStatus,
        exit_status: &str,
    ) -> StoreResult<JobExecution> {
        let mut state = self.state.write().await;
        let instance_id = state.instance_id_of(execution_id)?;

        let current = state.execution_mut(execution_id)?.status;
        if !current.can_transition_to(status) {
            return Err(StoreError::IllegalStatusTransition {
                record_id: execution_id,
                from: current,
                to: status,
            });
        }
        if let Some(instance_state) = InstanceState::from_final_status(status) {
            state.transition_instance(instance_id, instance_state)?;
        }
        state.mirror_status_on_instance(instance_id, status)?;

        let now = Utc::now();
        let execution = state.transition_execution(execution_id, status)?;
        execution.exit_status = Some(exit_status.to_string());
        if status.is_final() {
            execution.ended_at = Some(now);
        }
        Ok(execution.clone())
    }

    async fn update_execution_on_stop_before_dispatch(
        &self,
        execution_id: u64,
    ) -> StoreResult<JobExecution> {
        let mut state = self.state.write().await;
        let instance_id = state.instance_id_of(execution_id)?;
        let execution = state.execution_mut(execution_id)?;
        if let Some(server_id) = &execution.server_id {
            return Err(StoreError::AlreadyAssigned {
                execution_id,
                server_id: server_id.clone(),
            });
        }
        if !execution.status.can_transition_to(BatchStatus::Stopped) {
            return Err(StoreError::IllegalStatusTransition {
                record_id: execution_id,
                from: execution.status,
                to: BatchStatus::Stopped,
            });
        }
        state.transition_instance(instance_id, InstanceState::Stopped)?;
        state.mirror_status_on_instance(instance_id, BatchStatus::Stopped)?;

        let now = Utc::now();
        let execution = state.transition_execution(execution_id, BatchStatus::Stopped)?;
        execution.exit_status = Some(BatchStatus::Stopped.to_string());
        execution.ended_at = Some(now);
        Ok(execution.clone())
    }

    async fn create_top_level_step_execution(
        &self,
        execution_id: u64,
        step_name: &str,
        server_id: &str,
    ) -> StoreResult<StepThreadExecution> {
        let mut state = self.state.write().await;
        let instance_id = state.instance_id_of(execution_id)?;
        let step_execution_id = state.next_step_execution_id;
        state.next_step_execution_id += 1;
        let record = StepThreadExecution {
            step_execution_id,
            execution_id,
            instance_id,
            step_name: step_name.to_string(),
            kind: StepThreadKind::TopLevel,
            status: BatchStatus::Starting,
            exit_status: None,
            server_id: Some(server_id.to_string()),
            created_at: Utc::now(),
            ended_at: None,
            version: 0,
        };
        state.step_threads.insert(step_execution_id, record.clone());
        Ok(record)
    }

    async fn create_partition_step_execution(
        &self,
        execution_id: u64,
        step_name: &str,
        partition: u32,
        server_id: &str,
    ) -> StoreResult<StepThreadCreation> {
        let mut state = self.state.write().await;
        let instance_id = state.instance_id_of(execution_id)?;
        let kind = StepThreadKind::Partition { number: partition };

        if let Some(existing) = state.step_threads.values().find(|s| {
            s.execution_id == execution_id && s.step_name == step_name && s.kind == kind
        }) {
            return Ok(StepThreadCreation::Existing(existing.clone()));
        }

        let step_execution_id = state.next_step_execution_id;
        state.next_step_execution_id += 1;
        let record = StepThreadExecution {
            step_execution_id,
            execution_id,
            instance_id,
            step_name: step_name.to_string(),
            kind,
            status: BatchStatus::Starting,
            exit_status: None,
            server_id: Some(server_id.to_string()),
            created_at: Utc::now(),
            ended_at: None,
            version: 0,
        };
        state.step_threads.insert(step_execution_id, record.clone());
        Ok(StepThreadCreation::Created(record))
    }

    async fn update_step_thread_status(
        &self,
        step_execution_id: u64,
        status: BatchStatus,
        exit_status: Option<&str>,
    ) -> StoreResult<StepThreadExecution> {
        let mut state = self.state.write().await;
        let record = state
            .step_threads
            .get_mut(&step_execution_id)
            .ok_or(StoreError::NoSuchStepExecution(step_execution_id))?;
        if !record.status.can_transition_to(status) {
            return Err(StoreError::IllegalStatusTransition {
                record_id: step_execution_id,
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        if let Some(exit_status) = exit_status {
            record.exit_status = Some(exit_status.to_string());
        }
        if status.is_final() {
            record.ended_at = Some(Utc::now());
        }
        record.version += 1;
        Ok(record.clone())
    }

    async fn job_executions_running_on(&self, server_id: &str) -> StoreResult<Vec<JobExecution>> {
        let state = self.state.read().await;
        let mut running: Vec<JobExecution> = state
            .executions
            .values()
            .filter(|e| !e.status.is_final() && e.server_id.as_deref() == Some(server_id))
            .cloned()
            .collect();
        running.sort_by_key(|e| e.execution_id);
        Ok(running)
    }

    async fn step_threads_running_on(
        &self,
        server_id: &str,
    ) -> StoreResult<Vec<StepThreadExecution>> {
        let state = self.state.read().await;
        Ok(state
            .step_threads
            .values()
            .filter(|s| !s.status.is_final() && s.server_id.as_deref() == Some(server_id))
            .cloned()
            .collect())
    }

    async fn step_thread_executions(
        &self,
        execution_id: u64,
    ) -> StoreResult<Vec<StepThreadExecution>> {
        let state = self.state.read().await;
        state.instance_id_of(execution_id)?;
        Ok(state
            .step_threads
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn completed_partitions(
        &self,
        instance_id: u64,
        step_name: &str,
    ) -> StoreResult<BTreeSet<u32>> {
        let state = self.state.read().await;
        Ok(state
            .step_threads
            .values()
            .filter(|s| {
                s.instance_id == instance_id
                    && s.step_name == step_name
                    && s.status == BatchStatus::Completed
            })
            .filter_map(|s| s.kind.partition_number())
            .collect())
    }

    async fn last_top_level_status(
        &self,
        instance_id: u64,
        step_name: &str,
    ) -> StoreResult<Option<BatchStatus>> {
        let state = self.state.read().await;
        Ok(state
            .step_threads
            .values()
            .rev()
            .find(|s| {
                s.instance_id == instance_id
                    && s.step_name == step_name
                    && s.kind == StepThreadKind::TopLevel
            })
            .map(|s| s.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_instance() -> (InMemoryExecutionStore, JobInstance) {
        let store = InMemoryExecutionStore::new();
        let instance = store
            .create_job_instance("payroll", "alice", "payroll.xml")
            .await
            .unwrap();
        (store, instance)
    }

    #[tokio::test]
    async fn execution_numbers_are_gapless() {
        let (store, instance) = store_with_instance().await;
        let id = instance.instance_id;

        for expected in 0..4u32 {
            let execution = store.create_job_execution(id, Properties::new()).await.unwrap();
            assert_eq!(execution.execution_number, expected);
            store
                .update_execution_on_started(execution.execution_id, "node-1", "http://n1")
                .await
                .unwrap();
            store
                .update_execution_on_end(execution.execution_id, BatchStatus::Failed, "FAILED")
                .await
                .unwrap();
            store.update_instance_on_restart(id).await.unwrap();
        }

        let numbers: Vec<u32> = store
            .executions_for_instance(id)
            .await
            .unwrap()
            .iter()
            .rev()
            .map(|e| e.execution_number)
            .collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn execution_ids_increase_across_instances() {
        let store = InMemoryExecutionStore::new();
        let a = store.create_job_instance("a", "u", "a.xml").await.unwrap();
        let b = store.create_job_instance("b", "u", "b.xml").await.unwrap();
        let e1 = store.create_job_execution(a.instance_id, Properties::new()).await.unwrap();
        let e2 = store.create_job_execution(b.instance_id, Properties::new()).await.unwrap();
        assert!(e2.execution_id > e1.execution_id);
        assert_eq!(
            store.most_recent_execution_id(a.instance_id).await.unwrap(),
            Some(e1.execution_id)
        );
    }

    #[tokio::test]
    async fn started_dispatches_instance_and_records_server() {
        let (store, instance) = store_with_instance().await;
        let execution = store
            .create_job_execution(instance.instance_id, Properties::new())
            .await
            .unwrap();
        let started = store
            .update_execution_on_started(execution.execution_id, "node-2", "http://node-2")
            .await
            .unwrap();
        assert_eq!(started.status, BatchStatus::Started);
        assert_eq!(started.server_id.as_deref(), Some("node-2"));
        let instance = store.get_job_instance(instance.instance_id).await.unwrap();
        assert_eq!(instance.state, InstanceState::Dispatched);
    }

    #[tokio::test]
    async fn end_mirrors_final_status_on_instance() {
        let (store, instance) = store_with_instance().await;
        let execution = store
            .create_job_execution(instance.instance_id, Properties::new())
            .await
            .unwrap();
        store
            .update_execution_on_started(execution.execution_id, "node-1", "http://n1")
            .await
            .unwrap();
        let ended = store
            .update_execution_on_end(execution.execution_id, BatchStatus::Completed, "DONE")
            .await
            .unwrap();
        assert_eq!(ended.exit_status.as_deref(), Some("DONE"));
        assert!(ended.ended_at.is_some());
        let instance = store.get_job_instance(instance.instance_id).await.unwrap();
        assert_eq!(instance.state, InstanceState::Completed);
        assert_eq!(instance.batch_status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected_not_applied() {
        let (store, instance) = store_with_instance().await;
        let id = instance.instance_id;
        store
            .update_instance_state(id, InstanceState::Abandoned)
            .await
            .unwrap();
        let err = store
            .update_instance_state(id, InstanceState::Submitted)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            store.get_job_instance(id).await.unwrap().state,
            InstanceState::Abandoned
        );
        assert!(store.create_job_execution(id, Properties::new()).await.is_err());
    }

    #[tokio::test]
    async fn restart_requires_failed_or_stopped() {
        let (store, instance) = store_with_instance().await;
        let err = store
            .update_instance_on_restart(instance.instance_id)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::NotRestartable {
                instance_id: instance.instance_id,
                state: InstanceState::Submitted
            }
        );
    }

    #[tokio::test]
    async fn consume_only_once_from_queued() {
        let (store, instance) = store_with_instance().await;
        let id = instance.instance_id;
        store.update_instance_on_queued(id).await.unwrap();
        let consumed = store.update_instance_on_consumed(id).await.unwrap();
        assert_eq!(consumed.state, InstanceState::DispatchConsumed);
        let err = store.update_instance_on_consumed(id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotQueued { .. }));
    }

    #[tokio::test]
    async fn stop_before_dispatch_only_while_unassigned() {
        let (store, instance) = store_with_instance().await;
        let execution = store
            .create_job_execution(instance.instance_id, Properties::new())
            .await
            .unwrap();
        store.update_instance_on_queued(instance.instance_id).await.unwrap();
        let stopped = store
            .update_execution_on_stop_before_dispatch(execution.execution_id)
            .await
            .unwrap();
        assert_eq!(stopped.status, BatchStatus::Stopped);
        let instance = store.get_job_instance(instance.instance_id).await.unwrap();
        assert_eq!(instance.state, InstanceState::Stopped);
        // The queued request is now unconsumable.
        assert!(matches!(
            store.update_instance_on_consumed(instance.instance_id).await,
            Err(StoreError::NotQueued { .. })
        ));
    }

    #[tokio::test]
    async fn stop_before_dispatch_rejects_assigned_execution() {
        let (store, instance) = store_with_instance().await;
        let execution = store
            .create_job_execution(instance.instance_id, Properties::new())
            .await
            .unwrap();
        store
            .update_execution_on_started(execution.execution_id, "node-3", "http://n3")
            .await
            .unwrap();
        let err = store
            .update_execution_on_stop_before_dispatch(execution.execution_id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyAssigned { server_id, .. } if server_id == "node-3"));
    }

    #[tokio::test]
    async fn partition_records_are_idempotent() {
        let (store, instance) = store_with_instance().await;
        let execution = store
            .create_job_execution(instance.instance_id, Properties::new())
            .await
            .unwrap();
        let first = store
            .create_partition_step_execution(execution.execution_id, "load", 1, "node-1")
            .await
            .unwrap();
        let second = store
            .create_partition_step_execution(execution.execution_id, "load", 1, "node-2")
            .await
            .unwrap();
        assert!(matches!(first, StepThreadCreation::Created(_)));
        assert!(matches!(second, StepThreadCreation::Existing(_)));
        assert_eq!(
            first.record().step_execution_id,
            second.record().step_execution_id
        );
    }

    #[tokio::test]
    async fn completed_partitions_span_executions() {
        let (store, instance) = store_with_instance().await;
        let id = instance.instance_id;
        let first = store.create_job_execution(id, Properties::new()).await.unwrap();
        for (partition, status) in [(0, BatchStatus::Completed), (1, BatchStatus::Failed)] {
            let record = store
                .create_partition_step_execution(first.execution_id, "load", partition, "n")
                .await
                .unwrap();
            store
                .update_step_thread_status(record.record().step_execution_id, status, None)
                .await
                .unwrap();
        }
        let completed = store.completed_partitions(id, "load").await.unwrap();
        assert_eq!(completed.into_iter().collect::<Vec<_>>(), vec![0]);
        assert!(store
            .completed_partitions(id, "other")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn last_top_level_status_uses_latest_record() {
        let (store, instance) = store_with_instance().await;
        let id = instance.instance_id;
        let execution = store.create_job_execution(id, Properties::new()).await.unwrap();
        assert_eq!(store.last_top_level_status(id, "extract").await.unwrap(), None);
        let record = store
            .create_top_level_step_execution(execution.execution_id, "extract", "n")
            .await
            .unwrap();
        store
            .update_step_thread_status(record.step_execution_id, BatchStatus::Started, None)
            .await
            .unwrap();
        store
            .update_step_thread_status(record.step_execution_id, BatchStatus::Completed, Some("OK"))
            .await
            .unwrap();
        assert_eq!(
            store.last_top_level_status(id, "extract").await.unwrap(),
            Some(BatchStatus::Completed)
        );
    }
    #[tokio::test]
    async fn running_on_lists_only_non_final_records_of_that_server() {
        let (store, instance) = store_with_instance().await;
        let id = instance.instance_id;
        let execution = store.create_job_execution(id, Properties::new()).await.unwrap();
        store
            .update_execution_on_started(execution.execution_id, "node-1", "http://n1")
            .await
            .unwrap();
        let top = store
            .create_top_level_step_execution(execution.execution_id, "load", "node-1")
            .await
            .unwrap();
        let ours = store
            .create_partition_step_execution(execution.execution_id, "load", 0, "node-1")
            .await
            .unwrap();
        let theirs = store
            .create_partition_step_execution(execution.execution_id, "load", 1, "node-2")
            .await
            .unwrap();
        store
            .update_step_thread_status(top.step_execution_id, BatchStatus::Started, None)
            .await
            .unwrap();

        let executions = store.job_executions_running_on("node-1").await.unwrap();
        assert_eq!(executions.len(), 1);
        assert!(store.job_executions_running_on("node-2").await.unwrap().is_empty());

        let ids: Vec<u64> = store
            .step_threads_running_on("node-1")
            .await
            .unwrap()
            .iter()
            .map(|s| s.step_execution_id)
            .collect();
        assert_eq!(ids, vec![top.step_execution_id, ours.record().step_execution_id]);

        store
            .update_step_thread_status(theirs.record().step_execution_id, BatchStatus::Failed, None)
            .await
            .unwrap();
        assert!(store.step_threads_running_on("node-2").await.unwrap().is_empty());

        store
            .update_execution_on_end(execution.execution_id, BatchStatus::Failed, "FAILED")
            .await
            .unwrap();
        assert!(store.job_executions_running_on("node-1").await.unwrap().is_empty());
    }
}
