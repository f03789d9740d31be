//! Startup recovery of work a previous run of this server left in flight.
//!
//! A node that crashed leaves its executions and step threads in `STARTED`
//! or `STOPPING`, which blocks every restart of their instances. Before a
//! node starts taking work it fails everything still recorded against its
//! own server id.

use std::sync::Arc;

use crate::error::Result;
use crate::model::BatchStatus;
use crate::store::{retry_on_conflict, ExecutionStore};

/// Exit status recorded on work failed by startup recovery.
pub const RECOVERED: &str = "RECOVERED_ON_STARTUP";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub executions: Vec<u64>,
    pub step_threads: Vec<u64>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty() && self.step_threads.is_empty()
    }
}

/// Fails every non-final execution and step thread recorded on `server_id`.
///
/// Must run before the node starts any work of its own.
pub async fn recover_in_flight(
    store: &Arc<dyn ExecutionStore>,
    server_id: &str,
    max_conflict_retries: u32,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for record in store.step_threads_running_on(server_id).await? {
        let step_execution_id = record.step_execution_id;
        retry_on_conflict(max_conflict_retries, || {
            store.update_step_thread_status(step_execution_id, BatchStatus::Failed, Some(RECOVERED))
        })
        .await?;
        tracing::warn!(
            execution_id = record.execution_id,
            step_execution_id,
            step = %record.step_name,
            partition = ?record.kind.partition_number(),
            previous = %record.status,
            "Recovered step thread left in flight"
        );
        report.step_threads.push(step_execution_id);
    }

    for execution in store.job_executions_running_on(server_id).await? {
        let execution_id = execution.execution_id;
        retry_on_conflict(max_conflict_retries, || {
            store.update_execution_on_end(execution_id, BatchStatus::Failed, RECOVERED)
        })
        .await?;
        tracing::warn!(
            execution_id,
            instance_id = execution.instance_id,
            previous = %execution.status,
            "Recovered job execution left in flight"
        );
        report.executions.push(execution_id);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceState, Properties};
    use crate::store::InMemoryExecutionStore;

    #[tokio::test]
    async fn fails_only_this_servers_work() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let instance = store.create_job_instance("payroll", "alice", "payroll.xml").await.unwrap();
        let execution = store
            .create_job_execution(instance.instance_id, Properties::new())
            .await
            .unwrap();
        store
            .update_execution_on_started(execution.execution_id, "node-1", "http://n1")
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

        let report = recover_in_flight(&store, "node-1", 3).await.unwrap();
        assert_eq!(report.executions, vec![execution.execution_id]);
        assert_eq!(report.step_threads, vec![ours.record().step_execution_id]);

        let recovered = store.get_job_execution(execution.execution_id).await.unwrap();
        assert_eq!(recovered.status, BatchStatus::Failed);
        assert_eq!(recovered.exit_status.as_deref(), Some(RECOVERED));
        let instance = store.get_job_instance(instance.instance_id).await.unwrap();
        assert_eq!(instance.state, InstanceState::Failed);

        let steps = store.step_thread_executions(execution.execution_id).await.unwrap();
        let other = steps
            .iter()
            .find(|s| s.step_execution_id == theirs.record().step_execution_id)
            .unwrap();
        assert_eq!(other.status, BatchStatus::Starting);

        assert!(recover_in_flight(&store, "node-1", 3).await.unwrap().is_empty());
    }
}
