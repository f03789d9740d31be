
use std::time::Duration;

use batch_dispatch::config::DispatchMode;
use batch_dispatch::dispatcher::DispatchListener;
use batch_dispatch::error::DispatchError;
use batch_dispatch::model::{BatchStatus, InstanceState, Properties, StepThreadKind};
use batch_dispatch::store::ExecutionStore;
use test_harness::{ScriptStep, ScriptedRunner, TestCluster};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

fn waits_for_stop() -> std::sync::Arc<ScriptedRunner> {
    ScriptedRunner::new(vec![
        ScriptStep::Plain("prepare"),
        ScriptStep::UntilStopped("wait"),
    ])
}

/// A locally dispatched job runs every step and partition on the submitting node.
#[tokio::test]
async fn test_local_dispatch_runs_to_completion() {
    let runner = ScriptedRunner::partitioned(3);
    let cluster = TestCluster::new(1, runner.clone(), |c| c.with_mode(DispatchMode::Local)).await;

    let submitted = cluster.submit(0, Properties::new()).await.unwrap();
    assert_eq!(submitted.execution_number, 0);

    let execution = cluster
        .wait_for_final(submitted.execution_id, TIMEOUT)
        .await;
    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(execution.exit_status.as_deref(), Some("COMPLETED"));
    assert_eq!(execution.server_id.as_deref(), Some("node-1"));
    assert_eq!(
        execution.rest_url.as_deref(),
        Some("http://127.0.0.1:19080")
    );

    let instance = cluster
        .store
        .get_job_instance(execution.instance_id)
        .await
        .unwrap();
    assert_eq!(instance.state, InstanceState::Completed);

    let steps = cluster
        .store
        .step_thread_executions(execution.execution_id)
        .await
        .unwrap();
    let top_level: Vec<&str> = steps
        .iter()
        .filter(|s| s.kind == StepThreadKind::TopLevel)
        .map(|s| s.step_name.as_str())
        .collect();
    assert_eq!(top_level, vec!["prepare", "load", "report"]);
    assert_eq!(steps.iter().filter(|s| s.is_partition()).count(), 3);
    assert!(steps.iter().all(|s| s.status == BatchStatus::Completed));
    assert_eq!(runner.collected().len(), 3);
}

/// Stopping a job running on this node is cooperative and ends it STOPPED.
#[tokio::test]
async fn test_stop_local_execution() {
    let cluster = TestCluster::new(1, waits_for_stop(), |c| c.with_mode(DispatchMode::Local)).await;

    let submitted = cluster.submit(0, Properties::new()).await.unwrap();
    cluster
        .wait_until_running_on(0, submitted.execution_id, TIMEOUT)
        .await;

    cluster
        .node(0)
        .operator
        .stop(submitted.execution_id)
        .await
        .unwrap();

    let execution = cluster
        .wait_for_final(submitted.execution_id, TIMEOUT)
        .await;
    assert_eq!(execution.status, BatchStatus::Stopped);
    let instance = cluster
        .store
        .get_job_instance(execution.instance_id)
        .await
        .unwrap();
    assert_eq!(instance.state, InstanceState::Stopped);
    assert!(!cluster.node(0).internal.is_running(submitted.execution_id).await);
}

#[tokio::test]
async fn test_stop_unknown_execution_is_not_found() {
    let cluster = TestCluster::new(1, waits_for_stop(), |c| c.with_mode(DispatchMode::Local)).await;

    let result = cluster.node(0).operator.stop(999).await;
    assert!(
        matches!(result, Err(DispatchError::NotFound(999))),
        "unexpected result: {:?}",
        result
    );
}

#[tokio::test]
async fn test_stop_finished_execution_is_not_running() {
    let runner = ScriptedRunner::new(vec![ScriptStep::Plain("only")]);
    let cluster = TestCluster::new(1, runner, |c| c.with_mode(DispatchMode::Local)).await;

    let submitted = cluster.submit(0, Properties::new()).await.unwrap();
    cluster
        .wait_for_final(submitted.execution_id, TIMEOUT)
        .await;

    let result = cluster.node(0).operator.stop(submitted.execution_id).await;
    match result {
        Err(DispatchError::NotRunning {
            execution_id,
            status,
        }) => {
            assert_eq!(execution_id, submitted.execution_id);
            assert_eq!(status, BatchStatus::Completed);
        }
        other => panic!("expected NotRunning, got {:?}", other),
    }
}

/// Stop against an execution owned by another node returns NotLocal and
/// leaves every record and the owner's in-flight state untouched.
#[tokio::test]
async fn test_stop_on_other_node_is_not_local() {
    let cluster = TestCluster::new(2, waits_for_stop(), |c| c.with_mode(DispatchMode::Local)).await;

    let submitted = cluster.submit(0, Properties::new()).await.unwrap();
    cluster
        .wait_until_running_on(0, submitted.execution_id, TIMEOUT)
        .await;
    let before = cluster.execution(submitted.execution_id).await;

    let result = cluster.node(1).operator.stop(submitted.execution_id).await;
    match result {
        Err(DispatchError::NotLocal {
            execution_id,
            server_id,
            rest_url,
        }) => {
            assert_eq!(execution_id, submitted.execution_id);
            assert_eq!(server_id, "node-1");
            assert_eq!(rest_url.as_deref(), Some("http://127.0.0.1:19080"));
        }
        other => panic!("expected NotLocal, got {:?}", other),
    }

    let after = cluster.execution(submitted.execution_id).await;
    assert_eq!(after, before, "NotLocal must not mutate the execution");
    assert_eq!(after.status, BatchStatus::Started);
    assert!(cluster.node(0).internal.is_running(submitted.execution_id).await);
    assert!(cluster.node(1).internal.running_executions().await.is_empty());

    // The owner can still stop it.
    cluster
        .node(0)
        .operator
        .stop(submitted.execution_id)
        .await
        .unwrap();
    let execution = cluster
        .wait_for_final(submitted.execution_id, TIMEOUT)
        .await;
    assert_eq!(execution.status, BatchStatus::Stopped);
}

/// A queued request nobody has consumed is stopped in the store, and the
/// listener that later receives it skips it.
#[tokio::test]
async fn test_stop_before_dispatch() {
    let runner = ScriptedRunner::new(vec![ScriptStep::Plain("only")]);
    let cluster = TestCluster::new(1, runner.clone(), |c| {
        c.with_mode(DispatchMode::Queued).without_listener()
    })
    .await;
    let job_destination = cluster.node(0).config.dispatch.job_destination.clone();

    let submitted = cluster.submit(0, Properties::new()).await.unwrap();
    assert_eq!(submitted.status, BatchStatus::Starting);
    assert_eq!(cluster.transport.backlog_len(&job_destination).await, 1);
    let instance = cluster
        .store
        .get_job_instance(submitted.instance_id)
        .await
        .unwrap();
    assert_eq!(instance.state, InstanceState::QueuedForDispatch);

    cluster
        .node(0)
        .operator
        .stop(submitted.execution_id)
        .await
        .unwrap();

    let execution = cluster.execution(submitted.execution_id).await;
    assert_eq!(execution.status, BatchStatus::Stopped);
    assert!(execution.server_id.is_none());
    let instance = cluster
        .store
        .get_job_instance(submitted.instance_id)
        .await
        .unwrap();
    assert_eq!(instance.state, InstanceState::Stopped);

    // A listener that comes up afterwards drains the backlog and skips it.
    let shutdown = CancellationToken::new();
    let listener = DispatchListener::new(
        cluster.node(0).internal.clone(),
        cluster.transport.clone(),
        cluster.node(0).config.dispatch.clone(),
    );
    let handle = listener.spawn(shutdown.clone()).await.unwrap();
    assert_eq!(cluster.transport.backlog_len(&job_destination).await, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(runner.executed_steps().is_empty());
    assert_eq!(
        cluster.execution(submitted.execution_id).await.status,
        BatchStatus::Stopped
    );

    shutdown.cancel();
    handle.await.unwrap();
}

/// The queued dispatcher refuses to start without a transport.
#[tokio::test]
async fn test_queued_mode_requires_transport() {
    use batch_dispatch::config::NodeConfig;
    use batch_dispatch::node::Node;
    use batch_dispatch::store::InMemoryExecutionStore;
    use std::sync::Arc;

    let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
    let result = Node::new(
        NodeConfig::new("node-1", "http://127.0.0.1:19080").with_mode(DispatchMode::Queued),
        store,
        None,
        ScriptedRunner::partitioned(1),
        test_harness::test_definitions(),
    );
    assert!(matches!(result, Err(DispatchError::Internal(_))));
}

/// Store that holds `update_execution_on_started` open after it has been
/// applied, until the test lets it return.
struct HeldStartStore {
    inner: batch_dispatch::store::InMemoryExecutionStore,
    applied: tokio::sync::Notify,
    release: tokio::sync::Notify,
}

mod held_start {
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use batch_dispatch::model::{
        BatchStatus, InstanceState, JobExecution, JobInstance, Properties, StepThreadExecution,
    };
    use batch_dispatch::store::{ExecutionStore, StepThreadCreation, StoreResult};

    use super::HeldStartStore;

    #[async_trait]
    impl ExecutionStore for HeldStartStore {
        async fn create_job_instance(
            &self,
            job_name: &str,
            submitter: &str,
            definition_ref: &str,
        ) -> StoreResult<JobInstance> {
            self.inner
                .create_job_instance(job_name, submitter, definition_ref)
                .await
        }

        async fn create_job_execution(
            &self,
            instance_id: u64,
            parameters: Properties,
        ) -> StoreResult<JobExecution> {
            self.inner.create_job_execution(instance_id, parameters).await
        }

        async fn get_job_instance(&self, instance_id: u64) -> StoreResult<JobInstance> {
            self.inner.get_job_instance(instance_id).await
        }

        async fn get_job_execution(&self, execution_id: u64) -> StoreResult<JobExecution> {
            self.inner.get_job_execution(execution_id).await
        }

        async fn get_instance_for_execution(&self, execution_id: u64) -> StoreResult<JobInstance> {
            self.inner.get_instance_for_execution(execution_id).await
        }

        async fn list_job_instances(&self) -> StoreResult<Vec<JobInstance>> {
            self.inner.list_job_instances().await
        }

        async fn executions_for_instance(&self, instance_id: u64) -> StoreResult<Vec<JobExecution>> {
            self.inner.executions_for_instance(instance_id).await
        }

        async fn most_recent_execution_id(&self, instance_id: u64) -> StoreResult<Option<u64>> {
            self.inner.most_recent_execution_id(instance_id).await
        }

        async fn update_instance_state(
            &self,
            instance_id: u64,
            state: InstanceState,
        ) -> StoreResult<JobInstance> {
            self.inner.update_instance_state(instance_id, state).await
        }

        async fn update_instance_on_restart(&self, instance_id: u64) -> StoreResult<JobInstance> {
            self.inner.update_instance_on_restart(instance_id).await
        }

        async fn update_instance_on_queued(&self, instance_id: u64) -> StoreResult<JobInstance> {
            self.inner.update_instance_on_queued(instance_id).await
        }

        async fn update_instance_on_consumed(&self, instance_id: u64) -> StoreResult<JobInstance> {
            self.inner.update_instance_on_consumed(instance_id).await
        }

        async fn update_execution_on_started(
            &self,
            execution_id: u64,
            server_id: &str,
            rest_url: &str,
        ) -> StoreResult<JobExecution> {
            let result = self
                .inner
                .update_execution_on_started(execution_id, server_id, rest_url)
                .await;
            self.applied.notify_one();
            self.release.notified().await;
            result
        }

        async fn update_execution_status(
            &self,
            execution_id: u64,
            status: BatchStatus,
        ) -> StoreResult<JobExecution> {
            self.inner.update_execution_status(execution_id, status).await
        }

        async fn update_execution_on_end(
            &self,
            execution_id: u64,
            status: BatchStatus,
            exit_status: &str,
        ) -> StoreResult<JobExecution> {
            self.inner
                .update_execution_on_end(execution_id, status, exit_status)
                .await
        }

        async fn update_execution_on_stop_before_dispatch(
            &self,
            execution_id: u64,
        ) -> StoreResult<JobExecution> {
            self.inner
                .update_execution_on_stop_before_dispatch(execution_id)
                .await
        }

        async fn create_top_level_step_execution(
            &self,
            execution_id: u64,
            step_name: &str,
            server_id: &str,
        ) -> StoreResult<StepThreadExecution> {
            self.inner
                .create_top_level_step_execution(execution_id, step_name, server_id)
                .await
        }

        async fn create_partition_step_execution(
            &self,
            execution_id: u64,
            step_name: &str,
            partition: u32,
            server_id: &str,
        ) -> StoreResult<StepThreadCreation> {
            self.inner
                .create_partition_step_execution(execution_id, step_name, partition, server_id)
                .await
        }

        async fn update_step_thread_status(
            &self,
            step_execution_id: u64,
            status: BatchStatus,
            exit_status: Option<&str>,
        ) -> StoreResult<StepThreadExecution> {
            self.inner
                .update_step_thread_status(step_execution_id, status, exit_status)
                .await
        }

        async fn job_executions_running_on(&self, server_id: &str) -> StoreResult<Vec<JobExecution>> {
            self.inner.job_executions_running_on(server_id).await
        }

        async fn step_threads_running_on(
            &self,
            server_id: &str,
        ) -> StoreResult<Vec<StepThreadExecution>> {
            self.inner.step_threads_running_on(server_id).await
        }

        async fn step_thread_executions(
            &self,
            execution_id: u64,
        ) -> StoreResult<Vec<StepThreadExecution>> {
            self.inner.step_thread_executions(execution_id).await
        }

        async fn completed_partitions(
            &self,
            instance_id: u64,
            step_name: &str,
        ) -> StoreResult<BTreeSet<u32>> {
            self.inner.completed_partitions(instance_id, step_name).await
        }

        async fn last_top_level_status(
            &self,
            instance_id: u64,
            step_name: &str,
        ) -> StoreResult<Option<BatchStatus>> {
            self.inner.last_top_level_status(instance_id, step_name).await
        }
    }
}

/// A stop that arrives as soon as the record names this server already
/// reaches the job's token.
#[tokio::test]
async fn test_stop_right_after_start_is_recorded_reaches_job() {
    use std::sync::Arc;

    let held = Arc::new(HeldStartStore {
        inner: batch_dispatch::store::InMemoryExecutionStore::new(),
        applied: tokio::sync::Notify::new(),
        release: tokio::sync::Notify::new(),
    });
    let store: Arc<dyn ExecutionStore> = held.clone();
    let cluster = TestCluster::with_store(store, 1, waits_for_stop(), |c| {
        c.with_mode(DispatchMode::Local)
    })
    .await;

    let operator = cluster.node(0).operator.clone();
    let submission = tokio::spawn(async move {
        operator
            .submit(
                test_harness::JOB_NAME,
                "alice",
                test_harness::DEFINITION,
                Properties::new(),
            )
            .await
    });
    held.applied.notified().await;

    let running = cluster
        .store
        .job_executions_running_on("node-1")
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    let execution_id = running[0].execution_id;
    assert_eq!(running[0].status, BatchStatus::Started);

    cluster.node(0).internal.stop(execution_id).await.unwrap();
    held.release.notify_one();
    submission.await.unwrap().unwrap();

    let execution = cluster.wait_for_final(execution_id, TIMEOUT).await;
    assert_eq!(execution.status, BatchStatus::Stopped);
    assert!(!cluster.node(0).internal.is_running(execution_id).await);
}
