
use std::sync::Arc;
use std::time::Duration;

use batch_dispatch::config::DispatchMode;
use batch_dispatch::coordinator::{PartitionOutcome, PARTITIONS_INCOMPLETE};
use batch_dispatch::error::{DispatchError, RestartError, Result};
use batch_dispatch::model::{BatchStatus, InstanceState, JobExecution, JobInstance, Properties};
use batch_dispatch::restart::RestartValidator;
use batch_dispatch::store::{ExecutionStore, InMemoryExecutionStore, StepThreadCreation};
use test_harness::{
    params, test_definitions, PartitionBehavior, ScriptStep, ScriptedRunner, TestCluster,
    DEFINITION, JOB_NAME, NON_RESTARTABLE_DEFINITION,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn restart_error(result: Result<()>) -> RestartError {
    match result {
        Err(DispatchError::Restart(e)) => e,
        other => panic!("expected a restart rejection, got {:?}", other),
    }
}

struct Fixture {
    store: Arc<dyn ExecutionStore>,
    validator: RestartValidator,
}

impl Fixture {
    fn new() -> Self {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let validator = RestartValidator::new(store.clone(), test_definitions());
        Self { store, validator }
    }

    async fn instance(&self, definition_ref: &str) -> JobInstance {
        self.store
            .create_job_instance(JOB_NAME, "alice", definition_ref)
            .await
            .unwrap()
    }

    async fn execution(&self, instance: &JobInstance) -> JobExecution {
        self.store
            .create_job_execution(instance.instance_id, Properties::new())
            .await
            .unwrap()
    }

    async fn partition(&self, execution: &JobExecution, step: &str, partition: u32) -> u64 {
        match self
            .store
            .create_partition_step_execution(execution.execution_id, step, partition, "node-1")
            .await
            .unwrap()
        {
            StepThreadCreation::Created(record) => record.step_execution_id,
            StepThreadCreation::Existing(_) => panic!("partition record already existed"),
        }
    }

    async fn set_step(&self, step_execution_id: u64, status: BatchStatus) {
        self.store
            .update_step_thread_status(step_execution_id, status, Some(&status.to_string()))
            .await
            .unwrap();
    }

    async fn end(&self, execution: &JobExecution, status: BatchStatus) {
        self.store
            .update_execution_on_end(execution.execution_id, status, &status.to_string())
            .await
            .unwrap();
    }
}

/// Scenario: instance COMPLETED, restart requested.
#[tokio::test]
async fn test_restart_of_completed_instance_is_already_complete() {
    let f = Fixture::new();
    let instance = f.instance(DEFINITION).await;
    let execution = f.execution(&instance).await;
    f.store
        .update_execution_on_started(execution.execution_id, "node-1", "http://node-1")
        .await
        .unwrap();
    f.end(&execution, BatchStatus::Completed).await;

    let err = restart_error(f.validator.validate(execution.execution_id, &Properties::new()).await);
    assert_eq!(
        err,
        RestartError::AlreadyComplete {
            instance_id: instance.instance_id,
            execution_id: execution.execution_id,
        }
    );
    assert!(err.to_string().contains("already complete"));
}

/// Scenario: instance FAILED, previous execution still STARTING, every
/// step thread FAILED.
#[tokio::test]
async fn test_restart_accepted_from_starting_execution() {
    let f = Fixture::new();
    let instance = f.instance(DEFINITION).await;
    let execution = f.execution(&instance).await;

    let top = f
        .store
        .create_top_level_step_execution(execution.execution_id, "load", "node-1")
        .await
        .unwrap();
    f.set_step(top.step_execution_id, BatchStatus::Failed).await;
    for partition in 0..2 {
        let id = f.partition(&execution, "load", partition).await;
        f.set_step(id, BatchStatus::Failed).await;
    }
    f.store
        .update_instance_state(instance.instance_id, InstanceState::Failed)
        .await
        .unwrap();

    assert_eq!(
        f.store
            .get_job_execution(execution.execution_id)
            .await
            .unwrap()
            .status,
        BatchStatus::Starting
    );
    f.validator
        .validate(execution.execution_id, &Properties::new())
        .await
        .unwrap();
}

/// Scenario: instance FAILED with one partition step thread still STARTING.
#[tokio::test]
async fn test_restart_rejected_while_partition_not_final() {
    let f = Fixture::new();
    let instance = f.instance(DEFINITION).await;
    let execution = f.execution(&instance).await;

    let done = f.partition(&execution, "load", 0).await;
    f.set_step(done, BatchStatus::Started).await;
    f.set_step(done, BatchStatus::Completed).await;
    let _still_starting = f.partition(&execution, "load", 1).await;
    f.end(&execution, BatchStatus::Failed).await;

    let err = restart_error(f.validator.validate(execution.execution_id, &Properties::new()).await);
    match &err {
        RestartError::NonFinalStepThread {
            instance_id,
            execution_id,
            step_name,
            partition,
            status,
        } => {
            assert_eq!(*instance_id, instance.instance_id);
            assert_eq!(*execution_id, execution.execution_id);
            assert_eq!(step_name, "load");
            assert_eq!(*partition, Some(1));
            assert_eq!(*status, BatchStatus::Starting);
        }
        other => panic!("expected NonFinalStepThread, got {:?}", other),
    }
    let message = err.to_string();
    assert!(message.contains("non-final state"), "{}", message);
    assert!(message.contains("partition 1"), "{}", message);
}

/// Scenario: restart against an older execution while a newer one exists.
#[tokio::test]
async fn test_restart_of_stale_execution_is_not_most_recent() {
    let f = Fixture::new();
    let instance = f.instance(DEFINITION).await;
    let first = f.execution(&instance).await;
    f.end(&first, BatchStatus::Failed).await;
    f.store
        .update_instance_on_restart(instance.instance_id)
        .await
        .unwrap();
    let second = f.execution(&instance).await;
    f.end(&second, BatchStatus::Failed).await;
    assert!(second.execution_id > first.execution_id);

    let err = restart_error(f.validator.validate(first.execution_id, &Properties::new()).await);
    assert_eq!(
        err,
        RestartError::NotMostRecent {
            instance_id: instance.instance_id,
            execution_id: first.execution_id,
            most_recent: second.execution_id,
        }
    );
    assert!(err.to_string().contains("not the most recent"));

    f.validator
        .validate(second.execution_id, &Properties::new())
        .await
        .unwrap();
}

/// The same unchanged state yields the same decision and the same error.
#[tokio::test]
async fn test_validation_is_idempotent() {
    let f = Fixture::new();
    let instance = f.instance(DEFINITION).await;
    let execution = f.execution(&instance).await;
    let _running = f.partition(&execution, "load", 3).await;
    f.end(&execution, BatchStatus::Stopped).await;

    let first = restart_error(f.validator.validate(execution.execution_id, &Properties::new()).await);
    let second = restart_error(f.validator.validate(execution.execution_id, &Properties::new()).await);
    assert_eq!(first, second);
}

/// The restartable flag is checked first, with restart parameters substituted.
#[tokio::test]
async fn test_definition_restartable_flag() {
    let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
    let definitions = Arc::new(
        batch_dispatch::resolver::StaticDefinitions::new()
            .with_definition(NON_RESTARTABLE_DEFINITION, batch_dispatch::resolver::JobDefinition::restartable("false"))
            .with_definition(
                "param.xml",
                batch_dispatch::resolver::JobDefinition::restartable("#{jobParameters['allow']}"),
            ),
    );
    let validator = RestartValidator::new(store.clone(), definitions);

    let fixed = store
        .create_job_instance(JOB_NAME, "alice", NON_RESTARTABLE_DEFINITION)
        .await
        .unwrap();
    let fixed_execution = store
        .create_job_execution(fixed.instance_id, Properties::new())
        .await
        .unwrap();
    store
        .update_execution_on_started(fixed_execution.execution_id, "node-1", "http://node-1")
        .await
        .unwrap();
    store
        .update_execution_on_end(fixed_execution.execution_id, BatchStatus::Completed, "COMPLETED")
        .await
        .unwrap();
    // Rule 1 fires before "already complete".
    let err = restart_error(
        validator
            .validate(fixed_execution.execution_id, &Properties::new())
            .await,
    );
    assert_eq!(
        err,
        RestartError::NotRestartable {
            instance_id: fixed.instance_id,
            job_name: JOB_NAME.to_string(),
        }
    );

    let templated = store
        .create_job_instance(JOB_NAME, "alice", "param.xml")
        .await
        .unwrap();
    let execution = store
        .create_job_execution(templated.instance_id, Properties::new())
        .await
        .unwrap();
    store
        .update_execution_on_end(execution.execution_id, BatchStatus::Failed, "FAILED")
        .await
        .unwrap();
    let err = restart_error(
        validator
            .validate(execution.execution_id, &params(&[("allow", "false")]))
            .await,
    );
    assert!(matches!(err, RestartError::NotRestartable { .. }));
    validator
        .validate(execution.execution_id, &params(&[("allow", "true")]))
        .await
        .unwrap();
}

/// A failed partition is re-run on restart; completed steps and partitions are not.
#[tokio::test]
async fn test_restart_resumes_failed_partitions_only() {
    let runner = ScriptedRunner::partitioned(3);
    runner.set_behavior(1, PartitionBehavior::Fail);
    let cluster = TestCluster::new(1, runner.clone(), |c| c.with_mode(DispatchMode::Local)).await;

    let first = cluster.submit(0, Properties::new()).await.unwrap();
    let first = cluster.wait_for_final(first.execution_id, TIMEOUT).await;
    assert_eq!(first.status, BatchStatus::Failed);
    assert_eq!(first.exit_status.as_deref(), Some("FAILED"));
    let instance = cluster
        .store
        .get_job_instance(first.instance_id)
        .await
        .unwrap();
    assert_eq!(instance.state, InstanceState::Failed);

    runner.clear_behaviors();
    let second = cluster
        .node(0)
        .operator
        .restart(first.execution_id, Properties::new())
        .await
        .unwrap();
    assert_eq!(second.execution_number, 1);
    let second = cluster.wait_for_final(second.execution_id, TIMEOUT).await;
    assert_eq!(second.status, BatchStatus::Completed);

    let second_steps: Vec<String> = runner
        .executed_steps()
        .into_iter()
        .filter(|(id, _)| *id == second.execution_id)
        .map(|(_, name)| name)
        .collect();
    assert_eq!(second_steps, vec!["load".to_string(), "report".to_string()]);

    let rerun: Vec<u32> = runner
        .partition_runs()
        .into_iter()
        .filter(|(id, _)| *id == second.execution_id)
        .map(|(_, p)| p)
        .collect();
    assert_eq!(rerun, vec![1]);

    let outcome = runner.outcomes().last().cloned().unwrap();
    assert_eq!(
        outcome.partitions.get(&0),
        Some(&PartitionOutcome::PreviouslyCompleted)
    );
    assert_eq!(
        outcome.partitions.get(&2),
        Some(&PartitionOutcome::PreviouslyCompleted)
    );

    // Completed instances stay completed.
    let result = cluster
        .node(0)
        .operator
        .restart(second.execution_id, Properties::new())
        .await;
    assert!(matches!(
        result,
        Err(DispatchError::Restart(RestartError::AlreadyComplete { .. }))
    ));
}

/// Execution numbers run 0, 1, 2, ... across restarts, on a queued cluster.
#[tokio::test]
async fn test_execution_numbering_is_monotonic() {
    let runner = ScriptedRunner::new(vec![ScriptStep::Fail("always")]);
    let cluster = TestCluster::new(2, runner.clone(), |c| c.with_mode(DispatchMode::Queued)).await;

    let mut execution = cluster.submit(0, Properties::new()).await.unwrap();
    let mut ids = vec![execution.execution_id];
    for _ in 0..3 {
        let finished = cluster
            .wait_for_final(execution.execution_id, TIMEOUT)
            .await;
        assert_eq!(finished.status, BatchStatus::Failed);
        execution = cluster
            .node(1)
            .operator
            .restart(finished.execution_id, Properties::new())
            .await
            .unwrap();
        ids.push(execution.execution_id);
    }
    cluster
        .wait_for_final(execution.execution_id, TIMEOUT)
        .await;

    let history = cluster
        .store
        .executions_for_instance(execution.instance_id)
        .await
        .unwrap();
    let mut numbers: Vec<u32> = history.iter().map(|e| e.execution_number).collect();
    numbers.reverse();
    assert_eq!(numbers, vec![0, 1, 2, 3]);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(
        cluster
            .store
            .most_recent_execution_id(execution.instance_id)
            .await
            .unwrap(),
        Some(execution.execution_id)
    );
}

/// A partition that never reports keeps its record non-final, so restart is
/// refused until it ends.
#[tokio::test(start_paused = true)]
async fn test_restart_refused_while_partition_silently_running() {
    let runner = ScriptedRunner::new(vec![ScriptStep::Partitioned("load", 2)]);
    runner.set_behavior(1, PartitionBehavior::Ignore);
    let cluster = TestCluster::new(1, runner.clone(), |c| c.with_mode(DispatchMode::Local)).await;

    let submitted = cluster.submit(0, Properties::new()).await.unwrap();
    let execution = cluster
        .wait_for_final(submitted.execution_id, Duration::from_secs(60))
        .await;
    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(execution.exit_status.as_deref(), Some(PARTITIONS_INCOMPLETE));

    let result = cluster
        .node(0)
        .operator
        .restart(execution.execution_id, Properties::new())
        .await;
    match result {
        Err(DispatchError::Restart(RestartError::NonFinalStepThread {
            partition, status, ..
        })) => {
            assert_eq!(partition, Some(1));
            assert_eq!(status, BatchStatus::Started);
        }
        other => panic!("expected NonFinalStepThread, got {:?}", other),
    }
    let instance = cluster
        .store
        .get_job_instance(execution.instance_id)
        .await
        .unwrap();
    assert_eq!(instance.state, InstanceState::Failed);
    assert_eq!(instance.number_of_executions, 1);
}
