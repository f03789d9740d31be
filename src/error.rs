use thiserror::Error;

use crate::model::{BatchStatus, InstanceState};

/// Errors raised by the execution-record store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("No job instance found for id {0}")]
    NoSuchInstance(u64),

    #[error("No job execution found for id {0}")]
    NoSuchExecution(u64),

    #[error("No step execution found for id {0}")]
    NoSuchStepExecution(u64),

    #[error("Illegal state transition for job instance {instance_id}: {from} -> {to}")]
    IllegalTransition {
        instance_id: u64,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("Illegal status transition for record {record_id}: {from} -> {to}")]
    IllegalStatusTransition {
        record_id: u64,
        from: BatchStatus,
        to: BatchStatus,
    },

    #[error("Job instance {instance_id} is not queued for dispatch (state {state})")]
    NotQueued {
        instance_id: u64,
        state: InstanceState,
    },

    #[error("Job instance {instance_id} cannot be restarted because it is still in a non-final state ({state})")]
    NotRestartable {
        instance_id: u64,
        state: InstanceState,
    },

    #[error("Job execution {execution_id} is already assigned to server {server_id}")]
    AlreadyAssigned {
        execution_id: u64,
        server_id: String,
    },

    #[error("Conflicting concurrent update to {record} {id}")]
    Conflict { record: &'static str, id: u64 },

    #[error("Corrupt execution record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Errors that mean the state machine or the storage layer is broken,
    /// rather than a normal operational condition.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::IllegalTransition { .. }
                | StoreError::IllegalStatusTransition { .. }
                | StoreError::Corrupt(_)
        )
    }
}

/// Errors raised by the message transport or the wire codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),
}

/// One variant per restart rule, each naming what tripped it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RestartError {
    #[error("Job instance {instance_id} ({job_name}) is not restartable")]
    NotRestartable { instance_id: u64, job_name: String },

    #[error(
        "Job execution {execution_id} is not the most recent execution of job instance {instance_id} (most recent is {most_recent})"
    )]
    NotMostRecent {
        instance_id: u64,
        execution_id: u64,
        most_recent: u64,
    },

    #[error("Job instance {instance_id} is already complete (execution {execution_id})")]
    AlreadyComplete { instance_id: u64, execution_id: u64 },

    #[error(
        "Job instance {instance_id} is in an illegal state for restart: execution {execution_id} was abandoned"
    )]
    Abandoned { instance_id: u64, execution_id: u64 },

    #[error(
        "Job execution {execution_id} of job instance {instance_id} cannot be restarted from status {status}"
    )]
    NotTerminal {
        instance_id: u64,
        execution_id: u64,
        status: BatchStatus,
    },

    #[error("Job instance {instance_id} cannot be restarted from instance state {state}")]
    InstanceNotRestartable {
        instance_id: u64,
        state: InstanceState,
    },

    #[error(
        "Job instance {instance_id} cannot be restarted: step '{step_name}'{} of execution {execution_id} is still in a non-final state ({status})",
        partition_suffix(.partition)
    )]
    NonFinalStepThread {
        instance_id: u64,
        execution_id: u64,
        step_name: String,
        partition: Option<u32>,
        status: BatchStatus,
    },
}

fn partition_suffix(partition: &Option<u32>) -> String {
    match partition {
        Some(number) => format!(" partition {}", number),
        None => String::new(),
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Job execution not found: {0}")]
    NotFound(u64),

    #[error("Job execution {execution_id} is not running (status {status})")]
    NotRunning {
        execution_id: u64,
        status: BatchStatus,
    },

    #[error("Job execution {execution_id} is running on server {server_id}, not on this node")]
    NotLocal {
        execution_id: u64,
        server_id: String,
        rest_url: Option<String>,
    },

    #[error("The {dispatcher} dispatcher does not support {operation}")]
    Unsupported {
        dispatcher: &'static str,
        operation: &'static str,
    },

    #[error("Job execution {execution_id} has not finished (status {status})")]
    StillRunning {
        execution_id: u64,
        status: BatchStatus,
    },

    #[error("Partition reply queue is closed")]
    QueueClosed,

    #[error("No job definition registered as '{0}'")]
    UnknownDefinition(String),

    #[error("Invalid job definition '{definition_ref}': {reason}")]
    InvalidDefinition {
        definition_ref: String,
        reason: String,
    },

    #[error("Could not route job execution {execution_id}: {source}")]
    Routing {
        execution_id: u64,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Restart(#[from] RestartError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
