use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::BatchStatus;

/// Exit status recorded when at least one partition never reported.
pub const PARTITIONS_INCOMPLETE: &str = "PARTITIONS_INCOMPLETE";

/// What the coordinator knows about one partition at the end of collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PartitionOutcome {
    /// Completed in an earlier attempt; not re-run.
    PreviouslyCompleted,
    /// Sent its final status.
    Finished {
        status: BatchStatus,
        exit_status: String,
    },
    /// `start_partition` itself failed, so no reply can arrive.
    DispatchFailed { error: String },
    /// No final status before collection ended.
    Incomplete,
}

/// Folds per-partition outcomes into the step's `(status, exit_status)`.
///
/// Precedence: any failure, then any incomplete partition (also `FAILED`),
/// then any stop, otherwise `COMPLETED`. Incomplete partitions can never
/// yield `COMPLETED`.
pub fn reduce(outcomes: &BTreeMap<u32, PartitionOutcome>) -> (BatchStatus, String) {
    let mut incomplete = false;
    let mut stopped = false;

    for outcome in outcomes.values() {
        match outcome {
            PartitionOutcome::PreviouslyCompleted => {}
            PartitionOutcome::DispatchFailed { .. } => {
                return (BatchStatus::Failed, BatchStatus::Failed.to_string());
            }
            PartitionOutcome::Finished { status, .. } => match status {
                BatchStatus::Failed => {
                    return (BatchStatus::Failed, BatchStatus::Failed.to_string());
                }
                BatchStatus::Completed => {}
                _ => stopped = true,
            },
            PartitionOutcome::Incomplete => incomplete = true,
        }
    }

    if incomplete {
        (BatchStatus::Failed, PARTITIONS_INCOMPLETE.to_string())
    } else if stopped {
        (BatchStatus::Stopped, BatchStatus::Stopped.to_string())
    } else {
        (BatchStatus::Completed, BatchStatus::Completed.to_string())
    }
}

/// Receives partition results on the coordinating task, in receipt order.
pub trait PartitionAnalyzer: Send {
    fn analyze_collector_data(&mut self, partition: u32, data: &[u8]);

    fn analyze_status(&mut self, _partition: u32, _status: BatchStatus, _exit_status: &str) {}
}

/// Keeps every payload and final status as received.
#[derive(Debug, Default, Clone)]
pub struct CollectingAnalyzer {
    pub data: Vec<(u32, Vec<u8>)>,
    pub statuses: Vec<(u32, BatchStatus)>,
}

impl PartitionAnalyzer for CollectingAnalyzer {
    fn analyze_collector_data(&mut self, partition: u32, data: &[u8]) {
        self.data.push((partition, data.to_vec()));
    }

    fn analyze_status(&mut self, partition: u32, status: BatchStatus, _exit_status: &str) {
        self.statuses.push((partition, status));
    }
}
