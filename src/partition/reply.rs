use serde::{Deserialize, Serialize};

use crate::model::BatchStatus;
use crate::partition::plan::PartitionPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyKind {
    /// Zero or more per partition, before its final status.
    CollectorData,
    /// Exactly one per partition.
    FinalStatus,
}

/// Partition-to-coordinator result envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionReplyMessage {
    pub kind: ReplyKind,
    pub partition_number: u32,
    /// Per-partition send order, starting at 0.
    pub sequence: u64,
    pub batch_status: Option<BatchStatus>,
    pub exit_status: Option<String>,
    pub collector_data: Option<Vec<u8>>,
    pub plan: PartitionPlan,
}

impl PartitionReplyMessage {
    pub fn collector_data(plan: PartitionPlan, sequence: u64, data: Vec<u8>) -> Self {
        Self {
            kind: ReplyKind::CollectorData,
            partition_number: plan.partition_number,
            sequence,
            batch_status: None,
            exit_status: None,
            collector_data: Some(data),
            plan,
        }
    }

    pub fn final_status(
        plan: PartitionPlan,
        sequence: u64,
        status: BatchStatus,
        exit_status: impl Into<String>,
    ) -> Self {
        Self {
            kind: ReplyKind::FinalStatus,
            partition_number: plan.partition_number,
            sequence,
            batch_status: Some(status),
            exit_status: Some(exit_status.into()),
            collector_data: None,
            plan,
        }
    }
}
