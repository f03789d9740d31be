use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::Properties;

/// The owning job's (name, instance id, execution id) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIdentity {
    pub job_name: String,
    pub instance_id: u64,
    pub execution_id: u64,
}

/// The step a partition belongs to, as handed to whichever node runs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub properties: Properties,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Immutable per-partition configuration for one step attempt.
///
/// A partition's identity is `partition_number`, which stays stable across
/// restarts regardless of how many partitions are re-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub partition_number: u32,
    pub partition_properties: Properties,
    pub job: JobIdentity,
    pub top_level_step_execution_id: u64,
    pub step_name: String,
    pub job_properties: Properties,
    /// Shared by every partition of one step attempt
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
}
