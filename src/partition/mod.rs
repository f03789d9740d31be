//! Partition plan/reply protocol and the reply channel between a step's
//! coordinating task and its partition workers.
//!
//! # Components
//!
//! - [`PartitionPlan`]: per-partition configuration for one step attempt
//! - [`PartitionReplyMessage`]: collector data or final status from a partition
//! - [`PartitionReplyQueue`]: bounded-wait and zero-wait receive over one buffer,
//!   implemented in-process by [`LocalReplyQueue`] and across nodes by
//!   [`TransportReplyQueue`]
//! - [`ReplySender`]: partition-side handle that stamps per-partition sequence numbers

pub mod plan;
pub mod queue;
pub mod remote;
pub mod reply;

pub use plan::{JobIdentity, PartitionPlan, StepDefinition};
pub use queue::{LocalReplyQueue, PartitionReplyQueue, ReplySender};
pub use remote::TransportReplyQueue;
pub use reply::{PartitionReplyMessage, ReplyKind};
