pub mod instance;
pub mod status;

pub use instance::{JobExecution, JobInstance, Properties, StepThreadExecution, StepThreadKind};
pub use status::{BatchStatus, InstanceState};
