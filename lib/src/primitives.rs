pub use alloy_primitives::B256;

/// Principal 32-byte identifier of a task, assigned by the coordination
/// program. Every map in the scheduler is keyed by this.
pub type TaskAddress = B256;

/// Creator-scoped 32-byte application identifier of a task.
pub type TaskId = B256;

/// 32-byte address of a worker agent.
pub type WorkerAddress = B256;
