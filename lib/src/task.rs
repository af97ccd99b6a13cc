use crate::primitives::{TaskAddress, TaskId, WorkerAddress};
use serde::{Deserialize, Serialize};

/// On-chain lifecycle status of a task account.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    PendingValidation,
    Completed,
    Cancelled,
    Disputed,
}

/// Whether a task admits a single worker or a quorum of workers.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Exclusive,
    Shared,
}

/// Immutable-per-observation snapshot of a task account, as fetched from
/// the coordination program.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct OnChainTask {
    pub task_id: TaskId,
    pub creator: WorkerAddress,
    /// Capability bitset the worker must cover to claim this task.
    pub required_capabilities: u64,
    /// Reward in the program's smallest unit.
    pub reward_amount: u64,
    pub max_workers: u16,
    pub current_workers: u16,
    pub status: TaskStatus,
    pub task_type: TaskType,
    /// Seconds since epoch; 0 means no deadline.
    pub deadline: u64,
    pub escrow: u64,
    pub required_completions: u16,
    pub completions: u16,
}

impl OnChainTask {
    /// Whether the snapshot still has a claim slot left.
    pub fn has_open_slot(&self) -> bool {
        self.current_workers < self.max_workers
    }
}

/// Snapshot of a claim account. Times are in seconds since epoch, which
/// is what the program stores; internal math converts to milliseconds.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct ClaimRecord {
    pub task_address: TaskAddress,
    pub worker: WorkerAddress,
    pub claimed_at_sec: u64,
    pub expires_at_sec: u64,
}

impl ClaimRecord {
    /// A claim is healthy while `now + buffer < expires_at`. A zero
    /// buffer degenerates to a plain expiry check.
    pub fn is_healthy(&self, now_sec: u64, buffer_sec: u64) -> bool {
        now_sec.saturating_add(buffer_sec) < self.expires_at_sec
    }
}
