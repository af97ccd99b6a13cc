use crate::{
    primitives::{TaskAddress, TaskId, WorkerAddress},
    result::{PrivateProofBundle, PublicResult},
    task::{ClaimRecord, OnChainTask},
};
use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

/// Errors surfaced by the coordination-program boundary. The scheduler
/// never assumes idempotency of the underlying instructions; it retries
/// only what [`ChainError::is_retryable`] allows and surfaces the
/// program's verdict otherwise.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("task not found")]
    TaskNotFound,

    #[error("task already claimed by this worker")]
    AlreadyClaimed,

    #[error("task has no remaining claim slots")]
    TaskFullyClaimed,

    #[error("result rejected by the verifier: {0}")]
    VerificationRejected(String),

    #[error("claim expired or reassigned before submission")]
    StaleClaim,

    #[error("transport failure: {0}")]
    Transport(String),
}

impl ChainError {
    /// Only transport failures are worth another attempt; everything
    /// else is a program verdict.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }
}

pub type ChainResult<T, E = ChainError> = core::result::Result<T, E>;

/// Receipt of a successful claim instruction.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct ClaimReceipt {
    pub task_id: TaskId,
    pub claim_address: B256,
    pub tx_signature: String,
}

/// Receipt of a successful completion instruction.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct CompletionReceipt {
    pub task_id: TaskId,
    pub tx_signature: String,
}

/// Capability surface over the coordination program. Implementations
/// wrap whatever RPC transport the deployment uses; the scheduler only
/// sees these six operations.
#[async_trait::async_trait]
pub trait ChainOperations: Send + Sync {
    async fn fetch_task(&self, address: TaskAddress) -> ChainResult<OnChainTask>;

    async fn fetch_task_by_ids(
        &self,
        creator: WorkerAddress,
        task_id: TaskId,
    ) -> ChainResult<(TaskAddress, OnChainTask)>;

    async fn fetch_claim(
        &self,
        task_address: TaskAddress,
        worker: WorkerAddress,
    ) -> ChainResult<Option<ClaimRecord>>;

    async fn claim_task(
        &self,
        address: TaskAddress,
        task: &OnChainTask,
    ) -> ChainResult<ClaimReceipt>;

    async fn complete_task(
        &self,
        address: TaskAddress,
        result: &PublicResult,
    ) -> ChainResult<CompletionReceipt>;

    async fn complete_task_private(
        &self,
        address: TaskAddress,
        result: &PrivateProofBundle,
    ) -> ChainResult<CompletionReceipt>;
}
