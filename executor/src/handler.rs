use alloy_primitives::B256;
use drover_lib::{CancelSignal, ExecutionResult, OnChainTask, TaskAddress, WorkerAddress};

/// Everything a handler gets about the task it is executing. `signal`
/// is the task's scoped cancellation handle; a handler is required to
/// abandon work when it fires.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: OnChainTask,
    pub task_address: TaskAddress,
    pub claim_address: B256,
    pub agent_address: WorkerAddress,
    pub agent_id: String,
    /// Task-scoped span; handlers log inside it.
    pub span: tracing::Span,
    pub signal: CancelSignal,
}

/// The work capability the pipeline drives. Implementations do the
/// actual task computation and return either a public result or a
/// private proof bundle.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<ExecutionResult>;

    /// Whether this handler produces private proof bundles. Consulted
    /// by the speculation policy before results exist.
    fn produces_private_proofs(&self) -> bool {
        false
    }
}
