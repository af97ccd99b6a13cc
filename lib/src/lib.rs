mod chain;
mod primitives;
mod result;
mod signal;
mod task;

// Re-export
pub use chain::{ChainError, ChainOperations, ChainResult, ClaimReceipt, CompletionReceipt};
pub use primitives::{TaskAddress, TaskId, WorkerAddress};
pub use result::{
    ExecutionResult, PrivateProofBundle, PublicResult, WireError, JOURNAL_LEN,
    MAX_RESULT_DATA_LEN, PRIVATE_WIRE_LEN, SEAL_BYTES_LEN, SEAL_MAGIC,
};
pub use signal::CancelSignal;
pub use task::{ClaimRecord, OnChainTask, TaskStatus, TaskType};
