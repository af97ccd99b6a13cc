mod graph;
mod ledger;
mod proofs;

// Re-export
pub use graph::{
    DependencyGraph, DependencyType, GraphError, GraphResult, NodeStatus, TaskNode,
};
pub use ledger::{
    CommitmentLedger, CommitmentStatus, LedgerError, LedgerResult, LedgerStats,
    SpeculativeCommitment,
};
pub use proofs::{
    DeferralStats, DeferredProof, DeferredProofDb, ProofStage, ProofsError, ProofsResult,
};
