use crate::deferral::DeferralManager;
use crate::events::HookSet;
use crate::signals::{SignalRegistry, SpeculationTimers};
use drover_lib::TaskAddress;
use drover_specpool::{CommitmentLedger, CommitmentStatus, DependencyGraph, NodeStatus};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Why a speculative subtree is being torn down.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    ProofFailed,
    AncestorFailed,
    Timeout,
    Manual,
}

/// Aggregate of one rollback cascade.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct RollbackResult {
    pub root_address: TaskAddress,
    pub reason: RollbackReason,
    /// Root plus descendants, in BFS order.
    pub affected_task_addresses: Vec<TaskAddress>,
    pub stake_released: u64,
    /// Elapsed time of the active speculations that were aborted.
    pub wasted_compute_ms: u64,
}

/// Why a speculation is cancelled without counting as a miss.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    CreatorCancelled,
    DeadlineExpired,
    Manual,
    PolicyViolation,
}

/// Aggregate of one speculation cancel.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct CancelResult {
    pub cancelled_task_address: TaskAddress,
    pub reason: CancelReason,
    /// Descendants whose active speculation was aborted.
    pub aborted_descendants: Vec<TaskAddress>,
    pub cancelled_proofs: usize,
    /// Stake released without slashing.
    pub stake_released: u64,
}

crate::impl_display_using_json!(RollbackResult);
crate::impl_display_using_json!(CancelResult);

/// Tears down a speculative subtree: aborts signals, cancels pending
/// proofs, releases commitments and fails graph nodes, in deterministic
/// BFS order from the root.
pub(crate) struct RollbackController {
    graph: Arc<Mutex<DependencyGraph>>,
    ledger: Arc<Mutex<CommitmentLedger>>,
    deferral: Arc<DeferralManager>,
    signals: Arc<SignalRegistry>,
    timers: Arc<SpeculationTimers>,
    hooks: Arc<HookSet>,
}

impl RollbackController {
    pub fn new(
        graph: Arc<Mutex<DependencyGraph>>,
        ledger: Arc<Mutex<CommitmentLedger>>,
        deferral: Arc<DeferralManager>,
        signals: Arc<SignalRegistry>,
        timers: Arc<SpeculationTimers>,
        hooks: Arc<HookSet>,
    ) -> Self {
        Self {
            graph,
            ledger,
            deferral,
            signals,
            timers,
            hooks,
        }
    }

    pub fn rollback(&self, root: TaskAddress, reason: RollbackReason) -> RollbackResult {
        self.hooks.emit(|h| h.on_rollback_started(&root, reason));

        let descendants = self.graph.lock().unwrap().descendants_of(&root);
        let mut affected = Vec::with_capacity(descendants.len() + 1);
        let mut stake_released = 0u64;
        let mut wasted_compute_ms = 0u64;

        for addr in std::iter::once(root).chain(descendants) {
            self.signals.abort(&addr);
            if let Some(elapsed) = self.timers.take_elapsed_ms(&addr) {
                wasted_compute_ms += elapsed;
            }
            self.deferral.cancel(&addr);
            stake_released += self.release_commitment(&addr);
            self.fail_node(&addr);
            affected.push(addr);
        }

        let result = RollbackResult {
            root_address: root,
            reason,
            affected_task_addresses: affected,
            stake_released,
            wasted_compute_ms,
        };
        tracing::info!(
            "RollbackController.rollback: {root} reason={reason:?} affected={} stake_released={stake_released}",
            result.affected_task_addresses.len()
        );
        self.hooks.emit(|h| h.on_rollback_completed(&result));
        result
    }

    /// Softer teardown: same cascade, but no miss is recorded upstream
    /// and the stake comes back unslashed.
    pub fn cancel(&self, root: TaskAddress, reason: CancelReason) -> CancelResult {
        let descendants = self.graph.lock().unwrap().descendants_of(&root);
        let mut aborted_descendants = Vec::new();
        let mut cancelled_proofs = 0usize;
        let mut stake_released = 0u64;

        for addr in std::iter::once(root).chain(descendants) {
            let live_signal = self.signals.abort(&addr);
            let was_speculating = self.timers.take_elapsed_ms(&addr).is_some();
            if addr != root && (live_signal || was_speculating) {
                aborted_descendants.push(addr);
            }
            if self.deferral.cancel(&addr) {
                cancelled_proofs += 1;
            }
            stake_released += self.release_commitment(&addr);
            self.fail_node(&addr);
        }

        tracing::info!(
            "RollbackController.cancel: {root} reason={reason:?} proofs={cancelled_proofs} stake_released={stake_released}"
        );
        CancelResult {
            cancelled_task_address: root,
            reason,
            aborted_descendants,
            cancelled_proofs,
            stake_released,
        }
    }

    fn release_commitment(&self, addr: &TaskAddress) -> u64 {
        let mut ledger = self.ledger.lock().unwrap();
        let stake = match ledger.get(addr) {
            Some(c) if !c.status.is_terminal() => c.stake_at_risk,
            _ => return 0,
        };
        match ledger.update_status(addr, CommitmentStatus::RolledBack) {
            Ok(()) => stake,
            Err(_) => 0,
        }
    }

    fn fail_node(&self, addr: &TaskAddress) {
        let mut graph = self.graph.lock().unwrap();
        if let Some(node) = graph.get(addr) {
            if !node.status.is_terminal() {
                let _ = graph.update_status(addr, NodeStatus::Failed);
            }
        }
    }
}
