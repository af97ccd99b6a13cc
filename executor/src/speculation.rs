use crate::config::SpeculationConfig;
use crate::deferral::DeferralManager;
use crate::events::HookSet;
use crate::metrics::{SpeculationMetrics, SpeculationSnapshot};
use crate::rollback::{
    CancelReason, CancelResult, RollbackController, RollbackReason, RollbackResult,
};
use crate::signals::SpeculationTimers;
use drover_lib::TaskAddress;
use drover_specpool::{
    CommitmentLedger, DependencyGraph, DependencyType, LedgerStats, NodeStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Below this many registered speculations the rollback rate is too
/// noisy to act on, so the auto-disable guard stays quiet.
pub const MIN_SPECULATION_SAMPLES: u64 = 5;

/// Why a speculation request was turned down. Advisory only, never an
/// error.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    Disabled,
    TaskNotFound,
    DependencyTypeNotSpeculatable,
    DepthLimit,
    StakeLimit,
    PrivateSpeculationDisabled,
    LowReputation,
    RollbackRateExceeded,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::Disabled => "disabled",
            DenialReason::TaskNotFound => "task_not_found",
            DenialReason::DependencyTypeNotSpeculatable => "dependency_type_not_speculatable",
            DenialReason::DepthLimit => "depth_limit",
            DenialReason::StakeLimit => "stake_limit",
            DenialReason::PrivateSpeculationDisabled => "private_speculation_disabled",
            DenialReason::LowReputation => "low_reputation",
            DenialReason::RollbackRateExceeded => "rollback_rate_exceeded",
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of [`SpeculativeScheduler::should_speculate`].
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq)]
pub struct SpeculationDecision {
    pub allowed: bool,
    pub denial_reason: Option<DenialReason>,
}

impl SpeculationDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            denial_reason: None,
        }
    }

    fn deny(reason: DenialReason) -> Self {
        Self {
            allowed: false,
            denial_reason: Some(reason),
        }
    }
}

/// Policy layer deciding when dependent tasks may execute ahead of
/// their ancestors' proof confirmations, and resolving the outcome of
/// every speculation when proofs confirm or fail.
pub struct SpeculativeScheduler {
    config: SpeculationConfig,
    enabled: AtomicBool,
    /// At most one automatic trip per enable.
    rate_tripped: AtomicBool,
    graph: Arc<Mutex<DependencyGraph>>,
    ledger: Arc<Mutex<CommitmentLedger>>,
    deferral: Arc<DeferralManager>,
    timers: Arc<SpeculationTimers>,
    hooks: Arc<HookSet>,
    metrics: SpeculationMetrics,
    rollback: RollbackController,
}

impl SpeculativeScheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: SpeculationConfig,
        graph: Arc<Mutex<DependencyGraph>>,
        ledger: Arc<Mutex<CommitmentLedger>>,
        deferral: Arc<DeferralManager>,
        timers: Arc<SpeculationTimers>,
        hooks: Arc<HookSet>,
        rollback: RollbackController,
    ) -> Self {
        let enabled = AtomicBool::new(config.enabled);
        Self {
            config,
            enabled,
            rate_tripped: AtomicBool::new(false),
            graph,
            ledger,
            deferral,
            timers,
            hooks,
            metrics: SpeculationMetrics::default(),
            rollback,
        }
    }

    /// Single entry point for the speculation decision. Denial reasons
    /// are evaluated in a fixed order; the first failure wins.
    pub fn should_speculate(
        &self,
        task_address: &TaskAddress,
        is_private: bool,
        agent_reputation: u32,
    ) -> SpeculationDecision {
        // 1. global flag (manual or auto-disabled)
        if !self.enabled.load(Ordering::SeqCst) {
            return SpeculationDecision::deny(DenialReason::Disabled);
        }

        // 2. the task must be known to the graph
        let (dependency_type, depth) = {
            let graph = self.graph.lock().unwrap();
            match graph.get(task_address) {
                Some(node) => (node.dependency_type, node.depth),
                None => return SpeculationDecision::deny(DenialReason::TaskNotFound),
            }
        };

        // 3. proof edges are never speculatable, others per config
        if dependency_type == DependencyType::Proof
            || !self.config.speculatable_types.contains(&dependency_type)
        {
            return SpeculationDecision::deny(DenialReason::DependencyTypeNotSpeculatable);
        }

        // 4. depth ceiling
        if depth >= self.config.max_depth {
            self.hooks
                .emit(|h| h.on_depth_limit_reached(task_address, depth));
            return SpeculationDecision::deny(DenialReason::DepthLimit);
        }

        // 5. stake ceiling
        let stake_at_risk = self.ledger.lock().unwrap().total_stake_at_risk();
        if stake_at_risk >= self.config.max_stake {
            self.hooks
                .emit(|h| h.on_stake_limit_reached(task_address, stake_at_risk));
            return SpeculationDecision::deny(DenialReason::StakeLimit);
        }

        // 6. private execution needs its own opt-in
        if is_private && !self.config.allow_private {
            return SpeculationDecision::deny(DenialReason::PrivateSpeculationDisabled);
        }

        // 7. reputation floor
        if agent_reputation < self.config.min_reputation {
            return SpeculationDecision::deny(DenialReason::LowReputation);
        }

        // 8. rollback-rate circuit breaker; also flips the global flag
        if self.rate_exceeded() {
            self.trip_rate_guard();
            return SpeculationDecision::deny(DenialReason::RollbackRateExceeded);
        }

        SpeculationDecision::allow()
    }

    /// Record that a speculative execution started.
    pub fn register_speculation_start(&self, task_address: &TaskAddress, depth: u32) {
        self.timers.insert(*task_address);
        self.metrics.executions.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "SpeculativeScheduler: speculation started for {task_address} at depth {depth}"
        );
        self.hooks
            .emit(|h| h.on_speculation_started(task_address, depth));
    }

    /// An ancestor proof confirmed on-chain: settle the speculation as
    /// a hit and unblock gated descendants.
    pub fn on_proof_confirmed(&self, task_address: &TaskAddress) {
        {
            let mut graph = self.graph.lock().unwrap();
            if let Some(node) = graph.get(task_address) {
                // a node confirmed by another worker may never have
                // executed here; walk it through the legal transitions
                if node.status == NodeStatus::Pending {
                    let _ = graph.update_status(task_address, NodeStatus::Executing);
                }
                let _ = graph.update_status(task_address, NodeStatus::Completed);
            }
        }
        let was_speculation = {
            let mut ledger = self.ledger.lock().unwrap();
            ledger.mark_confirmed(task_address).is_ok()
        };
        if let Some(elapsed) = self.timers.take_elapsed_ms(task_address) {
            self.metrics
                .estimated_time_saved_ms
                .fetch_add(elapsed, Ordering::SeqCst);
        }
        if was_speculation {
            self.metrics.hits.fetch_add(1, Ordering::SeqCst);
            self.hooks.emit(|h| h.on_speculation_confirmed(task_address));
        }
        self.deferral.mark_confirmed(task_address);
        self.deferral.on_ancestor_confirmed(task_address);
    }

    /// An ancestor proof failed (or timed out): roll the subtree back
    /// and settle the speculation as a miss.
    pub fn on_proof_failed(
        &self,
        task_address: &TaskAddress,
        reason: Option<&str>,
    ) -> RollbackResult {
        if let Some(reason) = reason {
            tracing::warn!("SpeculativeScheduler: proof failed for {task_address}: {reason}");
        }
        let was_speculation = self.timers.contains(task_address)
            || self
                .ledger
                .lock()
                .unwrap()
                .get(task_address)
                .map(|c| !c.status.is_terminal())
                .unwrap_or(false);

        let result = self.rollback.rollback(*task_address, RollbackReason::ProofFailed);
        self.deferral.on_ancestor_failed(task_address);

        self.metrics
            .time_wasted_on_rollbacks_ms
            .fetch_add(result.wasted_compute_ms, Ordering::SeqCst);
        if was_speculation {
            self.metrics.misses.fetch_add(1, Ordering::SeqCst);
        }
        if self.rate_exceeded() {
            self.trip_rate_guard();
        }
        self.hooks.emit(|h| h.on_speculation_failed(task_address));
        result
    }

    /// Cancel a speculation without counting a miss or slashing.
    pub fn cancel_speculation(
        &self,
        task_address: &TaskAddress,
        reason: CancelReason,
    ) -> CancelResult {
        let result = self.rollback.cancel(*task_address, reason);
        self.deferral.on_ancestor_failed(task_address);
        result
    }

    /// Re-arm speculation after a manual or automatic disable.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        self.rate_tripped.store(false, Ordering::SeqCst);
        tracing::info!("SpeculativeScheduler: speculation enabled");
    }

    pub fn disable(&self, reason: &str) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::warn!("SpeculativeScheduler: speculation disabled: {reason}");
        self.hooks.emit(|h| h.on_speculation_disabled(reason));
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn metrics_snapshot(&self) -> SpeculationSnapshot {
        self.metrics.snapshot()
    }

    pub fn ledger_stats(&self) -> LedgerStats {
        self.ledger.lock().unwrap().stats()
    }

    pub fn blocked_proofs(&self) -> Vec<TaskAddress> {
        self.deferral.blocked()
    }

    fn rate_exceeded(&self) -> bool {
        self.metrics.executions.load(Ordering::SeqCst) >= MIN_SPECULATION_SAMPLES
            && self.metrics.rollback_rate() > self.config.max_rollback_rate_percent
    }

    fn trip_rate_guard(&self) {
        if !self.rate_tripped.swap(true, Ordering::SeqCst) {
            self.enabled.store(false, Ordering::SeqCst);
            tracing::warn!("SpeculativeScheduler: rollback rate exceeded, speculation disabled");
            self.hooks
                .emit(|h| h.on_speculation_disabled("rollback_rate_exceeded"));
        }
    }
}
