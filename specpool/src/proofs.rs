use chrono::{DateTime, Utc};
use drover_lib::{ExecutionResult, TaskAddress};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Stage of a deferred proof. `Confirmed`, `Failed`, `TimedOut` and
/// `Cancelled` are terminal; the record is dropped once terminal.
///
/// The hard safety rule lives in the transition function below: a proof
/// can only reach `Submitting` with an empty pending-ancestor set.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProofStage {
    Queued,
    Generating,
    AwaitingAncestors,
    Submitting,
    Confirmed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ProofStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProofStage::Confirmed | ProofStage::Failed | ProofStage::TimedOut | ProofStage::Cancelled
        )
    }
}

/// A proof whose on-chain submission is gated on unconfirmed ancestor
/// proofs.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct DeferredProof {
    pub task_address: TaskAddress,
    pub stage: ProofStage,
    pub ancestors_pending: BTreeSet<TaskAddress>,
    pub artifact: ExecutionResult,
    pub enqueued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Counts of live (non-terminal) proofs by stage.
#[derive(PartialEq, Debug, Clone, Default, Deserialize, Serialize, Eq)]
pub struct DeferralStats {
    pub queued: usize,
    pub generating: usize,
    pub awaiting_ancestors: usize,
    pub submitting: usize,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProofsError {
    #[error("deferred proof for {0} already exists")]
    Duplicate(TaskAddress),

    #[error("deferred proof for {0} not found")]
    NotFound(TaskAddress),
}

pub type ProofsResult<T> = Result<T, ProofsError>;

/// State store for deferred proofs. Pure bookkeeping: the executor's
/// deferral driver owns the timers and the submission work; this type
/// only decides which stage each record is in.
#[derive(Debug, Default)]
pub struct DeferredProofDb {
    proofs: HashMap<TaskAddress, DeferredProof>,
}

impl DeferredProofDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a proof job. The gate is resolved immediately: no pending
    /// ancestors means the proof comes back ready for submission.
    pub fn enqueue(
        &mut self,
        task_address: TaskAddress,
        artifact: ExecutionResult,
        ancestors_pending: BTreeSet<TaskAddress>,
        deadline: DateTime<Utc>,
    ) -> ProofsResult<DeferredProof> {
        if self.proofs.contains_key(&task_address) {
            return Err(ProofsError::Duplicate(task_address));
        }
        let stage = if ancestors_pending.is_empty() {
            ProofStage::Submitting
        } else {
            ProofStage::AwaitingAncestors
        };
        let proof = DeferredProof {
            task_address,
            stage,
            ancestors_pending,
            artifact,
            enqueued_at: Utc::now(),
            deadline,
        };
        tracing::debug!(
            "DeferredProofDb.enqueue: {task_address} stage={stage:?} blocked_on={}",
            proof.ancestors_pending.len()
        );
        self.proofs.insert(task_address, proof.clone());
        Ok(proof)
    }

    pub fn get(&self, task_address: &TaskAddress) -> Option<&DeferredProof> {
        self.proofs.get(task_address)
    }

    /// Remove `ancestor` from every blocked proof's pending set; proofs
    /// whose set drains move to `Submitting` and are returned so the
    /// driver can push them on-chain.
    pub fn on_ancestor_confirmed(&mut self, ancestor: &TaskAddress) -> Vec<DeferredProof> {
        let mut released = Vec::new();
        for proof in self.proofs.values_mut() {
            if proof.stage != ProofStage::AwaitingAncestors {
                continue;
            }
            if proof.ancestors_pending.remove(ancestor) && proof.ancestors_pending.is_empty() {
                proof.stage = ProofStage::Submitting;
                released.push(proof.clone());
            }
        }
        released
    }

    /// Cancel every proof still blocked on `ancestor`. Descendant
    /// closure beyond direct blockers is the rollback controller's job.
    pub fn on_ancestor_failed(&mut self, ancestor: &TaskAddress) -> Vec<TaskAddress> {
        let cancelled: Vec<TaskAddress> = self
            .proofs
            .values()
            .filter(|p| {
                p.stage == ProofStage::AwaitingAncestors && p.ancestors_pending.contains(ancestor)
            })
            .map(|p| p.task_address)
            .collect();
        for addr in &cancelled {
            self.remove_terminal(addr, ProofStage::Cancelled);
        }
        cancelled
    }

    /// Cancel a single pending proof. Returns whether a live record was
    /// dropped.
    pub fn cancel(&mut self, task_address: &TaskAddress) -> bool {
        self.remove_terminal(task_address, ProofStage::Cancelled)
    }

    pub fn mark_confirmed(&mut self, task_address: &TaskAddress) -> bool {
        self.remove_terminal(task_address, ProofStage::Confirmed)
    }

    pub fn mark_failed(&mut self, task_address: &TaskAddress) -> bool {
        self.remove_terminal(task_address, ProofStage::Failed)
    }

    /// Expire one proof regardless of its deadline. Used by the timer
    /// that armed when the proof was enqueued.
    pub fn expire(&mut self, task_address: &TaskAddress) -> bool {
        self.remove_terminal(task_address, ProofStage::TimedOut)
    }

    /// Move every live proof past its deadline to `TimedOut` and return
    /// their addresses. The scheduler treats them as failed proofs.
    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<TaskAddress> {
        let expired: Vec<TaskAddress> = self
            .proofs
            .values()
            .filter(|p| !p.stage.is_terminal() && p.deadline <= now)
            .map(|p| p.task_address)
            .collect();
        for addr in &expired {
            self.remove_terminal(addr, ProofStage::TimedOut);
        }
        expired
    }

    fn remove_terminal(&mut self, task_address: &TaskAddress, stage: ProofStage) -> bool {
        debug_assert!(stage.is_terminal());
        match self.proofs.remove(task_address) {
            Some(proof) => {
                tracing::debug!(
                    "DeferredProofDb: {task_address} {:?} -> {stage:?}",
                    proof.stage
                );
                true
            }
            None => false,
        }
    }

    /// Addresses of proofs still gated on ancestors.
    pub fn blocked(&self) -> Vec<TaskAddress> {
        self.proofs
            .values()
            .filter(|p| p.stage == ProofStage::AwaitingAncestors)
            .map(|p| p.task_address)
            .collect()
    }

    pub fn stats(&self) -> DeferralStats {
        let mut stats = DeferralStats::default();
        for proof in self.proofs.values() {
            match proof.stage {
                ProofStage::Queued => stats.queued += 1,
                ProofStage::Generating => stats.generating += 1,
                ProofStage::AwaitingAncestors => stats.awaiting_ancestors += 1,
                ProofStage::Submitting => stats.submitting += 1,
                _ => {}
            }
        }
        stats
    }
}
