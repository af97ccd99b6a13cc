use chrono::{DateTime, Utc};
use drover_lib::TaskAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status of a speculative commitment. `Confirmed`, `Failed` and
/// `RolledBack` are terminal; a terminal commitment no longer
/// contributes to the stake-at-risk sum.
#[derive(PartialEq, Debug, Clone, Copy, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    Active,
    AwaitingAncestor,
    Confirmed,
    Failed,
    RolledBack,
}

impl CommitmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommitmentStatus::Confirmed | CommitmentStatus::Failed | CommitmentStatus::RolledBack
        )
    }
}

/// A record that off-chain work started before the parent's proof was
/// confirmed, carrying the stake slashed if the speculation misses.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct SpeculativeCommitment {
    pub task_address: TaskAddress,
    pub depth: u32,
    pub stake_at_risk: u64,
    pub status: CommitmentStatus,
    pub created_at: DateTime<Utc>,
}

impl SpeculativeCommitment {
    pub fn new(task_address: TaskAddress, depth: u32, stake_at_risk: u64) -> Self {
        Self {
            task_address,
            depth,
            stake_at_risk,
            status: CommitmentStatus::Active,
            created_at: Utc::now(),
        }
    }
}

/// Counts by status plus the maximum depth ever recorded.
#[derive(PartialEq, Debug, Clone, Default, Deserialize, Serialize, Eq)]
pub struct LedgerStats {
    pub active: usize,
    pub awaiting_ancestor: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub max_depth: u32,
    pub total_stake_at_risk: u64,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LedgerError {
    #[error("commitment for {0} already recorded")]
    Duplicate(TaskAddress),

    #[error("commitment for {0} not found")]
    NotFound(TaskAddress),

    #[error("commitment for {address} is terminal ({status:?})")]
    AlreadyTerminal {
        address: TaskAddress,
        status: CommitmentStatus,
    },
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// In-memory ledger of speculative commitments. The stake-at-risk sum
/// is maintained incrementally and updated atomically with every status
/// change, so a snapshot taken under the owner's lock always satisfies
/// `total == sum(stake over non-terminal)`.
#[derive(Debug, Default)]
pub struct CommitmentLedger {
    commitments: HashMap<TaskAddress, SpeculativeCommitment>,
    stake_at_risk: u64,
    max_depth_seen: u32,
}

impl CommitmentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, commitment: SpeculativeCommitment) -> LedgerResult<()> {
        if self.commitments.contains_key(&commitment.task_address) {
            return Err(LedgerError::Duplicate(commitment.task_address));
        }
        if !commitment.status.is_terminal() {
            self.stake_at_risk += commitment.stake_at_risk;
        }
        self.max_depth_seen = self.max_depth_seen.max(commitment.depth);
        tracing::debug!(
            "CommitmentLedger.record: {} stake={} depth={}",
            commitment.task_address,
            commitment.stake_at_risk,
            commitment.depth
        );
        self.commitments
            .insert(commitment.task_address, commitment);
        Ok(())
    }

    pub fn get(&self, task_address: &TaskAddress) -> Option<&SpeculativeCommitment> {
        self.commitments.get(task_address)
    }

    pub fn all(&self) -> impl Iterator<Item = &SpeculativeCommitment> {
        self.commitments.values()
    }

    /// Sum of `stake_at_risk` over non-terminal commitments.
    pub fn total_stake_at_risk(&self) -> u64 {
        self.stake_at_risk
    }

    /// Terminal transitions release the commitment's stake from the sum
    /// atomically with the status change. A terminal commitment cannot
    /// move again.
    pub fn update_status(
        &mut self,
        task_address: &TaskAddress,
        status: CommitmentStatus,
    ) -> LedgerResult<()> {
        let commitment = self
            .commitments
            .get_mut(task_address)
            .ok_or(LedgerError::NotFound(*task_address))?;
        if commitment.status.is_terminal() {
            return Err(LedgerError::AlreadyTerminal {
                address: *task_address,
                status: commitment.status,
            });
        }
        if status.is_terminal() {
            self.stake_at_risk -= commitment.stake_at_risk;
        }
        commitment.status = status;
        Ok(())
    }

    pub fn mark_confirmed(&mut self, task_address: &TaskAddress) -> LedgerResult<()> {
        self.update_status(task_address, CommitmentStatus::Confirmed)
    }

    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats {
            max_depth: self.max_depth_seen,
            total_stake_at_risk: self.stake_at_risk,
            ..Default::default()
        };
        for commitment in self.commitments.values() {
            match commitment.status {
                CommitmentStatus::Active => stats.active += 1,
                CommitmentStatus::AwaitingAncestor => stats.awaiting_ancestor += 1,
                CommitmentStatus::Confirmed => stats.confirmed += 1,
                CommitmentStatus::Failed => stats.failed += 1,
                CommitmentStatus::RolledBack => stats.rolled_back += 1,
            }
        }
        stats
    }
}
