use drover_lib::{TaskAddress, TaskId, WorkerAddress};
use drover_specpool::DependencyType;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// How the pipeline is fed: from the discovery feed until stopped, or
/// from a fixed list of items until all reach a terminal state.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    Autonomous,
    Batch(Vec<BatchItem>),
}

/// One unit of a batch run, resolved through the fetch operations.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchItem {
    ByAddress(TaskAddress),
    ByIds {
        creator: WorkerAddress,
        task_id: TaskId,
    },
}

/// Exponential backoff for the claim and submit stages.
/// `max_attempts` counts the initial attempt plus retries; `1` disables
/// retrying.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based):
    /// `min(base * 2^retry, max)`, with full jitter when enabled.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX))
            .min(self.max_delay_ms);
        let ms = if self.jitter && exp > 0 {
            rand::thread_rng().gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(ms)
    }
}

/// Queue watermarks with mandatory hysteresis: the flag flips only at
/// a crossing, never between adjacent sizes.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct BackpressureConfig {
    pub high_water_mark: usize,
    pub low_water_mark: usize,
    pub pause_discovery: bool,
}

/// Order in which queued tasks are handed to free worker slots.
#[derive(PartialEq, Debug, Clone, Copy, Default, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    #[default]
    Fifo,
    /// Earliest on-chain deadline first; tasks without a deadline last.
    Priority,
    /// Largest reward first.
    RewardWeighted,
}

/// Policy knobs of the speculative scheduler.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct SpeculationConfig {
    pub enabled: bool,
    pub max_depth: u32,
    /// Cap on the ledger-wide stake at risk, program smallest unit.
    pub max_stake: u64,
    pub allow_private: bool,
    /// 0-1000 scale.
    pub min_reputation: u32,
    pub proof_timeout_ms: u64,
    pub strategy: SchedulingStrategy,
    pub speculatable_types: BTreeSet<DependencyType>,
    pub max_rollback_rate_percent: f64,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 3,
            max_stake: 10_000_000_000,
            allow_private: false,
            min_reputation: 500,
            proof_timeout_ms: 300_000,
            strategy: SchedulingStrategy::Fifo,
            speculatable_types: [DependencyType::Data, DependencyType::Order]
                .into_iter()
                .collect(),
            max_rollback_rate_percent: 20.0,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_concurrent_tasks must be at least 1")]
    ZeroConcurrency,

    #[error("retry max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("backpressure low_water_mark must be below high_water_mark")]
    WatermarkOrder,

    #[error("min_reputation must be within 0..=1000, got {0}")]
    ReputationRange(u32),

    #[error("proof-typed dependencies are never speculatable")]
    ProofNotSpeculatable,
}

/// Immutable executor configuration, passed in whole at construction.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    pub mode: ExecutorMode,
    /// On-chain address this worker signs with.
    pub agent_address: WorkerAddress,
    /// Application-level identifier, for handler context and logs.
    pub agent_id: String,
    /// Externally maintained reputation on the 0-1000 scale, consulted
    /// by the speculation policy.
    pub agent_reputation: u32,
    pub max_concurrent_tasks: usize,
    /// Applies to the execution stage only; 0 disables.
    pub task_timeout_ms: u64,
    /// Healthy-claim buffer; 0 disables the claim-deadline monitor.
    pub claim_expiry_buffer_ms: u64,
    pub retry: RetryPolicy,
    pub backpressure: Option<BackpressureConfig>,
    pub speculation: SpeculationConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutorMode::Autonomous,
            agent_address: WorkerAddress::ZERO,
            agent_id: String::new(),
            agent_reputation: 500,
            max_concurrent_tasks: 1,
            task_timeout_ms: 300_000,
            claim_expiry_buffer_ms: 30_000,
            retry: RetryPolicy::default(),
            backpressure: None,
            speculation: SpeculationConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if let Some(bp) = &self.backpressure {
            if bp.low_water_mark >= bp.high_water_mark {
                return Err(ConfigError::WatermarkOrder);
            }
        }
        if self.speculation.min_reputation > 1_000 {
            return Err(ConfigError::ReputationRange(self.speculation.min_reputation));
        }
        if self
            .speculation
            .speculatable_types
            .contains(&DependencyType::Proof)
        {
            return Err(ConfigError::ProofNotSpeculatable);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 50,
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(2), Duration::from_millis(40));
        assert_eq!(policy.delay_for(3), Duration::from_millis(50));
        assert_eq!(policy.delay_for(30), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_stays_below_cap() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: true,
        };
        for retry in 0..8 {
            assert!(policy.delay_for(retry) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn test_validation() {
        let mut config = ExecutorConfig::default();
        assert!(config.validate().is_ok());

        config.max_concurrent_tasks = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroConcurrency));
        config.max_concurrent_tasks = 1;

        config.backpressure = Some(BackpressureConfig {
            high_water_mark: 2,
            low_water_mark: 2,
            pause_discovery: true,
        });
        assert_eq!(config.validate(), Err(ConfigError::WatermarkOrder));
        config.backpressure = None;

        config.speculation.speculatable_types.insert(DependencyType::Proof);
        assert_eq!(config.validate(), Err(ConfigError::ProofNotSpeculatable));
    }
}
