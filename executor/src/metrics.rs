use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Running pipeline counters, updated atomically by worker tasks.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    pub(crate) tasks_discovered: AtomicU64,
    pub(crate) tasks_claimed: AtomicU64,
    pub(crate) tasks_completed: AtomicU64,
    pub(crate) tasks_failed: AtomicU64,
    pub(crate) claims_failed: AtomicU64,
    pub(crate) submits_failed: AtomicU64,
    pub(crate) claims_expired: AtomicU64,
    pub(crate) claim_retries: AtomicU64,
    pub(crate) submit_retries: AtomicU64,
    pub(crate) tasks_in_progress: AtomicU64,
    /// Epoch milliseconds of the last `start`; 0 before the first run.
    pub(crate) started_at_ms: AtomicU64,
}

impl ExecutorMetrics {
    pub(crate) fn mark_started(&self) {
        self.started_at_ms
            .store(chrono::Utc::now().timestamp_millis() as u64, Ordering::SeqCst);
    }

    pub fn snapshot(&self, queue_size: usize, backpressure_active: bool) -> MetricsSnapshot {
        let started_at_ms = self.started_at_ms.load(Ordering::SeqCst);
        let uptime_ms = if started_at_ms == 0 {
            0
        } else {
            (chrono::Utc::now().timestamp_millis() as u64).saturating_sub(started_at_ms)
        };
        MetricsSnapshot {
            tasks_discovered: self.tasks_discovered.load(Ordering::SeqCst),
            tasks_claimed: self.tasks_claimed.load(Ordering::SeqCst),
            tasks_completed: self.tasks_completed.load(Ordering::SeqCst),
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            claims_failed: self.claims_failed.load(Ordering::SeqCst),
            submits_failed: self.submits_failed.load(Ordering::SeqCst),
            claims_expired: self.claims_expired.load(Ordering::SeqCst),
            claim_retries: self.claim_retries.load(Ordering::SeqCst),
            submit_retries: self.submit_retries.load(Ordering::SeqCst),
            tasks_in_progress: self.tasks_in_progress.load(Ordering::SeqCst),
            queue_size,
            backpressure_active,
            started_at_ms,
            uptime_ms,
        }
    }
}

/// Point-in-time view of [`ExecutorMetrics`].
#[derive(PartialEq, Debug, Clone, Default, Deserialize, Serialize, Eq)]
pub struct MetricsSnapshot {
    pub tasks_discovered: u64,
    pub tasks_claimed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub claims_failed: u64,
    pub submits_failed: u64,
    pub claims_expired: u64,
    pub claim_retries: u64,
    pub submit_retries: u64,
    pub tasks_in_progress: u64,
    pub queue_size: usize,
    pub backpressure_active: bool,
    pub started_at_ms: u64,
    pub uptime_ms: u64,
}

/// Speculation counters. Rates are derived at snapshot time.
#[derive(Debug, Default)]
pub struct SpeculationMetrics {
    pub(crate) executions: AtomicU64,
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) estimated_time_saved_ms: AtomicU64,
    pub(crate) time_wasted_on_rollbacks_ms: AtomicU64,
}

impl SpeculationMetrics {
    /// `misses / executions * 100`, 0 when nothing ran yet.
    pub fn rollback_rate(&self) -> f64 {
        let executions = self.executions.load(Ordering::SeqCst);
        if executions == 0 {
            return 0.0;
        }
        self.misses.load(Ordering::SeqCst) as f64 / executions as f64 * 100.0
    }

    /// `hits / (hits + misses) * 100`, 0 before the first outcome.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::SeqCst);
        let misses = self.misses.load(Ordering::SeqCst);
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64 * 100.0
    }

    pub fn snapshot(&self) -> SpeculationSnapshot {
        SpeculationSnapshot {
            speculative_executions: self.executions.load(Ordering::SeqCst),
            speculative_hits: self.hits.load(Ordering::SeqCst),
            speculative_misses: self.misses.load(Ordering::SeqCst),
            hit_rate: self.hit_rate(),
            estimated_time_saved_ms: self.estimated_time_saved_ms.load(Ordering::SeqCst),
            time_wasted_on_rollbacks_ms: self.time_wasted_on_rollbacks_ms.load(Ordering::SeqCst),
            rollback_rate: self.rollback_rate(),
        }
    }
}

/// Point-in-time view of [`SpeculationMetrics`].
#[derive(PartialEq, Debug, Clone, Default, Deserialize, Serialize)]
pub struct SpeculationSnapshot {
    pub speculative_executions: u64,
    pub speculative_hits: u64,
    pub speculative_misses: u64,
    pub hit_rate: f64,
    pub estimated_time_saved_ms: u64,
    pub time_wasted_on_rollbacks_ms: u64,
    pub rollback_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates() {
        let metrics = SpeculationMetrics::default();
        assert_eq!(metrics.hit_rate(), 0.0);
        assert_eq!(metrics.rollback_rate(), 0.0);

        metrics.executions.store(10, Ordering::SeqCst);
        metrics.hits.store(8, Ordering::SeqCst);
        metrics.misses.store(2, Ordering::SeqCst);
        assert_eq!(metrics.hit_rate(), 80.0);
        assert_eq!(metrics.rollback_rate(), 20.0);
    }

    #[test]
    fn test_uptime_requires_start() {
        let metrics = ExecutorMetrics::default();
        let snap = metrics.snapshot(0, false);
        assert_eq!(snap.uptime_ms, 0);

        metrics.mark_started();
        let snap = metrics.snapshot(3, true);
        assert!(snap.started_at_ms > 0);
        assert_eq!(snap.queue_size, 3);
        assert!(snap.backpressure_active);
    }
}
