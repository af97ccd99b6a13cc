use crate::error::ExecutorError;
use crate::rollback::{RollbackReason, RollbackResult};
use drover_lib::{ClaimReceipt, CompletionReceipt, OnChainTask, TaskAddress};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

/// Stage-outcome callbacks. Every method has a no-op default, so
/// observers implement only what they care about. Listeners must not
/// block; panics are caught and logged without touching pipeline state.
#[allow(unused_variables)]
pub trait ExecutorHooks: Send + Sync {
    fn on_task_discovered(&self, task_address: &TaskAddress, task: &OnChainTask) {}
    fn on_task_claimed(&self, task_address: &TaskAddress, receipt: &ClaimReceipt) {}
    fn on_execution_started(&self, task_address: &TaskAddress) {}
    fn on_task_completed(&self, task_address: &TaskAddress, receipt: &CompletionReceipt) {}
    fn on_claim_failed(&self, error: &ExecutorError, task_address: &TaskAddress) {}
    fn on_task_failed(&self, error: &ExecutorError, task_address: &TaskAddress) {}
    fn on_submit_failed(&self, error: &ExecutorError, task_address: &TaskAddress) {}
    fn on_task_timeout(&self, error: &ExecutorError, task_address: &TaskAddress) {}
    fn on_claim_expiring(&self, error: &ExecutorError, task_address: &TaskAddress) {}
    fn on_backpressure_activated(&self, queue_size: usize) {}
    fn on_backpressure_released(&self, queue_size: usize) {}

    fn on_speculation_started(&self, task_address: &TaskAddress, depth: u32) {}
    fn on_speculation_confirmed(&self, task_address: &TaskAddress) {}
    fn on_speculation_failed(&self, task_address: &TaskAddress) {}
    fn on_speculation_disabled(&self, reason: &str) {}
    fn on_depth_limit_reached(&self, task_address: &TaskAddress, depth: u32) {}
    fn on_stake_limit_reached(&self, task_address: &TaskAddress, stake_at_risk: u64) {}
    fn on_rollback_started(&self, root: &TaskAddress, reason: RollbackReason) {}
    fn on_rollback_completed(&self, result: &RollbackResult) {}
}

/// Registered listener sets, invoked in registration order against a
/// snapshot so listeners may register or unregister during emission.
#[derive(Default)]
pub struct HookSet {
    hooks: RwLock<Vec<Arc<dyn ExecutorHooks>>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hooks: Arc<dyn ExecutorHooks>) {
        self.hooks.write().unwrap().push(hooks);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().unwrap().is_empty()
    }

    pub(crate) fn emit<F: Fn(&dyn ExecutorHooks)>(&self, emit_one: F) {
        let snapshot: Vec<Arc<dyn ExecutorHooks>> = self.hooks.read().unwrap().clone();
        for hooks in snapshot {
            if catch_unwind(AssertUnwindSafe(|| emit_one(hooks.as_ref()))).is_err() {
                tracing::warn!("HookSet.emit: listener panicked, ignoring");
            }
        }
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet").field("len", &self.len()).finish()
    }
}
