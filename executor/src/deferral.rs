use chrono::Utc;
use drover_lib::{ExecutionResult, TaskAddress};
use drover_specpool::{DeferralStats, DeferredProof, DeferredProofDb, ProofStage, ProofsResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Emitted towards the pipeline when a deferred proof changes fate.
#[derive(Debug)]
pub enum DeferralEvent {
    /// All ancestors confirmed: the proof is ready for submission.
    Ready(DeferredProof),
    /// The proof deadline elapsed; treated like a failed proof.
    TimedOut(TaskAddress),
}

/// Async driver around [`DeferredProofDb`]: owns the per-proof deadline
/// timers and pushes stage changes to the pipeline over a channel. All
/// gating decisions stay in the store; nothing here holds the lock
/// across an await.
pub struct DeferralManager {
    db: Mutex<DeferredProofDb>,
    events_tx: mpsc::UnboundedSender<DeferralEvent>,
    timers: Mutex<HashMap<TaskAddress, CancellationToken>>,
}

impl DeferralManager {
    /// Build the manager plus the event stream the pipeline consumes.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DeferralEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                db: Mutex::new(DeferredProofDb::new()),
                events_tx,
                timers: Mutex::new(HashMap::new()),
            }),
            events_rx,
        )
    }

    /// Queue a proof behind its unconfirmed ancestors and arm its
    /// deadline. An unblocked proof is announced ready immediately.
    pub fn enqueue(
        self: &Arc<Self>,
        task_address: TaskAddress,
        artifact: ExecutionResult,
        ancestors_pending: BTreeSet<TaskAddress>,
        timeout: Duration,
    ) -> ProofsResult<ProofStage> {
        let deadline = Utc::now() + chrono::Duration::milliseconds(timeout.as_millis() as i64);
        let proof = self
            .db
            .lock()
            .unwrap()
            .enqueue(task_address, artifact, ancestors_pending, deadline)?;

        let token = CancellationToken::new();
        self.timers.lock().unwrap().insert(task_address, token.clone());
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if manager.db.lock().unwrap().expire(&task_address) {
                        manager.timers.lock().unwrap().remove(&task_address);
                        tracing::warn!("DeferralManager: proof for {task_address} timed out");
                        let _ = manager.events_tx.send(DeferralEvent::TimedOut(task_address));
                    }
                }
            }
        });

        let stage = proof.stage;
        if stage == ProofStage::Submitting {
            let _ = self.events_tx.send(DeferralEvent::Ready(proof));
        }
        Ok(stage)
    }

    /// Unblock every proof gated on `ancestor`; fully released proofs
    /// are announced ready. Returns how many were released.
    pub fn on_ancestor_confirmed(&self, ancestor: &TaskAddress) -> usize {
        let released = self.db.lock().unwrap().on_ancestor_confirmed(ancestor);
        let count = released.len();
        for proof in released {
            let _ = self.events_tx.send(DeferralEvent::Ready(proof));
        }
        count
    }

    /// Cancel every proof still gated on `ancestor`.
    pub fn on_ancestor_failed(&self, ancestor: &TaskAddress) -> Vec<TaskAddress> {
        let cancelled = self.db.lock().unwrap().on_ancestor_failed(ancestor);
        for addr in &cancelled {
            self.disarm(addr);
        }
        cancelled
    }

    /// Drop one pending proof (rollback, explicit cancel).
    pub fn cancel(&self, task_address: &TaskAddress) -> bool {
        let dropped = self.db.lock().unwrap().cancel(task_address);
        if dropped {
            self.disarm(task_address);
        }
        dropped
    }

    pub fn mark_confirmed(&self, task_address: &TaskAddress) -> bool {
        let dropped = self.db.lock().unwrap().mark_confirmed(task_address);
        if dropped {
            self.disarm(task_address);
        }
        dropped
    }

    pub fn mark_failed(&self, task_address: &TaskAddress) -> bool {
        let dropped = self.db.lock().unwrap().mark_failed(task_address);
        if dropped {
            self.disarm(task_address);
        }
        dropped
    }

    pub fn blocked(&self) -> Vec<TaskAddress> {
        self.db.lock().unwrap().blocked()
    }

    pub fn stats(&self) -> DeferralStats {
        self.db.lock().unwrap().stats()
    }

    pub fn get(&self, task_address: &TaskAddress) -> Option<DeferredProof> {
        self.db.lock().unwrap().get(task_address).cloned()
    }

    fn disarm(&self, task_address: &TaskAddress) {
        if let Some(token) = self.timers.lock().unwrap().remove(task_address) {
            token.cancel();
        }
    }

    /// Disarm every deadline timer. Used by `stop`.
    pub fn cancel_all_timers(&self) {
        for (_, token) in self.timers.lock().unwrap().drain() {
            token.cancel();
        }
    }
}

impl std::fmt::Debug for DeferralManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferralManager")
            .field("stats", &self.stats())
            .finish()
    }
}
