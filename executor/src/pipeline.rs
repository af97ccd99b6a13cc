use crate::config::{BatchItem, ExecutorConfig, ExecutorMode};
use crate::deferral::{DeferralEvent, DeferralManager};
use crate::discovery::{Discovered, DiscoveryFeed};
use crate::error::ExecutorError;
use crate::events::{ExecutorHooks, HookSet};
use crate::handler::{TaskContext, TaskHandler};
use crate::metrics::{ExecutorMetrics, MetricsSnapshot, SpeculationSnapshot};
use crate::queue::{PipelineTask, TaskQueue};
use crate::retry::retry_chain_op;
use crate::rollback::{CancelReason, CancelResult, RollbackController, RollbackResult};
use crate::signals::{SignalRegistry, SpeculationTimers};
use crate::speculation::SpeculativeScheduler;
use chrono::Utc;
use drover_lib::{
    CancelSignal, ChainError, ChainOperations, CompletionReceipt, ExecutionResult, OnChainTask,
    TaskAddress,
};
use drover_specpool::{
    CommitmentLedger, CommitmentStatus, DeferralStats, DependencyGraph, DependencyType,
    GraphResult, LedgerStats, NodeStatus, SpeculativeCommitment, TaskNode,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Serializable view of the whole executor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorStatus {
    pub running: bool,
    pub paused: bool,
    pub metrics: MetricsSnapshot,
    pub speculation: SpeculationSnapshot,
    pub ledger: LedgerStats,
    pub deferral: DeferralStats,
}

crate::impl_display_using_json!(ExecutorStatus);

/// How one trip through the state machine ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    /// Result submitted on-chain.
    Completed,
    /// Speculative result parked in the deferral queue; the unit stays
    /// live until its ancestors settle.
    Deferred,
    /// Speculation denied; waiting for the parent proof to confirm.
    Parked,
    Failed,
    /// Aborted by stop, rollback or explicit cancel.
    Cancelled,
}

impl TaskOutcome {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskOutcome::Completed | TaskOutcome::Failed | TaskOutcome::Cancelled
        )
    }
}

/// Remaining batch items, drained as tasks reach a terminal state.
#[derive(Debug, Default)]
struct BatchLatch {
    remaining: Mutex<HashSet<TaskAddress>>,
}

impl BatchLatch {
    fn add(&self, task_address: TaskAddress) {
        self.remaining.lock().unwrap().insert(task_address);
    }

    fn done(&self, task_address: &TaskAddress) -> bool {
        self.remaining.lock().unwrap().remove(task_address)
    }

    fn is_done(&self) -> bool {
        self.remaining.lock().unwrap().is_empty()
    }
}

/// The off-chain task executor: discovers, claims, executes and submits
/// tasks, with bounded concurrency, retries, deadline monitors,
/// backpressure and speculative execution of dependent chains.
///
/// Cheap to clone; all state is shared. One instance owns its own
/// graph, ledger and deferral plane, so several executors can coexist
/// in a process.
#[derive(Clone)]
pub struct Executor {
    config: Arc<ExecutorConfig>,
    ops: Arc<dyn ChainOperations>,
    handler: Arc<dyn TaskHandler>,
    discovery: Arc<DiscoveryFeed>,
    hooks: Arc<HookSet>,
    metrics: Arc<ExecutorMetrics>,
    queue: Arc<Mutex<TaskQueue>>,
    parked: Arc<Mutex<HashMap<TaskAddress, PipelineTask>>>,
    /// Tasks whose artifact sits in the deferral queue, still counted
    /// as in-pipeline.
    deferred: Arc<Mutex<HashSet<TaskAddress>>>,
    notifier: Arc<Notify>,
    signals: Arc<SignalRegistry>,
    timers: Arc<SpeculationTimers>,
    graph: Arc<Mutex<DependencyGraph>>,
    ledger: Arc<Mutex<CommitmentLedger>>,
    deferral: Arc<DeferralManager>,
    deferral_events: Arc<AsyncMutex<Option<mpsc::UnboundedReceiver<DeferralEvent>>>>,
    speculation: Arc<SpeculativeScheduler>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    backpressure_active: Arc<AtomicBool>,
    shutdown: Arc<Mutex<CancellationToken>>,
    tracker: Arc<Mutex<TaskTracker>>,
    batch_latch: Arc<Mutex<Option<Arc<BatchLatch>>>>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        ops: Arc<dyn ChainOperations>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, ExecutorError> {
        config.validate()?;

        let hooks = Arc::new(HookSet::new());
        let graph = Arc::new(Mutex::new(DependencyGraph::new()));
        let ledger = Arc::new(Mutex::new(CommitmentLedger::new()));
        let signals = Arc::new(SignalRegistry::new());
        let timers = Arc::new(SpeculationTimers::new());
        let (deferral, deferral_events) = DeferralManager::new();

        let rollback = RollbackController::new(
            graph.clone(),
            ledger.clone(),
            deferral.clone(),
            signals.clone(),
            timers.clone(),
            hooks.clone(),
        );
        let speculation = Arc::new(SpeculativeScheduler::new(
            config.speculation.clone(),
            graph.clone(),
            ledger.clone(),
            deferral.clone(),
            timers.clone(),
            hooks.clone(),
            rollback,
        ));
        let strategy = config.speculation.strategy;

        Ok(Self {
            config: Arc::new(config),
            ops,
            handler,
            discovery: Arc::new(DiscoveryFeed::new()),
            hooks,
            metrics: Arc::new(ExecutorMetrics::default()),
            queue: Arc::new(Mutex::new(TaskQueue::new(strategy))),
            parked: Arc::new(Mutex::new(HashMap::new())),
            deferred: Arc::new(Mutex::new(HashSet::new())),
            notifier: Arc::new(Notify::new()),
            signals,
            timers,
            graph,
            ledger,
            deferral,
            deferral_events: Arc::new(AsyncMutex::new(Some(deferral_events))),
            speculation,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            backpressure_active: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Mutex::new(CancellationToken::new())),
            tracker: Arc::new(Mutex::new(TaskTracker::new())),
            batch_latch: Arc::new(Mutex::new(None)),
        })
    }

    // === accessors ===

    pub fn discovery(&self) -> Arc<DiscoveryFeed> {
        self.discovery.clone()
    }

    pub fn register_hooks(&self, hooks: Arc<dyn ExecutorHooks>) {
        self.hooks.register(hooks);
    }

    pub fn speculation(&self) -> &SpeculativeScheduler {
        &self.speculation
    }

    /// Declare a dependency edge before (or as) the child is
    /// discovered. Roots register implicitly at admission.
    pub fn register_dependency(
        &self,
        task_address: TaskAddress,
        parent_address: Option<TaskAddress>,
        dependency_type: DependencyType,
    ) -> GraphResult<TaskNode> {
        self.graph
            .lock()
            .unwrap()
            .add_node(task_address, parent_address, dependency_type)
    }

    pub fn queue_size(&self) -> usize {
        self.queue.lock().unwrap().size()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure_active.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.queue_size(), self.is_backpressure_active())
    }

    pub fn status(&self) -> ExecutorStatus {
        ExecutorStatus {
            running: self.is_running(),
            paused: self.is_paused(),
            metrics: self.metrics(),
            speculation: self.speculation.metrics_snapshot(),
            ledger: self.ledger.lock().unwrap().stats(),
            deferral: self.deferral.stats(),
        }
    }

    // === lifecycle ===

    /// Run the pipeline. Autonomous mode returns once `stop` cancels
    /// the run; batch mode returns when every resolvable item reached a
    /// terminal state. Never re-entrant.
    pub async fn start(&self) -> Result<(), ExecutorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ExecutorError::AlreadyRunning);
        }
        self.metrics.mark_started();
        let shutdown = CancellationToken::new();
        *self.shutdown.lock().unwrap() = shutdown.clone();
        let tracker = TaskTracker::new();
        *self.tracker.lock().unwrap() = tracker.clone();

        self.spawn_deferral_pump(shutdown.clone(), tracker.clone()).await;

        match self.config.mode.clone() {
            ExecutorMode::Autonomous => {
                let (admit_tx, admit_rx) = mpsc::unbounded_channel::<Discovered>();
                let subscription = self.discovery.subscribe(move |event| {
                    let _ = admit_tx.send(event.clone());
                });
                self.discovery.start();
                self.spawn_admission_pump(admit_rx, shutdown.clone());

                tracing::info!("Executor.start: autonomous, waiting for discoveries");
                self.worker_loop(shutdown.clone(), tracker.clone(), None).await;
                self.discovery.unsubscribe(subscription);
            }
            ExecutorMode::Batch(items) => {
                let latch = Arc::new(BatchLatch::default());
                *self.batch_latch.lock().unwrap() = Some(latch.clone());
                let total = items.len();
                let admitted = self.resolve_batch(items, &latch).await;
                tracing::info!("Executor.start: batch, {admitted}/{total} items admitted");

                self.worker_loop(shutdown.clone(), tracker.clone(), Some(latch)).await;

                // batch runs shut themselves down
                shutdown.cancel();
                tracker.close();
                tracker.wait().await;
                *self.batch_latch.lock().unwrap() = None;
                self.running.store(false, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Stop the pipeline: cancel every in-flight task synchronously,
    /// drain discovery, clear the queue and backpressure bookkeeping,
    /// then wait until all handlers and retry waits observed the
    /// cancellation. Idempotent.
    pub async fn stop(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        tracing::info!("Executor.stop: cancelling in-flight tasks");
        let shutdown = self.shutdown.lock().unwrap().clone();
        shutdown.cancel();
        self.discovery.stop();
        self.signals.abort_all();
        self.deferral.cancel_all_timers();
        self.queue.lock().unwrap().clear();
        self.parked.lock().unwrap().clear();
        self.deferred.lock().unwrap().clear();
        self.backpressure_active.store(false, Ordering::SeqCst);
        self.notifier.notify_waiters();

        let tracker = self.tracker.lock().unwrap().clone();
        tracker.close();
        tracker.wait().await;
        self.running.store(false, Ordering::SeqCst);
    }

    /// Keep accepting discoveries but start no new executions.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notifier.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // === proof outcome surface (driven by the chain watcher) ===

    /// An on-chain proof confirmation for `task_address` arrived.
    pub fn on_proof_confirmed(&self, task_address: &TaskAddress) {
        self.speculation.on_proof_confirmed(task_address);
        self.unpark_children(task_address);
    }

    /// An on-chain proof for `task_address` failed verification (or
    /// its deadline elapsed).
    pub fn on_proof_failed(
        &self,
        task_address: &TaskAddress,
        reason: Option<&str>,
    ) -> RollbackResult {
        let result = self.speculation.on_proof_failed(task_address, reason);
        self.settle_aborted_units(&result.affected_task_addresses);
        result
    }

    /// Withdraw a speculative subtree without recording a miss.
    pub fn cancel_speculation(
        &self,
        task_address: &TaskAddress,
        reason: CancelReason,
    ) -> CancelResult {
        let mut affected = vec![*task_address];
        affected.extend(self.graph.lock().unwrap().descendants_of(task_address));
        let result = self.speculation.cancel_speculation(task_address, reason);
        self.settle_aborted_units(&affected);
        result
    }

    // === internals ===

    async fn spawn_deferral_pump(&self, shutdown: CancellationToken, tracker: TaskTracker) {
        let Some(mut events_rx) = self.deferral_events.lock().await.take() else {
            return;
        };
        let exec = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(DeferralEvent::Ready(proof)) => {
                            let exec_ = exec.clone();
                            tracker.spawn(async move { exec_.submit_deferred(proof).await });
                        }
                        Some(DeferralEvent::TimedOut(task_address)) => {
                            exec.on_proof_failed(&task_address, Some("proof deadline exceeded"));
                        }
                        None => break,
                    }
                }
            }
            // hand the stream back for the next run
            *exec.deferral_events.lock().await = Some(events_rx);
        });
    }

    fn spawn_admission_pump(
        &self,
        mut admit_rx: mpsc::UnboundedReceiver<Discovered>,
        shutdown: CancellationToken,
    ) {
        let exec = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = admit_rx.recv() => match event {
                        Some(event) => {
                            exec.admit(event.task_address, event.task);
                        }
                        None => break,
                    }
                }
            }
        });
    }

    async fn resolve_batch(&self, items: Vec<BatchItem>, latch: &Arc<BatchLatch>) -> usize {
        let mut admitted = 0usize;
        for item in items {
            let resolved = match item {
                BatchItem::ByAddress(task_address) => self
                    .ops
                    .fetch_task(task_address)
                    .await
                    .map(|task| (task_address, task)),
                BatchItem::ByIds { creator, task_id } => {
                    self.ops.fetch_task_by_ids(creator, task_id).await
                }
            };
            match resolved {
                Ok((task_address, task)) => {
                    if self.admit(task_address, task) {
                        latch.add(task_address);
                        admitted += 1;
                    }
                }
                Err(ChainError::TaskNotFound) => {
                    tracing::warn!("Executor.resolve_batch: item not found, skipping");
                }
                Err(err) => {
                    tracing::warn!("Executor.resolve_batch: fetch failed, skipping: {err}");
                }
            }
        }
        admitted
    }

    /// Admit one task into the pipeline. Returns false on duplicates.
    fn admit(&self, task_address: TaskAddress, task: OnChainTask) -> bool {
        {
            let mut graph = self.graph.lock().unwrap();
            if graph.get(&task_address).is_none() {
                let _ = graph.add_node(task_address, None, DependencyType::None);
            }
        }
        let pushed = self
            .queue
            .lock()
            .unwrap()
            .push(PipelineTask { task_address, task: task.clone() });
        if !pushed {
            tracing::debug!("Executor.admit: {task_address} already queued, skipping");
            return false;
        }
        self.metrics.tasks_discovered.fetch_add(1, Ordering::SeqCst);
        self.hooks.emit(|h| h.on_task_discovered(&task_address, &task));
        self.maybe_activate_backpressure();
        self.notifier.notify_one();
        true
    }

    async fn worker_loop(
        &self,
        shutdown: CancellationToken,
        tracker: TaskTracker,
        latch: Option<Arc<BatchLatch>>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks));
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if let Some(latch) = &latch {
                if latch.is_done() {
                    break;
                }
            }
            if self.paused.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.notifier.notified() => {}
                }
                continue;
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let Some(item) = self.queue.lock().unwrap().try_next() else {
                drop(permit);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.notifier.notified() => {}
                }
                continue;
            };
            self.maybe_release_backpressure();

            let exec = self.clone();
            let latch_ = latch.clone();
            tracker.spawn(async move {
                let _permit = permit;
                let task_address = item.task_address;
                let outcome = exec.run_task(item).await;
                exec.queue.lock().unwrap().complete(&task_address);
                if outcome.is_terminal() {
                    if let Some(latch) = latch_ {
                        latch.done(&task_address);
                    }
                }
                exec.notifier.notify_one();
            });
        }
    }

    /// One trip through the state machine, owning the task unit.
    async fn run_task(&self, item: PipelineTask) -> TaskOutcome {
        let task_address = item.task_address;
        let signal = CancelSignal::new();
        self.signals.register(task_address, signal.clone());
        let abort_reason: Arc<Mutex<Option<ExecutorError>>> = Arc::new(Mutex::new(None));
        let done = CancellationToken::new();

        let outcome = self
            .drive_task(&item, &signal, &abort_reason, &done)
            .await;
        done.cancel();
        match outcome {
            // the unit stays live: rollback or the deferral pump will
            // still want the signal
            TaskOutcome::Deferred => {}
            _ => self.signals.remove(&task_address),
        }
        tracing::debug!("Executor.run_task: {task_address} -> {outcome:?}");
        outcome
    }

    async fn drive_task(
        &self,
        item: &PipelineTask,
        signal: &CancelSignal,
        abort_reason: &Arc<Mutex<Option<ExecutorError>>>,
        done: &CancellationToken,
    ) -> TaskOutcome {
        let task_address = item.task_address;
        let config = &self.config;

        // Speculation gate, before spending a claim: a task below an
        // unconfirmed ancestor either speculates or parks.
        let unconfirmed = self
            .graph
            .lock()
            .unwrap()
            .unconfirmed_ancestors(&task_address);
        let mut speculative = false;
        if !unconfirmed.is_empty() {
            let depth = self
                .graph
                .lock()
                .unwrap()
                .depth_of(&task_address)
                .unwrap_or(0);
            let decision = self.speculation.should_speculate(
                &task_address,
                self.handler.produces_private_proofs(),
                config.agent_reputation,
            );
            if decision.allowed {
                speculative = true;
                self.speculation
                    .register_speculation_start(&task_address, depth);
                let _ = self.ledger.lock().unwrap().record(SpeculativeCommitment::new(
                    task_address,
                    depth,
                    item.task.reward_amount,
                ));
            } else {
                tracing::info!(
                    "Executor.drive_task: {task_address} parked ({})",
                    decision
                        .denial_reason
                        .map(|r| r.as_str())
                        .unwrap_or("denied")
                );
                self.parked.lock().unwrap().insert(task_address, item.clone());
                return TaskOutcome::Parked;
            }
        }

        // S1: claim, with backoff on transport errors
        let metrics = self.metrics.clone();
        let claim_result = retry_chain_op(
            &config.retry,
            signal,
            || {
                metrics.claim_retries.fetch_add(1, Ordering::SeqCst);
            },
            |_| self.ops.claim_task(task_address, &item.task),
        )
        .await;
        let claim_receipt = match claim_result {
            Ok(receipt) => receipt,
            Err(ExecutorError::Cancelled) => {
                return self.settle_cancelled(&task_address, abort_reason, speculative)
            }
            Err(err) => {
                self.metrics.claims_failed.fetch_add(1, Ordering::SeqCst);
                self.metrics.tasks_failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("Executor.drive_task: claim failed for {task_address}: {err}");
                self.hooks.emit(|h| h.on_claim_failed(&err, &task_address));
                self.settle_failed(&task_address, speculative);
                return TaskOutcome::Failed;
            }
        };
        self.metrics.tasks_claimed.fetch_add(1, Ordering::SeqCst);
        self.hooks
            .emit(|h| h.on_task_claimed(&task_address, &claim_receipt));

        // S2: healthy-claim check now, and a deadline monitor that
        // covers the rest of the trip
        if config.claim_expiry_buffer_ms > 0 {
            match self
                .ops
                .fetch_claim(task_address, config.agent_address)
                .await
            {
                Ok(Some(claim)) => {
                    let now_ms = Utc::now().timestamp_millis() as u64;
                    let expires_ms = claim.expires_at_sec.saturating_mul(1_000);
                    if now_ms + config.claim_expiry_buffer_ms >= expires_ms {
                        let err = ExecutorError::ClaimExpired(config.claim_expiry_buffer_ms);
                        self.metrics.claims_expired.fetch_add(1, Ordering::SeqCst);
                        self.metrics.tasks_failed.fetch_add(1, Ordering::SeqCst);
                        self.hooks.emit(|h| h.on_claim_expiring(&err, &task_address));
                        self.hooks.emit(|h| h.on_task_failed(&err, &task_address));
                        self.settle_failed(&task_address, speculative);
                        return TaskOutcome::Failed;
                    }
                    let fire_in =
                        Duration::from_millis(expires_ms - config.claim_expiry_buffer_ms - now_ms);
                    self.spawn_abort_timer(
                        signal.clone(),
                        done.clone(),
                        abort_reason.clone(),
                        fire_in,
                        ExecutorError::ClaimExpired(config.claim_expiry_buffer_ms),
                    );
                }
                Ok(None) => {
                    tracing::warn!(
                        "Executor.drive_task: no claim record for {task_address}, skipping monitor"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        "Executor.drive_task: fetch_claim failed for {task_address}: {err}"
                    );
                }
            }
        }

        // S3: execute under the task timeout
        let exec_phase = CancellationToken::new();
        if config.task_timeout_ms > 0 {
            self.spawn_abort_timer(
                signal.clone(),
                exec_phase.clone(),
                abort_reason.clone(),
                Duration::from_millis(config.task_timeout_ms),
                ExecutorError::TaskTimeout(config.task_timeout_ms),
            );
        }
        {
            let mut graph = self.graph.lock().unwrap();
            let _ = graph.update_status(&task_address, NodeStatus::Executing);
        }
        self.metrics.tasks_in_progress.fetch_add(1, Ordering::SeqCst);
        self.hooks.emit(|h| h.on_execution_started(&task_address));

        let ctx = TaskContext {
            task: item.task.clone(),
            task_address,
            claim_address: claim_receipt.claim_address,
            agent_address: config.agent_address,
            agent_id: config.agent_id.clone(),
            span: tracing::info_span!("task", address = %task_address),
            signal: signal.clone(),
        };
        let handler_result = tokio::select! {
            result = self.handler.execute(ctx) => Some(result),
            _ = signal.cancelled() => None,
        };
        exec_phase.cancel();
        self.metrics.tasks_in_progress.fetch_sub(1, Ordering::SeqCst);

        let artifact = match handler_result {
            None => return self.settle_cancelled(&task_address, abort_reason, speculative),
            Some(Err(err)) => {
                let err = ExecutorError::Handler(err);
                self.metrics.tasks_failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("Executor.drive_task: handler failed for {task_address}: {err}");
                self.hooks.emit(|h| h.on_task_failed(&err, &task_address));
                self.settle_failed(&task_address, speculative);
                return TaskOutcome::Failed;
            }
            Some(Ok(artifact)) => artifact,
        };

        // S4 or deferral: a speculative artifact whose ancestors are
        // still unconfirmed must not reach the chain yet
        let still_unconfirmed: BTreeSet<TaskAddress> = self
            .graph
            .lock()
            .unwrap()
            .unconfirmed_ancestors(&task_address)
            .into_iter()
            .collect();
        if speculative && !still_unconfirmed.is_empty() {
            let _ = self
                .ledger
                .lock()
                .unwrap()
                .update_status(&task_address, CommitmentStatus::AwaitingAncestor);
            self.deferred.lock().unwrap().insert(task_address);
            match self.deferral.enqueue(
                task_address,
                artifact,
                still_unconfirmed,
                Duration::from_millis(config.speculation.proof_timeout_ms),
            ) {
                Ok(_) => return TaskOutcome::Deferred,
                Err(err) => {
                    self.deferred.lock().unwrap().remove(&task_address);
                    let err = ExecutorError::Handler(anyhow::anyhow!(
                        "failed to defer proof: {err}"
                    ));
                    self.metrics.tasks_failed.fetch_add(1, Ordering::SeqCst);
                    self.hooks.emit(|h| h.on_task_failed(&err, &task_address));
                    self.settle_failed(&task_address, speculative);
                    return TaskOutcome::Failed;
                }
            }
        }

        match self.submit_artifact(&task_address, &artifact, signal).await {
            Ok(receipt) => {
                self.metrics.tasks_completed.fetch_add(1, Ordering::SeqCst);
                self.hooks.emit(|h| h.on_task_completed(&task_address, &receipt));
                TaskOutcome::Completed
            }
            Err(ExecutorError::Cancelled) => {
                self.settle_cancelled(&task_address, abort_reason, speculative)
            }
            Err(err) => {
                self.metrics.submits_failed.fetch_add(1, Ordering::SeqCst);
                self.metrics.tasks_failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("Executor.drive_task: submit failed for {task_address}: {err}");
                self.hooks.emit(|h| h.on_submit_failed(&err, &task_address));
                self.settle_failed(&task_address, speculative);
                TaskOutcome::Failed
            }
        }
    }

    /// Route the artifact to the completion instruction matching its
    /// variant; exactly one of the two operations runs per task.
    async fn submit_artifact(
        &self,
        task_address: &TaskAddress,
        artifact: &ExecutionResult,
        signal: &CancelSignal,
    ) -> Result<CompletionReceipt, ExecutorError> {
        let metrics = self.metrics.clone();
        retry_chain_op(
            &self.config.retry,
            signal,
            || {
                metrics.submit_retries.fetch_add(1, Ordering::SeqCst);
            },
            |_| async move {
                match artifact {
                    ExecutionResult::Public(result) => {
                        self.ops.complete_task(*task_address, result).await
                    }
                    ExecutionResult::Private(bundle) => {
                        self.ops.complete_task_private(*task_address, bundle).await
                    }
                }
            },
        )
        .await
    }

    /// Submit a proof the deferral manager released. The task unit
    /// completes (or fails) here, long after its handler returned.
    async fn submit_deferred(&self, proof: drover_specpool::DeferredProof) {
        let task_address = proof.task_address;
        // a rollback may have raced the ready event
        if !self.deferred.lock().unwrap().remove(&task_address) {
            tracing::debug!(
                "Executor.submit_deferred: {task_address} no longer live, dropping"
            );
            return;
        }
        let signal = self
            .signals
            .get(&task_address)
            .unwrap_or_else(CancelSignal::new);

        let outcome = match self
            .submit_artifact(&task_address, &proof.artifact, &signal)
            .await
        {
            Ok(receipt) => {
                self.metrics.tasks_completed.fetch_add(1, Ordering::SeqCst);
                self.hooks.emit(|h| h.on_task_completed(&task_address, &receipt));
                TaskOutcome::Completed
            }
            Err(ExecutorError::Cancelled) => TaskOutcome::Cancelled,
            Err(err) => {
                self.metrics.submits_failed.fetch_add(1, Ordering::SeqCst);
                self.metrics.tasks_failed.fetch_add(1, Ordering::SeqCst);
                self.hooks.emit(|h| h.on_submit_failed(&err, &task_address));
                self.deferral.mark_failed(&task_address);
                self.settle_failed(&task_address, true);
                TaskOutcome::Failed
            }
        };
        self.signals.remove(&task_address);
        if outcome.is_terminal() {
            self.settle_batch_done(&task_address);
        }
    }

    /// Classify a cancellation: a deadline set the reason before
    /// aborting; stop and rollback leave it empty.
    fn settle_cancelled(
        &self,
        task_address: &TaskAddress,
        abort_reason: &Arc<Mutex<Option<ExecutorError>>>,
        speculative: bool,
    ) -> TaskOutcome {
        let reason = abort_reason.lock().unwrap().take();
        match reason {
            Some(err @ ExecutorError::TaskTimeout(_)) => {
                self.metrics.tasks_failed.fetch_add(1, Ordering::SeqCst);
                self.hooks.emit(|h| h.on_task_timeout(&err, task_address));
                self.hooks.emit(|h| h.on_task_failed(&err, task_address));
                self.settle_failed(task_address, speculative);
                TaskOutcome::Failed
            }
            Some(err @ ExecutorError::ClaimExpired(_)) => {
                self.metrics.claims_expired.fetch_add(1, Ordering::SeqCst);
                self.metrics.tasks_failed.fetch_add(1, Ordering::SeqCst);
                self.hooks.emit(|h| h.on_claim_expiring(&err, task_address));
                self.hooks.emit(|h| h.on_task_failed(&err, task_address));
                self.settle_failed(task_address, speculative);
                TaskOutcome::Failed
            }
            _ => {
                let shutting_down = self.shutdown.lock().unwrap().is_cancelled();
                if !shutting_down {
                    // rollback or explicit cancel already settled the
                    // graph and ledger; account the unit here
                    self.metrics.tasks_failed.fetch_add(1, Ordering::SeqCst);
                    self.hooks
                        .emit(|h| h.on_task_failed(&ExecutorError::Cancelled, task_address));
                }
                TaskOutcome::Cancelled
            }
        }
    }

    /// Fail the graph node and release any live commitment.
    fn settle_failed(&self, task_address: &TaskAddress, speculative: bool) {
        {
            let mut graph = self.graph.lock().unwrap();
            if let Some(node) = graph.get(task_address) {
                if !node.status.is_terminal() {
                    let _ = graph.update_status(task_address, NodeStatus::Failed);
                }
            }
        }
        if speculative {
            let _ = self
                .ledger
                .lock()
                .unwrap()
                .update_status(task_address, CommitmentStatus::Failed);
            self.timers.take_elapsed_ms(task_address);
        }
    }

    /// After a rollback or cancel cascade, settle the units that had no
    /// running future: parked tasks and deferred artifacts.
    fn settle_aborted_units(&self, affected: &[TaskAddress]) {
        for task_address in affected {
            let was_parked = self.parked.lock().unwrap().remove(task_address).is_some();
            let was_deferred = self.deferred.lock().unwrap().remove(task_address);
            if was_parked || was_deferred {
                self.metrics.tasks_failed.fetch_add(1, Ordering::SeqCst);
                self.signals.remove(task_address);
                self.queue.lock().unwrap().complete(task_address);
                self.settle_batch_done(task_address);
            }
        }
        self.notifier.notify_one();
    }

    fn settle_batch_done(&self, task_address: &TaskAddress) {
        let latch = self.batch_latch.lock().unwrap().clone();
        if let Some(latch) = latch {
            latch.done(task_address);
            self.notifier.notify_one();
        }
    }

    /// A parent proof confirmed: re-admit children that were waiting
    /// for it.
    fn unpark_children(&self, task_address: &TaskAddress) {
        let children = self
            .graph
            .lock()
            .unwrap()
            .get(task_address)
            .map(|node| node.child_addresses.clone())
            .unwrap_or_default();
        for child in children {
            let ready = self
                .graph
                .lock()
                .unwrap()
                .unconfirmed_ancestors(&child)
                .is_empty();
            if !ready || self.queue.lock().unwrap().contains(&child) {
                continue;
            }
            if let Some(item) = self.parked.lock().unwrap().remove(&child) {
                tracing::info!("Executor.unpark_children: re-admitting {child}");
                if self.queue.lock().unwrap().push(item) {
                    self.notifier.notify_one();
                }
            }
        }
    }

    fn spawn_abort_timer(
        &self,
        signal: CancelSignal,
        disarm: CancellationToken,
        abort_reason: Arc<Mutex<Option<ExecutorError>>>,
        fire_in: Duration,
        error: ExecutorError,
    ) {
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.cancelled() => {}
                _ = disarm.cancelled() => {}
                _ = tokio::time::sleep(fire_in) => {
                    let mut slot = abort_reason.lock().unwrap();
                    // first deadline wins; later timers are no-ops
                    if slot.is_none() && !signal.is_aborted() {
                        *slot = Some(error);
                        drop(slot);
                        signal.abort();
                    }
                }
            }
        });
    }

    fn maybe_activate_backpressure(&self) {
        let Some(bp) = &self.config.backpressure else {
            return;
        };
        let size = self.queue.lock().unwrap().size();
        if size >= bp.high_water_mark && !self.backpressure_active.swap(true, Ordering::SeqCst) {
            tracing::info!("Executor: backpressure activated at queue size {size}");
            self.hooks.emit(|h| h.on_backpressure_activated(size));
            if bp.pause_discovery {
                self.discovery.pause();
            }
        }
    }

    fn maybe_release_backpressure(&self) {
        let Some(bp) = &self.config.backpressure else {
            return;
        };
        let size = self.queue.lock().unwrap().size();
        if size <= bp.low_water_mark && self.backpressure_active.swap(false, Ordering::SeqCst) {
            tracing::info!("Executor: backpressure released at queue size {size}");
            self.hooks.emit(|h| h.on_backpressure_released(size));
            if bp.pause_discovery {
                self.discovery.resume();
            }
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.queue.lock().unwrap();
        f.debug_struct("Executor")
            .field("running", &self.is_running())
            .field("queue_size", &queue.size())
            .field("in_flight", &queue.in_flight())
            .finish()
    }
}
