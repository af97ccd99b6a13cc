#[cfg(test)]
mod tests {
    use alloy_primitives::B256;
    use async_trait::async_trait;
    use drover_executor::{
        BackpressureConfig, BatchItem, CancelReason, DenialReason, Executor, ExecutorConfig,
        ExecutorHooks, ExecutorMode, RetryPolicy, TaskContext, TaskHandler,
    };
    use drover_lib::{
        ChainError, ChainOperations, ChainResult, ClaimReceipt, ClaimRecord, CompletionReceipt,
        ExecutionResult, OnChainTask, PrivateProofBundle, PublicResult, TaskAddress, TaskId,
        TaskStatus, TaskType, WorkerAddress, JOURNAL_LEN, SEAL_BYTES_LEN, SEAL_MAGIC,
    };
    use drover_specpool::DependencyType;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    // === fixtures ===

    fn addr(byte: u8) -> TaskAddress {
        B256::from([byte; 32])
    }

    fn open_task(reward: u64) -> OnChainTask {
        OnChainTask {
            task_id: B256::from([0x1d; 32]),
            creator: B256::from([0xee; 32]),
            required_capabilities: 0,
            reward_amount: reward,
            max_workers: 1,
            current_workers: 0,
            status: TaskStatus::Open,
            task_type: TaskType::Exclusive,
            deadline: 0,
            escrow: reward,
            required_completions: 1,
            completions: 0,
        }
    }

    fn public_result() -> ExecutionResult {
        ExecutionResult::Public(PublicResult::new(B256::from([0x01; 32]), vec![]).unwrap())
    }

    fn private_result() -> ExecutionResult {
        let mut seal = [0xaa; SEAL_BYTES_LEN];
        seal[..4].copy_from_slice(&SEAL_MAGIC);
        ExecutionResult::Private(Box::new(
            PrivateProofBundle::new(
                seal,
                [0x02; JOURNAL_LEN],
                B256::from([0x03; 32]),
                B256::from([0x04; 32]),
                B256::from([0x05; 32]),
            )
            .unwrap(),
        ))
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum ChainCall {
        Claim(TaskAddress),
        Complete(TaskAddress),
        CompletePrivate(TaskAddress),
    }

    /// Programmable coordination-program double: scripted per-task
    /// failures drain before the operation succeeds, and every write
    /// operation is recorded.
    #[derive(Default)]
    struct MockChain {
        tasks: Mutex<HashMap<TaskAddress, OnChainTask>>,
        claims: Mutex<HashMap<TaskAddress, ClaimRecord>>,
        claim_errors: Mutex<HashMap<TaskAddress, VecDeque<ChainError>>>,
        submit_errors: Mutex<HashMap<TaskAddress, VecDeque<ChainError>>>,
        calls: Mutex<Vec<ChainCall>>,
    }

    impl MockChain {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn insert_task(&self, address: TaskAddress, task: OnChainTask) {
            self.tasks.lock().unwrap().insert(address, task);
        }

        fn insert_claim(&self, address: TaskAddress, worker: WorkerAddress, expires_in_sec: u64) {
            let now = chrono::Utc::now().timestamp() as u64;
            self.claims.lock().unwrap().insert(
                address,
                ClaimRecord {
                    task_address: address,
                    worker,
                    claimed_at_sec: now,
                    expires_at_sec: now + expires_in_sec,
                },
            );
        }

        fn script_claim_error(&self, address: TaskAddress, error: ChainError) {
            self.claim_errors
                .lock()
                .unwrap()
                .entry(address)
                .or_default()
                .push_back(error);
        }

        fn calls(&self) -> Vec<ChainCall> {
            self.calls.lock().unwrap().clone()
        }

        fn count_calls(&self, wanted: &ChainCall) -> usize {
            self.calls().iter().filter(|c| *c == wanted).count()
        }
    }

    #[async_trait]
    impl ChainOperations for MockChain {
        async fn fetch_task(&self, address: TaskAddress) -> ChainResult<OnChainTask> {
            self.tasks
                .lock()
                .unwrap()
                .get(&address)
                .cloned()
                .ok_or(ChainError::TaskNotFound)
        }

        async fn fetch_task_by_ids(
            &self,
            creator: WorkerAddress,
            task_id: TaskId,
        ) -> ChainResult<(TaskAddress, OnChainTask)> {
            self.tasks
                .lock()
                .unwrap()
                .iter()
                .find(|(_, t)| t.creator == creator && t.task_id == task_id)
                .map(|(a, t)| (*a, t.clone()))
                .ok_or(ChainError::TaskNotFound)
        }

        async fn fetch_claim(
            &self,
            task_address: TaskAddress,
            _worker: WorkerAddress,
        ) -> ChainResult<Option<ClaimRecord>> {
            Ok(self.claims.lock().unwrap().get(&task_address).cloned())
        }

        async fn claim_task(
            &self,
            address: TaskAddress,
            task: &OnChainTask,
        ) -> ChainResult<ClaimReceipt> {
            self.calls.lock().unwrap().push(ChainCall::Claim(address));
            if let Some(err) = self
                .claim_errors
                .lock()
                .unwrap()
                .get_mut(&address)
                .and_then(|q| q.pop_front())
            {
                return Err(err);
            }
            Ok(ClaimReceipt {
                task_id: task.task_id,
                claim_address: B256::from([0xcc; 32]),
                tx_signature: format!("claim-{address}"),
            })
        }

        async fn complete_task(
            &self,
            address: TaskAddress,
            _result: &PublicResult,
        ) -> ChainResult<CompletionReceipt> {
            self.calls.lock().unwrap().push(ChainCall::Complete(address));
            if let Some(err) = self
                .submit_errors
                .lock()
                .unwrap()
                .get_mut(&address)
                .and_then(|q| q.pop_front())
            {
                return Err(err);
            }
            Ok(CompletionReceipt {
                task_id: B256::from([0x1d; 32]),
                tx_signature: format!("complete-{address}"),
            })
        }

        async fn complete_task_private(
            &self,
            address: TaskAddress,
            _result: &PrivateProofBundle,
        ) -> ChainResult<CompletionReceipt> {
            self.calls
                .lock()
                .unwrap()
                .push(ChainCall::CompletePrivate(address));
            Ok(CompletionReceipt {
                task_id: B256::from([0x1d; 32]),
                tx_signature: format!("complete-private-{address}"),
            })
        }
    }

    enum Behavior {
        Public,
        Private,
        Hang,
        Fail,
    }

    struct TestHandler {
        behavior: Behavior,
        delay: Duration,
        executions: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        observed_abort: AtomicBool,
    }

    impl TestHandler {
        fn new(behavior: Behavior, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                delay,
                executions: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                observed_abort: AtomicBool::new(false),
            })
        }

        fn public() -> Arc<Self> {
            Self::new(Behavior::Public, Duration::from_millis(0))
        }

        fn public_with_delay(ms: u64) -> Arc<Self> {
            Self::new(Behavior::Public, Duration::from_millis(ms))
        }

        fn private() -> Arc<Self> {
            Self::new(Behavior::Private, Duration::from_millis(0))
        }

        fn hanging() -> Arc<Self> {
            Self::new(Behavior::Hang, Duration::from_millis(0))
        }

        fn failing() -> Arc<Self> {
            Self::new(Behavior::Fail, Duration::from_millis(0))
        }
    }

    #[async_trait]
    impl TaskHandler for TestHandler {
        async fn execute(&self, ctx: TaskContext) -> anyhow::Result<ExecutionResult> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);

            let result = match self.behavior {
                Behavior::Hang => {
                    ctx.signal.cancelled().await;
                    self.observed_abort
                        .store(ctx.signal.is_aborted(), Ordering::SeqCst);
                    Err(anyhow::anyhow!("aborted"))
                }
                Behavior::Public => {
                    tokio::time::sleep(self.delay).await;
                    Ok(public_result())
                }
                Behavior::Private => {
                    tokio::time::sleep(self.delay).await;
                    Ok(private_result())
                }
                Behavior::Fail => Err(anyhow::anyhow!("handler exploded")),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn produces_private_proofs(&self) -> bool {
            matches!(self.behavior, Behavior::Private)
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        events: Mutex<Vec<String>>,
    }

    impl RecordingHooks {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn record(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn count(&self, event: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.as_str() == event)
                .count()
        }

        fn filtered(&self, prefix: &str) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.starts_with(prefix))
                .cloned()
                .collect()
        }
    }

    impl ExecutorHooks for RecordingHooks {
        fn on_task_discovered(&self, _a: &TaskAddress, _t: &OnChainTask) {
            self.record("task_discovered");
        }
        fn on_task_claimed(&self, _a: &TaskAddress, _r: &ClaimReceipt) {
            self.record("task_claimed");
        }
        fn on_task_completed(&self, _a: &TaskAddress, _r: &CompletionReceipt) {
            self.record("task_completed");
        }
        fn on_claim_failed(&self, _e: &drover_executor::ExecutorError, _a: &TaskAddress) {
            self.record("claim_failed");
        }
        fn on_task_failed(&self, _e: &drover_executor::ExecutorError, _a: &TaskAddress) {
            self.record("task_failed");
        }
        fn on_submit_failed(&self, _e: &drover_executor::ExecutorError, _a: &TaskAddress) {
            self.record("submit_failed");
        }
        fn on_task_timeout(&self, _e: &drover_executor::ExecutorError, _a: &TaskAddress) {
            self.record("task_timeout");
        }
        fn on_claim_expiring(&self, _e: &drover_executor::ExecutorError, _a: &TaskAddress) {
            self.record("claim_expiring");
        }
        fn on_backpressure_activated(&self, _q: usize) {
            self.record("backpressure_activated");
        }
        fn on_backpressure_released(&self, _q: usize) {
            self.record("backpressure_released");
        }
        fn on_speculation_started(&self, _a: &TaskAddress, _d: u32) {
            self.record("speculation_started");
        }
        fn on_speculation_confirmed(&self, _a: &TaskAddress) {
            self.record("speculation_confirmed");
        }
        fn on_speculation_failed(&self, _a: &TaskAddress) {
            self.record("speculation_failed");
        }
        fn on_speculation_disabled(&self, reason: &str) {
            self.record(format!("speculation_disabled:{reason}"));
        }
        fn on_rollback_started(&self, _r: &TaskAddress, _reason: drover_executor::RollbackReason) {
            self.record("rollback_started");
        }
        fn on_rollback_completed(&self, _r: &drover_executor::RollbackResult) {
            self.record("rollback_completed");
        }
    }

    fn base_config() -> ExecutorConfig {
        ExecutorConfig {
            agent_address: B256::from([0x77; 32]),
            agent_id: "agent-under-test".to_string(),
            claim_expiry_buffer_ms: 0,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 50,
                jitter: false,
            },
            ..Default::default()
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    fn spawn_executor(exec: &Executor) -> tokio::task::JoinHandle<()> {
        let exec = exec.clone();
        tokio::spawn(async move {
            let _ = exec.start().await;
        })
    }

    fn init_tracing() {
        use std::sync::Once;
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init();
        });
    }

    async fn start_and_wait(exec: &Executor) -> tokio::task::JoinHandle<()> {
        init_tracing();
        let run = spawn_executor(exec);
        assert!(
            wait_until(
                || exec.is_running() && exec.discovery().is_running(),
                Duration::from_secs(2)
            )
            .await
        );
        run
    }

    // === scenarios ===

    #[tokio::test]
    async fn test_happy_path_public_completion() {
        let chain = MockChain::new();
        chain.insert_task(addr(1), open_task(1_000_000));
        let handler = TestHandler::public();
        let exec = Executor::new(base_config(), chain.clone(), handler).unwrap();
        let run = start_and_wait(&exec).await;

        exec.discovery()
            .publish(addr(1), open_task(1_000_000), drover_executor::DiscoveryOrigin::Manual);

        assert!(
            wait_until(
                || exec.metrics().tasks_completed == 1,
                Duration::from_secs(5)
            )
            .await
        );
        exec.stop().await;
        run.await.unwrap();

        let metrics = exec.metrics();
        assert_eq!(metrics.tasks_discovered, 1);
        assert_eq!(metrics.tasks_claimed, 1);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 0);
        // exactly one public completion, no private one
        assert_eq!(chain.count_calls(&ChainCall::Complete(addr(1))), 1);
        assert_eq!(chain.count_calls(&ChainCall::CompletePrivate(addr(1))), 0);
        // conservation: discovered = completed + failed once drained
        assert_eq!(
            metrics.tasks_discovered,
            metrics.tasks_completed + metrics.tasks_failed
        );
    }

    #[tokio::test]
    async fn test_private_result_routes_to_private_completion() {
        let chain = MockChain::new();
        chain.insert_task(addr(2), open_task(1_000_000));
        let handler = TestHandler::private();
        let exec = Executor::new(base_config(), chain.clone(), handler).unwrap();
        let run = start_and_wait(&exec).await;

        exec.discovery()
            .publish(addr(2), open_task(1_000_000), drover_executor::DiscoveryOrigin::Event);

        assert!(
            wait_until(
                || exec.metrics().tasks_completed == 1,
                Duration::from_secs(5)
            )
            .await
        );
        exec.stop().await;
        run.await.unwrap();

        assert_eq!(chain.count_calls(&ChainCall::CompletePrivate(addr(2))), 1);
        assert_eq!(chain.count_calls(&ChainCall::Complete(addr(2))), 0);
    }

    #[tokio::test]
    async fn test_claim_retries_transport_error_then_succeeds() {
        let chain = MockChain::new();
        chain.insert_task(addr(3), open_task(5));
        chain.script_claim_error(addr(3), ChainError::Transport("rpc flake".into()));
        let handler = TestHandler::public();
        let exec = Executor::new(base_config(), chain.clone(), handler).unwrap();
        let run = start_and_wait(&exec).await;

        exec.discovery()
            .publish(addr(3), open_task(5), drover_executor::DiscoveryOrigin::Manual);

        assert!(
            wait_until(
                || exec.metrics().tasks_completed == 1,
                Duration::from_secs(5)
            )
            .await
        );
        exec.stop().await;
        run.await.unwrap();

        let metrics = exec.metrics();
        assert_eq!(metrics.claim_retries, 1);
        assert_eq!(metrics.claims_failed, 0);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(chain.count_calls(&ChainCall::Claim(addr(3))), 2);
    }

    #[tokio::test]
    async fn test_program_verdicts_are_not_retried() {
        let chain = MockChain::new();
        chain.insert_task(addr(4), open_task(5));
        chain.script_claim_error(addr(4), ChainError::AlreadyClaimed);
        let handler = TestHandler::public();
        let hooks = RecordingHooks::new();
        let exec = Executor::new(base_config(), chain.clone(), handler).unwrap();
        exec.register_hooks(hooks.clone());
        let run = start_and_wait(&exec).await;

        exec.discovery()
            .publish(addr(4), open_task(5), drover_executor::DiscoveryOrigin::Manual);

        assert!(
            wait_until(|| exec.metrics().claims_failed == 1, Duration::from_secs(5)).await
        );
        exec.stop().await;
        run.await.unwrap();

        let metrics = exec.metrics();
        assert_eq!(chain.count_calls(&ChainCall::Claim(addr(4))), 1);
        assert_eq!(metrics.claim_retries, 0);
        assert_eq!(metrics.tasks_completed, 0);
        assert_eq!(hooks.count("claim_failed"), 1);
        assert_eq!(
            metrics.tasks_discovered,
            metrics.tasks_completed + metrics.tasks_failed
        );
    }

    #[tokio::test]
    async fn test_handler_error_fails_without_retry() {
        let chain = MockChain::new();
        chain.insert_task(addr(5), open_task(5));
        let handler = TestHandler::failing();
        let hooks = RecordingHooks::new();
        let exec = Executor::new(base_config(), chain.clone(), handler.clone()).unwrap();
        exec.register_hooks(hooks.clone());
        let run = start_and_wait(&exec).await;

        exec.discovery()
            .publish(addr(5), open_task(5), drover_executor::DiscoveryOrigin::Manual);

        assert!(
            wait_until(|| exec.metrics().tasks_failed == 1, Duration::from_secs(5)).await
        );
        exec.stop().await;
        run.await.unwrap();

        assert_eq!(handler.executions.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.count("task_failed"), 1);
        assert_eq!(chain.count_calls(&ChainCall::Complete(addr(5))), 0);
    }

    #[tokio::test]
    async fn test_task_timeout_aborts_hung_handler() {
        let chain = MockChain::new();
        chain.insert_task(addr(6), open_task(5));
        let handler = TestHandler::hanging();
        let hooks = RecordingHooks::new();
        let mut config = base_config();
        config.task_timeout_ms = 50;
        let exec = Executor::new(config, chain.clone(), handler.clone()).unwrap();
        exec.register_hooks(hooks.clone());
        let run = start_and_wait(&exec).await;

        exec.discovery()
            .publish(addr(6), open_task(5), drover_executor::DiscoveryOrigin::Manual);

        assert!(
            wait_until(|| exec.metrics().tasks_failed == 1, Duration::from_secs(5)).await
        );
        assert!(
            wait_until(
                || handler.observed_abort.load(Ordering::SeqCst),
                Duration::from_secs(2)
            )
            .await
        );
        exec.stop().await;
        run.await.unwrap();

        assert_eq!(hooks.count("task_timeout"), 1);
        assert_eq!(hooks.count("task_failed"), 1);
        assert_eq!(exec.metrics().tasks_failed, 1);
        assert_eq!(chain.count_calls(&ChainCall::Complete(addr(6))), 0);
    }

    #[tokio::test]
    async fn test_claim_deadline_aborts_mid_execution() {
        let chain = MockChain::new();
        let worker = B256::from([0x77; 32]);
        chain.insert_task(addr(7), open_task(5));
        chain.insert_claim(addr(7), worker, 1); // expires in 1s
        let handler = TestHandler::hanging();
        let hooks = RecordingHooks::new();
        let mut config = base_config();
        config.claim_expiry_buffer_ms = 500;
        let exec = Executor::new(config, chain.clone(), handler.clone()).unwrap();
        exec.register_hooks(hooks.clone());
        let run = start_and_wait(&exec).await;

        exec.discovery()
            .publish(addr(7), open_task(5), drover_executor::DiscoveryOrigin::Manual);

        // the monitor fires at expiry minus buffer, ~500ms in
        assert!(
            wait_until(
                || exec.metrics().claims_expired == 1,
                Duration::from_secs(3)
            )
            .await
        );
        exec.stop().await;
        run.await.unwrap();

        assert_eq!(hooks.count("claim_expiring"), 1);
        assert_eq!(exec.metrics().tasks_failed, 1);
        assert!(handler.observed_abort.load(Ordering::SeqCst));
        assert_eq!(chain.count_calls(&ChainCall::Complete(addr(7))), 0);
    }

    /// Chain P (external) <- R <- X <- Y. R, X and Y all execute
    /// speculatively, their proofs defer, then R's proof fails and the
    /// subtree rolls back.
    #[tokio::test]
    async fn test_speculative_rollback_cascade() {
        let chain = MockChain::new();
        let (p, r, x, y) = (addr(9), addr(10), addr(11), addr(12));
        for a in [r, x, y] {
            chain.insert_task(a, open_task(1_000_000));
        }
        let handler = TestHandler::public();
        let hooks = RecordingHooks::new();
        let mut config = base_config();
        config.max_concurrent_tasks = 3;
        config.speculation.max_depth = 5;
        let exec = Executor::new(config, chain.clone(), handler).unwrap();
        exec.register_hooks(hooks.clone());

        exec.register_dependency(p, None, DependencyType::None).unwrap();
        exec.register_dependency(r, Some(p), DependencyType::Data).unwrap();
        exec.register_dependency(x, Some(r), DependencyType::Data).unwrap();
        exec.register_dependency(y, Some(x), DependencyType::Data).unwrap();

        let run = start_and_wait(&exec).await;
        for a in [r, x, y] {
            exec.discovery()
                .publish(a, open_task(1_000_000), drover_executor::DiscoveryOrigin::Event);
        }

        // all three execute ahead of confirmation and defer their proofs
        assert!(
            wait_until(
                || exec.status().deferral.awaiting_ancestors == 3,
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(exec.speculation().metrics_snapshot().speculative_executions, 3);

        let result = exec.on_proof_failed(&r, Some("verifier rejected seal"));

        assert_eq!(result.root_address, r);
        assert!(result.affected_task_addresses.contains(&x));
        assert!(result.affected_task_addresses.contains(&y));
        assert_eq!(result.stake_released, 3_000_000);

        let ledger = exec.status().ledger;
        assert_eq!(ledger.rolled_back, 3);
        assert_eq!(ledger.total_stake_at_risk, 0);
        assert!(exec.speculation().blocked_proofs().is_empty());
        assert_eq!(hooks.count("rollback_completed"), 1);
        assert_eq!(exec.speculation().metrics_snapshot().speculative_misses, 1);

        // every unit left the pipeline as a failure
        let metrics = exec.metrics();
        assert_eq!(metrics.tasks_failed, 3);
        assert_eq!(
            metrics.tasks_discovered,
            metrics.tasks_completed + metrics.tasks_failed
        );

        exec.stop().await;
        run.await.unwrap();
    }

    /// Confirming the whole chain bottom-up releases each deferred
    /// proof in turn and counts hits.
    #[tokio::test]
    async fn test_speculative_chain_confirms_in_order() {
        let chain = MockChain::new();
        let (p, r, x) = (addr(13), addr(14), addr(15));
        for a in [r, x] {
            chain.insert_task(a, open_task(1_000));
        }
        let handler = TestHandler::public();
        let mut config = base_config();
        config.max_concurrent_tasks = 2;
        config.speculation.max_depth = 5;
        let exec = Executor::new(config, chain.clone(), handler).unwrap();

        exec.register_dependency(p, None, DependencyType::None).unwrap();
        exec.register_dependency(r, Some(p), DependencyType::Data).unwrap();
        exec.register_dependency(x, Some(r), DependencyType::Order).unwrap();

        let run = start_and_wait(&exec).await;
        for a in [r, x] {
            exec.discovery()
                .publish(a, open_task(1_000), drover_executor::DiscoveryOrigin::Event);
        }
        assert!(
            wait_until(
                || exec.status().deferral.awaiting_ancestors == 2,
                Duration::from_secs(5)
            )
            .await
        );

        // P confirms: R's proof gate empties and R submits
        exec.on_proof_confirmed(&p);
        assert!(
            wait_until(
                || chain.count_calls(&ChainCall::Complete(r)) == 1,
                Duration::from_secs(5)
            )
            .await
        );
        // X is still blocked on R
        assert_eq!(chain.count_calls(&ChainCall::Complete(x)), 0);

        // R confirms: X follows
        exec.on_proof_confirmed(&r);
        assert!(
            wait_until(
                || chain.count_calls(&ChainCall::Complete(x)) == 1,
                Duration::from_secs(5)
            )
            .await
        );
        exec.on_proof_confirmed(&x);

        assert!(
            wait_until(
                || exec.metrics().tasks_completed == 2,
                Duration::from_secs(5)
            )
            .await
        );
        let speculation = exec.speculation().metrics_snapshot();
        assert_eq!(speculation.speculative_hits, 2);
        assert_eq!(speculation.speculative_misses, 0);
        assert_eq!(speculation.hit_rate, 100.0);

        exec.stop().await;
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_backpressure_single_activation_cycle() {
        let chain = MockChain::new();
        for byte in 20u8..24 {
            chain.insert_task(addr(byte), open_task(5));
        }
        let handler = TestHandler::public_with_delay(100);
        let hooks = RecordingHooks::new();
        let mut config = base_config();
        config.max_concurrent_tasks = 1;
        config.backpressure = Some(BackpressureConfig {
            high_water_mark: 3,
            low_water_mark: 1,
            pause_discovery: true,
        });
        let exec = Executor::new(config, chain.clone(), handler).unwrap();
        exec.register_hooks(hooks.clone());
        let run = start_and_wait(&exec).await;

        for byte in 20u8..24 {
            exec.discovery()
                .publish(addr(byte), open_task(5), drover_executor::DiscoveryOrigin::Event);
        }

        assert!(
            wait_until(
                || exec.metrics().tasks_completed == 4,
                Duration::from_secs(10)
            )
            .await
        );
        exec.stop().await;
        run.await.unwrap();

        // exactly one edge in each direction, activation first
        assert_eq!(
            hooks.filtered("backpressure"),
            vec![
                "backpressure_activated".to_string(),
                "backpressure_released".to_string()
            ]
        );
        assert!(!exec.discovery().is_paused());
        assert!(!exec.is_backpressure_active());
    }

    #[tokio::test]
    async fn test_concurrency_cap_holds() {
        let chain = MockChain::new();
        for byte in 30u8..38 {
            chain.insert_task(addr(byte), open_task(5));
        }
        let handler = TestHandler::public_with_delay(50);
        let mut config = base_config();
        config.max_concurrent_tasks = 2;
        let exec = Executor::new(config, chain.clone(), handler.clone()).unwrap();
        let run = start_and_wait(&exec).await;

        for byte in 30u8..38 {
            exec.discovery()
                .publish(addr(byte), open_task(5), drover_executor::DiscoveryOrigin::Event);
        }

        assert!(
            wait_until(
                || exec.metrics().tasks_completed == 8,
                Duration::from_secs(10)
            )
            .await
        );
        exec.stop().await;
        run.await.unwrap();

        assert!(handler.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(exec.metrics().tasks_in_progress, 0);
    }

    #[tokio::test]
    async fn test_batch_mode_completes_and_skips_missing() {
        let chain = MockChain::new();
        let mut by_ids_task = open_task(9);
        by_ids_task.task_id = B256::from([0x42; 32]);
        chain.insert_task(addr(40), open_task(9));
        chain.insert_task(addr(41), by_ids_task.clone());
        let handler = TestHandler::public();
        let mut config = base_config();
        config.mode = ExecutorMode::Batch(vec![
            BatchItem::ByAddress(addr(40)),
            BatchItem::ByAddress(addr(99)), // unknown: skipped
            BatchItem::ByIds {
                creator: by_ids_task.creator,
                task_id: by_ids_task.task_id,
            },
        ]);
        let exec = Executor::new(config, chain.clone(), handler).unwrap();

        // batch start returns on its own once every item settles
        exec.start().await.unwrap();

        let metrics = exec.metrics();
        assert_eq!(metrics.tasks_discovered, 2);
        assert_eq!(metrics.tasks_completed, 2);
        assert_eq!(metrics.tasks_failed, 0);
        assert!(!exec.is_running());
    }

    #[tokio::test]
    async fn test_start_is_not_reentrant() {
        let chain = MockChain::new();
        let exec = Executor::new(base_config(), chain, TestHandler::public()).unwrap();
        let run = start_and_wait(&exec).await;

        let err = exec.start().await.unwrap_err();
        assert!(matches!(err, drover_executor::ExecutorError::AlreadyRunning));

        exec.stop().await;
        exec.stop().await; // idempotent
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_wakes_backoff_sleepers_promptly() {
        let chain = MockChain::new();
        chain.insert_task(addr(50), open_task(5));
        for _ in 0..3 {
            chain.script_claim_error(addr(50), ChainError::Transport("down".into()));
        }
        let mut config = base_config();
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            jitter: false,
        };
        let exec = Executor::new(config, chain.clone(), TestHandler::public()).unwrap();
        let run = start_and_wait(&exec).await;

        exec.discovery()
            .publish(addr(50), open_task(5), drover_executor::DiscoveryOrigin::Manual);
        assert!(
            wait_until(
                || chain.count_calls(&ChainCall::Claim(addr(50))) >= 1,
                Duration::from_secs(2)
            )
            .await
        );

        let started = std::time::Instant::now();
        exec.stop().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        run.await.unwrap();
    }

    // === speculation policy ===

    #[tokio::test]
    async fn test_denial_reasons_follow_policy_order() {
        let chain = MockChain::new();
        let exec = Executor::new(base_config(), chain, TestHandler::public()).unwrap();
        let scheduler = exec.speculation();

        // unknown task
        assert_eq!(
            scheduler.should_speculate(&addr(60), false, 800).denial_reason,
            Some(DenialReason::TaskNotFound)
        );

        exec.register_dependency(addr(61), None, DependencyType::None).unwrap();
        exec.register_dependency(addr(62), Some(addr(61)), DependencyType::Proof)
            .unwrap();
        assert_eq!(
            scheduler.should_speculate(&addr(62), false, 800).denial_reason,
            Some(DenialReason::DependencyTypeNotSpeculatable)
        );

        exec.register_dependency(addr(63), Some(addr(62)), DependencyType::Data)
            .unwrap();
        exec.register_dependency(addr(64), Some(addr(63)), DependencyType::Data)
            .unwrap();
        exec.register_dependency(addr(65), Some(addr(64)), DependencyType::Data)
            .unwrap();
        // depth 4 >= default max depth 3
        assert_eq!(
            scheduler.should_speculate(&addr(65), false, 800).denial_reason,
            Some(DenialReason::DepthLimit)
        );

        // private needs its own opt-in
        assert_eq!(
            scheduler.should_speculate(&addr(63), true, 800).denial_reason,
            Some(DenialReason::PrivateSpeculationDisabled)
        );

        // reputation floor (default 500)
        assert_eq!(
            scheduler.should_speculate(&addr(63), false, 499).denial_reason,
            Some(DenialReason::LowReputation)
        );

        // allowed when everything passes
        assert!(scheduler.should_speculate(&addr(63), false, 800).allowed);

        // manual disable wins over everything
        scheduler.disable("manual");
        assert_eq!(
            scheduler.should_speculate(&addr(63), false, 800).denial_reason,
            Some(DenialReason::Disabled)
        );
        scheduler.enable();
        assert!(scheduler.should_speculate(&addr(63), false, 800).allowed);
    }

    #[tokio::test]
    async fn test_stake_limit_denies_speculation() {
        let chain = MockChain::new();
        let mut config = base_config();
        config.speculation.max_stake = 0;
        let exec = Executor::new(config, chain, TestHandler::public()).unwrap();

        exec.register_dependency(addr(66), None, DependencyType::None).unwrap();
        exec.register_dependency(addr(67), Some(addr(66)), DependencyType::Data)
            .unwrap();
        assert_eq!(
            exec.speculation()
                .should_speculate(&addr(67), false, 800)
                .denial_reason,
            Some(DenialReason::StakeLimit)
        );
    }

    #[tokio::test]
    async fn test_rollback_rate_auto_disables_exactly_once() {
        let chain = MockChain::new();
        let parent = addr(70);
        let children: Vec<TaskAddress> = (71u8..76).map(addr).collect();
        for child in &children {
            chain.insert_task(*child, open_task(100));
        }
        let handler = TestHandler::public();
        let hooks = RecordingHooks::new();
        let mut config = base_config();
        config.max_concurrent_tasks = 5;
        let exec = Executor::new(config, chain.clone(), handler).unwrap();
        exec.register_hooks(hooks.clone());

        exec.register_dependency(parent, None, DependencyType::None).unwrap();
        for child in &children {
            exec.register_dependency(*child, Some(parent), DependencyType::Data)
                .unwrap();
        }

        let run = start_and_wait(&exec).await;
        for child in &children {
            exec.discovery()
                .publish(*child, open_task(100), drover_executor::DiscoveryOrigin::Event);
        }
        assert!(
            wait_until(
                || exec.status().deferral.awaiting_ancestors == 5,
                Duration::from_secs(5)
            )
            .await
        );

        // 1 miss out of 5: 20%, not above the 20% threshold
        exec.on_proof_failed(&children[0], None);
        assert!(exec.speculation().is_enabled());

        // 2 misses out of 5: 40%, trips the breaker
        exec.on_proof_failed(&children[1], None);
        assert!(!exec.speculation().is_enabled());
        assert_eq!(
            exec.speculation()
                .should_speculate(&children[2], false, 800)
                .denial_reason,
            Some(DenialReason::Disabled)
        );
        assert_eq!(hooks.count("speculation_disabled:rollback_rate_exceeded"), 1);

        // further misses do not re-emit the disable event
        exec.on_proof_failed(&children[2], None);
        assert_eq!(hooks.count("speculation_disabled:rollback_rate_exceeded"), 1);

        // re-enabling is an explicit operator action
        exec.speculation().enable();
        assert!(exec.speculation().is_enabled());

        exec.stop().await;
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_speculation_releases_without_miss() {
        let chain = MockChain::new();
        let (p, r) = (addr(80), addr(81));
        chain.insert_task(r, open_task(777));
        let exec = Executor::new(base_config(), chain.clone(), TestHandler::public()).unwrap();
        exec.register_dependency(p, None, DependencyType::None).unwrap();
        exec.register_dependency(r, Some(p), DependencyType::Data).unwrap();

        let run = start_and_wait(&exec).await;
        exec.discovery()
            .publish(r, open_task(777), drover_executor::DiscoveryOrigin::Event);
        assert!(
            wait_until(
                || exec.status().deferral.awaiting_ancestors == 1,
                Duration::from_secs(5)
            )
            .await
        );

        let result = exec.cancel_speculation(&r, CancelReason::CreatorCancelled);
        assert_eq!(result.cancelled_task_address, r);
        assert_eq!(result.cancelled_proofs, 1);
        assert_eq!(result.stake_released, 777);

        let speculation = exec.speculation().metrics_snapshot();
        assert_eq!(speculation.speculative_misses, 0);
        assert_eq!(exec.status().ledger.rolled_back, 1);

        exec.stop().await;
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_denied_speculation_parks_until_parent_confirms() {
        let chain = MockChain::new();
        let (p, r) = (addr(85), addr(86));
        chain.insert_task(r, open_task(5));
        let mut config = base_config();
        config.speculation.enabled = false;
        let exec = Executor::new(config, chain.clone(), TestHandler::public()).unwrap();
        exec.register_dependency(p, None, DependencyType::None).unwrap();
        exec.register_dependency(r, Some(p), DependencyType::Data).unwrap();

        let run = start_and_wait(&exec).await;
        exec.discovery()
            .publish(r, open_task(5), drover_executor::DiscoveryOrigin::Event);

        // the task parks instead of claiming or failing
        assert!(
            wait_until(|| exec.metrics().tasks_discovered == 1, Duration::from_secs(2)).await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(exec.metrics().tasks_claimed, 0);
        assert_eq!(exec.metrics().tasks_failed, 0);

        // parent confirms: the child re-enters and runs plainly
        exec.on_proof_confirmed(&p);
        assert!(
            wait_until(
                || exec.metrics().tasks_completed == 1,
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(exec.speculation().metrics_snapshot().speculative_executions, 0);

        exec.stop().await;
        run.await.unwrap();
    }
}
