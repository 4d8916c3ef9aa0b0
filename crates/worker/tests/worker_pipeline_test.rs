use async_trait::async_trait;
use chrono::Utc;
use executor::{ExecutionResult, ExecutionSpec, ExecutorError, FunctionRuntime};
use metadata::{
    ExecutionMetrics, ExecutionRequest, ExecutionStatus, Function, FunctionCode, FunctionConfig,
    Invocation, MemoryMetadataStore, MetadataError, MetadataStore, RuntimeKind, EXECUTION_QUEUE,
};
use queue::{MemoryQueue, Queue, DEAD_LETTER_REASON};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::{CodeStore, LocalCodeStore, StorageError};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use worker::{Worker, MAX_ATTEMPTS};

const POLL: Duration = Duration::from_millis(50);

/// Runtime that replays scripted outcomes and records the specs it saw.
#[derive(Default)]
struct ScriptedRuntime {
    outcomes: Mutex<Vec<Result<ExecutionResult, ExecutorError>>>,
    specs: Mutex<Vec<ExecutionSpec>>,
}

impl ScriptedRuntime {
    fn completing(stdout: &[u8]) -> Self {
        let runtime = Self::default();
        runtime.push(Ok(ExecutionResult::completed(
            stdout.to_vec(),
            ExecutionMetrics {
                duration: Duration::from_millis(7),
                ..Default::default()
            },
        )));
        runtime
    }

    fn push(&self, outcome: Result<ExecutionResult, ExecutorError>) {
        self.outcomes.lock().unwrap().push(outcome);
    }
}

#[async_trait]
impl FunctionRuntime for ScriptedRuntime {
    async fn execute(&self, spec: ExecutionSpec) -> executor::Result<ExecutionResult> {
        self.specs.lock().unwrap().push(spec);
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            // Default: keep completing.
            return Ok(ExecutionResult::completed(
                b"ok".to_vec(),
                ExecutionMetrics::default(),
            ));
        }
        outcomes.remove(0)
    }
}

/// Metadata store that fails the first `failures` terminal invocation writes
/// with a transient error, then behaves normally.
struct FlakyMetadataStore {
    inner: MemoryMetadataStore,
    terminal_failures_left: AtomicU32,
}

impl FlakyMetadataStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryMetadataStore::new(),
            terminal_failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl MetadataStore for FlakyMetadataStore {
    async fn create_function(&self, f: &Function) -> metadata::Result<()> {
        self.inner.create_function(f).await
    }
    async fn get_function(&self, id: &str) -> metadata::Result<Function> {
        self.inner.get_function(id).await
    }
    async fn get_function_by_name(&self, n: &str, v: &str) -> metadata::Result<Function> {
        self.inner.get_function_by_name(n, v).await
    }
    async fn update_function(&self, f: &Function) -> metadata::Result<()> {
        self.inner.update_function(f).await
    }
    async fn delete_function(&self, id: &str) -> metadata::Result<()> {
        self.inner.delete_function(id).await
    }
    async fn list_functions(
        &self,
        f: &metadata::FunctionFilter,
    ) -> metadata::Result<Vec<Function>> {
        self.inner.list_functions(f).await
    }
    async fn create_invocation(&self, i: &Invocation) -> metadata::Result<()> {
        self.inner.create_invocation(i).await
    }
    async fn get_invocation(&self, id: &str) -> metadata::Result<Invocation> {
        self.inner.get_invocation(id).await
    }
    async fn update_invocation(&self, i: &Invocation) -> metadata::Result<()> {
        if i.status.is_terminal() {
            let left = self.terminal_failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.terminal_failures_left.store(left - 1, Ordering::SeqCst);
                return Err(MetadataError::Internal("injected outage".to_string()));
            }
        }
        self.inner.update_invocation(i).await
    }
    async fn list_invocations(
        &self,
        f: &metadata::InvocationFilter,
    ) -> metadata::Result<Vec<Invocation>> {
        self.inner.list_invocations(f).await
    }
}

/// Code store whose reads always fail with an I/O error.
struct BrokenCodeStore;

#[async_trait]
impl CodeStore for BrokenCodeStore {
    async fn store(&self, _: &str, _: &[u8]) -> storage::Result<String> {
        Ok("unused".to_string())
    }
    async fn retrieve(&self, location: &str) -> storage::Result<Vec<u8>> {
        Err(StorageError::Io(std::io::Error::other(format!(
            "disk gone: {location}"
        ))))
    }
    async fn delete(&self, _: &str) -> storage::Result<()> {
        Ok(())
    }
}

struct Pipeline {
    queue: Arc<MemoryQueue>,
    store: Arc<dyn MetadataStore>,
    runtime: Arc<ScriptedRuntime>,
    worker: Worker,
    shutdown: CancellationToken,
    _code_dir: TempDir,
}

async fn pipeline_with(
    store: Arc<dyn MetadataStore>,
    code_store: Option<Arc<dyn CodeStore>>,
    runtime: Arc<ScriptedRuntime>,
) -> Pipeline {
    let queue = Arc::new(MemoryQueue::new());
    let code_dir = TempDir::new().unwrap();
    let code_store: Arc<dyn CodeStore> = match code_store {
        Some(cs) => cs,
        None => Arc::new(LocalCodeStore::new(code_dir.path()).await.unwrap()),
    };

    let shutdown = CancellationToken::new();
    let worker = Worker::new(
        "worker-test".to_string(),
        queue.clone(),
        store.clone(),
        code_store,
        runtime.clone(),
        POLL,
        shutdown.clone(),
    );

    Pipeline {
        queue,
        store,
        runtime,
        worker,
        shutdown,
        _code_dir: code_dir,
    }
}

/// Register a function whose blob lives in `code_store`, create a PENDING
/// invocation and enqueue the matching execution request.
async fn seed(
    pipeline: &Pipeline,
    code_store: Option<&LocalCodeStore>,
    code: &[u8],
) -> (Function, Invocation) {
    let now = Utc::now();
    let location = match code_store {
        Some(cs) => cs.store("fn-1", code).await.unwrap(),
        None => "fn-1/code".to_string(),
    };

    let function = Function {
        id: "fn-1".to_string(),
        name: "echo".to_string(),
        version: "1.0.0".to_string(),
        runtime: RuntimeKind::Python,
        handler: "main.handler".to_string(),
        code: FunctionCode {
            location,
            checksum: storage::sha256_hex(code),
            size: code.len() as i64,
        },
        config: FunctionConfig {
            timeout: Duration::from_secs(30),
            memory_mb: 128,
            concurrency: 1,
            environment: HashMap::new(),
        },
        metadata: HashMap::new(),
        created_at: now,
        updated_at: now,
    };
    pipeline.store.create_function(&function).await.unwrap();

    let invocation = Invocation {
        id: "inv-1".to_string(),
        function_id: function.id.clone(),
        payload: serde_json::json!("world"),
        headers: HashMap::new(),
        status: ExecutionStatus::Pending,
        result: None,
        error: None,
        metrics: None,
        created_at: now,
        started_at: None,
        completed_at: None,
    };
    pipeline.store.create_invocation(&invocation).await.unwrap();

    enqueue_request(pipeline, &invocation).await;
    (function, invocation)
}

async fn enqueue_request(pipeline: &Pipeline, invocation: &Invocation) {
    let request = ExecutionRequest {
        invocation_id: invocation.id.clone(),
        function_id: invocation.function_id.clone(),
        payload: invocation.payload.clone(),
        headers: HashMap::new(),
        timeout: None,
    };
    pipeline
        .queue
        .enqueue(
            EXECUTION_QUEUE,
            serde_json::to_vec(&request).unwrap(),
            HashMap::from([
                ("invocation_id".to_string(), invocation.id.clone()),
                ("function_id".to_string(), invocation.function_id.clone()),
            ]),
        )
        .await
        .unwrap();
}

async fn queue_stats(pipeline: &Pipeline) -> queue::QueueStats {
    pipeline.queue.stats(EXECUTION_QUEUE).await.unwrap()
}

#[tokio::test]
async fn happy_path_completes_the_invocation() {
    let store = Arc::new(MemoryMetadataStore::new());
    let runtime = Arc::new(ScriptedRuntime::completing(b"{\"hi\":\"world\"}"));
    let code_dir = TempDir::new().unwrap();
    let code_store = Arc::new(LocalCodeStore::new(code_dir.path()).await.unwrap());

    let pipeline = pipeline_with(store, Some(code_store.clone() as Arc<dyn CodeStore>), runtime).await;
    seed(&pipeline, Some(code_store.as_ref()), b"print('hi')").await;

    pipeline.worker.process_next().await.unwrap();

    let row = pipeline.store.get_invocation("inv-1").await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert_eq!(row.result.as_deref(), Some(b"{\"hi\":\"world\"}".as_slice()));
    assert!(row.started_at.is_some());
    assert!(row.completed_at.is_some());
    assert!(row.completed_at.unwrap() >= row.started_at.unwrap());
    assert!(row.metrics.unwrap().duration > Duration::ZERO);

    let stats = queue_stats(&pipeline).await;
    assert_eq!((stats.size, stats.processing, stats.dead_letter), (0, 0, 0));

    // The spec handed to the runtime carries the function contract.
    let specs = pipeline.runtime.specs.lock().unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].runtime, "python");
    assert_eq!(specs[0].payload, b"\"world\"");
    assert_eq!(specs[0].limits.memory_bytes, 128 * 1024 * 1024);
    assert_eq!(specs[0].timeout, Duration::from_secs(30));
}

#[tokio::test]
async fn unparseable_message_goes_straight_to_dead_letter() {
    let store = Arc::new(MemoryMetadataStore::new());
    let runtime = Arc::new(ScriptedRuntime::default());
    let pipeline = pipeline_with(store, None, runtime).await;

    pipeline
        .queue
        .enqueue(EXECUTION_QUEUE, b"not json".to_vec(), HashMap::new())
        .await
        .unwrap();

    pipeline.worker.process_next().await.unwrap();

    let stats = queue_stats(&pipeline).await;
    assert_eq!((stats.size, stats.processing, stats.dead_letter), (0, 0, 1));

    let parked = pipeline.queue.dead_letters(EXECUTION_QUEUE).await.unwrap();
    assert!(parked[0]
        .headers
        .get(DEAD_LETTER_REASON)
        .unwrap()
        .starts_with("invalid payload"));
    // Nothing executed.
    assert!(pipeline.runtime.specs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_function_fails_terminally_without_retry() {
    let store = Arc::new(MemoryMetadataStore::new());
    let runtime = Arc::new(ScriptedRuntime::default());
    let pipeline = pipeline_with(store, None, runtime).await;

    // Invocation exists, its function does not.
    let invocation = Invocation {
        id: "inv-1".to_string(),
        function_id: "ghost".to_string(),
        payload: serde_json::Value::Null,
        headers: HashMap::new(),
        status: ExecutionStatus::Pending,
        result: None,
        error: None,
        metrics: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    };
    pipeline.store.create_invocation(&invocation).await.unwrap();
    enqueue_request(&pipeline, &invocation).await;

    pipeline.worker.process_next().await.unwrap();

    let row = pipeline.store.get_invocation("inv-1").await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert_eq!(row.error.as_ref().unwrap().kind, "FunctionMissing");

    let stats = queue_stats(&pipeline).await;
    assert_eq!((stats.size, stats.processing, stats.dead_letter), (0, 0, 0));
}

#[tokio::test]
async fn checksum_mismatch_fails_terminally() {
    let store = Arc::new(MemoryMetadataStore::new());
    let runtime = Arc::new(ScriptedRuntime::default());
    let code_dir = TempDir::new().unwrap();
    let code_store = Arc::new(LocalCodeStore::new(code_dir.path()).await.unwrap());

    let pipeline = pipeline_with(store, Some(code_store.clone() as Arc<dyn CodeStore>), runtime).await;
    let (mut function, _) = seed(&pipeline, Some(code_store.as_ref()), b"print('hi')").await;

    // Corrupt the recorded checksum.
    function.code.checksum = "0".repeat(64);
    pipeline.store.update_function(&function).await.unwrap();

    pipeline.worker.process_next().await.unwrap();

    let row = pipeline.store.get_invocation("inv-1").await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert_eq!(row.error.as_ref().unwrap().kind, "CodeFetchFailed");
    assert!(pipeline.runtime.specs.lock().unwrap().is_empty());
    assert_eq!(queue_stats(&pipeline).await.dead_letter, 0);
}

#[tokio::test]
async fn transient_store_outage_retries_then_succeeds() {
    // First two terminal writes fail, the third lands.
    let store = Arc::new(FlakyMetadataStore::new(2));
    let runtime = Arc::new(ScriptedRuntime::default());
    let code_dir = TempDir::new().unwrap();
    let code_store = Arc::new(LocalCodeStore::new(code_dir.path()).await.unwrap());

    let pipeline =
        pipeline_with(store.clone(), Some(code_store.clone() as Arc<dyn CodeStore>), runtime).await;
    seed(&pipeline, Some(code_store.as_ref()), b"print('hi')").await;

    // Attempt 1 and 2: execution runs, terminal write fails, message nacked,
    // invocation stays RUNNING.
    for attempt in 1..=2u32 {
        pipeline.worker.process_next().await.unwrap();
        let row = pipeline.store.get_invocation("inv-1").await.unwrap();
        assert_eq!(row.status, ExecutionStatus::Running, "attempt {attempt}");
        let stats = queue_stats(&pipeline).await;
        assert_eq!((stats.size, stats.processing, stats.dead_letter), (1, 0, 0));
    }

    // Attempt 3 succeeds and acks.
    pipeline.worker.process_next().await.unwrap();

    let row = pipeline.store.get_invocation("inv-1").await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);

    let stats = queue_stats(&pipeline).await;
    assert_eq!((stats.size, stats.processing, stats.dead_letter), (0, 0, 0));

    // The execution ran once per attempt.
    assert_eq!(pipeline.runtime.specs.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn persistent_code_store_failure_exhausts_retries() {
    let store = Arc::new(MemoryMetadataStore::new());
    let runtime = Arc::new(ScriptedRuntime::default());
    let pipeline = pipeline_with(
        store,
        Some(Arc::new(BrokenCodeStore) as Arc<dyn CodeStore>),
        runtime,
    )
    .await;
    seed(&pipeline, None, b"print('hi')").await;

    for _ in 0..MAX_ATTEMPTS {
        pipeline.worker.process_next().await.unwrap();
    }

    let stats = queue_stats(&pipeline).await;
    assert_eq!((stats.size, stats.processing, stats.dead_letter), (0, 0, 1));

    let parked = pipeline.queue.dead_letters(EXECUTION_QUEUE).await.unwrap();
    assert!(parked[0]
        .headers
        .get(DEAD_LETTER_REASON)
        .unwrap()
        .contains("max retries exceeded"));
    assert_eq!(parked[0].attempts, MAX_ATTEMPTS);

    let row = pipeline.store.get_invocation("inv-1").await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert_eq!(row.error.as_ref().unwrap().kind, "RetryExhausted");
    assert!(row.completed_at.is_some());
}

#[tokio::test]
async fn structured_failure_is_terminal_and_acked() {
    let store = Arc::new(MemoryMetadataStore::new());
    let runtime = Arc::new(ScriptedRuntime::default());
    runtime.push(Ok(ExecutionResult::failed(
        metadata::ExecutionError::new("RuntimeError", "function exited with code 1")
            .with_stack("Traceback: boom"),
        ExecutionMetrics::default(),
    )));
    let code_dir = TempDir::new().unwrap();
    let code_store = Arc::new(LocalCodeStore::new(code_dir.path()).await.unwrap());

    let pipeline = pipeline_with(store, Some(code_store.clone() as Arc<dyn CodeStore>), runtime).await;
    seed(&pipeline, Some(code_store.as_ref()), b"import sys; sys.exit(1)").await;

    pipeline.worker.process_next().await.unwrap();

    let row = pipeline.store.get_invocation("inv-1").await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    let error = row.error.unwrap();
    assert_eq!(error.kind, "RuntimeError");
    assert!(error.message.contains("code 1"));
    assert_eq!(error.stack, "Traceback: boom");
    assert!(row.result.is_none());

    // Function failures never retry.
    let stats = queue_stats(&pipeline).await;
    assert_eq!((stats.size, stats.processing, stats.dead_letter), (0, 0, 0));
}

#[tokio::test]
async fn timeout_outcome_is_recorded_and_acked() {
    let store = Arc::new(MemoryMetadataStore::new());
    let runtime = Arc::new(ScriptedRuntime::default());
    runtime.push(Ok(ExecutionResult::timed_out(
        metadata::ExecutionError::new("TimeoutError", "execution timed out"),
        ExecutionMetrics {
            duration: Duration::from_secs(5),
            ..Default::default()
        },
    )));
    let code_dir = TempDir::new().unwrap();
    let code_store = Arc::new(LocalCodeStore::new(code_dir.path()).await.unwrap());

    let pipeline = pipeline_with(store, Some(code_store.clone() as Arc<dyn CodeStore>), runtime).await;
    seed(&pipeline, Some(code_store.as_ref()), b"import time; time.sleep(60)").await;

    pipeline.worker.process_next().await.unwrap();

    let row = pipeline.store.get_invocation("inv-1").await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Timeout);
    assert_eq!(row.error.as_ref().unwrap().kind, "TimeoutError");
    assert!(row.metrics.unwrap().duration >= Duration::from_secs(5));
    assert_eq!(queue_stats(&pipeline).await.dead_letter, 0);
}

#[tokio::test]
async fn duplicate_delivery_leaves_a_single_terminal_row() {
    let store = Arc::new(MemoryMetadataStore::new());
    let runtime = Arc::new(ScriptedRuntime::default());
    let code_dir = TempDir::new().unwrap();
    let code_store = Arc::new(LocalCodeStore::new(code_dir.path()).await.unwrap());

    let pipeline = pipeline_with(store, Some(code_store.clone() as Arc<dyn CodeStore>), runtime).await;
    let (_, invocation) = seed(&pipeline, Some(code_store.as_ref()), b"print('hi')").await;

    // The same request lands twice (crash between terminal write and ack on
    // some other worker).
    enqueue_request(&pipeline, &invocation).await;

    pipeline.worker.process_next().await.unwrap();
    let first = pipeline.store.get_invocation("inv-1").await.unwrap();

    pipeline.worker.process_next().await.unwrap();
    let second = pipeline.store.get_invocation("inv-1").await.unwrap();

    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(second.status, ExecutionStatus::Completed);
    // The original completion time survives the duplicate write.
    assert_eq!(first.completed_at, second.completed_at);

    let stats = queue_stats(&pipeline).await;
    assert_eq!((stats.size, stats.processing, stats.dead_letter), (0, 0, 0));
}

#[tokio::test]
async fn timeout_override_takes_precedence_over_function_config() {
    let store = Arc::new(MemoryMetadataStore::new());
    let runtime = Arc::new(ScriptedRuntime::default());
    let code_dir = TempDir::new().unwrap();
    let code_store = Arc::new(LocalCodeStore::new(code_dir.path()).await.unwrap());

    let pipeline = pipeline_with(store, Some(code_store.clone() as Arc<dyn CodeStore>), runtime).await;
    let (_, invocation) = seed(&pipeline, Some(code_store.as_ref()), b"print('hi')").await;

    // Drain the seeded request, then enqueue one with an override.
    let seeded = pipeline
        .queue
        .dequeue(EXECUTION_QUEUE, POLL)
        .await
        .unwrap()
        .unwrap();
    pipeline.queue.ack(&seeded).await.unwrap();

    let request = ExecutionRequest {
        invocation_id: invocation.id.clone(),
        function_id: invocation.function_id.clone(),
        payload: invocation.payload.clone(),
        headers: HashMap::new(),
        timeout: Some(Duration::from_secs(3)),
    };
    pipeline
        .queue
        .enqueue(
            EXECUTION_QUEUE,
            serde_json::to_vec(&request).unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();

    pipeline.worker.process_next().await.unwrap();

    let specs = pipeline.runtime.specs.lock().unwrap();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].timeout, Duration::from_secs(3));
}

#[tokio::test]
async fn run_loop_processes_until_shutdown() {
    let store = Arc::new(MemoryMetadataStore::new());
    let runtime = Arc::new(ScriptedRuntime::default());
    let code_dir = TempDir::new().unwrap();
    let code_store = Arc::new(LocalCodeStore::new(code_dir.path()).await.unwrap());

    let pipeline = pipeline_with(
        store,
        Some(code_store.clone() as Arc<dyn CodeStore>),
        runtime,
    )
    .await;
    seed(&pipeline, Some(code_store.as_ref()), b"print('hi')").await;

    let supervise = async {
        // Wait for the message to drain through the loop, then stop it.
        let mut settled = false;
        for _ in 0..100 {
            let row = pipeline.store.get_invocation("inv-1").await.unwrap();
            if row.status == ExecutionStatus::Completed {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Cooperative shutdown: the loop exits before the next dequeue.
        pipeline.shutdown.cancel();
        assert!(settled, "invocation never completed");
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(pipeline.worker.run(), supervise);
    })
    .await
    .expect("worker did not stop after shutdown");

    let stats = queue_stats(&pipeline).await;
    assert_eq!((stats.size, stats.processing, stats.dead_letter), (0, 0, 0));
}
