//! Integration tests for the coordination and execution engines.
//!
//! These drive the coordinator, pipeline runtime and streaming
//! aggregator end to end against the in-memory stores and the broadcast
//! publisher: happy path, step failure, cooperative stop, concurrent
//! trigger serialization, aggregation correctness and correlation
//! lookup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::{
    AggregationStore, BroadcastPublisher, Config, CoreError, ExecutionStore, JobDefinition,
    JobRegistry, LaunchCoordinator, MemoryAggregationStore, MemoryExecutionStore, StepBody,
    StepContext, StepCounts, StepOutcome, StreamingAggregator,
};
use conveyor_job::{
    AggregationType, BatchStatus, EventEnvelope, EventType, ExitCode, JobExecution, JobInstance,
    JobParameters, ParameterKey, ParameterType, StepExecution, WorkRecord,
};
use tokio::sync::broadcast::Receiver;
use tokio::sync::Notify;
use tokio::time::sleep;

// ============================================================================
// Helpers
// ============================================================================

struct Harness {
    coordinator: Arc<LaunchCoordinator>,
    store: Arc<MemoryExecutionStore>,
    publisher: Arc<BroadcastPublisher>,
}

fn test_config() -> Config {
    Config {
        queue_timeout_secs: 5,
        worker_count: 8,
        metadata_retry_backoff_ms: 10,
        ..Config::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Coordinator over fresh in-memory stores with a broadcast publisher.
fn harness(registry: JobRegistry) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryExecutionStore::new());
    let publisher = Arc::new(BroadcastPublisher::new(2048));
    let coordinator = LaunchCoordinator::new(
        Arc::new(registry),
        store.clone(),
        publisher.clone(),
        test_config(),
    );
    Harness {
        coordinator,
        store,
        publisher,
    }
}

fn harness_with_store(
    registry: JobRegistry,
    store: Arc<dyn ExecutionStore>,
    config: Config,
) -> (Arc<LaunchCoordinator>, Arc<BroadcastPublisher>) {
    init_tracing();
    let publisher = Arc::new(BroadcastPublisher::new(2048));
    let coordinator =
        LaunchCoordinator::new(Arc::new(registry), store, publisher.clone(), config);
    (coordinator, publisher)
}

/// A step that finishes with fixed counters.
struct CountStep {
    counts: StepCounts,
}

impl CountStep {
    fn new(read: u64, write: u64, skip: u64) -> Arc<Self> {
        Arc::new(Self {
            counts: StepCounts::new(read, write, skip),
        })
    }
}

#[async_trait]
impl StepBody for CountStep {
    async fn execute(&self, _params: &JobParameters, _ctx: &StepContext) -> StepOutcome {
        StepOutcome::Finished(self.counts)
    }
}

/// A step that always fails with the given message.
struct FailStep {
    message: String,
}

impl FailStep {
    fn new(message: &str) -> Arc<Self> {
        Arc::new(Self {
            message: message.to_string(),
        })
    }
}

#[async_trait]
impl StepBody for FailStep {
    async fn execute(&self, _params: &JobParameters, _ctx: &StepContext) -> StepOutcome {
        StepOutcome::failed(&self.message)
    }
}

/// A long step that signals once running and then polls the stop flag.
struct WaitForStopStep {
    started: Arc<Notify>,
}

#[async_trait]
impl StepBody for WaitForStopStep {
    async fn execute(&self, _params: &JobParameters, ctx: &StepContext) -> StepOutcome {
        self.started.notify_one();
        while !ctx.is_stopping() {
            sleep(Duration::from_millis(5)).await;
        }
        StepOutcome::finished()
    }
}

/// Wait until the execution reaches a terminal status.
async fn wait_for_terminal(store: &dyn ExecutionStore, execution_id: i64) -> JobExecution {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(execution) = store.find_execution(execution_id).await.unwrap() {
                if execution.status.is_terminal() {
                    return execution;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("execution did not reach a terminal status")
}

/// Collect published events until a terminal job event arrives.
async fn collect_until_terminal(
    rx: &mut Receiver<(String, EventEnvelope)>,
) -> Vec<(String, EventEnvelope)> {
    let mut events = Vec::new();
    loop {
        let (channel, event) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        let terminal = matches!(
            event.event_type,
            EventType::JobCompleted | EventType::JobFailed | EventType::JobStopped
        );
        events.push((channel, event));
        if terminal {
            return events;
        }
    }
}

fn steps_by_name(steps: &[StepExecution]) -> HashMap<String, StepExecution> {
    steps
        .iter()
        .map(|s| (s.step_name.clone(), s.clone()))
        .collect()
}

// ============================================================================
// Faulty store wrapper (latency + transient failures)
// ============================================================================

/// Delegating store that can slow down or transiently fail metadata
/// creation, for lock-contention and retry tests.
struct FaultyStore {
    inner: MemoryExecutionStore,
    create_delay: Duration,
    failures_remaining: AtomicU32,
}

impl FaultyStore {
    fn new(create_delay: Duration, failures: u32) -> Self {
        Self {
            inner: MemoryExecutionStore::new(),
            create_delay,
            failures_remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ExecutionStore for FaultyStore {
    async fn create_instance(
        &self,
        name: &str,
        params: &JobParameters,
    ) -> Result<JobInstance, CoreError> {
        if !self.create_delay.is_zero() {
            sleep(self.create_delay).await;
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::Storage("simulated transient fault".to_string()));
        }
        self.inner.create_instance(name, params).await
    }

    async fn create_execution(
        &self,
        instance: &JobInstance,
        params: &JobParameters,
    ) -> Result<JobExecution, CoreError> {
        self.inner.create_execution(instance, params).await
    }

    async fn update_execution(&self, execution: &JobExecution) -> Result<(), CoreError> {
        self.inner.update_execution(execution).await
    }

    async fn mark_started(&self, execution_id: i64) -> Result<JobExecution, CoreError> {
        self.inner.mark_started(execution_id).await
    }

    async fn request_stop(&self, execution_id: i64) -> Result<bool, CoreError> {
        self.inner.request_stop(execution_id).await
    }

    async fn create_step_execution(
        &self,
        execution_id: i64,
        step_name: &str,
        sequence: u32,
    ) -> Result<StepExecution, CoreError> {
        self.inner
            .create_step_execution(execution_id, step_name, sequence)
            .await
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), CoreError> {
        self.inner.update_step_execution(step).await
    }

    async fn find_execution(&self, execution_id: i64) -> Result<Option<JobExecution>, CoreError> {
        self.inner.find_execution(execution_id).await
    }

    async fn find_recent_instances(
        &self,
        name: &str,
        page: u32,
        size: u32,
    ) -> Result<Vec<JobInstance>, CoreError> {
        self.inner.find_recent_instances(name, page, size).await
    }

    async fn list_executions(&self, instance_id: i64) -> Result<Vec<JobExecution>, CoreError> {
        self.inner.list_executions(instance_id).await
    }

    async fn list_step_executions(
        &self,
        execution_id: i64,
    ) -> Result<Vec<StepExecution>, CoreError> {
        self.inner.list_step_executions(execution_id).await
    }

    async fn find_unfinished(&self) -> Result<Vec<JobExecution>, CoreError> {
        self.inner.find_unfinished().await
    }

    async fn count_by_status(&self) -> Result<Vec<(BatchStatus, u64)>, CoreError> {
        self.inner.count_by_status().await
    }
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_happy_path_events_and_persistence() {
    let mut registry = JobRegistry::new();
    registry
        .register(
            JobDefinition::new("two-step")
                .with_step("s1", CountStep::new(5, 4, 1))
                .with_step("s2", CountStep::new(10, 0, 0)),
        )
        .unwrap();
    let h = harness(registry);
    let mut rx = h.publisher.subscribe();

    let execution = h
        .coordinator
        .trigger("two-step", "T1", &HashMap::new())
        .await
        .unwrap();
    assert_eq!(execution.status, BatchStatus::Starting);
    assert_eq!(execution.trigger_id(), Some("T1"));

    let finished = wait_for_terminal(h.store.as_ref(), execution.id).await;
    assert_eq!(finished.status, BatchStatus::Completed);
    assert_eq!(finished.exit_code, ExitCode::Completed);
    assert!(finished.start_time.is_some());
    assert!(finished.end_time.is_some());

    let events = collect_until_terminal(&mut rx).await;
    let channels = Config::default().channels;
    assert_eq!(events.len(), 4);

    assert_eq!(events[0].1.event_type, EventType::JobStarted);
    assert_eq!(events[0].0, channels.started);

    assert_eq!(events[1].1.event_type, EventType::StepCompleted);
    assert_eq!(events[1].0, channels.progress);
    assert_eq!(events[1].1.step_name.as_deref(), Some("s1"));
    assert_eq!(events[1].1.progress, Some(50));

    assert_eq!(events[2].1.event_type, EventType::StepCompleted);
    assert_eq!(events[2].1.step_name.as_deref(), Some("s2"));
    assert_eq!(events[2].1.progress, Some(100));

    let terminal = &events[3];
    assert_eq!(terminal.1.event_type, EventType::JobCompleted);
    assert_eq!(terminal.0, channels.completed);
    assert_eq!(terminal.1.read_count, 15);
    assert_eq!(terminal.1.write_count, 4);
    assert_eq!(terminal.1.skip_count, 1);
    assert_eq!(terminal.1.step_count, 2);
    assert_eq!(terminal.1.trigger_id.as_deref(), Some("T1"));

    // Step executions persisted in definition order, all completed.
    let steps = h.store.list_step_executions(execution.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step_name, "s1");
    assert_eq!(steps[1].step_name, "s2");
    assert!(steps.iter().all(|s| s.status == BatchStatus::Completed));
}

#[tokio::test]
async fn test_execution_context_flows_between_steps() {
    struct WriteStep;
    struct ReadStep;

    #[async_trait]
    impl StepBody for WriteStep {
        async fn execute(&self, _params: &JobParameters, ctx: &StepContext) -> StepOutcome {
            ctx.put_string("handoff", "from-s1").await;
            ctx.put_long("staged", 12).await;
            StepOutcome::finished()
        }
    }

    #[async_trait]
    impl StepBody for ReadStep {
        async fn execute(&self, _params: &JobParameters, ctx: &StepContext) -> StepOutcome {
            match ctx.get_string("handoff").await.as_deref() {
                Some("from-s1") => StepOutcome::Finished(StepCounts::new(
                    ctx.get_long("staged").await.unwrap_or(0) as u64,
                    0,
                    0,
                )),
                _ => StepOutcome::failed("context entry missing"),
            }
        }
    }

    let mut registry = JobRegistry::new();
    registry
        .register(
            JobDefinition::new("context-job")
                .with_step("write", Arc::new(WriteStep))
                .with_step("read", Arc::new(ReadStep)),
        )
        .unwrap();
    let h = harness(registry);

    let execution = h
        .coordinator
        .trigger("context-job", "ctx-1", &HashMap::new())
        .await
        .unwrap();
    let finished = wait_for_terminal(h.store.as_ref(), execution.id).await;

    assert_eq!(finished.status, BatchStatus::Completed);
    // The persisted context carries what the steps wrote.
    assert_eq!(finished.context.get_string("handoff"), Some("from-s1"));
    assert_eq!(finished.context.get_long("staged"), Some(12));

    let steps = h.store.list_step_executions(execution.id).await.unwrap();
    assert_eq!(steps_by_name(&steps)["read"].read_count, 12);
}

#[tokio::test]
async fn test_parameter_defaults_and_coercion() {
    struct AssertParamsStep;

    #[async_trait]
    impl StepBody for AssertParamsStep {
        async fn execute(&self, params: &JobParameters, _ctx: &StepContext) -> StepOutcome {
            if params.get_long("chunkSize") != Some(500) {
                return StepOutcome::failed("chunkSize not coerced");
            }
            if params.get_bool("dryRun") != Some(false) {
                return StepOutcome::failed("dryRun default missing");
            }
            if params.get_string("note") != Some("ad-hoc") {
                return StepOutcome::failed("undeclared parameter dropped");
            }
            StepOutcome::finished()
        }
    }

    let mut registry = JobRegistry::new();
    registry
        .register(
            JobDefinition::new("typed-job")
                .with_parameter(ParameterKey::new("chunkSize", ParameterType::Long))
                .with_parameter(
                    ParameterKey::new("dryRun", ParameterType::Bool)
                        .with_default(conveyor_job::ParameterValue::Bool(false)),
                )
                .with_step("check", Arc::new(AssertParamsStep)),
        )
        .unwrap();
    let h = harness(registry);

    let mut raw = HashMap::new();
    raw.insert("chunkSize".to_string(), "500".to_string());
    raw.insert("note".to_string(), "ad-hoc".to_string());

    let execution = h
        .coordinator
        .trigger("typed-job", "p-1", &raw)
        .await
        .unwrap();
    let finished = wait_for_terminal(h.store.as_ref(), execution.id).await;
    assert_eq!(finished.status, BatchStatus::Completed);

    // Bad coercion is rejected synchronously, creating nothing.
    let mut bad = HashMap::new();
    bad.insert("chunkSize".to_string(), "many".to_string());
    let err = h
        .coordinator
        .trigger("typed-job", "p-2", &bad)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Job(_)));
    assert!(h.coordinator.find_by_trigger_id("p-2").await.unwrap().is_none());
}

// ============================================================================
// Step failure
// ============================================================================

#[tokio::test]
async fn test_step_failure_fails_execution() {
    let mut registry = JobRegistry::new();
    registry
        .register(
            JobDefinition::new("failing")
                .with_step("s1", CountStep::new(3, 3, 0))
                .with_step("s2", FailStep::new("boom"))
                .with_step("s3", CountStep::new(1, 1, 0)),
        )
        .unwrap();
    let h = harness(registry);
    let mut rx = h.publisher.subscribe();

    let execution = h
        .coordinator
        .trigger("failing", "F1", &HashMap::new())
        .await
        .unwrap();
    let finished = wait_for_terminal(h.store.as_ref(), execution.id).await;

    assert_eq!(finished.status, BatchStatus::Failed);
    assert_eq!(finished.exit_code, ExitCode::Failed);
    assert!(finished.exit_description.as_deref().unwrap().contains("boom"));

    let events = collect_until_terminal(&mut rx).await;
    let step_completed: Vec<_> = events
        .iter()
        .filter(|(_, e)| e.event_type == EventType::StepCompleted)
        .collect();
    assert_eq!(step_completed.len(), 1);

    let (channel, terminal) = events.last().unwrap();
    assert_eq!(terminal.event_type, EventType::JobFailed);
    assert_eq!(*channel, Config::default().channels.failed);

    // The remainder of the step list never ran.
    let steps = h.store.list_step_executions(execution.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[1].status, BatchStatus::Failed);
    assert!(steps[1]
        .failure_message
        .as_deref()
        .unwrap()
        .contains("boom"));
}

// ============================================================================
// Cooperative stop
// ============================================================================

#[tokio::test]
async fn test_stop_mid_execution() {
    let started = Arc::new(Notify::new());
    let mut registry = JobRegistry::new();
    registry
        .register(
            JobDefinition::new("stoppable")
                .with_step(
                    "long",
                    Arc::new(WaitForStopStep {
                        started: started.clone(),
                    }),
                )
                .with_step("after", CountStep::new(1, 1, 0)),
        )
        .unwrap();
    let h = harness(registry);
    let mut rx = h.publisher.subscribe();

    let execution = h
        .coordinator
        .trigger("stoppable", "S1", &HashMap::new())
        .await
        .unwrap();

    started.notified().await;
    assert!(h.coordinator.stop(execution.id).await.unwrap());

    let finished = wait_for_terminal(h.store.as_ref(), execution.id).await;
    assert_eq!(finished.status, BatchStatus::Stopped);
    assert_eq!(finished.exit_code, ExitCode::Stopped);

    // The finished step's event precedes the terminal stop event.
    let events = collect_until_terminal(&mut rx).await;
    let types: Vec<EventType> = events.iter().map(|(_, e)| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::JobStarted,
            EventType::StepCompleted,
            EventType::JobStopped
        ]
    );
    assert_eq!(events.last().unwrap().0, Config::default().channels.failed);

    // The step that never ran is recorded as abandoned.
    let steps = h.store.list_step_executions(execution.id).await.unwrap();
    let by_name = steps_by_name(&steps);
    assert_eq!(by_name["long"].status, BatchStatus::Completed);
    assert_eq!(by_name["after"].status, BatchStatus::Abandoned);

    // Idempotent stop: terminal executions refuse.
    assert!(!h.coordinator.stop(execution.id).await.unwrap());
}

#[tokio::test]
async fn test_stop_unknown_execution_returns_false() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("j").with_step("s", CountStep::new(0, 0, 0)))
        .unwrap();
    let h = harness(registry);
    assert!(!h.coordinator.stop(424242).await.unwrap());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_triggers_serialize_metadata() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("burst").with_step("s", CountStep::new(1, 0, 0)))
        .unwrap();

    let store = Arc::new(FaultyStore::new(Duration::from_millis(1), 0));
    let (coordinator, _publisher) = harness_with_store(
        registry,
        store.clone(),
        Config {
            queue_timeout_secs: 30,
            worker_count: 8,
            ..Config::default()
        },
    );

    let mut handles = Vec::new();
    for _ in 0..200 {
        let coordinator = coordinator.clone();
        let trigger_id = uuid::Uuid::new_v4().to_string();
        handles.push(tokio::spawn(async move {
            coordinator.trigger("burst", &trigger_id, &HashMap::new()).await
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        let execution = handle.await.unwrap().expect("trigger must not fail");
        ids.insert(execution.id);
    }
    assert_eq!(ids.len(), 200);
    assert_eq!(coordinator.trigger_count(), 200);

    // Contention happened, but the first acquirer never queued behind
    // the full batch.
    assert!(coordinator.peak_queue_depth() > 1);
    assert!(coordinator.peak_queue_depth() < 200);

    let finished = futures::future::join_all(
        ids.iter().map(|id| wait_for_terminal(store.as_ref(), *id)),
    )
    .await;
    assert!(finished.iter().all(|e| e.status == BatchStatus::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_timeout_fails_fast_and_creates_nothing() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("slow").with_step("s", CountStep::new(0, 0, 0)))
        .unwrap();

    let store = Arc::new(FaultyStore::new(Duration::from_millis(500), 0));
    let (coordinator, _publisher) = harness_with_store(
        registry,
        store.clone(),
        Config {
            queue_timeout_secs: 0,
            worker_count: 2,
            ..Config::default()
        },
    );

    let first = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.trigger("slow", "hold", &HashMap::new()).await })
    };
    // Let the first trigger take the lock and sit in its slow insert.
    sleep(Duration::from_millis(100)).await;

    let err = coordinator
        .trigger("slow", "late", &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::LockTimeout(0)));

    let held = first.await.unwrap().unwrap();
    wait_for_terminal(store.as_ref(), held.id).await;

    // Only the lock holder's execution exists.
    assert!(coordinator.find_by_trigger_id("late").await.unwrap().is_none());
    assert_eq!(coordinator.trigger_count(), 1);
}

#[tokio::test]
async fn test_metadata_creation_retries_transient_faults() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("flaky").with_step("s", CountStep::new(0, 0, 0)))
        .unwrap();

    let store = Arc::new(FaultyStore::new(Duration::ZERO, 2));
    let (coordinator, _publisher) =
        harness_with_store(registry, store.clone(), test_config());

    let execution = coordinator
        .trigger("flaky", "retry-1", &HashMap::new())
        .await
        .expect("third attempt should succeed");
    let finished = wait_for_terminal(store.as_ref(), execution.id).await;
    assert_eq!(finished.status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_retries_exhausted_surface_storage_failure() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("flaky").with_step("s", CountStep::new(0, 0, 0)))
        .unwrap();

    let store = Arc::new(FaultyStore::new(Duration::ZERO, 10));
    let (coordinator, _publisher) = harness_with_store(registry, store, test_config());

    let err = coordinator
        .trigger("flaky", "retry-2", &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Storage(_)));
}

// ============================================================================
// Resolution errors
// ============================================================================

#[tokio::test]
async fn test_unknown_job_is_rejected() {
    let h = harness(JobRegistry::new());

    let err = h
        .coordinator
        .trigger("missing", "T1", &HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::UnknownJob(_)));
    assert!(h.store.count_by_status().await.unwrap().is_empty());

    let response = h
        .coordinator
        .handle_trigger(conveyor_job::TriggerRequest {
            job_name: "missing".to_string(),
            trigger_id: "T1".to_string(),
            params: HashMap::new(),
        })
        .await;
    assert!(!response.success);
    assert!(response.execution_id.is_none());
    assert!(response.message.contains("missing"));
}

#[tokio::test]
async fn test_empty_trigger_id_is_rejected() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("j").with_step("s", CountStep::new(0, 0, 0)))
        .unwrap();
    let h = harness(registry);

    let err = h.coordinator.trigger("j", "", &HashMap::new()).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidTriggerId));
}

// ============================================================================
// Correlation lookup
// ============================================================================

#[tokio::test]
async fn test_find_by_trigger_id() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("a").with_step("s", CountStep::new(0, 0, 0)))
        .unwrap();
    registry
        .register(JobDefinition::new("b").with_step("s", CountStep::new(0, 0, 0)))
        .unwrap();
    let h = harness(registry);

    let execution = h.coordinator.trigger("b", "abc", &HashMap::new()).await.unwrap();

    let found = h.coordinator.find_by_trigger_id("abc").await.unwrap().unwrap();
    assert_eq!(found.id, execution.id);
    assert_eq!(found.job_name, "b");

    assert!(h.coordinator.find_by_trigger_id("nope").await.unwrap().is_none());

    let summary = h.coordinator.lookup("abc").await.unwrap().unwrap();
    assert_eq!(summary.execution_id, execution.id);
    assert_eq!(summary.trigger_id.as_deref(), Some("abc"));
}

#[tokio::test]
async fn test_same_trigger_id_yields_distinct_executions() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("j").with_step("s", CountStep::new(0, 0, 0)))
        .unwrap();
    let h = harness(registry);

    let first = h.coordinator.trigger("j", "dup", &HashMap::new()).await.unwrap();
    let second = h.coordinator.trigger("j", "dup", &HashMap::new()).await.unwrap();
    assert_ne!(first.id, second.id);
}

// ============================================================================
// Post-processing and recovery
// ============================================================================

#[tokio::test]
async fn test_mark_processed_transitions_completed_only() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("ok").with_step("s", CountStep::new(0, 0, 0)))
        .unwrap();
    registry
        .register(JobDefinition::new("bad").with_step("s", FailStep::new("nope")))
        .unwrap();
    let h = harness(registry);

    let ok = h.coordinator.trigger("ok", "m1", &HashMap::new()).await.unwrap();
    let bad = h.coordinator.trigger("bad", "m2", &HashMap::new()).await.unwrap();
    wait_for_terminal(h.store.as_ref(), ok.id).await;
    wait_for_terminal(h.store.as_ref(), bad.id).await;

    assert!(h.coordinator.mark_processed(ok.id).await.unwrap());
    let processed = h.store.find_execution(ok.id).await.unwrap().unwrap();
    assert_eq!(processed.status, BatchStatus::Processed);

    // Second call and failed executions both refuse.
    assert!(!h.coordinator.mark_processed(ok.id).await.unwrap());
    assert!(!h.coordinator.mark_processed(bad.id).await.unwrap());
    assert!(!h.coordinator.mark_processed(999).await.unwrap());
}

#[tokio::test]
async fn test_recover_orphans_abandons_unfinished() {
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("j").with_step("s", CountStep::new(0, 0, 0)))
        .unwrap();
    let h = harness(registry);

    // Simulate rows left behind by a crashed process.
    let params = JobParameters::new().with(
        conveyor_job::TRIGGER_ID_KEY,
        conveyor_job::ParameterValue::String("orphan".into()),
        true,
    );
    let instance = h.store.create_instance("j", &params).await.unwrap();
    let orphan = h.store.create_execution(&instance, &params).await.unwrap();

    assert_eq!(h.coordinator.recover_orphans().await.unwrap(), 1);
    let recovered = h.store.find_execution(orphan.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, BatchStatus::Abandoned);
    assert!(recovered.end_time.is_some());

    // Nothing left to recover.
    assert_eq!(h.coordinator.recover_orphans().await.unwrap(), 0);
}

// ============================================================================
// Streaming aggregation
// ============================================================================

fn synthetic_records(total: usize) -> Vec<Result<WorkRecord, conveyor_job::JobError>> {
    (0..total)
        .map(|i| {
            Ok(WorkRecord {
                department: format!("DEPT-{:02}", (i / 100) % 50),
                region: format!("REGION-{}", i % 10),
                status: ["ACTIVE", "LEAVE", "TERMINATED"][i % 3].to_string(),
                salary: 10_000.0 + (i % 100) as f64,
                hours_worked: 37.5,
                bonus: 250.0,
            })
        })
        .collect()
}

#[tokio::test]
async fn test_streaming_aggregation_end_to_end() {
    let total = 100_000usize;
    let store = Arc::new(MemoryAggregationStore::new());
    let aggregator = StreamingAggregator::new(store.clone(), 3, 5_000);

    let stats = aggregator
        .aggregate(42, synthetic_records(total))
        .await
        .unwrap();

    assert_eq!(stats.records_seen, total as u64);
    assert_eq!(stats.records_parsed, total as u64);
    assert_eq!(stats.flushes, 20);

    let departments = store
        .list_rows(42, AggregationType::ByDepartment)
        .await
        .unwrap();
    assert_eq!(departments.len(), 50);
    for row in &departments {
        assert_eq!(row.record_count, 2_000);
        assert_eq!(row.min_salary, 10_000.0);
        assert_eq!(row.max_salary, 10_099.0);
        assert!(row.min_salary <= row.max_salary);
    }

    let analytic: f64 = (0..total).map(|i| 10_000.0 + (i % 100) as f64).sum();
    let summed: f64 = departments.iter().map(|r| r.total_salary).sum();
    assert_eq!(summed, analytic);

    // Record counts are conserved across key families.
    assert_eq!(store.total_record_count(42).await.unwrap(), total as u64);
    let regions = store.list_rows(42, AggregationType::ByRegion).await.unwrap();
    let region_total: u64 = regions.iter().map(|r| r.record_count).sum();
    assert_eq!(region_total, total as u64);

    let composite = store
        .count_distinct_groups(42, AggregationType::ByDepartmentRegionStatus)
        .await
        .unwrap();
    assert!(composite <= 1_500);
}

#[tokio::test]
async fn test_aggregation_step_inside_pipeline() {
    struct AggregateStep {
        store: Arc<MemoryAggregationStore>,
    }

    #[async_trait]
    impl StepBody for AggregateStep {
        async fn execute(&self, _params: &JobParameters, ctx: &StepContext) -> StepOutcome {
            let aggregator = StreamingAggregator::new(self.store.clone(), 2, 16);
            match aggregator
                .aggregate(ctx.execution_id(), synthetic_records(100))
                .await
            {
                Ok(stats) => {
                    ctx.put_long("recordsProcessed", stats.records_parsed as i64).await;
                    StepOutcome::Finished(StepCounts::new(stats.records_seen, stats.records_parsed, 0))
                }
                Err(e) => StepOutcome::failed(e.to_string()),
            }
        }
    }

    let aggregation_store = Arc::new(MemoryAggregationStore::new());
    let mut registry = JobRegistry::new();
    registry
        .register(JobDefinition::new("aggregate-job").with_step(
            "reduce",
            Arc::new(AggregateStep {
                store: aggregation_store.clone(),
            }),
        ))
        .unwrap();
    let h = harness(registry);

    let execution = h
        .coordinator
        .trigger("aggregate-job", "agg-1", &HashMap::new())
        .await
        .unwrap();
    let finished = wait_for_terminal(h.store.as_ref(), execution.id).await;

    assert_eq!(finished.status, BatchStatus::Completed);
    assert_eq!(finished.context.get_long("recordsProcessed"), Some(100));
    assert_eq!(
        aggregation_store
            .total_record_count(execution.id)
            .await
            .unwrap(),
        100
    );

    // Bulk cleanup by execution.
    assert!(aggregation_store
        .delete_by_execution(execution.id)
        .await
        .unwrap()
        > 0);
    assert_eq!(
        aggregation_store
            .total_record_count(execution.id)
            .await
            .unwrap(),
        0
    );
}
