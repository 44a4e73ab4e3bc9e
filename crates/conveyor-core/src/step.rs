//! Step body trait and the per-execution runtime context handed to it.

use std::sync::Arc;

use async_trait::async_trait;
use conveyor_job::{ContextValue, ExecutionContext, JobParameters};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Read/write/skip counters reported by a finished step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub read: u64,
    pub write: u64,
    pub skip: u64,
}

impl StepCounts {
    pub fn new(read: u64, write: u64, skip: u64) -> Self {
        Self { read, write, skip }
    }
}

/// What a step body reports back to the runtime.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Finished(StepCounts),
    Failed(StepFailure),
}

impl StepOutcome {
    /// A finished step that moved no records.
    pub fn finished() -> Self {
        StepOutcome::Finished(StepCounts::default())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        StepOutcome::Failed(StepFailure {
            message: message.into(),
            detail: None,
        })
    }
}

/// Failure captured from a step body. `detail` carries a condensed
/// cause chain when one exists.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub message: String,
    pub detail: Option<String>,
}

impl StepFailure {
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut detail = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            detail.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            detail: if detail.is_empty() {
                None
            } else {
                Some(detail.join(": "))
            },
        }
    }
}

/// Runtime context shared with a step body: the execution's scratch
/// context plus the cooperative stop signal.
///
/// Step bodies are expected to poll [`StepContext::is_stopping`] at I/O
/// or chunk boundaries and return early; the runtime never interrupts a
/// running body.
#[derive(Clone)]
pub struct StepContext {
    execution_id: i64,
    job_name: String,
    context: Arc<RwLock<ExecutionContext>>,
    cancel: CancellationToken,
}

impl StepContext {
    pub fn new(execution_id: i64, job_name: impl Into<String>, context: ExecutionContext) -> Self {
        Self {
            execution_id,
            job_name: job_name.into(),
            context: Arc::new(RwLock::new(context)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn execution_id(&self) -> i64 {
        self.execution_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Whether a stop has been requested for this execution.
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal the cooperative stop to the running body.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn get(&self, key: &str) -> Option<ContextValue> {
        self.context.read().await.get(key).cloned()
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        self.context.read().await.get_string(key).map(str::to_string)
    }

    pub async fn get_long(&self, key: &str) -> Option<i64> {
        self.context.read().await.get_long(key)
    }

    pub async fn put(&self, key: impl Into<String>, value: ContextValue) {
        self.context.write().await.put(key, value);
    }

    pub async fn put_string(&self, key: impl Into<String>, value: impl Into<String>) {
        self.context.write().await.put_string(key, value);
    }

    pub async fn put_long(&self, key: impl Into<String>, value: i64) {
        self.context.write().await.put_long(key, value);
    }

    /// Snapshot of the context for persistence between steps.
    pub async fn snapshot(&self) -> ExecutionContext {
        self.context.read().await.clone()
    }
}

/// One step of a job: the unit the pipeline runtime drives.
#[async_trait]
pub trait StepBody: Send + Sync {
    /// Run the step. Long-running bodies should poll
    /// `ctx.is_stopping()` and return `Finished` early with the
    /// counters accumulated so far; the runtime resolves the stop at
    /// the step boundary.
    async fn execute(&self, params: &JobParameters, ctx: &StepContext) -> StepOutcome;
}
