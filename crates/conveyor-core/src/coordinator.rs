//! Trigger & launch coordinator.
//!
//! Correlates external trigger ids with internal executions, serializes
//! metadata creation behind a single fair lock, and hands accepted
//! executions to async pipeline workers. The lock covers only the store
//! calls that materialize instance and execution rows — job bodies run
//! outside it, concurrent without bound beyond the worker pool size.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conveyor_job::{
    ExecutionSummary, JobExecution, JobParameters, ParameterValue, TriggerRequest, TriggerResponse,
    BatchStatus, ExitCode, TIMESTAMP_KEY, TRIGGER_ID_KEY,
};
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::CoreError;
use crate::pipeline::PipelineRuntime;
use crate::publisher::EventPublisher;
use crate::registry::{JobDefinition, JobRegistry};
use crate::step::StepContext;
use crate::storage::ExecutionStore;

/// Page size used when scanning instances for a trigger-id correlation.
const LOOKUP_PAGE_SIZE: u32 = 100;

pub struct LaunchCoordinator {
    registry: Arc<JobRegistry>,
    store: Arc<dyn ExecutionStore>,
    runtime: Arc<PipelineRuntime>,
    config: Config,
    /// Fair (FIFO) lock guarding metadata creation against the store.
    metadata_lock: Mutex<()>,
    queue_depth: AtomicUsize,
    peak_queue_depth: AtomicUsize,
    trigger_count: AtomicU64,
    workers: Arc<Semaphore>,
    /// Step contexts of in-flight executions, for stop propagation.
    running: Arc<DashMap<i64, StepContext>>,
}

impl LaunchCoordinator {
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn ExecutionStore>,
        publisher: Arc<dyn EventPublisher>,
        config: Config,
    ) -> Arc<Self> {
        let runtime = Arc::new(PipelineRuntime::new(
            store.clone(),
            publisher,
            config.channels.clone(),
        ));
        Arc::new(Self {
            registry,
            store,
            runtime,
            workers: Arc::new(Semaphore::new(config.worker_count.max(1))),
            config,
            metadata_lock: Mutex::new(()),
            queue_depth: AtomicUsize::new(0),
            peak_queue_depth: AtomicUsize::new(0),
            trigger_count: AtomicU64::new(0),
            running: Arc::new(DashMap::new()),
        })
    }

    /// Launch a job. Returns the freshly materialized execution in
    /// `Starting` state as soon as its metadata is durable; the job
    /// body runs asynchronously on a worker.
    pub async fn trigger(
        &self,
        job_name: &str,
        trigger_id: &str,
        raw_params: &HashMap<String, String>,
    ) -> Result<JobExecution, CoreError> {
        if trigger_id.is_empty() {
            return Err(CoreError::InvalidTriggerId);
        }
        let definition = self
            .registry
            .lookup(job_name)
            .ok_or_else(|| CoreError::UnknownJob(job_name.to_string()))?;

        let params = self.build_parameters(&definition, trigger_id, raw_params)?;
        let execution = self.create_metadata_locked(&definition, &params).await?;

        self.trigger_count.fetch_add(1, Ordering::Relaxed);
        info!(
            execution_id = execution.id,
            job = %definition.name,
            trigger_id,
            "execution accepted"
        );

        self.submit(execution.clone(), definition);
        Ok(execution)
    }

    /// Scheduler-facing wrapper around [`Self::trigger`] producing the
    /// wire response instead of an error.
    pub async fn handle_trigger(&self, request: TriggerRequest) -> TriggerResponse {
        match self
            .trigger(&request.job_name, &request.trigger_id, &request.params)
            .await
        {
            Ok(execution) => TriggerResponse::accepted(&execution),
            Err(e) => TriggerResponse::rejected(request.job_name, request.trigger_id, e.to_string()),
        }
    }

    /// Cooperative stop: flips the persisted status to `Stopping` and
    /// signals the in-process cancel token. Returns false when the
    /// execution is unknown or already terminal.
    pub async fn stop(&self, execution_id: i64) -> Result<bool, CoreError> {
        let accepted = self.store.request_stop(execution_id).await?;
        if accepted {
            if let Some(ctx) = self.running.get(&execution_id) {
                ctx.request_stop();
            }
            info!(execution_id, "stop requested");
        }
        Ok(accepted)
    }

    /// Correlate an external trigger id with its execution by scanning
    /// recent instances of every registered job.
    pub async fn find_by_trigger_id(
        &self,
        trigger_id: &str,
    ) -> Result<Option<JobExecution>, CoreError> {
        for name in self.registry.names() {
            let instances = self
                .store
                .find_recent_instances(&name, 0, LOOKUP_PAGE_SIZE)
                .await?;
            for instance in instances {
                let executions = self.store.list_executions(instance.id).await?;
                if let Some(execution) = executions
                    .into_iter()
                    .find(|e| e.trigger_id() == Some(trigger_id))
                {
                    return Ok(Some(execution));
                }
            }
        }
        Ok(None)
    }

    /// Correlation lookup returning the wire summary.
    pub async fn lookup(&self, trigger_id: &str) -> Result<Option<ExecutionSummary>, CoreError> {
        Ok(self
            .find_by_trigger_id(trigger_id)
            .await?
            .map(|execution| ExecutionSummary::from(&execution)))
    }

    /// Transition a completed execution to `Processed` once the
    /// scheduler has consumed its results. Returns false for anything
    /// not currently in `Completed`.
    pub async fn mark_processed(&self, execution_id: i64) -> Result<bool, CoreError> {
        let Some(mut execution) = self.store.find_execution(execution_id).await? else {
            return Ok(false);
        };
        if execution.status != BatchStatus::Completed {
            return Ok(false);
        }
        execution.status = BatchStatus::Processed;
        self.store.update_execution(&execution).await?;
        info!(execution_id, "execution marked processed");
        Ok(true)
    }

    /// Startup recovery: mark every non-terminal execution left behind
    /// by a previous process as abandoned. Call before accepting
    /// triggers — running executions of this process would be swept up
    /// too.
    pub async fn recover_orphans(&self) -> Result<u64, CoreError> {
        let orphans = self.store.find_unfinished().await?;
        let mut recovered = 0;
        for mut execution in orphans {
            execution.status = BatchStatus::Abandoned;
            execution.exit_code = ExitCode::Unknown;
            execution.end_time = Some(Utc::now());
            self.store.update_execution(&execution).await?;
            warn!(
                execution_id = execution.id,
                job = %execution.job_name,
                "orphaned execution abandoned"
            );
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Callers currently blocked on the metadata lock.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// High-water mark of the metadata-lock queue.
    pub fn peak_queue_depth(&self) -> usize {
        self.peak_queue_depth.load(Ordering::Relaxed)
    }

    /// Executions accepted since startup.
    pub fn trigger_count(&self) -> u64 {
        self.trigger_count.load(Ordering::Relaxed)
    }

    /// Build the typed parameter set: injected identifying parameters
    /// first, then declared defaults, then caller values coerced to
    /// their declared types. Undeclared caller keys pass through as
    /// non-identifying strings.
    fn build_parameters(
        &self,
        definition: &JobDefinition,
        trigger_id: &str,
        raw_params: &HashMap<String, String>,
    ) -> Result<JobParameters, CoreError> {
        let mut params = JobParameters::new();
        params.insert(
            TRIGGER_ID_KEY,
            ParameterValue::String(trigger_id.to_string()),
            true,
        );
        params.insert(
            TIMESTAMP_KEY,
            ParameterValue::Long(Utc::now().timestamp_millis()),
            true,
        );

        for key in &definition.parameter_keys {
            if raw_params.contains_key(&key.name) || params.contains(&key.name) {
                continue;
            }
            if let Some(default) = &key.default {
                params.insert(&key.name, default.clone(), key.identifying);
            }
        }

        for (name, raw) in raw_params {
            if name == TRIGGER_ID_KEY || name == TIMESTAMP_KEY {
                continue;
            }
            match definition.parameter_key(name) {
                Some(key) => {
                    params.insert(name, key.ty.coerce(name, raw)?, key.identifying);
                }
                None => {
                    params.insert(name, ParameterValue::String(raw.clone()), false);
                }
            }
        }
        Ok(params)
    }

    /// The critical section: wait for the fair metadata lock (bounded),
    /// then find-or-create the instance and create the execution, with
    /// retries for transient storage faults. The lock is released
    /// before the job body is submitted.
    async fn create_metadata_locked(
        &self,
        definition: &JobDefinition,
        params: &JobParameters,
    ) -> Result<JobExecution, CoreError> {
        let depth = self.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_queue_depth.fetch_max(depth, Ordering::SeqCst);

        let wait = Duration::from_secs(self.config.queue_timeout_secs);
        let guard = match timeout(wait, self.metadata_lock.lock()).await {
            Ok(guard) => {
                self.queue_depth.fetch_sub(1, Ordering::SeqCst);
                guard
            }
            Err(_) => {
                self.queue_depth.fetch_sub(1, Ordering::SeqCst);
                warn!(job = %definition.name, "metadata lock wait timed out");
                return Err(CoreError::LockTimeout(self.config.queue_timeout_secs));
            }
        };

        let mut attempt = 0;
        let execution = loop {
            attempt += 1;
            match self.create_metadata(definition, params).await {
                Ok(execution) => break execution,
                Err(e) if e.is_retryable() && attempt < self.config.metadata_retry_attempts => {
                    let backoff = self.config.metadata_retry_backoff_ms * (1u64 << (attempt - 1));
                    let jitter = rand::thread_rng().gen_range(0..=backoff / 2 + 1);
                    warn!(
                        job = %definition.name,
                        attempt,
                        backoff_ms = backoff + jitter,
                        error = %e,
                        "metadata creation failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
                Err(e) => return Err(e),
            }
        };
        drop(guard);
        Ok(execution)
    }

    async fn create_metadata(
        &self,
        definition: &JobDefinition,
        params: &JobParameters,
    ) -> Result<JobExecution, CoreError> {
        let instance = self.store.create_instance(&definition.name, params).await?;
        self.store.create_execution(&instance, params).await
    }

    /// Hand the execution to an async worker. In-flight submissions are
    /// unbounded; actual concurrency is bounded by the worker pool.
    fn submit(&self, execution: JobExecution, definition: Arc<JobDefinition>) {
        let ctx = StepContext::new(
            execution.id,
            execution.job_name.as_str(),
            execution.context.clone(),
        );
        self.running.insert(execution.id, ctx.clone());

        let runtime = self.runtime.clone();
        let workers = self.workers.clone();
        let running = self.running.clone();
        tokio::spawn(async move {
            let execution_id = execution.id;
            // The semaphore is never closed, so acquire only fails if
            // the coordinator is torn down; nothing left to run then.
            if let Ok(_permit) = workers.acquire_owned().await {
                debug!(execution_id, "worker picked up execution");
                runtime.run(execution, definition, ctx).await;
            }
            running.remove(&execution_id);
        });
    }
}
