//! Step pipeline runtime.
//!
//! Drives one execution through its ordered step list: persists per-step
//! progress, publishes lifecycle events, honors the cooperative stop
//! signal at step boundaries and always leaves the execution in a
//! terminal state.

use std::sync::Arc;

use chrono::Utc;
use conveyor_job::{BatchStatus, EventEnvelope, EventType, ExitCode, JobExecution};
use tracing::{debug, error, info, warn};

use crate::config::ChannelConfig;
use crate::error::CoreError;
use crate::publisher::EventPublisher;
use crate::registry::JobDefinition;
use crate::step::{StepContext, StepCounts, StepFailure, StepOutcome};
use crate::storage::ExecutionStore;

/// Runs job executions handed over by the coordinator. One `run` call
/// owns its execution end to end; instances are shared across workers.
pub struct PipelineRuntime {
    store: Arc<dyn ExecutionStore>,
    publisher: Arc<dyn EventPublisher>,
    channels: ChannelConfig,
}

impl PipelineRuntime {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        publisher: Arc<dyn EventPublisher>,
        channels: ChannelConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            channels,
        }
    }

    /// Run the execution to a terminal state. Never panics or returns
    /// an error across the worker boundary; storage failures mid-run
    /// are converted into a failed execution as far as the store still
    /// allows.
    pub async fn run(&self, execution: JobExecution, definition: Arc<JobDefinition>, ctx: StepContext) {
        let execution_id = execution.id;
        if let Err(e) = self.run_inner(execution, &definition, &ctx).await {
            error!(execution_id, error = %e, "pipeline aborted");
            self.abort(execution_id, &definition, &e).await;
        }
    }

    async fn run_inner(
        &self,
        mut execution: JobExecution,
        definition: &JobDefinition,
        ctx: &StepContext,
    ) -> Result<(), CoreError> {
        let step_count = definition.step_count();

        // A stop may have arrived between trigger and worker start;
        // mark_started resolves that race in the store.
        execution = self.store.mark_started(execution.id).await?;
        if execution.status != BatchStatus::Started {
            if execution.status == BatchStatus::Stopping {
                self.abandon_remaining(&execution, definition, 0).await?;
                return self.finish(execution, definition, Terminal::Stopped, ctx).await;
            }
            debug!(
                execution_id = execution.id,
                status = execution.status.as_str(),
                "execution no longer startable"
            );
            return Ok(());
        }

        info!(
            execution_id = execution.id,
            job = %execution.job_name,
            steps = step_count,
            "job started"
        );
        self.publish(EventEnvelope::for_execution(
            EventType::JobStarted,
            &execution,
            step_count,
        ))
        .await;

        let mut failure: Option<StepFailure> = None;
        let mut stopped = false;

        for (index, step) in definition.steps.iter().enumerate() {
            if self.stop_requested(&execution, ctx).await? {
                self.abandon_remaining(&execution, definition, index).await?;
                stopped = true;
                break;
            }

            let mut step_execution = self
                .store
                .create_step_execution(execution.id, &step.name, index as u32)
                .await?;

            debug!(
                execution_id = execution.id,
                step = %step.name,
                "executing step"
            );

            match step.body.execute(&execution.parameters, ctx).await {
                StepOutcome::Finished(counts) => {
                    step_execution.end_time = Some(Utc::now());
                    step_execution.status = BatchStatus::Completed;
                    step_execution.exit_code = ExitCode::Completed;
                    step_execution.read_count = counts.read;
                    step_execution.write_count = counts.write;
                    step_execution.skip_count = counts.skip;
                    self.store.update_step_execution(&step_execution).await?;

                    let progress = ((index as u32 + 1) * 100) / step_count;
                    self.publish(
                        EventEnvelope::for_execution(
                            EventType::StepCompleted,
                            &execution,
                            step_count,
                        )
                        .with_step(&step.name, progress)
                        .with_counts(counts.read, counts.write, counts.skip),
                    )
                    .await;
                }
                StepOutcome::Failed(step_failure) => {
                    warn!(
                        execution_id = execution.id,
                        step = %step.name,
                        error = %step_failure.message,
                        "step failed"
                    );
                    step_execution.end_time = Some(Utc::now());
                    step_execution.status = BatchStatus::Failed;
                    step_execution.exit_code = ExitCode::Failed;
                    step_execution.failure_message = Some(match &step_failure.detail {
                        Some(detail) => format!("{}: {}", step_failure.message, detail),
                        None => step_failure.message.clone(),
                    });
                    self.store.update_step_execution(&step_execution).await?;

                    failure = Some(step_failure);
                    break;
                }
            }
        }

        let terminal = match (&failure, stopped) {
            (Some(f), _) => Terminal::Failed(f.message.clone()),
            (None, true) => Terminal::Stopped,
            (None, false) => Terminal::Completed,
        };
        self.finish(execution, definition, terminal, ctx).await
    }

    /// Re-read the stop flag at a step boundary. The in-process token
    /// is checked first; the persisted status covers stops requested
    /// through a store that outlives this process.
    async fn stop_requested(
        &self,
        execution: &JobExecution,
        ctx: &StepContext,
    ) -> Result<bool, CoreError> {
        if ctx.is_stopping() {
            return Ok(true);
        }
        let current = self
            .store
            .find_execution(execution.id)
            .await?
            .ok_or(CoreError::ExecutionNotFound(execution.id))?;
        Ok(current.status == BatchStatus::Stopping)
    }

    /// Record the steps that will never run as abandoned.
    async fn abandon_remaining(
        &self,
        execution: &JobExecution,
        definition: &JobDefinition,
        from_index: usize,
    ) -> Result<(), CoreError> {
        for (index, step) in definition.steps.iter().enumerate().skip(from_index) {
            let mut step_execution = self
                .store
                .create_step_execution(execution.id, &step.name, index as u32)
                .await?;
            step_execution.status = BatchStatus::Abandoned;
            step_execution.start_time = None;
            self.store.update_step_execution(&step_execution).await?;
        }
        Ok(())
    }

    async fn finish(
        &self,
        mut execution: JobExecution,
        definition: &JobDefinition,
        terminal: Terminal,
        ctx: &StepContext,
    ) -> Result<(), CoreError> {
        let (status, exit_code, event_type) = match &terminal {
            Terminal::Completed => (
                BatchStatus::Completed,
                ExitCode::Completed,
                EventType::JobCompleted,
            ),
            Terminal::Failed(_) => (BatchStatus::Failed, ExitCode::Failed, EventType::JobFailed),
            Terminal::Stopped => (BatchStatus::Stopped, ExitCode::Stopped, EventType::JobStopped),
        };

        execution.status = status;
        execution.exit_code = exit_code;
        execution.exit_description = match terminal {
            Terminal::Failed(message) => Some(message),
            _ => None,
        };
        execution.end_time = Some(Utc::now());
        execution.context = ctx.snapshot().await;
        self.store.update_execution(&execution).await?;

        let totals = self.sum_counters(execution.id).await?;
        info!(
            execution_id = execution.id,
            job = %execution.job_name,
            status = execution.status.as_str(),
            read = totals.read,
            write = totals.write,
            skip = totals.skip,
            "job finished"
        );
        self.publish(
            EventEnvelope::for_execution(event_type, &execution, definition.step_count())
                .with_counts(totals.read, totals.write, totals.skip),
        )
        .await;
        Ok(())
    }

    /// Aggregate read/write/skip counters over all step executions.
    async fn sum_counters(&self, execution_id: i64) -> Result<StepCounts, CoreError> {
        let steps = self.store.list_step_executions(execution_id).await?;
        Ok(steps.iter().fold(StepCounts::default(), |acc, step| {
            StepCounts::new(
                acc.read + step.read_count,
                acc.write + step.write_count,
                acc.skip + step.skip_count,
            )
        }))
    }

    /// Best-effort terminal marking after an unrecoverable storage
    /// fault; the store may itself be the broken part, so every call
    /// here tolerates failure.
    async fn abort(&self, execution_id: i64, definition: &JobDefinition, cause: &CoreError) {
        let Ok(Some(mut execution)) = self.store.find_execution(execution_id).await else {
            return;
        };
        if execution.status.is_terminal() {
            return;
        }
        execution.status = BatchStatus::Failed;
        execution.exit_code = ExitCode::Failed;
        execution.exit_description = Some(cause.to_string());
        execution.end_time = Some(Utc::now());
        if self.store.update_execution(&execution).await.is_err() {
            warn!(execution_id, "could not persist aborted execution");
            return;
        }
        self.publish(EventEnvelope::for_execution(
            EventType::JobFailed,
            &execution,
            definition.step_count(),
        ))
        .await;
    }

    async fn publish(&self, event: EventEnvelope) {
        let channel = self.channels.channel_for(event.event_type);
        self.publisher.publish(channel, &event).await;
    }
}

enum Terminal {
    Completed,
    Failed(String),
    Stopped,
}
