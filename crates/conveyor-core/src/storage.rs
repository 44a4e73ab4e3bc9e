//! Storage contracts for execution metadata and aggregation rows, with
//! in-memory implementations for tests and development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use conveyor_job::{
    AggregateDelta, AggregationRow, AggregationType, BatchStatus, ExitCode, JobExecution,
    JobInstance, JobParameters, StepExecution,
};
use tokio::sync::RwLock;

use crate::error::CoreError;

/// Durable record of job instances, executions and step executions.
///
/// Concurrent writers target *different* executions; rows of a single
/// execution are only ever written by its one pipeline worker (plus the
/// atomic `request_stop` transition).
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Find or create the instance for this job name and identifying
    /// parameter set.
    async fn create_instance(
        &self,
        name: &str,
        params: &JobParameters,
    ) -> Result<JobInstance, CoreError>;

    /// Create a new execution in `Starting` state with a fresh id.
    async fn create_execution(
        &self,
        instance: &JobInstance,
        params: &JobParameters,
    ) -> Result<JobExecution, CoreError>;

    /// Persist status, times, exit status and execution context.
    /// Illegal status transitions (per [`BatchStatus::can_transition_to`])
    /// are rejected.
    async fn update_execution(&self, execution: &JobExecution) -> Result<(), CoreError>;

    /// Atomically move `Starting -> Started` and stamp the start time.
    /// Returns the stored execution afterwards, whatever its status —
    /// the caller inspects it to learn whether a stop raced the start.
    async fn mark_started(&self, execution_id: i64) -> Result<JobExecution, CoreError>;

    /// Atomically move a running execution to `Stopping`. Returns false
    /// when the execution is missing or already terminal.
    async fn request_stop(&self, execution_id: i64) -> Result<bool, CoreError>;

    /// Append a step execution in `Started` state.
    async fn create_step_execution(
        &self,
        execution_id: i64,
        step_name: &str,
        sequence: u32,
    ) -> Result<StepExecution, CoreError>;

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), CoreError>;

    async fn find_execution(&self, execution_id: i64) -> Result<Option<JobExecution>, CoreError>;

    /// Most recent instances of a job, newest first.
    async fn find_recent_instances(
        &self,
        name: &str,
        page: u32,
        size: u32,
    ) -> Result<Vec<JobInstance>, CoreError>;

    async fn list_executions(&self, instance_id: i64) -> Result<Vec<JobExecution>, CoreError>;

    async fn list_step_executions(
        &self,
        execution_id: i64,
    ) -> Result<Vec<StepExecution>, CoreError>;

    /// Executions not yet in a terminal state (crash-recovery sweep).
    async fn find_unfinished(&self) -> Result<Vec<JobExecution>, CoreError>;

    /// Execution counts per status, for operators.
    async fn count_by_status(&self) -> Result<Vec<(BatchStatus, u64)>, CoreError>;
}

/// Upsert-capable keyed table of aggregate rows.
#[async_trait]
pub trait AggregationStore: Send + Sync {
    /// Atomic insert-or-merge keyed on
    /// `(executionId, aggregationType, groupKey)`: counts and totals
    /// add, min/max fold. Re-flushing the same delta is not idempotent,
    /// so callers must clear buffers after a flush.
    async fn upsert_batch(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
        group_key: &str,
        delta: &AggregateDelta,
    ) -> Result<(), CoreError>;

    async fn count_distinct_groups(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
    ) -> Result<u64, CoreError>;

    /// Total records observed for an execution, summed over the
    /// canonical `BY_DEPARTMENT` family.
    async fn total_record_count(&self, execution_id: i64) -> Result<u64, CoreError>;

    async fn list_rows(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
    ) -> Result<Vec<AggregationRow>, CoreError>;

    /// Bulk cleanup; returns the number of rows removed.
    async fn delete_by_execution(&self, execution_id: i64) -> Result<u64, CoreError>;
}

// =============================================================================
// In-memory execution store
// =============================================================================

#[derive(Default)]
struct MemoryExecutionState {
    instances: HashMap<i64, JobInstance>,
    instance_index: HashMap<(String, String), i64>,
    executions: HashMap<i64, JobExecution>,
    executions_by_instance: HashMap<i64, Vec<i64>>,
    steps: HashMap<i64, StepExecution>,
    steps_by_execution: HashMap<i64, Vec<i64>>,
}

/// In-memory execution store (for testing and development).
pub struct MemoryExecutionStore {
    state: Arc<RwLock<MemoryExecutionState>>,
    next_instance_id: AtomicI64,
    next_execution_id: AtomicI64,
    next_step_id: AtomicI64,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryExecutionState::default())),
            next_instance_id: AtomicI64::new(1),
            next_execution_id: AtomicI64::new(1),
            next_step_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create_instance(
        &self,
        name: &str,
        params: &JobParameters,
    ) -> Result<JobInstance, CoreError> {
        let key = params.instance_key();
        let mut state = self.state.write().await;

        if let Some(id) = state.instance_index.get(&(name.to_string(), key.clone())) {
            return Ok(state.instances[id].clone());
        }

        let instance = JobInstance {
            id: self.next_instance_id.fetch_add(1, Ordering::SeqCst),
            job_name: name.to_string(),
            instance_key: key.clone(),
            created_at: Utc::now(),
        };
        state
            .instance_index
            .insert((name.to_string(), key), instance.id);
        state.instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn create_execution(
        &self,
        instance: &JobInstance,
        params: &JobParameters,
    ) -> Result<JobExecution, CoreError> {
        let execution = JobExecution {
            id: self.next_execution_id.fetch_add(1, Ordering::SeqCst),
            instance_id: instance.id,
            job_name: instance.job_name.clone(),
            status: BatchStatus::Starting,
            exit_code: ExitCode::Unknown,
            exit_description: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            parameters: params.clone(),
            context: Default::default(),
        };

        let mut state = self.state.write().await;
        state
            .executions_by_instance
            .entry(instance.id)
            .or_default()
            .push(execution.id);
        state.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn update_execution(&self, execution: &JobExecution) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .executions
            .get_mut(&execution.id)
            .ok_or(CoreError::ExecutionNotFound(execution.id))?;

        if !stored.status.can_transition_to(execution.status) {
            return Err(CoreError::Job(conveyor_job::JobError::InvalidTransition {
                from: stored.status.as_str().to_string(),
                to: execution.status.as_str().to_string(),
            }));
        }
        *stored = execution.clone();
        Ok(())
    }

    async fn mark_started(&self, execution_id: i64) -> Result<JobExecution, CoreError> {
        let mut state = self.state.write().await;
        let stored = state
            .executions
            .get_mut(&execution_id)
            .ok_or(CoreError::ExecutionNotFound(execution_id))?;

        if stored.status == BatchStatus::Starting {
            stored.status = BatchStatus::Started;
            stored.start_time = Some(Utc::now());
        }
        Ok(stored.clone())
    }

    async fn request_stop(&self, execution_id: i64) -> Result<bool, CoreError> {
        let mut state = self.state.write().await;
        let Some(stored) = state.executions.get_mut(&execution_id) else {
            return Ok(false);
        };
        if !stored.status.is_running() {
            return Ok(false);
        }
        stored.status = BatchStatus::Stopping;
        Ok(true)
    }

    async fn create_step_execution(
        &self,
        execution_id: i64,
        step_name: &str,
        sequence: u32,
    ) -> Result<StepExecution, CoreError> {
        let step = StepExecution {
            id: self.next_step_id.fetch_add(1, Ordering::SeqCst),
            execution_id,
            step_name: step_name.to_string(),
            status: BatchStatus::Started,
            exit_code: ExitCode::Unknown,
            failure_message: None,
            start_time: Some(Utc::now()),
            end_time: None,
            read_count: 0,
            write_count: 0,
            skip_count: 0,
            sequence,
        };

        let mut state = self.state.write().await;
        if !state.executions.contains_key(&execution_id) {
            return Err(CoreError::ExecutionNotFound(execution_id));
        }
        state
            .steps_by_execution
            .entry(execution_id)
            .or_default()
            .push(step.id);
        state.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        match state.steps.get_mut(&step.id) {
            Some(stored) => {
                *stored = step.clone();
                Ok(())
            }
            None => Err(CoreError::Storage(format!(
                "step execution {} not found",
                step.id
            ))),
        }
    }

    async fn find_execution(&self, execution_id: i64) -> Result<Option<JobExecution>, CoreError> {
        Ok(self.state.read().await.executions.get(&execution_id).cloned())
    }

    async fn find_recent_instances(
        &self,
        name: &str,
        page: u32,
        size: u32,
    ) -> Result<Vec<JobInstance>, CoreError> {
        let state = self.state.read().await;
        let mut instances: Vec<JobInstance> = state
            .instances
            .values()
            .filter(|i| i.job_name == name)
            .cloned()
            .collect();
        instances.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(instances
            .into_iter()
            .skip((page * size) as usize)
            .take(size as usize)
            .collect())
    }

    async fn list_executions(&self, instance_id: i64) -> Result<Vec<JobExecution>, CoreError> {
        let state = self.state.read().await;
        let ids = state
            .executions_by_instance
            .get(&instance_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.executions.get(&id).cloned())
            .collect())
    }

    async fn list_step_executions(
        &self,
        execution_id: i64,
    ) -> Result<Vec<StepExecution>, CoreError> {
        let state = self.state.read().await;
        let ids = state
            .steps_by_execution
            .get(&execution_id)
            .cloned()
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.steps.get(&id).cloned())
            .collect())
    }

    async fn find_unfinished(&self) -> Result<Vec<JobExecution>, CoreError> {
        let state = self.state.read().await;
        Ok(state
            .executions
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn count_by_status(&self) -> Result<Vec<(BatchStatus, u64)>, CoreError> {
        let state = self.state.read().await;
        let mut counts: HashMap<BatchStatus, u64> = HashMap::new();
        for execution in state.executions.values() {
            *counts.entry(execution.status).or_default() += 1;
        }
        let mut result: Vec<(BatchStatus, u64)> = counts.into_iter().collect();
        result.sort_by_key(|(status, _)| status.as_str());
        Ok(result)
    }
}

// =============================================================================
// In-memory aggregation store
// =============================================================================

type GroupKey = (i64, AggregationType, String);

/// In-memory aggregation store with the same insert-or-merge semantics
/// as the PostgreSQL `ON CONFLICT` upsert.
pub struct MemoryAggregationStore {
    rows: Arc<RwLock<HashMap<GroupKey, AggregationRow>>>,
}

impl MemoryAggregationStore {
    pub fn new() -> Self {
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryAggregationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AggregationStore for MemoryAggregationStore {
    async fn upsert_batch(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
        group_key: &str,
        delta: &AggregateDelta,
    ) -> Result<(), CoreError> {
        let mut rows = self.rows.write().await;
        let key = (execution_id, aggregation_type, group_key.to_string());
        match rows.get_mut(&key) {
            Some(row) => row.apply(delta),
            None => {
                rows.insert(
                    key,
                    AggregationRow::from_delta(execution_id, aggregation_type, group_key, delta),
                );
            }
        }
        Ok(())
    }

    async fn count_distinct_groups(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
    ) -> Result<u64, CoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .keys()
            .filter(|(exec, ty, _)| *exec == execution_id && *ty == aggregation_type)
            .count() as u64)
    }

    async fn total_record_count(&self, execution_id: i64) -> Result<u64, CoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|((exec, ty, _), _)| {
                *exec == execution_id && *ty == AggregationType::ByDepartment
            })
            .map(|(_, row)| row.record_count)
            .sum())
    }

    async fn list_rows(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
    ) -> Result<Vec<AggregationRow>, CoreError> {
        let rows = self.rows.read().await;
        let mut result: Vec<AggregationRow> = rows
            .iter()
            .filter(|((exec, ty, _), _)| *exec == execution_id && *ty == aggregation_type)
            .map(|(_, row)| row.clone())
            .collect();
        result.sort_by(|a, b| a.group_key.cmp(&b.group_key));
        Ok(result)
    }

    async fn delete_by_execution(&self, execution_id: i64) -> Result<u64, CoreError> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|(exec, _, _), _| *exec != execution_id);
        Ok((before - rows.len()) as u64)
    }
}
