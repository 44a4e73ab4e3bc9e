//! DB-backed implementations of the conveyor-core storage traits.
//!
//! Bridges the in-memory storage interfaces of `conveyor-core` to the
//! PostgreSQL repositories, converting between domain types and row
//! entities transparently.

use async_trait::async_trait;
use sqlx::PgPool;

use conveyor_core::error::CoreError;
use conveyor_core::storage::{AggregationStore, ExecutionStore};
use conveyor_job::{
    AggregateDelta, AggregationRow, AggregationType, BatchStatus, JobExecution, JobInstance,
    JobParameters, StepExecution,
};

use crate::entities::{InsertExecution, StepExecutionEntity};
use crate::error::DbError;
use crate::repositories::{AggregationRepository, ExecutionRepository};

/// Convert a DbError into a CoreError::Storage.
fn db_err(e: DbError) -> CoreError {
    CoreError::Storage(e.to_string())
}

/// Convert a serde_json::Error into a CoreError::Storage.
fn json_err(e: serde_json::Error) -> CoreError {
    CoreError::Storage(format!("JSON serialization error: {e}"))
}

// =============================================================================
// SqlxExecutionStore
// =============================================================================

/// PostgreSQL-backed implementation of `ExecutionStore`.
#[derive(Clone)]
pub struct SqlxExecutionStore {
    repo: ExecutionRepository,
}

impl SqlxExecutionStore {
    /// Create a new store backed by the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            repo: ExecutionRepository::new(pool),
        }
    }

    /// Create from an existing repository.
    pub fn from_repo(repo: ExecutionRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl ExecutionStore for SqlxExecutionStore {
    async fn create_instance(
        &self,
        name: &str,
        params: &JobParameters,
    ) -> Result<JobInstance, CoreError> {
        let entity = self
            .repo
            .find_or_create_instance(name, &params.instance_key())
            .await
            .map_err(db_err)?;
        Ok(entity.into())
    }

    async fn create_execution(
        &self,
        instance: &JobInstance,
        params: &JobParameters,
    ) -> Result<JobExecution, CoreError> {
        let insert = InsertExecution::new(instance, params).map_err(CoreError::Job)?;
        let entity = self.repo.create_execution(&insert).await.map_err(db_err)?;
        entity.into_execution().map_err(db_err)
    }

    async fn update_execution(&self, execution: &JobExecution) -> Result<(), CoreError> {
        let context = serde_json::to_value(&execution.context).map_err(json_err)?;
        self.repo
            .update_execution(
                execution.id,
                execution.status,
                execution.exit_code.as_str(),
                execution.exit_description.as_deref(),
                execution.start_time,
                execution.end_time,
                &context,
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_started(&self, execution_id: i64) -> Result<JobExecution, CoreError> {
        let entity = self.repo.mark_started(execution_id).await.map_err(db_err)?;
        entity.into_execution().map_err(db_err)
    }

    async fn request_stop(&self, execution_id: i64) -> Result<bool, CoreError> {
        self.repo.request_stop(execution_id).await.map_err(db_err)
    }

    async fn create_step_execution(
        &self,
        execution_id: i64,
        step_name: &str,
        sequence: u32,
    ) -> Result<StepExecution, CoreError> {
        let entity = self
            .repo
            .create_step_execution(execution_id, step_name, sequence)
            .await
            .map_err(db_err)?;
        entity.into_step().map_err(db_err)
    }

    async fn update_step_execution(&self, step: &StepExecution) -> Result<(), CoreError> {
        let entity = StepExecutionEntity {
            id: step.id,
            execution_id: step.execution_id,
            step_name: step.step_name.clone(),
            status: step.status.as_str().to_string(),
            exit_code: step.exit_code.as_str().to_string(),
            failure_message: step.failure_message.clone(),
            start_time: step.start_time,
            end_time: step.end_time,
            read_count: step.read_count as i64,
            write_count: step.write_count as i64,
            skip_count: step.skip_count as i64,
            sequence: step.sequence as i32,
        };
        self.repo
            .update_step_execution(&entity)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn find_execution(&self, execution_id: i64) -> Result<Option<JobExecution>, CoreError> {
        match self.repo.find_by_id(execution_id).await.map_err(db_err)? {
            Some(entity) => Ok(Some(entity.into_execution().map_err(db_err)?)),
            None => Ok(None),
        }
    }

    async fn find_recent_instances(
        &self,
        name: &str,
        page: u32,
        size: u32,
    ) -> Result<Vec<JobInstance>, CoreError> {
        let entities = self
            .repo
            .find_recent_instances(name, page, size)
            .await
            .map_err(db_err)?;
        Ok(entities.into_iter().map(Into::into).collect())
    }

    async fn list_executions(&self, instance_id: i64) -> Result<Vec<JobExecution>, CoreError> {
        let entities = self.repo.list_executions(instance_id).await.map_err(db_err)?;
        entities
            .into_iter()
            .map(|e| e.into_execution().map_err(db_err))
            .collect()
    }

    async fn list_step_executions(
        &self,
        execution_id: i64,
    ) -> Result<Vec<StepExecution>, CoreError> {
        let entities = self
            .repo
            .list_step_executions(execution_id)
            .await
            .map_err(db_err)?;
        entities
            .into_iter()
            .map(|e| e.into_step().map_err(db_err))
            .collect()
    }

    async fn find_unfinished(&self) -> Result<Vec<JobExecution>, CoreError> {
        let entities = self.repo.find_unfinished().await.map_err(db_err)?;
        entities
            .into_iter()
            .map(|e| e.into_execution().map_err(db_err))
            .collect()
    }

    async fn count_by_status(&self) -> Result<Vec<(BatchStatus, u64)>, CoreError> {
        let counts = self.repo.count_by_status().await.map_err(db_err)?;
        counts
            .into_iter()
            .map(|(status, count)| {
                BatchStatus::from_str(&status)
                    .map(|s| (s, count.max(0) as u64))
                    .ok_or_else(|| CoreError::Storage(format!("unknown status '{status}'")))
            })
            .collect()
    }
}

// =============================================================================
// SqlxAggregationStore
// =============================================================================

/// PostgreSQL-backed implementation of `AggregationStore`, using the
/// `ON CONFLICT` merge upsert.
#[derive(Clone)]
pub struct SqlxAggregationStore {
    repo: AggregationRepository,
}

impl SqlxAggregationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            repo: AggregationRepository::new(pool),
        }
    }

    pub fn from_repo(repo: AggregationRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl AggregationStore for SqlxAggregationStore {
    async fn upsert_batch(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
        group_key: &str,
        delta: &AggregateDelta,
    ) -> Result<(), CoreError> {
        self.repo
            .upsert(execution_id, aggregation_type, group_key, delta)
            .await
            .map_err(db_err)
    }

    async fn count_distinct_groups(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
    ) -> Result<u64, CoreError> {
        let count = self
            .repo
            .count_distinct_groups(execution_id, aggregation_type)
            .await
            .map_err(db_err)?;
        Ok(count.max(0) as u64)
    }

    async fn total_record_count(&self, execution_id: i64) -> Result<u64, CoreError> {
        let total = self
            .repo
            .total_record_count(execution_id)
            .await
            .map_err(db_err)?;
        Ok(total.max(0) as u64)
    }

    async fn list_rows(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
    ) -> Result<Vec<AggregationRow>, CoreError> {
        let entities = self
            .repo
            .list_rows(execution_id, aggregation_type)
            .await
            .map_err(db_err)?;
        entities
            .into_iter()
            .map(|e| e.into_row().map_err(db_err))
            .collect()
    }

    async fn delete_by_execution(&self, execution_id: i64) -> Result<u64, CoreError> {
        self.repo
            .delete_by_execution(execution_id)
            .await
            .map_err(db_err)
    }
}
