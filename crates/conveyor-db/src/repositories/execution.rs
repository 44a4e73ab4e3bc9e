//! Execution repository - CRUD over job instances, executions and
//! step executions.

use sqlx::PgPool;

use conveyor_job::BatchStatus;

use crate::entities::{ExecutionEntity, InsertExecution, InstanceEntity, StepExecutionEntity};
use crate::error::DbError;

const EXECUTION_COLUMNS: &str = "id, instance_id, job_name, status, exit_code, exit_description, \
     trigger_id, created_at, start_time, end_time, parameters, context";

const STEP_COLUMNS: &str = "id, execution_id, step_name, status, exit_code, failure_message, \
     start_time, end_time, read_count, write_count, skip_count, sequence";

/// Repository for execution metadata.
#[derive(Clone)]
pub struct ExecutionRepository {
    pool: PgPool,
}

impl ExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find or create the instance row for a `(job_name, instance_key)`
    /// pair. The insert is a no-op on conflict; the follow-up select
    /// then reads whichever row won.
    pub async fn find_or_create_instance(
        &self,
        job_name: &str,
        instance_key: &str,
    ) -> Result<InstanceEntity, DbError> {
        let inserted = sqlx::query_as::<_, InstanceEntity>(
            r#"
            INSERT INTO job_instance (job_name, instance_key)
            VALUES ($1, $2)
            ON CONFLICT (job_name, instance_key) DO NOTHING
            RETURNING id, job_name, instance_key, created_at
            "#,
        )
        .bind(job_name)
        .bind(instance_key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(instance) = inserted {
            return Ok(instance);
        }

        let existing = sqlx::query_as::<_, InstanceEntity>(
            r#"
            SELECT id, job_name, instance_key, created_at
            FROM job_instance
            WHERE job_name = $1 AND instance_key = $2
            "#,
        )
        .bind(job_name)
        .bind(instance_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(existing)
    }

    /// Most recent instances of a job, newest first.
    pub async fn find_recent_instances(
        &self,
        job_name: &str,
        page: u32,
        size: u32,
    ) -> Result<Vec<InstanceEntity>, DbError> {
        let instances = sqlx::query_as::<_, InstanceEntity>(
            r#"
            SELECT id, job_name, instance_key, created_at
            FROM job_instance
            WHERE job_name = $1
            ORDER BY id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(job_name)
        .bind(size as i64)
        .bind((page as i64) * (size as i64))
        .fetch_all(&self.pool)
        .await?;

        Ok(instances)
    }

    /// Create a new execution in `STARTING` state.
    pub async fn create_execution(
        &self,
        insert: &InsertExecution,
    ) -> Result<ExecutionEntity, DbError> {
        let created = sqlx::query_as::<_, ExecutionEntity>(&format!(
            r#"
            INSERT INTO job_execution (instance_id, job_name, trigger_id, parameters)
            VALUES ($1, $2, $3, $4)
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(insert.instance_id)
        .bind(&insert.job_name)
        .bind(&insert.trigger_id)
        .bind(&insert.parameters)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<ExecutionEntity>, DbError> {
        let execution = sqlx::query_as::<_, ExecutionEntity>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_execution WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(execution)
    }

    /// Persist status, exit status, times and context. The current
    /// status is read first and the transition validated, so terminal
    /// rows stay immutable.
    pub async fn update_execution(
        &self,
        id: i64,
        status: BatchStatus,
        exit_code: &str,
        exit_description: Option<&str>,
        start_time: Option<chrono::DateTime<chrono::Utc>>,
        end_time: Option<chrono::DateTime<chrono::Utc>>,
        context: &serde_json::Value,
    ) -> Result<ExecutionEntity, DbError> {
        let current = self.find_by_id(id).await?.ok_or(DbError::NotFound)?;
        let current_status = BatchStatus::from_str(&current.status)
            .ok_or_else(|| DbError::InvalidData(format!("unknown status '{}'", current.status)))?;
        if !current_status.can_transition_to(status) {
            return Err(DbError::InvalidTransition(format!(
                "{} -> {}",
                current.status,
                status.as_str()
            )));
        }

        let updated = sqlx::query_as::<_, ExecutionEntity>(&format!(
            r#"
            UPDATE job_execution
            SET status = $2,
                exit_code = $3,
                exit_description = $4,
                start_time = COALESCE($5, start_time),
                end_time = COALESCE($6, end_time),
                context = $7
            WHERE id = $1
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(exit_code)
        .bind(exit_description)
        .bind(start_time)
        .bind(end_time)
        .bind(context)
        .fetch_one(&self.pool)
        .await?;

        Ok(updated)
    }

    /// Atomically move `STARTING -> STARTED` and stamp the start time;
    /// a no-op when a stop or terminal transition got there first.
    /// Returns the row as it stands afterwards.
    pub async fn mark_started(&self, id: i64) -> Result<ExecutionEntity, DbError> {
        let updated = sqlx::query_as::<_, ExecutionEntity>(&format!(
            r#"
            UPDATE job_execution
            SET status = 'STARTED', start_time = NOW()
            WHERE id = $1 AND status = 'STARTING'
            RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(execution) => Ok(execution),
            None => self.find_by_id(id).await?.ok_or(DbError::NotFound),
        }
    }

    /// Atomically move a running execution to `STOPPING`.
    pub async fn request_stop(&self, id: i64) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE job_execution
            SET status = 'STOPPING'
            WHERE id = $1 AND status IN ('STARTING', 'STARTED', 'STOPPING')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_executions(&self, instance_id: i64) -> Result<Vec<ExecutionEntity>, DbError> {
        let executions = sqlx::query_as::<_, ExecutionEntity>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM job_execution
            WHERE instance_id = $1
            ORDER BY id ASC
            "#
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(executions)
    }

    /// Executions not yet terminal, oldest first (recovery sweep).
    pub async fn find_unfinished(&self) -> Result<Vec<ExecutionEntity>, DbError> {
        let executions = sqlx::query_as::<_, ExecutionEntity>(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM job_execution
            WHERE status IN ('STARTING', 'STARTED', 'STOPPING')
            ORDER BY id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(executions)
    }

    /// Execution counts per status.
    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>, DbError> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*) AS count
            FROM job_execution
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }

    // =========================================================================
    // Step executions
    // =========================================================================

    /// Append a step execution in `STARTED` state.
    pub async fn create_step_execution(
        &self,
        execution_id: i64,
        step_name: &str,
        sequence: u32,
    ) -> Result<StepExecutionEntity, DbError> {
        let created = sqlx::query_as::<_, StepExecutionEntity>(&format!(
            r#"
            INSERT INTO step_execution (execution_id, step_name, status, start_time, sequence)
            VALUES ($1, $2, 'STARTED', NOW(), $3)
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(execution_id)
        .bind(step_name)
        .bind(sequence as i32)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    pub async fn update_step_execution(
        &self,
        step: &StepExecutionEntity,
    ) -> Result<StepExecutionEntity, DbError> {
        let updated = sqlx::query_as::<_, StepExecutionEntity>(&format!(
            r#"
            UPDATE step_execution
            SET status = $2,
                exit_code = $3,
                failure_message = $4,
                start_time = $5,
                end_time = $6,
                read_count = $7,
                write_count = $8,
                skip_count = $9
            WHERE id = $1
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(step.id)
        .bind(&step.status)
        .bind(&step.exit_code)
        .bind(&step.failure_message)
        .bind(step.start_time)
        .bind(step.end_time)
        .bind(step.read_count)
        .bind(step.write_count)
        .bind(step.skip_count)
        .fetch_one(&self.pool)
        .await?;

        Ok(updated)
    }

    pub async fn list_step_executions(
        &self,
        execution_id: i64,
    ) -> Result<Vec<StepExecutionEntity>, DbError> {
        let steps = sqlx::query_as::<_, StepExecutionEntity>(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM step_execution
            WHERE execution_id = $1
            ORDER BY sequence ASC, id ASC
            "#
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(steps)
    }
}
