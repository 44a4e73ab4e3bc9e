//! Execution entities: job instances, executions and step executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use conveyor_job::{
    BatchStatus, ExecutionContext, ExitCode, JobError, JobExecution, JobInstance, JobParameters,
    StepExecution,
};

use crate::error::DbError;

/// Row of `job_instance`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InstanceEntity {
    pub id: i64,
    pub job_name: String,
    pub instance_key: String,
    pub created_at: DateTime<Utc>,
}

impl From<InstanceEntity> for JobInstance {
    fn from(entity: InstanceEntity) -> Self {
        JobInstance {
            id: entity.id,
            job_name: entity.job_name,
            instance_key: entity.instance_key,
            created_at: entity.created_at,
        }
    }
}

/// Row of `job_execution`. Parameters and context are stored as JSONB
/// snapshots of their domain serde shapes.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionEntity {
    pub id: i64,
    pub instance_id: i64,
    pub job_name: String,
    pub status: String,
    pub exit_code: String,
    #[sqlx(default)]
    pub exit_description: Option<String>,
    pub trigger_id: String,
    pub created_at: DateTime<Utc>,
    #[sqlx(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub parameters: serde_json::Value,
    pub context: serde_json::Value,
}

impl ExecutionEntity {
    /// Reconstruct the domain execution, deserializing the JSONB
    /// snapshots and status strings.
    pub fn into_execution(self) -> Result<JobExecution, DbError> {
        let parameters: JobParameters = serde_json::from_value(self.parameters)?;
        let context: ExecutionContext = serde_json::from_value(self.context)?;
        let status = BatchStatus::from_str(&self.status)
            .ok_or_else(|| DbError::InvalidData(format!("unknown status '{}'", self.status)))?;
        let exit_code = ExitCode::from_str(&self.exit_code).ok_or_else(|| {
            DbError::InvalidData(format!("unknown exit code '{}'", self.exit_code))
        })?;

        Ok(JobExecution {
            id: self.id,
            instance_id: self.instance_id,
            job_name: self.job_name,
            status,
            exit_code,
            exit_description: self.exit_description,
            created_at: self.created_at,
            start_time: self.start_time,
            end_time: self.end_time,
            parameters,
            context,
        })
    }
}

/// Insert parameters for a new execution.
#[derive(Debug, Clone)]
pub struct InsertExecution {
    pub instance_id: i64,
    pub job_name: String,
    pub trigger_id: String,
    pub parameters: serde_json::Value,
}

impl InsertExecution {
    pub fn new(instance: &JobInstance, params: &JobParameters) -> Result<Self, JobError> {
        let parameters = serde_json::to_value(params)
            .map_err(|e| JobError::Serialization(e.to_string()))?;
        Ok(Self {
            instance_id: instance.id,
            job_name: instance.job_name.clone(),
            trigger_id: params.trigger_id().unwrap_or_default().to_string(),
            parameters,
        })
    }
}

/// Row of `step_execution`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepExecutionEntity {
    pub id: i64,
    pub execution_id: i64,
    pub step_name: String,
    pub status: String,
    pub exit_code: String,
    #[sqlx(default)]
    pub failure_message: Option<String>,
    #[sqlx(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub read_count: i64,
    pub write_count: i64,
    pub skip_count: i64,
    pub sequence: i32,
}

impl StepExecutionEntity {
    pub fn into_step(self) -> Result<StepExecution, DbError> {
        let status = BatchStatus::from_str(&self.status)
            .ok_or_else(|| DbError::InvalidData(format!("unknown status '{}'", self.status)))?;
        let exit_code = ExitCode::from_str(&self.exit_code).ok_or_else(|| {
            DbError::InvalidData(format!("unknown exit code '{}'", self.exit_code))
        })?;

        Ok(StepExecution {
            id: self.id,
            execution_id: self.execution_id,
            step_name: self.step_name,
            status,
            exit_code,
            failure_message: self.failure_message,
            start_time: self.start_time,
            end_time: self.end_time,
            read_count: self.read_count.max(0) as u64,
            write_count: self.write_count.max(0) as u64,
            skip_count: self.skip_count.max(0) as u64,
            sequence: self.sequence.max(0) as u32,
        })
    }
}
