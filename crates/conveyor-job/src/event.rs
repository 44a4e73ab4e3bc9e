//! Lifecycle event envelopes published at job and step boundaries.
//!
//! Delivery is fire-and-forget; subscribers must tolerate duplicates,
//! unknown fields and out-of-order delivery across executions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{BatchStatus, ExitCode, JobExecution};

/// The lifecycle transition an envelope describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    JobStarted,
    StepStarting,
    StepCompleted,
    JobCompleted,
    JobFailed,
    JobStopped,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobStarted => "JOB_STARTED",
            EventType::StepStarting => "STEP_STARTING",
            EventType::StepCompleted => "STEP_COMPLETED",
            EventType::JobCompleted => "JOB_COMPLETED",
            EventType::JobFailed => "JOB_FAILED",
            EventType::JobStopped => "JOB_STOPPED",
        }
    }
}

/// JSON envelope published on the lifecycle channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub execution_id: i64,
    pub job_name: String,
    pub status: BatchStatus,
    pub exit_code: ExitCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    pub step_count: u32,
    pub read_count: u64,
    pub write_count: u64,
    pub skip_count: u64,
    /// Step events only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// Step events only: whole-job progress in percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u32>,
}

impl EventEnvelope {
    /// Base envelope for an execution; counters start at zero and step
    /// fields empty.
    pub fn for_execution(event_type: EventType, execution: &JobExecution, step_count: u32) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            execution_id: execution.id,
            job_name: execution.job_name.clone(),
            status: execution.status,
            exit_code: execution.exit_code,
            exit_description: execution.exit_description.clone(),
            start_time: execution.start_time,
            end_time: execution.end_time,
            trigger_id: execution.trigger_id().map(str::to_string),
            step_count,
            read_count: 0,
            write_count: 0,
            skip_count: 0,
            step_name: None,
            progress: None,
        }
    }

    pub fn with_step(mut self, step_name: impl Into<String>, progress: u32) -> Self {
        self.step_name = Some(step_name.into());
        self.progress = Some(progress);
        self
    }

    pub fn with_counts(mut self, read: u64, write: u64, skip: u64) -> Self {
        self.read_count = read;
        self.write_count = write;
        self.skip_count = skip;
        self
    }
}
