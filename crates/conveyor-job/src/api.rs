//! Wire DTOs for the trigger API exposed toward the external scheduler.
//!
//! The HTTP layer that carries these is out of scope; the types pin the
//! contract so any transport can serialize them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{BatchStatus, ExitCode, JobExecution};

/// Launch request from the external scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub job_name: String,
    pub trigger_id: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Launch acknowledgment returned to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<i64>,
    pub job_name: String,
    pub trigger_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,
    pub message: String,
}

impl TriggerResponse {
    pub fn accepted(execution: &JobExecution) -> Self {
        Self {
            success: true,
            execution_id: Some(execution.id),
            job_name: execution.job_name.clone(),
            trigger_id: execution.trigger_id().unwrap_or_default().to_string(),
            status: Some(execution.status),
            message: "execution accepted".to_string(),
        }
    }

    pub fn rejected(
        job_name: impl Into<String>,
        trigger_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            execution_id: None,
            job_name: job_name.into(),
            trigger_id: trigger_id.into(),
            status: None,
            message: message.into(),
        }
    }
}

/// Compact execution view returned by correlation lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: i64,
    pub job_name: String,
    pub status: BatchStatus,
    pub exit_code: ExitCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl From<&JobExecution> for ExecutionSummary {
    fn from(execution: &JobExecution) -> Self {
        Self {
            execution_id: execution.id,
            job_name: execution.job_name.clone(),
            status: execution.status,
            exit_code: execution.exit_code,
            exit_description: execution.exit_description.clone(),
            trigger_id: execution.trigger_id().map(str::to_string),
            start_time: execution.start_time,
            end_time: execution.end_time,
        }
    }
}
