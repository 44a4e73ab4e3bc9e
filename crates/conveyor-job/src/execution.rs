//! Execution data structures: instances, executions, step executions
//! and their status machines.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::parameters::JobParameters;

/// Lifecycle status of a job or step execution.
///
/// Transitions are monotonic: `Starting -> Started -> (Stopping) ->`
/// one of the terminal states. `Processed` is a post-processing
/// terminal state reachable only from `Completed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchStatus {
    #[default]
    Starting,
    Started,
    Stopping,
    Stopped,
    Completed,
    Failed,
    Abandoned,
    Processed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Stopped
                | BatchStatus::Completed
                | BatchStatus::Failed
                | BatchStatus::Abandoned
                | BatchStatus::Processed
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Processed => "PROCESSED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "STARTING" => Some(BatchStatus::Starting),
            "STARTED" => Some(BatchStatus::Started),
            "STOPPING" => Some(BatchStatus::Stopping),
            "STOPPED" => Some(BatchStatus::Stopped),
            "COMPLETED" => Some(BatchStatus::Completed),
            "FAILED" => Some(BatchStatus::Failed),
            "ABANDONED" => Some(BatchStatus::Abandoned),
            "PROCESSED" => Some(BatchStatus::Processed),
            _ => None,
        }
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Terminal states admit no transition except `Completed ->
    /// Processed`. Identity transitions are always legal so that
    /// re-persisting an unchanged row is not an error.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            BatchStatus::Starting => next != BatchStatus::Processed,
            BatchStatus::Started => {
                next != BatchStatus::Starting && next != BatchStatus::Processed
            }
            BatchStatus::Stopping => next.is_terminal() && next != BatchStatus::Processed,
            BatchStatus::Completed => next == BatchStatus::Processed,
            _ => false,
        }
    }
}

/// Exit code recorded against finished executions and steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExitCode {
    #[default]
    Unknown,
    Completed,
    Failed,
    Stopped,
}

impl ExitCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitCode::Unknown => "UNKNOWN",
            ExitCode::Completed => "COMPLETED",
            ExitCode::Failed => "FAILED",
            ExitCode::Stopped => "STOPPED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "UNKNOWN" => Some(ExitCode::Unknown),
            "COMPLETED" => Some(ExitCode::Completed),
            "FAILED" => Some(ExitCode::Failed),
            "STOPPED" => Some(ExitCode::Stopped),
            _ => None,
        }
    }
}

/// A scalar value storable in the execution context.
///
/// The context must survive crash restarts, so it is bounded to
/// serializable scalars; larger cross-step state goes to a side store
/// with its handle passed through the context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "UPPERCASE")]
pub enum ContextValue {
    String(String),
    Long(i64),
    Double(f64),
    Bool(bool),
}

/// Key-value scratch space shared by the steps of one execution.
///
/// Written by the step whose body is currently running, read by later
/// steps. One worker drives one execution, so writes never race.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    entries: BTreeMap<String, ContextValue>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: ContextValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn put_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.put(key, ContextValue::String(value.into()));
    }

    pub fn put_long(&mut self, key: impl Into<String>, value: i64) {
        self.put(key, ContextValue::Long(value));
    }

    pub fn put_double(&mut self, key: impl Into<String>, value: f64) {
        self.put(key, ContextValue::Double(value));
    }

    pub fn put_bool(&mut self, key: impl Into<String>, value: bool) {
        self.put(key, ContextValue::Bool(value));
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(ContextValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(ContextValue::Long(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.entries.get(key) {
            Some(ContextValue::Double(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key) {
            Some(ContextValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The equivalence class of executions sharing identifying parameters
/// for a given job name. Created lazily on first launch with that
/// combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInstance {
    pub id: i64,
    pub job_name: String,
    /// Digest of the identifying parameters; unique per job name.
    pub instance_key: String,
    pub created_at: DateTime<Utc>,
}

/// A single attempt to run a job with specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub id: i64,
    pub instance_id: i64,
    pub job_name: String,
    pub status: BatchStatus,
    pub exit_code: ExitCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_description: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub parameters: JobParameters,
    pub context: ExecutionContext,
}

impl JobExecution {
    /// The correlation id injected at trigger time. Every execution
    /// created by the coordinator carries one.
    pub fn trigger_id(&self) -> Option<&str> {
        self.parameters.trigger_id()
    }

    /// Apply a status change, enforcing monotonicity.
    pub fn transition(&mut self, next: BatchStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Progress record for one step of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub id: i64,
    pub execution_id: i64,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_code: ExitCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub read_count: u64,
    pub write_count: u64,
    pub skip_count: u64,
    /// Position of the step within the job definition, starting at 0.
    pub sequence: u32,
}
