//! Error types for the job data model.

use thiserror::Error;

/// Primary error type for job model operations.
#[derive(Error, Debug, Clone)]
pub enum JobError {
    #[error("Parameter '{key}' cannot be coerced to {expected}: '{value}'")]
    ParameterCoercion {
        key: String,
        expected: &'static str,
        value: String,
    },

    #[error("Invalid job definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Record parse error: {0}")]
    RecordParse(String),

    #[error("Schema '{schema}' error: {message}")]
    Schema { schema: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl JobError {
    pub fn schema(schema: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            schema: schema.into(),
            message: message.into(),
        }
    }
}
