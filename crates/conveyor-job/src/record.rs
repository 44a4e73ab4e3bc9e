//! The streaming input record consumed by the aggregation engine.

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Placeholder for string fields a record does not carry.
pub const UNKNOWN_FIELD: &str = "UNKNOWN";

/// One unit of the large record stream reduced by the aggregator.
///
/// Missing string fields default to `"UNKNOWN"` and missing numeric
/// fields to `0.0`, so sparse upstream extracts still aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    #[serde(default = "unknown")]
    pub department: String,
    #[serde(default = "unknown")]
    pub region: String,
    #[serde(default = "unknown")]
    pub status: String,
    #[serde(default)]
    pub salary: f64,
    #[serde(default)]
    pub hours_worked: f64,
    #[serde(default)]
    pub bonus: f64,
}

fn unknown() -> String {
    UNKNOWN_FIELD.to_string()
}

impl Default for WorkRecord {
    fn default() -> Self {
        Self {
            department: unknown(),
            region: unknown(),
            status: unknown(),
            salary: 0.0,
            hours_worked: 0.0,
            bonus: 0.0,
        }
    }
}

impl WorkRecord {
    /// Parse one serialized record as produced by upstream pipeline
    /// steps: `department|region|status|salary|hoursWorked|bonus`.
    ///
    /// Trailing fields may be omitted; numeric fields that are present
    /// but malformed make the whole record unparseable.
    pub fn parse_delimited(line: &str) -> Result<Self, JobError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(JobError::RecordParse("empty record".to_string()));
        }

        let mut record = WorkRecord::default();
        for (index, field) in trimmed.split('|').enumerate() {
            let field = field.trim();
            match index {
                0 if !field.is_empty() => record.department = field.to_string(),
                1 if !field.is_empty() => record.region = field.to_string(),
                2 if !field.is_empty() => record.status = field.to_string(),
                3 => record.salary = parse_number(line, field)?,
                4 => record.hours_worked = parse_number(line, field)?,
                5 => record.bonus = parse_number(line, field)?,
                _ => {}
            }
        }
        Ok(record)
    }
}

fn parse_number(line: &str, field: &str) -> Result<f64, JobError> {
    if field.is_empty() {
        return Ok(0.0);
    }
    field
        .parse::<f64>()
        .map_err(|_| JobError::RecordParse(format!("bad numeric field '{field}' in '{line}'")))
}
