//! Aggregation summary entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use conveyor_job::{AggregationRow, AggregationType};

use crate::error::DbError;

/// Row of `aggregation_summary`, keyed by
/// `(execution_id, aggregation_type, group_key)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AggregationEntity {
    pub execution_id: i64,
    pub aggregation_type: String,
    pub group_key: String,
    pub record_count: i64,
    pub total_salary: f64,
    pub total_hours: f64,
    pub total_bonus: f64,
    pub min_salary: f64,
    pub max_salary: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AggregationEntity {
    pub fn into_row(self) -> Result<AggregationRow, DbError> {
        let aggregation_type = AggregationType::from_str(&self.aggregation_type).ok_or_else(|| {
            DbError::InvalidData(format!(
                "unknown aggregation type '{}'",
                self.aggregation_type
            ))
        })?;

        Ok(AggregationRow {
            execution_id: self.execution_id,
            aggregation_type,
            group_key: self.group_key,
            record_count: self.record_count.max(0) as u64,
            total_salary: self.total_salary,
            total_hours: self.total_hours,
            total_bonus: self.total_bonus,
            min_salary: self.min_salary,
            max_salary: self.max_salary,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
