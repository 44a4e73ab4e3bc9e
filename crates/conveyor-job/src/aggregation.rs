//! Aggregation model: key families, per-group deltas and the stored
//! aggregate row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::WorkRecord;

/// The key-derivation rule for one aggregate family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregationType {
    ByDepartment,
    ByRegion,
    ByStatus,
    ByDepartmentRegion,
    ByDepartmentRegionStatus,
}

impl AggregationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationType::ByDepartment => "BY_DEPARTMENT",
            AggregationType::ByRegion => "BY_REGION",
            AggregationType::ByStatus => "BY_STATUS",
            AggregationType::ByDepartmentRegion => "BY_DEPARTMENT_REGION",
            AggregationType::ByDepartmentRegionStatus => "BY_DEPARTMENT_REGION_STATUS",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BY_DEPARTMENT" => Some(AggregationType::ByDepartment),
            "BY_REGION" => Some(AggregationType::ByRegion),
            "BY_STATUS" => Some(AggregationType::ByStatus),
            "BY_DEPARTMENT_REGION" => Some(AggregationType::ByDepartmentRegion),
            "BY_DEPARTMENT_REGION_STATUS" => Some(AggregationType::ByDepartmentRegionStatus),
            _ => None,
        }
    }

    /// The families maintained at a given aggregation depth (1..=3).
    pub fn for_depth(depth: u8) -> &'static [AggregationType] {
        match depth {
            0 | 1 => &[
                AggregationType::ByDepartment,
                AggregationType::ByRegion,
                AggregationType::ByStatus,
            ],
            2 => &[
                AggregationType::ByDepartment,
                AggregationType::ByRegion,
                AggregationType::ByStatus,
                AggregationType::ByDepartmentRegion,
            ],
            _ => &[
                AggregationType::ByDepartment,
                AggregationType::ByRegion,
                AggregationType::ByStatus,
                AggregationType::ByDepartmentRegion,
                AggregationType::ByDepartmentRegionStatus,
            ],
        }
    }

    /// Derive the group key for a record under this family.
    pub fn group_key(&self, record: &WorkRecord) -> String {
        match self {
            AggregationType::ByDepartment => record.department.clone(),
            AggregationType::ByRegion => record.region.clone(),
            AggregationType::ByStatus => record.status.clone(),
            AggregationType::ByDepartmentRegion => {
                format!("{}_{}", record.department, record.region)
            }
            AggregationType::ByDepartmentRegionStatus => {
                format!("{}_{}_{}", record.department, record.region, record.status)
            }
        }
    }
}

/// Accumulated values for one group since the last flush.
///
/// Forms a commutative monoid under [`AggregateDelta::merge`], so the
/// order in which flushed deltas reach the store does not matter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateDelta {
    pub count: u64,
    pub total_salary: f64,
    pub total_hours: f64,
    pub total_bonus: f64,
    pub min_salary: f64,
    pub max_salary: f64,
}

impl AggregateDelta {
    /// Start a buffer from its first observation.
    pub fn first(record: &WorkRecord) -> Self {
        Self {
            count: 1,
            total_salary: record.salary,
            total_hours: record.hours_worked,
            total_bonus: record.bonus,
            min_salary: record.salary,
            max_salary: record.salary,
        }
    }

    /// Fold one more record into the buffer.
    pub fn observe(&mut self, record: &WorkRecord) {
        self.count += 1;
        self.total_salary += record.salary;
        self.total_hours += record.hours_worked;
        self.total_bonus += record.bonus;
        self.min_salary = self.min_salary.min(record.salary);
        self.max_salary = self.max_salary.max(record.salary);
    }

    /// Merge another delta into this one (store-side conflict rule).
    pub fn merge(&mut self, other: &AggregateDelta) {
        self.count += other.count;
        self.total_salary += other.total_salary;
        self.total_hours += other.total_hours;
        self.total_bonus += other.total_bonus;
        self.min_salary = self.min_salary.min(other.min_salary);
        self.max_salary = self.max_salary.max(other.max_salary);
    }
}

/// One stored aggregate row, keyed by
/// `(executionId, aggregationType, groupKey)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationRow {
    pub execution_id: i64,
    pub aggregation_type: AggregationType,
    pub group_key: String,
    pub record_count: u64,
    pub total_salary: f64,
    pub total_hours: f64,
    pub total_bonus: f64,
    pub min_salary: f64,
    pub max_salary: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AggregationRow {
    /// Materialize the initial row for a delta's first upsert.
    pub fn from_delta(
        execution_id: i64,
        aggregation_type: AggregationType,
        group_key: impl Into<String>,
        delta: &AggregateDelta,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id,
            aggregation_type,
            group_key: group_key.into(),
            record_count: delta.count,
            total_salary: delta.total_salary,
            total_hours: delta.total_hours,
            total_bonus: delta.total_bonus,
            min_salary: delta.min_salary,
            max_salary: delta.max_salary,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a delta to an existing row (insert-or-merge conflict arm).
    pub fn apply(&mut self, delta: &AggregateDelta) {
        self.record_count += delta.count;
        self.total_salary += delta.total_salary;
        self.total_hours += delta.total_hours;
        self.total_bonus += delta.total_bonus;
        self.min_salary = self.min_salary.min(delta.min_salary);
        self.max_salary = self.max_salary.max(delta.max_salary);
        self.updated_at = Utc::now();
    }
}
