//! Aggregation repository - batched upserts with commutative merge.

use sqlx::PgPool;

use conveyor_job::{AggregateDelta, AggregationType};

use crate::entities::AggregationEntity;
use crate::error::DbError;

const AGGREGATION_COLUMNS: &str = "execution_id, aggregation_type, group_key, record_count, \
     total_salary, total_hours, total_bonus, min_salary, max_salary, created_at, updated_at";

/// Repository for the keyed aggregate table.
#[derive(Clone)]
pub struct AggregationRepository {
    pool: PgPool,
}

impl AggregationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomic insert-or-merge of one group delta. Counts and totals
    /// add; min/max fold with `LEAST`/`GREATEST`. The merge is
    /// commutative, so flush ordering across workers is irrelevant.
    pub async fn upsert(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
        group_key: &str,
        delta: &AggregateDelta,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO aggregation_summary
                (execution_id, aggregation_type, group_key, record_count,
                 total_salary, total_hours, total_bonus, min_salary, max_salary)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (execution_id, aggregation_type, group_key) DO UPDATE SET
                record_count = aggregation_summary.record_count + EXCLUDED.record_count,
                total_salary = aggregation_summary.total_salary + EXCLUDED.total_salary,
                total_hours  = aggregation_summary.total_hours + EXCLUDED.total_hours,
                total_bonus  = aggregation_summary.total_bonus + EXCLUDED.total_bonus,
                min_salary   = LEAST(aggregation_summary.min_salary, EXCLUDED.min_salary),
                max_salary   = GREATEST(aggregation_summary.max_salary, EXCLUDED.max_salary),
                updated_at   = NOW()
            "#,
        )
        .bind(execution_id)
        .bind(aggregation_type.as_str())
        .bind(group_key)
        .bind(delta.count as i64)
        .bind(delta.total_salary)
        .bind(delta.total_hours)
        .bind(delta.total_bonus)
        .bind(delta.min_salary)
        .bind(delta.max_salary)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_distinct_groups(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
    ) -> Result<i64, DbError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM aggregation_summary
            WHERE execution_id = $1 AND aggregation_type = $2
            "#,
        )
        .bind(execution_id)
        .bind(aggregation_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Total records for an execution, summed over the canonical
    /// `BY_DEPARTMENT` family.
    pub async fn total_record_count(&self, execution_id: i64) -> Result<i64, DbError> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(record_count), 0)::BIGINT
            FROM aggregation_summary
            WHERE execution_id = $1 AND aggregation_type = 'BY_DEPARTMENT'
            "#,
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    pub async fn list_rows(
        &self,
        execution_id: i64,
        aggregation_type: AggregationType,
    ) -> Result<Vec<AggregationEntity>, DbError> {
        let rows = sqlx::query_as::<_, AggregationEntity>(&format!(
            r#"
            SELECT {AGGREGATION_COLUMNS}
            FROM aggregation_summary
            WHERE execution_id = $1 AND aggregation_type = $2
            ORDER BY group_key ASC
            "#
        ))
        .bind(execution_id)
        .bind(aggregation_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Bulk cleanup of every family of one execution.
    pub async fn delete_by_execution(&self, execution_id: i64) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM aggregation_summary WHERE execution_id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
