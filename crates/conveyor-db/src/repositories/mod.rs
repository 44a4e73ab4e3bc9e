//! Repositories over the PostgreSQL pool.

pub mod aggregation;
pub mod execution;

pub use aggregation::AggregationRepository;
pub use execution::ExecutionRepository;

use sqlx::PgPool;

/// Bundle of all repositories sharing one pool.
#[derive(Clone)]
pub struct DbContext {
    pub executions: ExecutionRepository,
    pub aggregations: AggregationRepository,
    pool: PgPool,
}

impl DbContext {
    pub fn new(pool: PgPool) -> Self {
        Self {
            executions: ExecutionRepository::new(pool.clone()),
            aggregations: AggregationRepository::new(pool.clone()),
            pool,
        }
    }

    /// Run the embedded migrations.
    pub async fn migrate(&self) -> Result<(), crate::error::DbError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::debug!("conveyor migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
