//! Postgres-backed repository implementations.

mod tasks;
mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use apalis_sql::postgres::PostgresStorage;
use sqlx::{
    Postgres, Transaction,
    postgres::{PgPool, PgPoolOptions},
    query,
};

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    /// Apply the job-queue schema first, then the task table. Both share the migrations
    /// table, so each migrator ignores the other's entries.
    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        let mut queue = PostgresStorage::<()>::migrations();
        queue.set_ignore_missing(true);
        queue.run(pool).await?;

        let mut tasks = sqlx::migrate!("./migrations");
        tasks.set_ignore_missing(true);
        tasks.run(pool).await.map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }
}
