//! Database layer for Taskmill.
//!
//! Provides repository traits and PostgreSQL implementations. Every
//! cross-process invariant in the system is enforced here, through
//! transactions and conditional updates; callers never hold locks across
//! await points of their own.

pub mod error;
pub mod mem;
pub mod repo;
pub mod retry;

pub use error::{DbError, DbResult};
pub use repo::*;
pub use retry::with_retries;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a new database connection pool.
///
/// Sized so `workers + schedulers * 4` concurrent transactions do not starve
/// a small fleet; override with `max_connections` for larger ones.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    create_pool_sized(database_url, 16).await
}

pub async fn create_pool_sized(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
