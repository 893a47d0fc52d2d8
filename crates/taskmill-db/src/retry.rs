//! Bounded retry for transient database errors.
//!
//! Connection drops, pool timeouts, deadlocks and serialization failures are
//! retried in place with doubling backoff. Anything else, or a transient
//! error that outlives the attempt budget, is returned to the caller; the
//! service loops treat that as fatal and exit for supervision to restart.

use std::future::Future;
use std::time::Duration;

use crate::{DbError, DbResult};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Whether an error is worth retrying in the same loop iteration.
pub fn is_transient(error: &DbError) -> bool {
    let DbError::Database(error) = error else {
        return false;
    };
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        // 40001 serialization_failure, 40P01 deadlock_detected,
        // 57P03 cannot_connect_now (server restarting).
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("40001") | Some("40P01") | Some("57P03")
        ),
        _ => false,
    }
}

/// Run `op`, retrying transient failures up to `attempts` total tries.
pub async fn with_retries<T, F, Fut>(label: &str, attempts: u32, mut op: F) -> DbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) && attempt < attempts => {
                tracing::warn!(
                    label,
                    attempt,
                    error = %error,
                    "transient database error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
