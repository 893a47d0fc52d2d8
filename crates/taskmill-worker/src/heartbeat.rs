//! Worker heartbeat task.
//!
//! Runs as an independent task sharing nothing with the main loop except the
//! database, so liveness keeps flowing while a long script executes. If the
//! registration row has vanished (the reaper raced a stall), the worker
//! re-registers itself and carries on.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use taskmill_core::WorkerStatus;
use taskmill_db::WorkerRepo;

use crate::WorkerIdentity;

pub struct Heartbeat {
    workers: Arc<dyn WorkerRepo>,
    identity: WorkerIdentity,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(workers: Arc<dyn WorkerRepo>, identity: WorkerIdentity, interval: Duration) -> Self {
        Self {
            workers,
            identity,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("heartbeat stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let now = Utc::now();
            match self.workers.heartbeat(&self.identity.worker_id, now).await {
                Ok(true) => debug!(worker_id = %self.identity.worker_id, "heartbeat"),
                Ok(false) => {
                    warn!(
                        worker_id = %self.identity.worker_id,
                        "registration row missing, re-registering"
                    );
                    let record = self.identity.registration(now, WorkerStatus::Idle, None);
                    if let Err(error) = self.workers.reregister(&record).await {
                        warn!(error = %error, "re-registration failed");
                    }
                }
                Err(error) => warn!(error = %error, "heartbeat update failed"),
            }
        }
    }
}
