//! Retention GC: periodically purges terminal Jobs past a
//! leeway window. Caller-driven — this module does not spawn its own timer,
//! it exposes a single `tick` for whatever scheduling mechanism (a tokio
//! interval, a cron-style external trigger) the embedding binary chooses.

use crate::store::Store;
use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};

pub struct RetentionGc {
    store: Arc<dyn Store>,
    leeway: Duration,
}

impl RetentionGc {
    pub fn new(store: Arc<dyn Store>, leeway: Duration) -> Self {
        Self { store, leeway }
    }

    /// Runs one purge pass. Errors are logged and swallowed rather than
    /// propagated to whatever drives its schedule.
    pub async fn tick(&self) {
        match self.store.delete_old_jobs(self.leeway).await {
            Ok(deleted) if deleted > 0 => info!(deleted, "retention GC purged old jobs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "retention GC pass failed"),
        }
    }
}
