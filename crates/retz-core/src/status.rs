//! The status reporter: aggregates queue/running counts and
//! resource totals for the external status endpoint. Must never block
//! longer than a single count query — the offer snapshot it reports
//! alongside those counts is allowed to be stale.

use crate::error::RetzError;
use crate::store::Store;
use retz_broker::{Offer, Resources};
use std::sync::Mutex;

/// The last set of offers the Dispatcher saw, cached so the status reporter
/// never has to ask the broker directly.
#[derive(Debug, Clone, Default)]
pub struct OfferSnapshot {
    pub count: i64,
    pub num_slaves: i64,
    pub total: Resources,
}

impl OfferSnapshot {
    pub fn from_offers(offers: &[Offer]) -> Self {
        let distinct_slaves: std::collections::HashSet<&str> =
            offers.iter().map(|o| o.slave_id.as_str()).collect();
        Self {
            count: offers.len() as i64,
            num_slaves: distinct_slaves.len() as i64,
            total: offers.iter().map(|o| o.resources).sum(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusResponse {
    pub queue_length: i64,
    pub running_length: i64,
    pub total_used: Resources,
    pub num_slaves: i64,
    pub offers: i64,
    pub total_offered: Resources,
    pub version: String,
}

pub struct StatusReporter {
    store: std::sync::Arc<dyn Store>,
    version: String,
    last_offers: Mutex<OfferSnapshot>,
}

impl StatusReporter {
    pub fn new(store: std::sync::Arc<dyn Store>, version: impl Into<String>) -> Self {
        Self {
            store,
            version: version.into(),
            last_offers: Mutex::new(OfferSnapshot::default()),
        }
    }

    /// Called by the Dispatcher on every `onOffers` so the cache tracks the
    /// most recent snapshot without this reporter ever touching the broker.
    pub fn record_offers(&self, offers: &[Offer]) {
        let snapshot = OfferSnapshot::from_offers(offers);
        *self.last_offers.lock().expect("offer snapshot lock poisoned") = snapshot;
    }

    pub async fn status(&self) -> Result<StatusResponse, RetzError> {
        let queue_length = self.store.count_queued().await?;
        let running_length = self.store.count_running().await?;
        let total_used = self.store.sum_running_resources().await?;

        let snapshot = self
            .last_offers
            .lock()
            .expect("offer snapshot lock poisoned")
            .clone();

        Ok(StatusResponse {
            queue_length,
            running_length,
            total_used,
            num_slaves: snapshot.num_slaves,
            offers: snapshot.count,
            total_offered: snapshot.total,
            version: self.version.clone(),
        })
    }
}
