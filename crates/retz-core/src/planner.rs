//! The planner: a pluggable strategy from offers + the queued view to a
//! launch plan. Expressed as `Planner: (Offers, Store) → Plan` — the
//! planner calls `Store::find_fit` itself rather than receiving a
//! pre-filtered candidate list, since the prefix rule depends on the
//! strategy's own ordering.
//!
//! Two built-ins, `Fifo` and `Priority`, differ only in `order_by()` —
//! deliberately not generalized beyond that.

use crate::error::RetzError;
use crate::model::{Job, OrderKey};
use crate::store::Store;
use async_trait::async_trait;
use retz_broker::{Offer, OfferId, Resources};

/// The planner's output: Jobs matched to the offer that will run them, plus
/// the offers nobody used (to be declined).
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub launches: Vec<(Job, OfferId)>,
    pub to_decline: Vec<OfferId>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// The columns `find_fit` should sort by, ascending, ties broken in
    /// list order.
    fn order_by(&self) -> &[OrderKey];

    /// Produce a plan for the given `offers` against the Store's current
    /// queue. Must not mutate the Store — the Dispatcher applies whatever
    /// plan is returned.
    async fn plan(&self, store: &dyn Store, offers: &[Offer]) -> Result<Plan, RetzError>;
}

/// Greedily assigns `candidates` (already ordered and resource-capped by
/// `find_fit`) to individual offers: first-fit over the offers in the order
/// given. Every launched Job fits entirely within the offer it is assigned
/// to; total resources consumed per offer never exceed what that offer
/// provides. Offers that end up unused are returned for decline.
fn bin_pack(candidates: Vec<Job>, offers: &[Offer]) -> Plan {
    let mut remaining: Vec<Resources> = offers.iter().map(|o| o.resources).collect();
    let mut launches = Vec::new();
    let mut used = vec![false; offers.len()];

    for job in candidates {
        if let Some(idx) = remaining
            .iter()
            .position(|r| job.resources.fits_within(r))
        {
            let left = remaining[idx]
                .checked_sub(&job.resources)
                .expect("fits_within guarantees non-negative remainder");
            remaining[idx] = left;
            used[idx] = true;
            launches.push((job, offers[idx].id.clone()));
        }
        // A Job that fits in no single offer is left queued; `find_fit`
        // already capped the *aggregate* across all offers, but bin-packing
        // into individual offers can still strand a Job too large for any
        // one of them.
    }

    let to_decline = offers
        .iter()
        .zip(used.iter())
        .filter(|(_, &u)| !u)
        .map(|(o, _)| o.id.clone())
        .collect();

    Plan {
        launches,
        to_decline,
    }
}

async fn plan_with_order(
    store: &dyn Store,
    offers: &[Offer],
    order_by: &[OrderKey],
) -> Result<Plan, RetzError> {
    let total: Resources = offers.iter().map(|o| o.resources).sum();
    let candidates = store.find_fit(order_by, total.cpu, total.mem_mb).await?;
    Ok(bin_pack(candidates, offers))
}

/// First-in, first-out: orders solely by `id`.
pub struct Fifo {
    order: [OrderKey; 1],
}

impl Default for Fifo {
    fn default() -> Self {
        Self {
            order: [OrderKey::Id],
        }
    }
}

#[async_trait]
impl Planner for Fifo {
    fn order_by(&self) -> &[OrderKey] {
        &self.order
    }

    async fn plan(&self, store: &dyn Store, offers: &[Offer]) -> Result<Plan, RetzError> {
        plan_with_order(store, offers, &self.order).await
    }
}

/// Lower `priority` values are more urgent; ties broken by `id` to keep the
/// ordering stable and deterministic.
pub struct Priority {
    order: [OrderKey; 2],
}

impl Default for Priority {
    fn default() -> Self {
        Self {
            order: [OrderKey::Priority, OrderKey::Id],
        }
    }
}

#[async_trait]
impl Planner for Priority {
    fn order_by(&self) -> &[OrderKey] {
        &self.order
    }

    async fn plan(&self, store: &dyn Store, offers: &[Offer]) -> Result<Plan, RetzError> {
        plan_with_order(store, offers, &self.order).await
    }
}
