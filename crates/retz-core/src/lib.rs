//! # Retz core
//!
//! The persistent job store and planner/dispatcher at the heart of Retz, a
//! job scheduler that accepts batch workloads from authenticated clients
//! and dispatches them onto a cluster via a resource-offer protocol.
//!
//! ## Architecture
//!
//! ```text
//! ResourceBroker ──► Dispatcher ──► Planner
//!        ▲               │             │
//!        │               ▼             │
//!        └──────────── Store ◄─────────┘
//! ```
//!
//! - [`Store`] owns every persistent entity (Users, Applications, Jobs,
//!   Properties) and is the only component that writes to the database.
//! - [`state_machine`] validates and applies Job lifecycle transitions;
//!   it is the sole place a Job's `state` field changes.
//! - [`Planner`] is a pure strategy from resource offers and the queued
//!   view to a launch plan — it never mutates the Store.
//! - [`Dispatcher`] drives the planner on broker events and persists
//!   whatever plan it produces.
//! - [`StatusReporter`] and [`RetentionGc`] are read-only and maintenance
//!   side components respectively; neither participates in dispatch.
//!
//! This crate is backend-agnostic: it defines the [`Store`] trait but ships
//! no implementation of it. See `retz-store-postgres` for the production
//! backend and `retz-testing` for an in-memory one used by this crate's own
//! test suite.

mod dispatcher;
mod error;
mod model;
mod planner;
mod retention;
mod status;
mod store;

pub mod state_machine;

pub use dispatcher::Dispatcher;
pub use error::{Categorizable, RetzError, StoreError};
pub use model::{Application, Job, JobState, OrderKey, Property, User};
pub use planner::{Fifo, Plan, Planner, Priority};
pub use retention::RetentionGc;
pub use state_machine::Transition;
pub use status::{OfferSnapshot, StatusReporter, StatusResponse};
pub use store::{PendingTransition, Store};

// Re-exported so downstream crates need not depend on retz-broker directly
// just to name a Job's resource requirement.
pub use retz_broker::Resources;
