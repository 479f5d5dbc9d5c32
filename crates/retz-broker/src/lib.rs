//! The broker interface consumed by the Retz dispatcher.
//!
//! This crate holds nothing but the abstract shape of a Mesos-style
//! resource-offer broker: the types that cross the boundary (offers,
//! resources, task status) and the [`ResourceBroker`] trait itself. The
//! concrete driver that actually talks to a cluster manager is out of scope
//! for this repository — callers plug in their own implementation, and
//! `retz-testing` ships a scripted fake for exercising the dispatcher
//! without one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A quantity of cluster resources, shared by offers, job requirements, and
/// the status reporter's aggregate totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: i64,
    pub mem_mb: i64,
    pub gpu: i64,
    pub ports: i64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu: 0,
        mem_mb: 0,
        gpu: 0,
        ports: 0,
    };

    pub fn new(cpu: i64, mem_mb: i64, gpu: i64, ports: i64) -> Self {
        Self {
            cpu,
            mem_mb,
            gpu,
            ports,
        }
    }

    /// Whether `self` fits entirely within `other` on every dimension.
    pub fn fits_within(&self, other: &Resources) -> bool {
        self.cpu <= other.cpu
            && self.mem_mb <= other.mem_mb
            && self.gpu <= other.gpu
            && self.ports <= other.ports
    }

    pub fn checked_add(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_add(other.cpu)?,
            mem_mb: self.mem_mb.checked_add(other.mem_mb)?,
            gpu: self.gpu.checked_add(other.gpu)?,
            ports: self.ports.checked_add(other.ports)?,
        })
    }

    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            cpu: self.cpu.checked_sub(other.cpu)?,
            mem_mb: self.mem_mb.checked_sub(other.mem_mb)?,
            gpu: self.gpu.checked_sub(other.gpu)?,
            ports: self.ports.checked_sub(other.ports)?,
        })
    }
}

impl std::iter::Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Self {
        iter.fold(Resources::ZERO, |acc, r| {
            acc.checked_add(&r).unwrap_or(Resources {
                cpu: i64::MAX,
                mem_mb: i64::MAX,
                gpu: i64::MAX,
                ports: i64::MAX,
            })
        })
    }
}

/// Opaque offer identifier, unique for the lifetime of the offer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OfferId(pub String);

/// Opaque broker-assigned task identifier, set when a Job enters `STARTING`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl std::fmt::Display for OfferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A quantum of cluster resources made available by the broker. Valid until
/// launched against or declined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub resources: Resources,
    pub slave_id: String,
}

/// Everything the broker needs to actually launch a task: the command to
/// run and the sandbox it runs inside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub cmd: String,
    pub appid: String,
    pub env: Vec<(String, String)>,
}

/// The broker's lifecycle vocabulary for a task, delivered via
/// `statusUpdate`. A superset of the Job state machine's own states:
/// `LOST` and `FAILED` both collapse onto the Job state machine's `KILLED`
/// transition (see `retz-core::state_machine`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerTaskStatus {
    Starting,
    Started,
    Finished,
    Lost,
    Failed,
    Killed,
}

/// A status update delivered from the broker for a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub status: BrokerTaskStatus,
    pub exit_code: Option<i32>,
    pub sandbox_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker rejected launch of task {task_id}: {reason}")]
    LaunchRejected { task_id: TaskId, reason: String },
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_checks_every_dimension() {
        let small = Resources::new(1, 128, 0, 0);
        let big = Resources::new(4, 1024, 1, 2);
        assert!(small.fits_within(&big));
        assert!(!big.fits_within(&small));
    }

    #[test]
    fn checked_sub_rejects_negative_remainder() {
        let small = Resources::new(1, 128, 0, 0);
        let big = Resources::new(4, 1024, 1, 2);
        assert!(small.checked_sub(&big).is_none());
        assert_eq!(
            big.checked_sub(&small),
            Some(Resources::new(3, 896, 1, 2))
        );
    }

    #[test]
    fn sum_adds_every_dimension() {
        let total: Resources = [
            Resources::new(1, 100, 0, 0),
            Resources::new(2, 200, 1, 0),
            Resources::new(3, 300, 0, 1),
        ]
        .into_iter()
        .sum();
        assert_eq!(total, Resources::new(6, 600, 1, 1));
    }

    #[test]
    fn zero_is_the_additive_identity() {
        let r = Resources::new(2, 256, 0, 1);
        assert_eq!(r.checked_add(&Resources::ZERO), Some(r));
    }
}

/// The abstract collaborator that delivers resource offers and accepts
/// launch/kill requests. Concrete implementations (a real Mesos driver, a
/// Kubernetes adapter, a scripted test double) live outside this crate;
/// `retz-core::Dispatcher` is written entirely against this trait.
#[async_trait]
pub trait ResourceBroker: Send + Sync {
    /// Launch `cmd` as `task_id` against `offer`. Failure means the broker
    /// rejected the launch outright (e.g. the offer already expired); the
    /// caller is expected to revert the Job to `QUEUED`.
    async fn launch(
        &self,
        task_id: &TaskId,
        cmd: &CommandSpec,
        offer: &Offer,
    ) -> Result<(), BrokerError>;

    /// Decline an offer that the planner chose not to use.
    async fn decline(&self, offer_id: &OfferId) -> Result<(), BrokerError>;

    /// Ask the broker to kill a running task.
    async fn kill(&self, task_id: &TaskId) -> Result<(), BrokerError>;

    /// Ask the broker to reconcile the status of the given tasks, typically
    /// after a reregistration, so missed status updates surface again.
    async fn reconcile(&self, task_ids: &[TaskId]) -> Result<(), BrokerError>;
}
