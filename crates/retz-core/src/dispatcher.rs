//! The dispatcher: drives the configured planner on broker
//! events and applies the resulting plan to the Store. This is the only
//! component that is re-entered directly by the broker; client API
//! mutations go straight to the Store and race with it under
//! `SERIALIZABLE` isolation rather than an in-process lock.

use crate::error::{Categorizable, RetzError};
use crate::model::JobState;
use crate::planner::Planner;
use crate::state_machine::Transition;
use crate::store::{PendingTransition, Store};
use chrono::Utc;
use retz_broker::{BrokerTaskStatus, CommandSpec, Offer, ResourceBroker, StatusUpdate, TaskId};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Dispatcher {
    store: Arc<dyn Store>,
    broker: Arc<dyn ResourceBroker>,
    planner: Box<dyn Planner>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn ResourceBroker>,
        planner: Box<dyn Planner>,
    ) -> Self {
        Self {
            store,
            broker,
            planner,
        }
    }

    /// `onOffers`: plan against the current queue, mark the chosen Jobs
    /// `STARTING` in one transaction, then submit launches to the broker.
    /// A broker-rejected launch is compensated by reverting that one Job
    /// back to `QUEUED`; it does not abort the rest of the batch.
    pub async fn on_offers(&self, offers: Vec<Offer>) -> Result<(), RetzError> {
        let plan = self.planner.plan(self.store.as_ref(), &offers).await?;

        if plan.launches.is_empty() {
            for offer_id in &plan.to_decline {
                if let Err(e) = self.broker.decline(offer_id).await {
                    warn!(offer_id = %offer_id, error = %e, "failed to decline offer");
                }
            }
            return Ok(());
        }

        let now = Utc::now();
        let pending: Vec<PendingTransition> = plan
            .launches
            .iter()
            .map(|(job, _offer_id)| PendingTransition {
                job_id: job.id,
                transition: Transition::Starting {
                    task_id: task_id_for(job.id).0,
                    url: None,
                    at: now,
                },
            })
            .collect();

        let started = self.store.apply_transitions(pending).await?;
        info!(count = started.len(), "marked jobs STARTING");

        let offers_by_id: std::collections::HashMap<_, _> =
            offers.iter().map(|o| (o.id.clone(), o)).collect();

        for (job, offer_id) in started.iter().zip(plan.launches.iter().map(|(_, o)| o)) {
            let task_id = job
                .task_id
                .clone()
                .map(TaskId)
                .expect("STARTING transition always sets taskId");
            let offer = offers_by_id
                .get(offer_id)
                .expect("offer_id came from the offers we were just given");
            let cmd = CommandSpec {
                cmd: job.cmd.clone(),
                appid: job.appid.clone(),
                env: Vec::new(),
            };

            if let Err(e) = self.broker.launch(&task_id, &cmd, offer).await {
                warn!(job_id = job.id, error = %e, "broker rejected launch, reverting to QUEUED");
                if let Err(revert_err) = self
                    .store
                    .apply_transition(job.id, Transition::Retry)
                    .await
                {
                    warn!(job_id = job.id, error = %revert_err, "failed to revert rejected launch");
                }
            }
        }

        for offer_id in &plan.to_decline {
            if let Err(e) = self.broker.decline(offer_id).await {
                warn!(offer_id = %offer_id, error = %e, "failed to decline offer");
            }
        }

        Ok(())
    }

    /// `onStatusUpdate`: look up the Job by taskId and apply the matching
    /// transition. A status update for a taskId we don't recognise, or one
    /// whose transition the state machine rejects (a stale update for an
    /// already-terminal Job), is logged and dropped rather than propagated.
    pub async fn on_status_update(&self, update: StatusUpdate) {
        let job = match self
            .store
            .get_job_from_task_id(&update.task_id.0)
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(task_id = %update.task_id, "status update for unknown task, dropping");
                return;
            }
            Err(e) => {
                warn!(task_id = %update.task_id, error = %e, "failed to look up task for status update");
                return;
            }
        };

        let transition = match update.status {
            BrokerTaskStatus::Starting => Transition::Starting {
                task_id: update.task_id.0.clone(),
                url: update.sandbox_url.clone(),
                at: update.timestamp,
            },
            BrokerTaskStatus::Started => Transition::Started {
                at: update.timestamp,
            },
            BrokerTaskStatus::Finished => Transition::Finished {
                at: update.timestamp,
                exit_code: update.exit_code,
            },
            BrokerTaskStatus::Lost | BrokerTaskStatus::Failed | BrokerTaskStatus::Killed => {
                Transition::Killed {
                    at: update.timestamp,
                    reason: format!("{:?}", update.status),
                }
            }
        };

        match self.store.apply_transition(job.id, transition).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                warn!(job_id = job.id, error = %e, "dropping stale or illegal status update");
            }
            Err(e) => {
                warn!(job_id = job.id, error = %e, "status update handling failed");
            }
        }
    }

    /// `onDisconnected`: no state mutation; the scheduler relies on
    /// reregistration and reconciliation to recover.
    pub async fn on_disconnected(&self) {
        warn!("broker disconnected; awaiting reregistration");
    }

    /// `onReregistered`: persist the (re)issued framework id. A mismatch
    /// against a previously persisted id is an `InvariantViolation` —
    /// framework identity must never silently change underneath running
    /// jobs.
    pub async fn on_reregistered(&self, framework_id: &str) -> Result<(), RetzError> {
        if let Some(existing) = self.store.get_framework_id().await? {
            if existing != framework_id {
                return Err(RetzError::InvariantViolation(format!(
                    "frameworkId changed from {existing} to {framework_id} across reregistration"
                )));
            }
            return Ok(());
        }
        self.store.set_framework_id(framework_id).await?;
        Ok(())
    }

    /// Gathers currently running task ids and asks the broker to
    /// reconcile them. Not one of the broker-driven events but implied by
    /// `reconcile(taskIds)` appearing on the broker interface with no other
    /// caller: a scheduler that never reconciles after a restart can't
    /// recover from missed status updates.
    pub async fn reconcile_running(&self) -> Result<(), RetzError> {
        let running = self.store.get_running().await?;
        let task_ids: Vec<TaskId> = running
            .iter()
            .filter(|j| j.state == JobState::Starting || j.state == JobState::Started)
            .filter_map(|j| j.task_id.clone().map(TaskId))
            .collect();
        if task_ids.is_empty() {
            return Ok(());
        }
        self.broker
            .reconcile(&task_ids)
            .await
            .map_err(|e| RetzError::InvariantViolation(format!("reconcile failed: {e}")))
    }
}

/// Generates a broker-facing task id for a newly launched Job. Real
/// deployments hand this responsibility to the broker driver (Mesos issues
/// its own task ids); this default is deterministic and collision-free
/// within one scheduler process, which is sufficient for the in-memory test
/// broker and documents the expected shape for a real driver to replace.
fn task_id_for(job_id: i64) -> TaskId {
    TaskId(format!("retz-job-{job_id}"))
}
