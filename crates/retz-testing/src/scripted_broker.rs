//! A `ResourceBroker` test double that records every call it receives and
//! lets a test script every launch outcome in advance, so the Dispatcher's
//! compensating-transaction path (revert a rejected launch back to
//! `QUEUED`) can be exercised deterministically.

use async_trait::async_trait;
use retz_broker::{BrokerError, CommandSpec, Offer, OfferId, ResourceBroker, TaskId};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub enum Call {
    Launch {
        task_id: TaskId,
        cmd: CommandSpec,
        offer: Offer,
    },
    Decline(OfferId),
    Kill(TaskId),
    Reconcile(Vec<TaskId>),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    reject: Vec<TaskId>,
}

/// A broker whose `launch` calls fail for any task id pre-registered via
/// [`ScriptedBroker::reject_launch`]; every other call always succeeds.
/// Every call is recorded and retrievable via [`ScriptedBroker::calls`] for
/// assertions.
#[derive(Default)]
pub struct ScriptedBroker {
    state: Mutex<State>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Causes the next `launch` for `task_id` to return `LaunchRejected`.
    pub fn reject_launch(&self, task_id: TaskId) {
        self.state.lock().unwrap().reject.push(task_id);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Launch { .. }))
            .count()
    }

    pub fn decline_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Decline(_)))
            .count()
    }
}

#[async_trait]
impl ResourceBroker for ScriptedBroker {
    async fn launch(
        &self,
        task_id: &TaskId,
        cmd: &CommandSpec,
        offer: &Offer,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        let rejected = if let Some(pos) = state.reject.iter().position(|t| t == task_id) {
            state.reject.remove(pos);
            true
        } else {
            false
        };
        state.calls.push(Call::Launch {
            task_id: task_id.clone(),
            cmd: cmd.clone(),
            offer: offer.clone(),
        });
        if rejected {
            return Err(BrokerError::LaunchRejected {
                task_id: task_id.clone(),
                reason: "scripted rejection".to_string(),
            });
        }
        Ok(())
    }

    async fn decline(&self, offer_id: &OfferId) -> Result<(), BrokerError> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::Decline(offer_id.clone()));
        Ok(())
    }

    async fn kill(&self, task_id: &TaskId) -> Result<(), BrokerError> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::Kill(task_id.clone()));
        Ok(())
    }

    async fn reconcile(&self, task_ids: &[TaskId]) -> Result<(), BrokerError> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(Call::Reconcile(task_ids.to_vec()));
        Ok(())
    }
}
