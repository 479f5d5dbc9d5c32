//! The Job lifecycle state machine. This module is the single
//! source of truth for which attribute changes accompany which transition;
//! the Store commits whatever this module returns and nothing else.
//!
//! ```text
//! QUEUED ──► STARTING ──► STARTED ──► FINISHED
//!    │           │            │
//!    │           └──► KILLED ◄┘
//!    └─────────────► KILLED
//! ```
//!
//! `retry()` additionally allows `FINISHED|KILLED → QUEUED`, and also
//! `STARTING → QUEUED` for the one case where a Job must revert before it
//! ever ran: the Dispatcher marks a Job `STARTING` before it asks the
//! broker to launch it, so a broker-rejected launch has to compensate by
//! sending that same Job back to `QUEUED`.

use crate::error::RetzError;
use crate::model::{Job, JobState};
use chrono::{DateTime, Utc};

/// One of the five named transitions a caller may request. Deliberately a
/// closed enum rather than a callback — see `retz-core::store::Store`'s
/// `apply_transition` for why: closures can't cross a transactional
/// boundary cleanly, but a typed transition can be matched on, logged, and
/// replayed.
#[derive(Debug, Clone)]
pub enum Transition {
    Starting {
        task_id: String,
        url: Option<String>,
        at: DateTime<Utc>,
    },
    Started {
        at: DateTime<Utc>,
    },
    Finished {
        at: DateTime<Utc>,
        exit_code: Option<i32>,
    },
    Killed {
        at: DateTime<Utc>,
        reason: String,
    },
    Retry,
}

impl Transition {
    fn target_state(&self) -> JobState {
        match self {
            Transition::Starting { .. } => JobState::Starting,
            Transition::Started { .. } => JobState::Started,
            Transition::Finished { .. } => JobState::Finished,
            Transition::Killed { .. } => JobState::Killed,
            Transition::Retry => JobState::Queued,
        }
    }

    fn is_legal_from(&self, from: JobState) -> bool {
        match self {
            Transition::Starting { .. } => from == JobState::Queued,
            Transition::Started { .. } => from == JobState::Starting,
            Transition::Finished { .. } => {
                matches!(from, JobState::Starting | JobState::Started)
            }
            Transition::Killed { .. } => !from.is_terminal(),
            Transition::Retry => from.is_terminal() || from == JobState::Starting,
        }
    }
}

/// Applies `transition` to `job`, returning the mutated Job on success.
/// `job` is left untouched (the caller still owns the original) on
/// rejection; the error names both the from- and to-state so callers can
/// decide whether to log-and-drop (stale broker updates) or surface
/// `IllegalTransition` (client-originated mutations).
pub fn apply(job: &Job, transition: Transition) -> Result<Job, RetzError> {
    if !transition.is_legal_from(job.state) {
        return Err(RetzError::IllegalTransition {
            from: job.state,
            to: transition.target_state(),
        });
    }

    let mut next = job.clone();
    match transition {
        Transition::Starting { task_id, url, at } => {
            next.state = JobState::Starting;
            next.task_id = Some(task_id);
            next.url = url;
            next.finished = None;
            let _ = at; // reserved for a future started_at column; not yet part of the Job model
        }
        Transition::Started { at: _ } => {
            next.state = JobState::Started;
        }
        Transition::Finished { at, exit_code: _ } => {
            next.state = JobState::Finished;
            next.finished = Some(at);
        }
        Transition::Killed { at, reason } => {
            next.state = JobState::Killed;
            next.finished = Some(at);
            next.extra
                .insert("killReason".to_string(), serde_json::Value::String(reason));
        }
        Transition::Retry => {
            next.state = JobState::Queued;
            next.retry += 1;
            next.task_id = None;
            next.url = None;
            next.finished = None;
        }
    }

    debug_assert!(
        next.task_id_invariant_holds(),
        "state machine produced a Job violating the taskId/QUEUED invariant"
    );

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use retz_broker::Resources;
    use std::collections::BTreeSet;

    fn job(state: JobState) -> Job {
        Job {
            id: 1,
            appid: "app1".into(),
            name: "job".into(),
            cmd: "echo hi".into(),
            priority: 0,
            tags: BTreeSet::new(),
            task_id: if state == JobState::Queued {
                None
            } else {
                Some("task-1".into())
            },
            state,
            resources: Resources::new(1, 128, 0, 0),
            url: None,
            finished: None,
            retry: 0,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn queued_to_starting_sets_task_id_and_url() {
        let j = job(JobState::Queued);
        let now = Utc::now();
        let next = apply(
            &j,
            Transition::Starting {
                task_id: "task-1".into(),
                url: Some("http://sandbox".into()),
                at: now,
            },
        )
        .unwrap();
        assert_eq!(next.state, JobState::Starting);
        assert_eq!(next.task_id.as_deref(), Some("task-1"));
        assert_eq!(next.url.as_deref(), Some("http://sandbox"));
    }

    #[test]
    fn starting_to_started() {
        let j = job(JobState::Starting);
        let next = apply(&j, Transition::Started { at: Utc::now() }).unwrap();
        assert_eq!(next.state, JobState::Started);
    }

    #[test]
    fn started_to_finished_stamps_finished() {
        let j = job(JobState::Started);
        let now = Utc::now();
        let next = apply(
            &j,
            Transition::Finished {
                at: now,
                exit_code: Some(0),
            },
        )
        .unwrap();
        assert_eq!(next.state, JobState::Finished);
        assert_eq!(next.finished, Some(now));
    }

    #[test]
    fn late_started_on_finished_job_is_rejected() {
        let j = job(JobState::Finished);
        let err = apply(&j, Transition::Started { at: Utc::now() }).unwrap_err();
        assert!(matches!(err, RetzError::IllegalTransition { .. }));
    }

    #[test]
    fn any_nonterminal_can_be_killed() {
        for s in [JobState::Queued, JobState::Starting, JobState::Started] {
            let j = job(s);
            let next = apply(
                &j,
                Transition::Killed {
                    at: Utc::now(),
                    reason: "operator kill".into(),
                },
            )
            .unwrap();
            assert_eq!(next.state, JobState::Killed);
        }
    }

    #[test]
    fn killed_to_starting_is_rejected() {
        let j = job(JobState::Killed);
        let err = apply(
            &j,
            Transition::Starting {
                task_id: "task-2".into(),
                url: None,
                at: Utc::now(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, RetzError::IllegalTransition { .. }));
    }

    #[test]
    fn retry_from_finished_clears_task_fields_and_increments_counter() {
        let mut j = job(JobState::Finished);
        j.finished = Some(Utc::now());
        j.retry = 2;
        let next = apply(&j, Transition::Retry).unwrap();
        assert_eq!(next.state, JobState::Queued);
        assert_eq!(next.retry, 3);
        assert!(next.task_id.is_none());
        assert!(next.url.is_none());
        assert!(next.finished.is_none());
    }

    #[test]
    fn retry_from_queued_is_rejected() {
        let j = job(JobState::Queued);
        let err = apply(&j, Transition::Retry).unwrap_err();
        assert!(matches!(err, RetzError::IllegalTransition { .. }));
    }

    #[test]
    fn retry_from_starting_reverts_a_rejected_launch_to_queued() {
        let j = job(JobState::Starting);
        let next = apply(&j, Transition::Retry).unwrap();
        assert_eq!(next.state, JobState::Queued);
        assert_eq!(next.retry, 1);
        assert!(next.task_id.is_none());
    }

    #[test]
    fn retry_from_started_is_rejected() {
        let j = job(JobState::Started);
        let err = apply(&j, Transition::Retry).unwrap_err();
        assert!(matches!(err, RetzError::IllegalTransition { .. }));
    }
}
