//! The `Store` trait: the single owner of all persistent state. Every
//! method here either is a single-statement read (auto-committing) or runs
//! its own transaction internally — callers never see a transaction
//! handle. Concrete implementations (`retz-store-postgres`,
//! `retz-testing::SqliteStore`) are required to run every multi-statement
//! operation at `SERIALIZABLE` isolation (or, for the SQLite test double,
//! its closest equivalent — see that crate's docs).

use crate::error::RetzError;
use crate::model::{Application, Job, JobState, OrderKey, Property, User};
use crate::state_machine::Transition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use retz_broker::Resources;

/// A requested Job mutation paired with the transition to apply, used by
/// the batch mutators (`apply_transitions`) so the Dispatcher can move many
/// Jobs in one transaction without smuggling closures across it.
#[derive(Debug, Clone)]
pub struct PendingTransition {
    pub job_id: i64,
    pub transition: Transition,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- Users ------------------------------------------------------------
    async fn all_users(&self) -> Result<Vec<User>, RetzError>;
    async fn add_user(&self, user: User) -> Result<(), RetzError>;
    async fn create_user(&self, info: String) -> Result<User, RetzError>;
    async fn get_user(&self, key_id: &str) -> Result<Option<User>, RetzError>;
    async fn enable_user(&self, key_id: &str, enabled: bool) -> Result<(), RetzError>;

    // -- Applications -------------------------------------------------------
    async fn get_all_applications(
        &self,
        owner: Option<&str>,
    ) -> Result<Vec<Application>, RetzError>;
    /// Returns `false` (no row written) if `owner` does not exist or is
    /// disabled. Otherwise atomically replaces any existing row sharing
    /// `appid` (delete+insert as one transaction) and returns `true`.
    async fn add_application(&self, app: Application) -> Result<bool, RetzError>;
    async fn get_application(&self, appid: &str) -> Result<Option<Application>, RetzError>;
    /// Refuses with `ApplicationInUse` if any Job in a non-terminal state
    /// references `appid`.
    async fn delete_application(&self, appid: &str) -> Result<(), RetzError>;

    // -- Jobs ---------------------------------------------------------------
    /// Inserts only if `appid` names an existing Application; fails with
    /// `ApplicationNotFound` otherwise.
    async fn safe_add_job(&self, job: Job) -> Result<Job, RetzError>;
    async fn get_job(&self, id: i64) -> Result<Option<Job>, RetzError>;
    async fn get_job_from_task_id(&self, task_id: &str) -> Result<Option<Job>, RetzError>;
    async fn get_app_job(&self, id: i64) -> Result<Option<(Application, Job)>, RetzError>;
    async fn list_jobs(
        &self,
        owner: &str,
        state: Option<JobState>,
        tag: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Job>, RetzError>;
    /// Jobs in `QUEUED`, ordered by `id ASC`.
    async fn queued(&self, limit: i64) -> Result<Vec<Job>, RetzError>;
    /// The planner's primitive query: the longest prefix of `QUEUED` Jobs
    /// (sorted ascending by `order_by`, ties broken in list order, no
    /// duplicates) whose cumulative cpu and memMB both remain within the
    /// given caps. Stops at the first Job that would exceed either cap —
    /// never skips ahead.
    async fn find_fit(
        &self,
        order_by: &[OrderKey],
        cpu: i64,
        mem_mb: i64,
    ) -> Result<Vec<Job>, RetzError>;
    /// Union of `STARTING` and `STARTED`.
    async fn get_running(&self) -> Result<Vec<Job>, RetzError>;
    /// The resource totals of every `STARTING`/`STARTED` Job, computed as a
    /// single aggregate query rather than by fetching and summing full rows
    /// — `StatusReporter::status` calls this instead of `get_running` so it
    /// never has to deserialize a running Job just to add up its resources.
    async fn sum_running_resources(&self) -> Result<Resources, RetzError>;
    /// Half-open interval `[start, end)` on the `finished` column.
    async fn finished_jobs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Job>, RetzError>;

    /// Transactional read-apply-write: reads the Job inside the
    /// transaction, applies `transition` via `state_machine::apply`, and
    /// commits the result. Fails with `JobNotFound` if `job_id` is absent
    /// and with `IllegalTransition` if the transition does not apply to the
    /// Job's current state.
    async fn apply_transition(
        &self,
        job_id: i64,
        transition: Transition,
    ) -> Result<Job, RetzError>;

    /// Batch form of `apply_transition`: every pending transition is
    /// applied in one transaction. A single illegal transition aborts the
    /// whole batch (callers that want partial application should call
    /// `apply_transition` individually).
    async fn apply_transitions(
        &self,
        pending: Vec<PendingTransition>,
    ) -> Result<Vec<Job>, RetzError>;

    async fn count_jobs(&self) -> Result<i64, RetzError>;
    async fn count_queued(&self) -> Result<i64, RetzError>;
    async fn count_running(&self) -> Result<i64, RetzError>;
    async fn get_latest_job_id(&self) -> Result<Option<i64>, RetzError>;

    // -- Properties -----------------------------------------------------------
    /// Upsert. Returns `true` on any successful write; finer
    /// inserted-vs-replaced semantics are not required by any caller.
    async fn set_framework_id(&self, id: &str) -> Result<bool, RetzError>;
    async fn get_framework_id(&self) -> Result<Option<String>, RetzError>;
    async fn delete_all_properties(&self) -> Result<(), RetzError>;
    async fn get_property(&self, key: &str) -> Result<Option<Property>, RetzError>;

    // -- Retention --------------------------------------------------------
    /// Purges `FINISHED`/`KILLED` Jobs whose `finished` timestamp is older
    /// than `now - leeway`. Runs in its own transaction; returns the number
    /// of rows deleted.
    async fn delete_old_jobs(&self, leeway: chrono::Duration) -> Result<u64, RetzError>;

    /// Drains the connection pool: waits until the active connection count
    /// is zero, then closes it. Implementations poll with backoff.
    async fn stop(&self);
}
