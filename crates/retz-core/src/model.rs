//! The persistent entities: `User`, `Application`, `Job`,
//! `Property`. Each mirrors a row: an indexed identity plus the fields that
//! round-trip through the store's `json` column. Every type here derives
//! `Serialize`/`Deserialize` directly — the JSON-in-column pattern means
//! these structs *are* the canonical wire format, not a projection of one.

use retz_broker::Resources;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A principal owning Applications. Never deleted — only soft-disabled via
/// `enabled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub key_id: String,
    pub secret: String,
    pub enabled: bool,
    pub info: String,

    /// Fields unknown to this version of the schema, preserved verbatim so
    /// a newer writer's extra JSON keys survive an older reader's
    /// round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A reusable execution environment: container image, files, env — opaque
/// to the scheduler beyond `appid` and `owner`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub appid: String,
    pub owner: String,
    /// Opaque definition blob (image, files, env). The scheduler never
    /// interprets this; it only round-trips it.
    pub definition: serde_json::Value,

    /// Fields unknown to this version of the schema, preserved verbatim so
    /// a newer writer's extra JSON keys survive an older reader's
    /// round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A Job's position in the state machine. Transitions are validated
/// exclusively by `state_machine::apply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Queued,
    Starting,
    Started,
    Finished,
    Killed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Killed)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Starting | JobState::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Starting => "STARTING",
            JobState::Started => "STARTED",
            JobState::Finished => "FINISHED",
            JobState::Killed => "KILLED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobState::Queued),
            "STARTING" => Ok(JobState::Starting),
            "STARTED" => Ok(JobState::Started),
            "FINISHED" => Ok(JobState::Finished),
            "KILLED" => Ok(JobState::Killed),
            other => Err(format!("unknown job state `{other}`")),
        }
    }
}

/// A single execution request. `id` is assigned at enqueue time and is
/// monotonic within one Store instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub appid: String,
    pub name: String,
    pub cmd: String,
    pub priority: i32,
    pub tags: BTreeSet<String>,
    pub task_id: Option<String>,
    pub state: JobState,
    pub resources: Resources,
    pub url: Option<String>,
    pub finished: Option<chrono::DateTime<chrono::Utc>>,
    pub retry: i32,

    /// Fields unknown to this version of the schema, preserved verbatim so
    /// a newer writer's extra JSON keys survive an older reader's
    /// round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// `taskId` is null iff `state == QUEUED`.
    pub fn task_id_invariant_holds(&self) -> bool {
        (self.state == JobState::Queued) == self.task_id.is_none()
    }
}

/// Singleton key/value row for scheduler-global metadata (notably
/// `frameworkId`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub key: String,
    pub value: String,
}

/// A column Jobs may be ordered by in `findFit`/`queued`/`listJobs`. Kept as
/// an explicit enum (rather than a raw string) so a planner strategy can't
/// accidentally request a column the store doesn't index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKey {
    Id,
    Priority,
}

impl OrderKey {
    pub fn column(&self) -> &'static str {
        match self {
            OrderKey::Id => "id",
            OrderKey::Priority => "priority",
        }
    }
}
