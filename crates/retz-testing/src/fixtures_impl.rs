//! Builders for the persistent entities, with sane defaults so a test can
//! override only the field it cares about.

use retz_broker::Resources;
use retz_core::{Application, Job, JobState, User};
use std::collections::BTreeSet;

pub fn user(key_id: &str) -> User {
    User {
        key_id: key_id.to_string(),
        secret: format!("{key_id}-secret"),
        enabled: true,
        info: format!("fixture user {key_id}"),
        extra: serde_json::Map::new(),
    }
}

pub fn application(appid: &str, owner: &str) -> Application {
    Application {
        appid: appid.to_string(),
        owner: owner.to_string(),
        definition: serde_json::json!({}),
        extra: serde_json::Map::new(),
    }
}

/// A `QUEUED` job with 1 cpu / 128MB, ready to be passed to `safe_add_job`.
/// `id` is ignored by `safe_add_job` (the store assigns it) but is set here
/// so fixtures can also be used directly against `state_machine::apply` in
/// unit tests that never touch a store.
pub fn job(appid: &str, name: &str) -> Job {
    Job {
        id: 0,
        appid: appid.to_string(),
        name: name.to_string(),
        cmd: "true".to_string(),
        priority: 0,
        tags: BTreeSet::new(),
        task_id: None,
        state: JobState::Queued,
        resources: Resources::new(1, 128, 0, 0),
        url: None,
        finished: None,
        retry: 0,
        extra: serde_json::Map::new(),
    }
}

pub fn job_with_resources(appid: &str, name: &str, resources: Resources) -> Job {
    Job {
        resources,
        ..job(appid, name)
    }
}

pub fn job_with_priority(appid: &str, name: &str, priority: i32) -> Job {
    Job {
        priority,
        ..job(appid, name)
    }
}
