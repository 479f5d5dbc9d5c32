//! Store-level properties that don't need a Dispatcher: the
//! resource-cap prefix rule, application lifecycle guards, and retention.

use retz_core::{OrderKey, RetentionGc, RetzError, Store};
use retz_testing::fixtures;
use retz_testing::SqliteStore;
use std::sync::Arc;

async fn fresh_store() -> SqliteStore {
    let store = SqliteStore::new_in_memory().await.unwrap();
    store.add_user(fixtures::user("alice")).await.unwrap();
    store
        .add_application(fixtures::application("app1", "alice"))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn find_fit_stops_at_first_job_that_would_exceed_cap() {
    let store = fresh_store().await;
    for i in 0..3 {
        store
            .safe_add_job(fixtures::job_with_resources(
                "app1",
                &format!("j{i}"),
                retz_broker::Resources::new(2, 512, 0, 0),
            ))
            .await
            .unwrap();
    }

    // Room for exactly 2 of the 3 jobs (2 cpu each, cap is 5).
    let fit = store.find_fit(&[OrderKey::Id], 5, 4096).await.unwrap();
    assert_eq!(fit.len(), 2);
}

#[tokio::test]
async fn add_application_rejects_disabled_owner() {
    let store = SqliteStore::new_in_memory().await.unwrap();
    let mut disabled = fixtures::user("bob");
    disabled.enabled = false;
    store.add_user(disabled).await.unwrap();

    let ok = store
        .add_application(fixtures::application("app2", "bob"))
        .await
        .unwrap();
    assert!(!ok);
    assert!(store.get_application("app2").await.unwrap().is_none());
}

#[tokio::test]
async fn delete_application_refuses_while_jobs_are_non_terminal() {
    let store = fresh_store().await;
    store
        .safe_add_job(fixtures::job("app1", "j1"))
        .await
        .unwrap();

    let err = store.delete_application("app1").await.unwrap_err();
    assert!(matches!(err, RetzError::ApplicationInUse(_)));
}

#[tokio::test]
async fn safe_add_job_rejects_unknown_application() {
    let store = SqliteStore::new_in_memory().await.unwrap();
    let err = store
        .safe_add_job(fixtures::job("no-such-app", "j1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RetzError::ApplicationNotFound(_)));
}

#[tokio::test]
async fn sum_running_resources_counts_only_starting_and_started_jobs() {
    let store = fresh_store().await;
    let queued = store
        .safe_add_job(fixtures::job_with_resources(
            "app1",
            "queued",
            retz_broker::Resources::new(9, 9999, 0, 0),
        ))
        .await
        .unwrap();
    let running = store
        .safe_add_job(fixtures::job_with_resources(
            "app1",
            "running",
            retz_broker::Resources::new(2, 256, 1, 0),
        ))
        .await
        .unwrap();
    store
        .apply_transition(
            running.id,
            retz_core::Transition::Starting {
                task_id: "t1".into(),
                url: None,
                at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();
    let _ = queued;

    let total = store.sum_running_resources().await.unwrap();
    assert_eq!(total, retz_broker::Resources::new(2, 256, 1, 0));
}

#[tokio::test]
async fn retention_gc_purges_only_past_the_leeway_window() {
    let store = Arc::new(fresh_store().await);
    let job = store.safe_add_job(fixtures::job("app1", "j1")).await.unwrap();

    let old_finish = chrono::Utc::now() - chrono::Duration::hours(2);
    store
        .apply_transition(
            job.id,
            retz_core::Transition::Starting {
                task_id: "t1".into(),
                url: None,
                at: old_finish,
            },
        )
        .await
        .unwrap();
    store
        .apply_transition(
            job.id,
            retz_core::Transition::Started { at: old_finish },
        )
        .await
        .unwrap();
    store
        .apply_transition(
            job.id,
            retz_core::Transition::Finished {
                at: old_finish,
                exit_code: Some(0),
            },
        )
        .await
        .unwrap();

    // Leeway of 1 hour: a job finished 2 hours ago is past the window.
    let gc = RetentionGc::new(store.clone(), chrono::Duration::hours(1));
    gc.tick().await;

    assert!(store.get_job(job.id).await.unwrap().is_none());
}

#[tokio::test]
async fn retention_gc_leaves_recently_finished_jobs() {
    let store = Arc::new(fresh_store().await);
    let job = store.safe_add_job(fixtures::job("app1", "j1")).await.unwrap();
    let now = chrono::Utc::now();

    store
        .apply_transition(
            job.id,
            retz_core::Transition::Starting {
                task_id: "t1".into(),
                url: None,
                at: now,
            },
        )
        .await
        .unwrap();
    store
        .apply_transition(job.id, retz_core::Transition::Started { at: now })
        .await
        .unwrap();
    store
        .apply_transition(
            job.id,
            retz_core::Transition::Finished {
                at: now,
                exit_code: Some(0),
            },
        )
        .await
        .unwrap();

    let gc = RetentionGc::new(store.clone(), chrono::Duration::hours(1));
    gc.tick().await;

    assert!(store.get_job(job.id).await.unwrap().is_some());
}
