//! End-to-end scenarios driving `Dispatcher` against `SqliteStore` and
//! `ScriptedBroker` together, exercising end-to-end properties that need
//! more than one Store call to observe.

use retz_broker::{BrokerTaskStatus, Offer, OfferId, StatusUpdate, TaskId};
use retz_core::{Dispatcher, Fifo, JobState, Priority, Store};
use retz_testing::fixtures;
use retz_testing::{ScriptedBroker, SqliteStore};
use std::sync::Arc;

async fn fresh_store() -> Arc<SqliteStore> {
    let store = SqliteStore::new_in_memory().await.unwrap();
    store.add_user(fixtures::user("alice")).await.unwrap();
    store
        .add_application(fixtures::application("app1", "alice"))
        .await
        .unwrap();
    Arc::new(store)
}

fn offer(id: &str, cpu: i64, mem_mb: i64) -> Offer {
    Offer {
        id: OfferId(id.to_string()),
        resources: retz_broker::Resources::new(cpu, mem_mb, 0, 0),
        slave_id: format!("slave-{id}"),
    }
}

#[tokio::test]
async fn happy_path_queues_starts_and_finishes() {
    let store = fresh_store().await;
    let broker = Arc::new(ScriptedBroker::new());
    let dispatcher = Dispatcher::new(store.clone(), broker.clone(), Box::new(Fifo::default()));

    let job = store.safe_add_job(fixtures::job("app1", "j1")).await.unwrap();
    assert_eq!(job.state, JobState::Queued);

    dispatcher.on_offers(vec![offer("o1", 4, 1024)]).await.unwrap();
    assert_eq!(broker.launch_count(), 1);

    let started = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(started.state, JobState::Starting);
    assert!(started.task_id.is_some());

    let task_id = TaskId(started.task_id.clone().unwrap());
    dispatcher
        .on_status_update(StatusUpdate {
            task_id: task_id.clone(),
            status: BrokerTaskStatus::Started,
            exit_code: None,
            sandbox_url: None,
            timestamp: chrono::Utc::now(),
        })
        .await;
    assert_eq!(
        store.get_job(job.id).await.unwrap().unwrap().state,
        JobState::Started
    );

    dispatcher
        .on_status_update(StatusUpdate {
            task_id,
            status: BrokerTaskStatus::Finished,
            exit_code: Some(0),
            sandbox_url: None,
            timestamp: chrono::Utc::now(),
        })
        .await;
    let finished = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(finished.state, JobState::Finished);
    assert!(finished.finished.is_some());
}

#[tokio::test]
async fn priority_planner_launches_lower_priority_value_first() {
    let store = fresh_store().await;
    let broker = Arc::new(ScriptedBroker::new());
    let dispatcher = Dispatcher::new(
        store.clone(),
        broker.clone(),
        Box::new(Priority::default()),
    );

    let low = store
        .safe_add_job(fixtures::job_with_priority("app1", "low", 10))
        .await
        .unwrap();
    let high = store
        .safe_add_job(fixtures::job_with_priority("app1", "high", 1))
        .await
        .unwrap();

    // Only enough room in one offer for a single 1-cpu job.
    dispatcher.on_offers(vec![offer("o1", 1, 128)]).await.unwrap();

    let high_after = store.get_job(high.id).await.unwrap().unwrap();
    let low_after = store.get_job(low.id).await.unwrap().unwrap();
    assert_eq!(high_after.state, JobState::Starting);
    assert_eq!(low_after.state, JobState::Queued);
}

#[tokio::test]
async fn rejected_launch_is_reverted_to_queued() {
    let store = fresh_store().await;
    let broker = Arc::new(ScriptedBroker::new());
    let dispatcher = Dispatcher::new(store.clone(), broker.clone(), Box::new(Fifo::default()));

    let job = store.safe_add_job(fixtures::job("app1", "j1")).await.unwrap();
    broker.reject_launch(TaskId(format!("retz-job-{}", job.id)));

    dispatcher.on_offers(vec![offer("o1", 4, 1024)]).await.unwrap();

    let reverted = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(reverted.state, JobState::Queued);
    assert_eq!(reverted.retry, 1);
    assert!(reverted.task_id.is_none());
}

#[tokio::test]
async fn stale_status_update_for_finished_job_is_dropped_not_propagated() {
    let store = fresh_store().await;
    let broker = Arc::new(ScriptedBroker::new());
    let dispatcher = Dispatcher::new(store.clone(), broker.clone(), Box::new(Fifo::default()));

    let job = store.safe_add_job(fixtures::job("app1", "j1")).await.unwrap();
    dispatcher.on_offers(vec![offer("o1", 4, 1024)]).await.unwrap();
    let task_id = TaskId(
        store
            .get_job(job.id)
            .await
            .unwrap()
            .unwrap()
            .task_id
            .unwrap(),
    );

    dispatcher
        .on_status_update(StatusUpdate {
            task_id: task_id.clone(),
            status: BrokerTaskStatus::Finished,
            exit_code: Some(0),
            sandbox_url: None,
            timestamp: chrono::Utc::now(),
        })
        .await;

    // A late STARTED arriving after FINISHED must not panic or mutate the job.
    dispatcher
        .on_status_update(StatusUpdate {
            task_id,
            status: BrokerTaskStatus::Started,
            exit_code: None,
            sandbox_url: None,
            timestamp: chrono::Utc::now(),
        })
        .await;

    let job = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Finished);
}

#[tokio::test]
async fn offers_with_no_room_are_declined() {
    let store = fresh_store().await;
    let broker = Arc::new(ScriptedBroker::new());
    let dispatcher = Dispatcher::new(store.clone(), broker.clone(), Box::new(Fifo::default()));

    dispatcher.on_offers(vec![offer("o1", 4, 1024)]).await.unwrap();
    assert_eq!(broker.decline_count(), 1);
    assert_eq!(broker.launch_count(), 0);
}
