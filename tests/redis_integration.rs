//! Integration tests against a live Redis server.
//!
//! Each test uses its own key prefix, so they can share a database.
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use forge_queue::store::{LeasedStage, Outcome, QueueSet, Transition};
use forge_queue::{Chunk, Job, Queue, QueueBuilder, RedisStore, Store, Task, WorkerDefinition};

fn redis_url() -> String {
    std::env::var("REDIS_URL")
        .expect("REDIS_URL environment variable must be set for integration tests")
}

async fn connect() -> RedisStore {
    let prefix = format!("forge-queue-test:{}:", uuid::Uuid::new_v4());
    RedisStore::connect(&redis_url(), &prefix)
        .await
        .expect("Should connect to Redis")
}

struct SquareJob {
    reduced: mpsc::UnboundedSender<Vec<Value>>,
}

#[async_trait]
impl Job for SquareJob {
    async fn map(&self, task: &Task) -> anyhow::Result<Vec<Value>> {
        let n = task.data()["n"].as_u64().context("missing n")?;
        Ok((1..=n).map(|i| json!(i)).collect())
    }

    async fn process(&self, chunk: &Chunk) -> anyhow::Result<Value> {
        let value = chunk.data().as_i64().context("chunk is not an integer")?;
        Ok(json!(value * value))
    }

    async fn reduce(&self, _task: &Task, results: Vec<Value>) -> anyhow::Result<()> {
        let _ = self.reduced.send(results);
        Ok(())
    }
}

fn square_queue(store: Arc<RedisStore>, reduced: mpsc::UnboundedSender<Vec<Value>>) -> Queue {
    QueueBuilder::new(store)
        .with_tick_interval(Duration::from_millis(20))
        .register_worker(
            WorkerDefinition::new("square", SquareJob { reduced })
                .with_chunks_per_instance(2)
                .with_retry_delay(Duration::from_millis(100)),
        )
        .expect("worker definition should be valid")
        .build()
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_map_reduce_across_two_processes() {
    let store = Arc::new(connect().await);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let a = square_queue(Arc::clone(&store), tx.clone());
    let b = square_queue(Arc::clone(&store), tx);

    a.start().expect("Should start");
    b.start().expect("Should start");

    let task_id = a.push("square", &json!({"n": 5})).await.expect("Should push");

    let results = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("Task should finish")
        .expect("Channel should stay open");
    let mut squares: Vec<i64> = results.iter().filter_map(Value::as_i64).collect();
    squares.sort_unstable();
    assert_eq!(squares, vec![1, 4, 9, 16, 25]);

    // Deletion follows reduce
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.task(&task_id).await.expect("Should read").is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Task should be deleted");

    a.shutdown().await;
    b.shutdown().await;

    assert_eq!(a.stats().await.expect("Should count").total(), 0);
}

#[tokio::test]
#[ignore]
async fn test_transitions_are_exclusive() {
    let store = connect().await;
    let task_id = store.keys().task_id("w", "1");

    let added = store
        .apply(Transition::AddTask {
            task_id: task_id.clone(),
            worker: "w".to_string(),
            data: "{}".to_string(),
        })
        .await
        .expect("Should add");
    assert_eq!(added, Outcome::Applied);

    let again = store
        .apply(Transition::AddTask {
            task_id: task_id.clone(),
            worker: "w".to_string(),
            data: "{\"other\":true}".to_string(),
        })
        .await
        .expect("Should apply");
    assert_eq!(again, Outcome::Skipped);

    let claim = || Transition::PendingToMapping {
        task_id: task_id.clone(),
        deadline: 1_000,
    };
    let (first, second) = tokio::join!(store.apply(claim()), store.apply(claim()));
    let outcomes = [first.expect("Should apply"), second.expect("Should apply")];
    assert_eq!(
        outcomes.iter().filter(|o| **o == Outcome::Applied).count(),
        1
    );

    assert_eq!(
        store.due(QueueSet::Mapping, 1_000).await.expect("Should read"),
        vec![(task_id.clone(), 1_000)]
    );

    // Stale lease
    let stale = store
        .apply(Transition::RetryStage {
            stage: LeasedStage::Mapping,
            task_id: task_id.clone(),
            deadline: 2_000,
            expected: 999,
            max_retries: Some(2),
        })
        .await
        .expect("Should apply");
    assert_eq!(stale, Outcome::Skipped);

    let record = store.task(&task_id).await.expect("Should read").expect("Should exist");
    assert_eq!(record.data, "{}");
    assert_eq!(record.retries, 0);

    let deleted = store
        .apply(Transition::DeleteTask {
            task_id: task_id.clone(),
        })
        .await
        .expect("Should delete");
    assert_eq!(deleted, Outcome::Applied);
    assert!(store.task(&task_id).await.expect("Should read").is_none());
}

#[tokio::test]
#[ignore]
async fn test_cron_lock_shared_between_connections() {
    let first = Arc::new(connect().await);
    let prefix = first.keys().prefix().to_string();
    let second = Arc::new(
        RedisStore::connect(&redis_url(), &prefix)
            .await
            .expect("Should connect to Redis"),
    );

    let build = |store: Arc<RedisStore>| {
        QueueBuilder::new(store)
            .register_worker(
                WorkerDefinition::from_fn("hourly", |data| async move { Ok(data) })
                    .with_cron("0 * * * *"),
            )
            .expect("worker definition should be valid")
            .build()
    };
    let a = build(first);
    let b = build(second);

    let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let (ra, rb) = tokio::join!(a.fire_cron("hourly", at), b.fire_cron("hourly", at));
    let fired = [ra.expect("Should fire"), rb.expect("Should fire")];

    assert_eq!(fired.iter().filter(|id| id.is_some()).count(), 1);
    assert_eq!(a.stats().await.expect("Should count").pending, 1);
}

#[tokio::test]
#[ignore]
async fn test_server_clock() {
    let store = connect().await;

    let server = store.now().await.expect("Should read TIME");
    let local = Utc::now().timestamp_millis();

    // Same host in CI; allow generous skew elsewhere
    assert!((server - local).abs() < 60_000, "skew of {} ms", server - local);
}
