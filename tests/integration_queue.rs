//! End-to-end scenarios against a real PostgreSQL database. Skipped with
//! a warning if `DATABASE_URL` is not set, so the suite degrades
//! gracefully in environments without a database available.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use systeric_pgqueue::{
    EnqueueRequest, FindOptions, Handler, MessageStatus, QueueConfig, StartOptions,
};

async fn connect() -> Option<PgPool> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("skipping: DATABASE_URL not set");
        return None;
    };
    PgPool::connect(&url).await.ok()
}

fn unique_queue_name(label: &str) -> String {
    format!("it_{}_{}", label, uuid::Uuid::new_v4().simple())
}

struct RecordingHandler {
    seen: Arc<Mutex<Vec<serde_json::Value>>>,
    always_fail: bool,
}

#[async_trait::async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, message: &systeric_pgqueue::Message) -> Result<(), String> {
        self.seen.lock().unwrap().push(message.payload.clone());
        if self.always_fail {
            Err("boom".to_string())
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn happy_path_enqueue_process_complete() {
    let Some(pool) = connect().await else { return };
    let config = QueueConfig::new(unique_queue_name("happy"));
    let queue = systeric_pgqueue::Queue::create(config, pool).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    queue
        .register_handler(
            "t",
            Arc::new(RecordingHandler {
                seen: seen.clone(),
                always_fail: false,
            }),
        )
        .unwrap();

    queue
        .enqueue(EnqueueRequest::new("t", json!({"x": 1})))
        .await
        .unwrap();

    queue.start(StartOptions { concurrency: 1 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    queue.stop().await.unwrap();

    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(seen.lock().unwrap()[0], json!({"x": 1}));

    let stats = queue.get_stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.dead_letter, 0);
}

#[tokio::test]
async fn retry_then_dead_letter() {
    let Some(pool) = connect().await else { return };
    let mut config = QueueConfig::new(unique_queue_name("dlq"));
    config.sweep_interval = Duration::from_millis(200);
    let queue = systeric_pgqueue::Queue::create(config, pool).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    queue
        .register_handler(
            "t",
            Arc::new(RecordingHandler {
                seen: seen.clone(),
                always_fail: true,
            }),
        )
        .unwrap();

    let id = queue
        .enqueue(
            EnqueueRequest::new("t", json!({}))
                .with_max_retries(2),
        )
        .await
        .unwrap();

    queue.start(StartOptions { concurrency: 1 }).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    queue.stop().await.unwrap();

    let messages = queue
        .find_by_status(MessageStatus::DeadLetter, FindOptions::default())
        .await
        .unwrap();
    assert!(messages.iter().any(|m| m.id == id));
    let dead = messages.iter().find(|m| m.id == id).unwrap();
    assert!(dead.retry_count > dead.max_retries);
    assert!(dead.next_retry_at.is_none());
}

#[tokio::test]
async fn priority_ordering_is_ascending_then_fifo() {
    let Some(pool) = connect().await else { return };
    let config = QueueConfig::new(unique_queue_name("prio"));
    let queue = systeric_pgqueue::Queue::create(config, pool).await.unwrap();

    queue
        .enqueue(EnqueueRequest::new("t", json!({"n": 1})).with_priority(5))
        .await
        .unwrap();
    queue
        .enqueue(EnqueueRequest::new("t", json!({"n": 2})).with_priority(5))
        .await
        .unwrap();
    queue
        .enqueue(EnqueueRequest::new("t", json!({"n": 3})).with_priority(1))
        .await
        .unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    struct OrderRecorder(Arc<Mutex<Vec<i64>>>);

    #[async_trait::async_trait]
    impl Handler for OrderRecorder {
        async fn handle(&self, message: &systeric_pgqueue::Message) -> Result<(), String> {
            self.0
                .lock()
                .unwrap()
                .push(message.payload["n"].as_i64().unwrap());
            Ok(())
        }
    }

    queue
        .register_handler("t", Arc::new(OrderRecorder(order.clone())))
        .unwrap();

    queue.start(StartOptions { concurrency: 1 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    queue.stop().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec![3, 1, 2]);
}

#[tokio::test]
async fn outbox_rolls_back_enqueue_on_caller_failure() {
    let Some(pool) = connect().await else { return };
    let config = QueueConfig::new(unique_queue_name("outbox"));
    let queue = systeric_pgqueue::Queue::create(config, pool).await.unwrap();

    let result: systeric_pgqueue::Result<()> = queue
        .with_transaction(|ctx| {
            Box::pin(async move {
                ctx.enqueue(EnqueueRequest::new("t", json!({}))).await?;
                Err(systeric_pgqueue::QueueError::Validation(
                    "caller aborted".to_string(),
                ))
            })
        })
        .await;

    assert!(result.is_err());
    let stats = queue.get_stats().await.unwrap();
    assert_eq!(stats.pending, 0);
}
