//! At-least-once delivery of underwriting tasks through the local broker.

use async_trait::async_trait;
use insura_server::config::QueueConfig;
use insura_server::queue::{
    Handler, HandlerError, StreamBroker, StreamQueue, StreamTask, UnderwritingTask,
    dead_letter_stream, group_name,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STREAM: &str = "order_stream";

/// Records every task it sees and fails while `failing` is set.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<UnderwritingTask>>,
    failing: bool,
}

impl Recorder {
    fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl Handler<UnderwritingTask> for Recorder {
    async fn handle(&self, task: UnderwritingTask) -> Result<(), HandlerError> {
        self.seen.lock().push(task);
        if self.failing {
            return Err(HandlerError::new("underwriting service unavailable"));
        }
        Ok(())
    }
}

fn queue(config: QueueConfig) -> StreamQueue {
    StreamQueue::new(StreamBroker::new_local(), config)
}

fn immediate_retries() -> QueueConfig {
    QueueConfig {
        block_ms: 20,
        idle_threshold_secs: 0,
        max_retries: 2,
        reclaim_jitter_ms: 0,
        ..QueueConfig::default()
    }
}

fn task() -> UnderwritingTask {
    UnderwritingTask {
        order_id: 42,
        user_id: 7,
        product_id: 3,
    }
}

async fn pending_count(queue: &StreamQueue) -> usize {
    queue
        .broker()
        .pending(STREAM, &group_name(STREAM), 100)
        .await
        .unwrap()
        .len()
}

async fn wait_for_calls(recorder: &Recorder, calls: usize) {
    for _ in 0..200 {
        if recorder.calls() >= calls {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("handler saw {} calls, expected {calls}", recorder.calls());
}

#[tokio::test]
async fn test_successful_delivery_leaves_nothing_pending() {
    let queue = queue(immediate_retries());
    let recorder = Arc::new(Recorder::default());
    let cancel = CancellationToken::new();
    let consumer = {
        let queue = queue.clone();
        let recorder = Arc::clone(&recorder);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            queue
                .consume::<UnderwritingTask, _>(STREAM, "worker-1", recorder, cancel)
                .await;
        })
    };

    queue.push(STREAM, &task()).await.unwrap();
    wait_for_calls(&recorder, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(recorder.seen.lock().as_slice(), &[task()]);
    assert_eq!(pending_count(&queue).await, 0);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), consumer)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_failing_handler_is_retried_twice_then_dead_lettered() {
    let queue = queue(immediate_retries());
    let group = group_name(STREAM);
    let recorder = Recorder::failing();
    queue.push(STREAM, &task()).await.unwrap();

    // First delivery fails and leaves the entry pending.
    let delivered = queue
        .broker()
        .read_group(STREAM, &group, "worker-1", 1, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);
    let decoded = UnderwritingTask::decode(&delivered[0].fields).unwrap();
    assert!(recorder.handle(decoded).await.is_err());

    // Two reclaim passes re-run the handler.
    for attempt in 2..=3 {
        let report = queue
            .process_pending::<UnderwritingTask, _>(STREAM, "worker-2", &recorder)
            .await
            .unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.processed, 0);
        assert_eq!(recorder.calls(), attempt);
    }

    // The third pass finds the entry over the ceiling and drops it.
    let report = queue
        .process_pending::<UnderwritingTask, _>(STREAM, "worker-2", &recorder)
        .await
        .unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(recorder.calls(), 3);
    assert_eq!(pending_count(&queue).await, 0);

    let dead = dead_letter_stream(STREAM);
    assert_eq!(queue.broker().len(&dead).await.unwrap(), 1);
    queue.broker().ensure_group(&dead, "audit").await.unwrap();
    let entries = queue
        .broker()
        .read_group(&dead, "audit", "auditor", 10, Duration::from_millis(10))
        .await
        .unwrap();
    let fields = &entries[0].fields;
    assert_eq!(fields["order_id"], "42");
    assert_eq!(fields["reason"], "max retries exceeded");
    assert_eq!(fields["delivery_count"], "3");
    assert_eq!(fields["source_id"], delivered[0].id);
}

#[tokio::test]
async fn test_running_consumer_reclaims_and_dead_letters() {
    let config = QueueConfig {
        check_interval_secs: 1,
        ..immediate_retries()
    };
    let queue = queue(config);
    let recorder = Arc::new(Recorder::failing());
    let cancel = CancellationToken::new();
    let consumer = {
        let queue = queue.clone();
        let recorder = Arc::clone(&recorder);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            queue
                .consume::<UnderwritingTask, _>(STREAM, "worker-1", recorder, cancel)
                .await;
        })
    };

    queue.push(STREAM, &task()).await.unwrap();
    let dead = dead_letter_stream(STREAM);
    let mut dropped = false;
    for _ in 0..100 {
        if queue.broker().len(&dead).await.unwrap() == 1 {
            dropped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(dropped, "entry was never dead-lettered");
    assert_eq!(recorder.calls(), 3);
    assert_eq!(pending_count(&queue).await, 0);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), consumer)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_entry_delivered_to_one_consumer_only() {
    let queue = queue(immediate_retries());
    let group = group_name(STREAM);
    queue.push(STREAM, &task()).await.unwrap();

    let (a, b) = tokio::join!(
        queue
            .broker()
            .read_group(STREAM, &group, "worker-1", 1, Duration::from_millis(30)),
        queue
            .broker()
            .read_group(STREAM, &group, "worker-2", 1, Duration::from_millis(30)),
    );
    assert_eq!(a.unwrap().len() + b.unwrap().len(), 1);
}
