//! Redis-backed cache, lock and stream broker.
//!
//! Tests use testcontainers to spin up a real Redis instance and are ignored
//! by default; run them with `--ignored` where Docker is available.

use insura_server::cache::{CacheBackend, LockError, LockManager, RetryPolicy, create_redis_pool};
use insura_server::config::{QueueConfig, RedisConfig};
use insura_server::queue::{
    Handler, HandlerError, StreamBroker, StreamQueue, UnderwritingTask, dead_letter_stream,
    group_name,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use uuid::Uuid;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn pool() -> deadpool_redis::Pool {
    let config = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        ..RedisConfig::default()
    };
    create_redis_pool(&config).await.expect("redis pool")
}

/// Keys and streams are prefixed per test so the shared container stays clean.
fn unique(name: &str) -> String {
    format!("{name}:{}", Uuid::new_v4().simple())
}

#[tokio::test]
async fn test_disabled_redis_yields_no_pool() {
    assert!(create_redis_pool(&RedisConfig::default()).await.is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_cache_get_set_ttl() {
    let cache = CacheBackend::new_redis(pool().await);
    assert!(cache.is_redis_available().await);
    let key = unique("product:id");

    cache
        .set(&key, b"{\"id\":3}".to_vec(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), Some(b"{\"id\":3}".to_vec()));
    let ttl = cache.ttl(&key).await.unwrap().unwrap();
    assert!(ttl > Duration::from_secs(50) && ttl <= Duration::from_secs(60));

    cache.delete(&key).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), None);
    assert_eq!(cache.ttl(&key).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_list_append_only_extends_existing_lists() {
    let cache = CacheBackend::new_redis(pool().await);
    let key = unique("order:user");

    assert!(!cache.list_append_if_exists(&key, b"1".to_vec()).await.unwrap());
    assert_eq!(cache.list_range(&key, 0, -1).await.unwrap(), None);

    cache
        .list_replace(&key, vec![b"1".to_vec(), b"2".to_vec()], Duration::from_secs(60))
        .await
        .unwrap();
    assert!(cache.list_append_if_exists(&key, b"3".to_vec()).await.unwrap());
    assert_eq!(
        cache.list_range(&key, 0, -1).await.unwrap(),
        Some(vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()])
    );
    assert!(cache.ttl(&key).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_lock_is_shared_between_managers() {
    let pool = pool().await;
    let retry = RetryPolicy {
        interval: Duration::from_millis(10),
        max_attempts: 3,
    };
    // Two managers over one Redis stand in for two instances.
    let first = LockManager::new_redis(pool.clone(), retry);
    let second = LockManager::new_redis(pool, retry);
    let key = unique("product:id:3:lock");

    let lease = first.acquire(&key, Duration::from_secs(5)).await.unwrap();
    let err = second.acquire(&key, Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, LockError::Busy { .. }));

    // Only the holder's token releases it.
    let stranger = LockManager::new_local(retry)
        .acquire(&key, Duration::from_secs(5))
        .await
        .unwrap();
    second.release(&stranger).await.unwrap();
    assert!(second.acquire(&key, Duration::from_millis(100)).await.is_err());

    first.refresh(&lease, Duration::from_secs(5)).await.unwrap();
    first.release(&lease).await.unwrap();
    assert!(second.acquire(&key, Duration::from_secs(5)).await.is_ok());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_lease_expires() {
    let locks = LockManager::new_redis(
        pool().await,
        RetryPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 1,
        },
    );
    let key = unique("lock");
    let stale = locks.acquire(&key, Duration::from_millis(50)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(locks.acquire(&key, Duration::from_secs(5)).await.is_ok());
    let err = locks.refresh(&stale, Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, LockError::NotHeld { .. }));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_stream_delivery_claim_and_ack() {
    let broker = StreamBroker::new_redis(pool().await);
    let stream = unique("order_stream");
    let group = group_name(&stream);
    broker.ensure_group(&stream, &group).await.unwrap();
    // Creating it twice is fine.
    broker.ensure_group(&stream, &group).await.unwrap();

    let fields = UnderwritingTask {
        order_id: 42,
        user_id: 7,
        product_id: 3,
    };
    let fields = insura_server::queue::StreamTask::encode(&fields);
    let id = broker.append(&stream, &fields).await.unwrap();

    let read = broker
        .read_group(&stream, &group, "worker-1", 1, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(read.len(), 1);
    assert_eq!(read[0].id, id);
    assert_eq!(read[0].fields, fields);

    // Nothing new for anyone else.
    let empty = broker
        .read_group(&stream, &group, "worker-2", 1, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(empty.is_empty());

    let pending = broker.pending(&stream, &group, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consumer, "worker-1");
    assert_eq!(pending[0].delivery_count, 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let claimed = broker
        .claim(&stream, &group, "worker-2", Duration::from_millis(10), &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.fields, fields);
    let pending = broker.pending(&stream, &group, 10).await.unwrap();
    assert_eq!(pending[0].consumer, "worker-2");
    assert_eq!(pending[0].delivery_count, 2);

    assert_eq!(broker.ack(&stream, &group, &id).await.unwrap(), 1);
    assert_eq!(broker.ack(&stream, &group, &id).await.unwrap(), 0);
    assert!(broker.pending(&stream, &group, 10).await.unwrap().is_empty());
    assert_eq!(broker.fetch(&stream, &id).await.unwrap().unwrap().fields, fields);
    assert_eq!(broker.len(&stream).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_read_without_group_is_reported() {
    let broker = StreamBroker::new_redis(pool().await);
    let stream = unique("order_stream");
    broker.ensure_group(&stream, "other").await.unwrap();
    let err = broker
        .read_group(&stream, &group_name(&stream), "worker-1", 1, Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, insura_server::queue::QueueError::NoGroup { .. }));
}

struct AlwaysFails(AtomicUsize);

#[async_trait::async_trait]
impl Handler<UnderwritingTask> for AlwaysFails {
    async fn handle(&self, _task: UnderwritingTask) -> Result<(), HandlerError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::new("underwriting service unavailable"))
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_queue_dead_letters_after_retries() {
    let queue = StreamQueue::new(
        StreamBroker::new_redis(pool().await),
        QueueConfig {
            idle_threshold_secs: 0,
            max_retries: 2,
            ..QueueConfig::default()
        },
    );
    let stream = unique("order_stream");
    let group = group_name(&stream);
    let handler = Arc::new(AlwaysFails(AtomicUsize::new(0)));
    queue
        .push(
            &stream,
            &UnderwritingTask {
                order_id: 42,
                user_id: 7,
                product_id: 3,
            },
        )
        .await
        .unwrap();

    let delivered = queue
        .broker()
        .read_group(&stream, &group, "worker-1", 1, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    for _ in 0..3 {
        queue
            .process_pending::<UnderwritingTask, _>(&stream, "worker-2", handler.as_ref())
            .await
            .unwrap();
    }
    assert_eq!(handler.0.load(Ordering::SeqCst), 2);
    assert!(queue.broker().pending(&stream, &group, 10).await.unwrap().is_empty());
    assert_eq!(queue.broker().len(&dead_letter_stream(&stream)).await.unwrap(), 1);
}
