//! Stream broker: Redis Streams (shared) or an in-process log (single instance).
//!
//! Both backends implement the same consumer-group contract: entries get
//! monotonically increasing `<ms>-<seq>` ids, a group read hands out entries
//! not yet delivered to the group and records them as pending for the reading
//! consumer, and a claim moves a pending entry to another consumer, resetting
//! its idle time and bumping its delivery count.

use deadpool_redis::Pool;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, instrument};

use super::QueueError;

/// A flat entry payload.
pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: String,
    pub fields: Fields,
}

/// A delivered but unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    fn next_after(last: EntryId) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        if now > last.ms {
            EntryId { ms: now, seq: 0 }
        } else {
            EntryId {
                ms: last.ms,
                seq: last.seq + 1,
            }
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QueueError::Broker(format!("invalid stream id: {s}"));
        let (ms, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(EntryId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug)]
struct LocalPending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct LocalGroup {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, LocalPending>,
}

#[derive(Debug, Default)]
struct LocalStream {
    entries: BTreeMap<EntryId, Fields>,
    last_id: EntryId,
    groups: HashMap<String, LocalGroup>,
}

impl LocalStream {
    fn message(&self, id: EntryId) -> Option<StreamMessage> {
        self.entries.get(&id).map(|fields| StreamMessage {
            id: id.to_string(),
            fields: fields.clone(),
        })
    }
}

/// In-process broker with consumer-group semantics.
#[derive(Debug, Default)]
pub struct LocalBroker {
    streams: Mutex<HashMap<String, LocalStream>>,
    appended: Notify,
}

impl LocalBroker {
    fn ensure_group(&self, stream: &str, group: &str) {
        self.streams
            .lock()
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
    }

    fn append(&self, stream: &str, fields: &Fields) -> String {
        let id = {
            let mut streams = self.streams.lock();
            let log = streams.entry(stream.to_string()).or_default();
            let id = EntryId::next_after(log.last_id);
            log.last_id = id;
            log.entries.insert(id, fields.clone());
            id
        };
        self.appended.notify_waiters();
        id.to_string()
    }

    fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let mut streams = self.streams.lock();
        let no_group = || QueueError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let log = streams.get_mut(stream).ok_or_else(no_group)?;
        let state = log.groups.get_mut(group).ok_or_else(no_group)?;

        let mut messages = Vec::new();
        for (id, fields) in log
            .entries
            .range((Bound::Excluded(state.last_delivered), Bound::Unbounded))
            .take(count.max(1))
        {
            state.pending.insert(
                *id,
                LocalPending {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            state.last_delivered = *id;
            messages.push(StreamMessage {
                id: id.to_string(),
                fields: fields.clone(),
            });
        }
        Ok(messages)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Register interest before checking so an append in between is not missed.
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let messages = self.read_new(stream, group, consumer, count)?;
            if !messages.is_empty() || block.is_zero() {
                return Ok(messages);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn ack(&self, stream: &str, group: &str, id: EntryId) -> u64 {
        let mut streams = self.streams.lock();
        let removed = streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
            .and_then(|state| state.pending.remove(&id));
        u64::from(removed.is_some())
    }

    fn pending(&self, stream: &str, group: &str, count: usize) -> Vec<PendingEntry> {
        let streams = self.streams.lock();
        let Some(state) = streams.get(stream).and_then(|log| log.groups.get(group)) else {
            return Vec::new();
        };
        let now = Instant::now();
        state
            .pending
            .iter()
            .take(count)
            .map(|(id, entry)| PendingEntry {
                id: id.to_string(),
                consumer: entry.consumer.clone(),
                idle: now.saturating_duration_since(entry.delivered_at),
                delivery_count: entry.delivery_count,
            })
            .collect()
    }

    fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: EntryId,
    ) -> Option<StreamMessage> {
        let mut streams = self.streams.lock();
        let log = streams.get_mut(stream)?;
        let message = log.message(id)?;
        let entry = log.groups.get_mut(group)?.pending.get_mut(&id)?;
        if entry.delivered_at.elapsed() < min_idle {
            return None;
        }
        entry.consumer = consumer.to_string();
        entry.delivered_at = Instant::now();
        entry.delivery_count += 1;
        Some(message)
    }

    fn fetch(&self, stream: &str, id: EntryId) -> Option<StreamMessage> {
        self.streams.lock().get(stream)?.message(id)
    }

    fn len(&self, stream: &str) -> u64 {
        self.streams
            .lock()
            .get(stream)
            .map_or(0, |log| log.entries.len() as u64)
    }
}

fn message_from_redis(entry: StreamId) -> StreamMessage {
    let fields = entry
        .map
        .iter()
        .filter_map(|(field, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|value| (field.clone(), value))
        })
        .collect();
    StreamMessage {
        id: entry.id,
        fields,
    }
}

fn read_error(stream: &str, group: &str, e: redis::RedisError) -> QueueError {
    if e.code() == Some("NOGROUP") {
        QueueError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    } else {
        QueueError::from(e)
    }
}

/// Stream broker used by the queue.
///
/// - **Local**: entries live in this process; nothing survives a restart
/// - **Redis**: Redis Streams consumer groups via a deadpool pool
#[derive(Clone)]
pub enum StreamBroker {
    Local(Arc<LocalBroker>),
    Redis(Pool),
}

impl fmt::Debug for StreamBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamBroker").field(&self.mode()).finish()
    }
}

impl StreamBroker {
    pub fn new_local() -> Self {
        StreamBroker::Local(Arc::new(LocalBroker::default()))
    }

    pub fn new_redis(pool: Pool) -> Self {
        StreamBroker::Redis(pool)
    }

    pub fn mode(&self) -> &'static str {
        match self {
            StreamBroker::Local(_) => "local",
            StreamBroker::Redis(_) => "redis",
        }
    }

    /// Create the stream and group if absent. An existing group is not an error.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        match self {
            StreamBroker::Local(broker) => {
                broker.ensure_group(stream, group);
                Ok(())
            }
            StreamBroker::Redis(pool) => {
                let mut conn = pool.get().await?;
                let created: redis::RedisResult<()> =
                    conn.xgroup_create_mkstream(stream, group, "0").await;
                match created {
                    Ok(()) => Ok(()),
                    Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                    Err(e) => Err(QueueError::CreateGroup {
                        stream: stream.to_string(),
                        group: group.to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
        }
    }

    /// Append an entry with a broker-assigned id and return the id.
    #[instrument(skip(self, fields))]
    pub async fn append(&self, stream: &str, fields: &Fields) -> Result<String, QueueError> {
        match self {
            StreamBroker::Local(broker) => Ok(broker.append(stream, fields)),
            StreamBroker::Redis(pool) => {
                let append_error = |reason: String| QueueError::Append {
                    stream: stream.to_string(),
                    reason,
                };
                let mut conn = pool.get().await.map_err(|e| append_error(e.to_string()))?;
                let id: String = conn
                    .xadd_map(stream, "*", fields)
                    .await
                    .map_err(|e| append_error(e.to_string()))?;
                Ok(id)
            }
        }
    }

    /// Read up to `count` entries never delivered to `group`, waiting up to
    /// `block` for one to arrive. An empty result means the wait timed out.
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, QueueError> {
        match self {
            StreamBroker::Local(broker) => {
                broker.read_group(stream, group, consumer, count, block).await
            }
            StreamBroker::Redis(pool) => {
                let mut conn = pool.get().await?;
                let options = StreamReadOptions::default()
                    .group(group, consumer)
                    .count(count.max(1))
                    .block(block.as_millis() as usize);
                let reply: Option<StreamReadReply> = conn
                    .xread_options(&[stream], &[">"], &options)
                    .await
                    .map_err(|e| read_error(stream, group, e))?;
                Ok(reply
                    .into_iter()
                    .flat_map(|reply| reply.keys)
                    .flat_map(|key| key.ids)
                    .map(message_from_redis)
                    .collect())
            }
        }
    }

    /// Acknowledge an entry. Returns how many entries left the pending list.
    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<u64, QueueError> {
        match self {
            StreamBroker::Local(broker) => Ok(broker.ack(stream, group, id.parse()?)),
            StreamBroker::Redis(pool) => {
                let mut conn = pool.get().await?;
                let acked: u64 = conn.xack(stream, group, &[id]).await?;
                Ok(acked)
            }
        }
    }

    /// The first `count` pending entries of `group`, oldest first.
    pub async fn pending(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, QueueError> {
        match self {
            StreamBroker::Local(broker) => Ok(broker.pending(stream, group, count)),
            StreamBroker::Redis(pool) => {
                let mut conn = pool.get().await?;
                let reply: StreamPendingCountReply = conn
                    .xpending_count(stream, group, "-", "+", count)
                    .await
                    .map_err(|e| read_error(stream, group, e))?;
                Ok(reply
                    .ids
                    .into_iter()
                    .map(|entry| PendingEntry {
                        id: entry.id,
                        consumer: entry.consumer,
                        idle: Duration::from_millis(entry.last_delivered_ms as u64),
                        delivery_count: entry.times_delivered as u64,
                    })
                    .collect())
            }
        }
    }

    /// Move a pending entry idle for at least `min_idle` to `consumer`.
    ///
    /// `None` if the entry is gone, no longer pending, or was delivered more
    /// recently than `min_idle`.
    pub async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: &str,
    ) -> Result<Option<StreamMessage>, QueueError> {
        match self {
            StreamBroker::Local(broker) => {
                Ok(broker.claim(stream, group, consumer, min_idle, id.parse()?))
            }
            StreamBroker::Redis(pool) => {
                let mut conn = pool.get().await?;
                let reply: StreamClaimReply = conn
                    .xclaim(stream, group, consumer, min_idle.as_millis() as u64, &[id])
                    .await?;
                let claimed = reply.ids.into_iter().next().map(message_from_redis);
                if claimed.is_some() {
                    debug!(stream, id, consumer, "entry claimed");
                }
                Ok(claimed)
            }
        }
    }

    /// Read one entry by id, whatever its delivery state.
    pub async fn fetch(&self, stream: &str, id: &str) -> Result<Option<StreamMessage>, QueueError> {
        match self {
            StreamBroker::Local(broker) => Ok(broker.fetch(stream, id.parse()?)),
            StreamBroker::Redis(pool) => {
                let mut conn = pool.get().await?;
                let reply: StreamRangeReply = conn.xrange_count(stream, id, id, 1).await?;
                Ok(reply.ids.into_iter().next().map(message_from_redis))
            }
        }
    }

    /// Number of entries in the stream.
    pub async fn len(&self, stream: &str) -> Result<u64, QueueError> {
        match self {
            StreamBroker::Local(broker) => Ok(broker.len(stream)),
            StreamBroker::Redis(pool) => {
                let mut conn = pool.get().await?;
                let len: u64 = conn.xlen(stream).await?;
                Ok(len)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(n: i64) -> Fields {
        Fields::from([("n".to_string(), n.to_string())])
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let broker = StreamBroker::new_local();
        let mut last = EntryId::default();
        for n in 0..100 {
            let id: EntryId = broker.append("s", &fields(n)).await.unwrap().parse().unwrap();
            assert!(id > last);
            last = id;
        }
        assert_eq!(broker.len("s").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_group_read_delivers_in_order_once() {
        let broker = StreamBroker::new_local();
        broker.ensure_group("s", "g").await.unwrap();
        broker.ensure_group("s", "g").await.unwrap();
        for n in 1..=3 {
            broker.append("s", &fields(n)).await.unwrap();
        }

        let first = broker.read_group("s", "g", "c1", 2, Duration::ZERO).await.unwrap();
        let second = broker.read_group("s", "g", "c2", 2, Duration::ZERO).await.unwrap();
        let values: Vec<&str> = first
            .iter()
            .chain(second.iter())
            .map(|m| m.fields["n"].as_str())
            .collect();
        assert_eq!(values, vec!["1", "2", "3"]);

        let pending = broker.pending("s", "g", 10).await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[2].consumer, "c2");
        assert!(pending.iter().all(|p| p.delivery_count == 1));
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let broker = StreamBroker::new_local();
        let err = broker
            .read_group("s", "g", "c", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NoGroup { .. }));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let broker = StreamBroker::new_local();
        broker.ensure_group("s", "g").await.unwrap();

        let reader = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .read_group("s", "g", "c", 1, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.append("s", &fields(9)).await.unwrap();

        let messages = reader.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].fields["n"], "9");
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let broker = StreamBroker::new_local();
        broker.ensure_group("s", "g").await.unwrap();
        let messages = broker
            .read_group("s", "g", "c", 1, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_claim_moves_entry_and_counts_delivery() {
        let broker = StreamBroker::new_local();
        broker.ensure_group("s", "g").await.unwrap();
        let id = broker.append("s", &fields(1)).await.unwrap();
        broker.read_group("s", "g", "c1", 1, Duration::ZERO).await.unwrap();

        // Not idle long enough yet.
        let early = broker
            .claim("s", "g", "c2", Duration::from_secs(60), &id)
            .await
            .unwrap();
        assert!(early.is_none());

        let claimed = broker.claim("s", "g", "c2", Duration::ZERO, &id).await.unwrap();
        assert_eq!(claimed.unwrap().fields, fields(1));
        let pending = broker.pending("s", "g", 10).await.unwrap();
        assert_eq!(pending[0].consumer, "c2");
        assert_eq!(pending[0].delivery_count, 2);

        assert_eq!(broker.ack("s", "g", &id).await.unwrap(), 1);
        assert_eq!(broker.ack("s", "g", &id).await.unwrap(), 0);
        assert!(broker.pending("s", "g", 10).await.unwrap().is_empty());
        // Acked entries stay readable.
        assert!(broker.fetch("s", &id).await.unwrap().is_some());
    }
}
