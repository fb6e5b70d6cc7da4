//! Producer and consumer sides of the stream queue.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::broker::{Fields, PendingEntry, StreamBroker, StreamMessage};
use super::task::StreamTask;
use super::{QueueError, dead_letter_stream, group_name};
use crate::config::QueueConfig;

/// A handler failure. The entry stays pending and is retried by the reclaimer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Processes one decoded task. `Ok` acknowledges the entry.
#[async_trait]
pub trait Handler<T: StreamTask>: Send + Sync {
    async fn handle(&self, task: T) -> Result<(), HandlerError>;
}

/// What one reclaim pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub scanned: usize,
    pub claimed: usize,
    pub processed: usize,
    pub dead_lettered: usize,
}

/// Outcome of handing one entry to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Acked,
    Failed,
    DeadLettered,
}

/// Typed at-least-once queue over a [`StreamBroker`].
#[derive(Debug, Clone)]
pub struct StreamQueue {
    broker: StreamBroker,
    config: QueueConfig,
}

impl StreamQueue {
    pub fn new(broker: StreamBroker, config: QueueConfig) -> Self {
        Self { broker, config }
    }

    pub fn broker(&self) -> &StreamBroker {
        &self.broker
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append `task` to `stream`, creating the stream and its group on first use.
    #[instrument(skip(self, task), fields(kind = T::KIND))]
    pub async fn push<T: StreamTask>(&self, stream: &str, task: &T) -> Result<String, QueueError> {
        self.broker.ensure_group(stream, &group_name(stream)).await?;
        let id = self.broker.append(stream, &task.encode()).await?;
        debug!(stream, id = %id, "task pushed");
        Ok(id)
    }

    /// Run the delivery and reclaim loops for `consumer` until `cancel` fires.
    pub async fn consume<T, H>(
        &self,
        stream: &str,
        consumer: &str,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) where
        T: StreamTask,
        H: Handler<T> + ?Sized,
    {
        let group = group_name(stream);
        if let Err(e) = self.broker.ensure_group(stream, &group).await {
            error!(stream, error = %e, "failed to create consumer group");
        }
        info!(stream, consumer, broker = self.broker.mode(), "consumer started");

        tokio::join!(
            self.delivery_loop::<T, H>(stream, &group, consumer, &handler, &cancel),
            self.reclaim_loop::<T, H>(stream, consumer, &handler, &cancel),
        );
        info!(stream, consumer, "consumer stopped");
    }

    async fn delivery_loop<T, H>(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        handler: &Arc<H>,
        cancel: &CancellationToken,
    ) where
        T: StreamTask,
        H: Handler<T> + ?Sized,
    {
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.broker.read_group(stream, group, consumer, 1, self.config.block()) => read,
            };
            match read {
                Ok(messages) => {
                    for message in messages {
                        debug!(stream, id = %message.id, "entry delivered");
                        self.dispatch::<T, H>(stream, group, message, 1, handler.as_ref()).await;
                    }
                }
                Err(e) => {
                    error!(stream, error = %e, "failed to read stream");
                    if matches!(e, QueueError::NoGroup { .. })
                        && let Err(e) = self.broker.ensure_group(stream, group).await
                    {
                        error!(stream, error = %e, "failed to recreate consumer group");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.read_error_backoff()) => {}
                    }
                }
            }
        }
    }

    async fn reclaim_loop<T, H>(
        &self,
        stream: &str,
        consumer: &str,
        handler: &Arc<H>,
        cancel: &CancellationToken,
    ) where
        T: StreamTask,
        H: Handler<T> + ?Sized,
    {
        // Spread instances so they do not all scan at the same moment.
        let jitter_ms = self.config.reclaim_jitter().as_millis() as u64;
        if jitter_ms > 0 {
            let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let period = self.config.check_interval().max(Duration::from_millis(1));
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.process_pending::<T, H>(stream, consumer, handler.as_ref()).await {
                        Ok(report) if report.scanned > 0 => debug!(stream, ?report, "reclaim pass finished"),
                        Ok(_) => {}
                        Err(e) => error!(stream, error = %e, "failed to get pending entries"),
                    }
                }
            }
        }
    }

    /// One reclaim pass: dead-letter entries over the delivery ceiling, claim
    /// and re-run entries idle past the threshold.
    pub async fn process_pending<T, H>(
        &self,
        stream: &str,
        consumer: &str,
        handler: &H,
    ) -> Result<ReclaimReport, QueueError>
    where
        T: StreamTask,
        H: Handler<T> + ?Sized,
    {
        let group = group_name(stream);
        let pending = self
            .broker
            .pending(stream, &group, self.config.batch_size)
            .await?;
        let mut report = ReclaimReport {
            scanned: pending.len(),
            ..ReclaimReport::default()
        };

        let threshold = self.config.idle_threshold();
        for entry in pending {
            if entry.delivery_count > self.config.max_retries {
                warn!(
                    stream,
                    id = %entry.id,
                    delivery_count = entry.delivery_count,
                    "entry reached max retries, dead-lettering"
                );
                if self.dead_letter_pending(stream, &group, &entry).await {
                    report.dead_lettered += 1;
                }
                continue;
            }
            if entry.idle < threshold {
                continue;
            }

            info!(stream, id = %entry.id, idle_ms = entry.idle.as_millis() as u64, "claiming idle entry");
            let claimed = match self
                .broker
                .claim(stream, &group, consumer, threshold, &entry.id)
                .await
            {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    error!(stream, id = %entry.id, error = %e, "failed to claim entry");
                    continue;
                }
            };
            report.claimed += 1;
            match self
                .dispatch::<T, H>(stream, &group, claimed, entry.delivery_count + 1, handler)
                .await
            {
                Dispatch::Acked => report.processed += 1,
                Dispatch::DeadLettered => report.dead_lettered += 1,
                Dispatch::Failed => {}
            }
        }
        Ok(report)
    }

    async fn dispatch<T, H>(
        &self,
        stream: &str,
        group: &str,
        message: StreamMessage,
        delivery_count: u64,
        handler: &H,
    ) -> Dispatch
    where
        T: StreamTask,
        H: Handler<T> + ?Sized,
    {
        let task = match T::decode(&message.fields) {
            Ok(task) => task,
            Err(e) => {
                warn!(stream, id = %message.id, error = %e, "undecodable entry, dead-lettering");
                let reason = format!("invalid payload: {e}");
                return if self
                    .dead_letter(stream, group, &message.id, message.fields, &reason, delivery_count)
                    .await
                {
                    Dispatch::DeadLettered
                } else {
                    Dispatch::Failed
                };
            }
        };

        if let Err(e) = handler.handle(task).await {
            error!(stream, id = %message.id, error = %e, "failed to process entry");
            return Dispatch::Failed;
        }
        if let Err(e) = self.broker.ack(stream, group, &message.id).await {
            // Stays pending; the reclaimer will redeliver it.
            error!(stream, id = %message.id, error = %e, "failed to ack entry");
            return Dispatch::Failed;
        }
        Dispatch::Acked
    }

    async fn dead_letter_pending(&self, stream: &str, group: &str, entry: &PendingEntry) -> bool {
        let fields = match self.broker.fetch(stream, &entry.id).await {
            Ok(message) => message.map(|m| m.fields).unwrap_or_default(),
            Err(e) => {
                error!(stream, id = %entry.id, error = %e, "failed to read entry for dead-lettering");
                return false;
            }
        };
        self.dead_letter(stream, group, &entry.id, fields, "max retries exceeded", entry.delivery_count)
            .await
    }

    /// Copy an entry to the dead-letter stream, then ack it. Nothing is acked
    /// if the copy fails.
    async fn dead_letter(
        &self,
        stream: &str,
        group: &str,
        id: &str,
        mut fields: Fields,
        reason: &str,
        delivery_count: u64,
    ) -> bool {
        fields.insert("source_id".to_string(), id.to_string());
        fields.insert("reason".to_string(), reason.to_string());
        fields.insert("delivery_count".to_string(), delivery_count.to_string());

        let dead = dead_letter_stream(stream);
        if let Err(e) = self.broker.append(&dead, &fields).await {
            error!(stream, id, error = %e, "dead-letter append failed, keeping entry pending");
            return false;
        }
        if let Err(e) = self.broker.ack(stream, group, id).await {
            error!(stream, id, error = %e, "failed to ack dead-lettered entry");
            return false;
        }
        true
    }
}
