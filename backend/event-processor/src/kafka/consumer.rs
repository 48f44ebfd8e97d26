//! Kafka consumption with manual offset commits
//!
//! Each [`ConsumerWorker`] owns one consumer in the group and processes its
//! records sequentially, so a partition's records complete in offset order.
//! Positions are committed only for records that finished (processed or
//! dead-lettered). A transient error parks the worker on the failing record
//! with exponential backoff; later records of that batch wait behind it.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use resilience::ErrorStreak;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::{ProcessorError, Result};
use crate::metrics;
use crate::models::EventRecord;
use crate::offsets::{OffsetTracker, PartitionOffset};
use crate::processor::Processor;
use crate::retry::{Delivery, PoisonRetry};

const LAG_REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Where a worker pulls records from and commits positions to
#[async_trait]
pub trait RecordSource: Send {
    /// Up to `max` records, waiting at most `timeout`. An empty batch is not
    /// an error.
    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<EventRecord>>;

    fn commit(&self, offsets: &[PartitionOffset], sync: bool) -> Result<()>;

    /// Partitions currently assigned to this consumer
    fn assignment(&self) -> Result<HashSet<(String, i32)>>;

    async fn report_lag(&self) {}

    fn close(&mut self);
}

pub struct EventConsumer {
    consumer: Arc<StreamConsumer>,
    worker_id: usize,
}

impl EventConsumer {
    pub fn new(config: &KafkaConfig, worker_id: usize) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", format!("{}-{}", config.group_id, worker_id))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                ProcessorError::Kafka(e)
            })?;

        Ok(Self {
            consumer: Arc::new(consumer),
            worker_id,
        })
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<()> {
        self.consumer.subscribe(topics).map_err(|e| {
            error!("Failed to subscribe to topics: {}", e);
            ProcessorError::Kafka(e)
        })?;
        info!(worker = self.worker_id, topics = ?topics, "Consumer subscribed");
        Ok(())
    }

    fn to_record(msg: &BorrowedMessage<'_>) -> EventRecord {
        let headers = msg
            .headers()
            .map(|hs| {
                hs.iter()
                    .map(|h| (h.key.to_string(), h.value.map(<[u8]>::to_vec)))
                    .collect()
            })
            .unwrap_or_default();

        EventRecord {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            payload: msg.payload().map(<[u8]>::to_vec),
            headers,
            timestamp_ms: msg.timestamp().to_millis(),
        }
    }
}

#[async_trait]
impl RecordSource for EventConsumer {
    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<EventRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::with_capacity(max);

        while batch.len() < max {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(msg)) => {
                    metrics::record_consumed(msg.topic());
                    batch.push(Self::to_record(&msg));
                }
                Ok(Err(e)) if batch.is_empty() => return Err(ProcessorError::Kafka(e)),
                Ok(Err(e)) => {
                    warn!(worker = self.worker_id, error = %e, "Consumer error mid-batch");
                    break;
                }
            }
        }

        Ok(batch)
    }

    fn commit(&self, offsets: &[PartitionOffset], sync: bool) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        for po in offsets {
            tpl.add_partition_offset(&po.topic, po.partition, Offset::Offset(po.offset))?;
        }
        let mode = if sync { CommitMode::Sync } else { CommitMode::Async };
        self.consumer.commit(&tpl, mode)?;
        Ok(())
    }

    fn assignment(&self) -> Result<HashSet<(String, i32)>> {
        let tpl = self.consumer.assignment()?;
        Ok(tpl
            .elements()
            .iter()
            .map(|e| (e.topic().to_string(), e.partition()))
            .collect())
    }

    async fn report_lag(&self) {
        let consumer = self.consumer.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<Vec<(String, i32, i64)>> {
            let positions = consumer.position()?;
            let mut lags = Vec::new();
            for elem in positions.elements() {
                let (_, high) =
                    consumer.fetch_watermarks(elem.topic(), elem.partition(), Duration::from_secs(5))?;
                let lag = match elem.offset() {
                    Offset::Offset(pos) => high - pos,
                    _ => 0,
                };
                lags.push((elem.topic().to_string(), elem.partition(), lag));
            }
            Ok(lags)
        })
        .await;

        match result {
            Ok(Ok(lags)) => {
                for (topic, partition, lag) in lags {
                    metrics::set_consumer_lag(&topic, partition, lag);
                }
            }
            Ok(Err(e)) => debug!(worker = self.worker_id, error = %e, "Lag query failed"),
            Err(e) => debug!(worker = self.worker_id, error = %e, "Lag task failed"),
        }
    }

    fn close(&mut self) {
        self.consumer.unsubscribe();
        info!(worker = self.worker_id, "Consumer closed");
    }
}

pub struct ConsumerWorker<S: RecordSource> {
    id: usize,
    source: S,
    processor: Arc<dyn Processor>,
    retry: PoisonRetry,
    tracker: OffsetTracker,
    streak: Arc<ErrorStreak>,
    poll_max: usize,
    poll_timeout: Duration,
}

impl<S: RecordSource + Sync> ConsumerWorker<S> {
    pub fn new(
        id: usize,
        source: S,
        processor: Arc<dyn Processor>,
        retry: PoisonRetry,
        streak: Arc<ErrorStreak>,
        poll_max: usize,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            id,
            source,
            processor,
            retry,
            tracker: OffsetTracker::new(),
            streak,
            poll_max,
            poll_timeout,
        }
    }

    /// Consume until `shutdown` flips to `true`.
    ///
    /// On shutdown the in-flight batch is finished (or abandoned at a record
    /// stuck on a transient error), positions are committed synchronously and
    /// the consumer is closed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(worker = self.id, "Consumer worker started");
        let mut last_lag_report = Instant::now();

        while !*shutdown.borrow() {
            let records = match self.source.poll(self.poll_max, self.poll_timeout).await {
                Ok(records) => records,
                Err(e) => {
                    metrics::record_error(&e);
                    if !self.back_off(&e, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if !records.is_empty() {
                debug!(worker = self.id, count = records.len(), "Batch polled");
                let completed = self.handle_batch(records, &mut shutdown).await;
                self.commit(false);
                if !completed {
                    break;
                }
            }

            if last_lag_report.elapsed() >= LAG_REPORT_INTERVAL {
                self.source.report_lag().await;
                last_lag_report = Instant::now();
            }
        }

        info!(worker = self.id, "Consumer worker stopping");
        self.commit(true);
        self.source.close();
        Ok(())
    }

    /// Deliver every record in order. Returns `false` if shutdown interrupted
    /// a transient backoff.
    async fn handle_batch(
        &mut self,
        records: Vec<EventRecord>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        for record in records {
            loop {
                match self.retry.deliver(self.processor.as_ref(), &record).await {
                    Ok(delivery) => {
                        if let Delivery::DeadLettered { attempts } = delivery {
                            debug!(
                                worker = self.id,
                                topic = %record.topic,
                                offset = record.offset,
                                attempts,
                                "Record dead-lettered"
                            );
                        }
                        self.streak.record_success();
                        metrics::set_consecutive_errors(self.id, 0);
                        self.tracker
                            .record_processed(&record.topic, record.partition, record.offset);
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        metrics::record_error(&e);
                        if !self.back_off(&e, shutdown).await {
                            return false;
                        }
                    }
                    Err(e) => {
                        // the dead-letter topic refused the record for good
                        metrics::record_error(&e);
                        metrics::record_dropped(&record.topic);
                        error!(
                            worker = self.id,
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            error = %e,
                            "Record could not be dead-lettered, skipping"
                        );
                        self.tracker
                            .record_processed(&record.topic, record.partition, record.offset);
                        break;
                    }
                }
            }
        }
        true
    }

    /// Sleep for the current backoff. Returns `false` when shutdown was
    /// requested meanwhile.
    async fn back_off(&self, err: &ProcessorError, shutdown: &mut watch::Receiver<bool>) -> bool {
        let streak = self.streak.record_error();
        metrics::set_consecutive_errors(self.id, streak);
        let delay = self.streak.current_backoff();
        warn!(
            worker = self.id,
            error = %err,
            consecutive_errors = streak,
            backoff_ms = delay.as_millis() as u64,
            "Transient error, backing off"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => !*shutdown.borrow(),
            _ = shutdown.changed() => false,
        }
    }

    fn commit(&mut self, sync: bool) {
        let pending = self.tracker.pending_commits();
        if pending.is_empty() {
            return;
        }

        let assigned = match self.source.assignment() {
            Ok(assigned) => assigned,
            Err(e) => {
                warn!(worker = self.id, error = %e, "Failed to read assignment, skipping commit");
                return;
            }
        };

        let (owned, revoked): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|po| assigned.contains(&(po.topic.clone(), po.partition)));

        for po in &revoked {
            debug!(worker = self.id, topic = %po.topic, partition = po.partition, "Dropping position of revoked partition");
            self.tracker.forget_partition(&po.topic, po.partition);
        }

        if owned.is_empty() {
            return;
        }

        match self.source.commit(&owned, sync) {
            Ok(()) => {
                for po in &owned {
                    metrics::set_committed_offset(&po.topic, po.partition, po.offset);
                }
                self.tracker.mark_committed(&owned);
                debug!(worker = self.id, partitions = owned.len(), sync, "Offsets committed");
            }
            Err(e) => warn!(worker = self.id, error = %e, "Offset commit failed, will retry"),
        }
    }
}
