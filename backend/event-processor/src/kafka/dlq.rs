//! Dead-letter topics
//!
//! A dead-lettered record keeps its key and payload. Where it came from and
//! why it failed travel in `x-dlq-*` headers, next to the original batch id.

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::KafkaConfig;
use crate::error::{ProcessorError, Result};
use crate::models::{EventRecord, BATCH_HEADER};

pub const HEADER_ORIGINAL_TOPIC: &str = "x-dlq-original-topic";
pub const HEADER_ORIGINAL_PARTITION: &str = "x-dlq-original-partition";
pub const HEADER_ORIGINAL_OFFSET: &str = "x-dlq-original-offset";
pub const HEADER_ERROR: &str = "x-dlq-error";
pub const HEADER_ATTEMPTS: &str = "x-dlq-attempts";
pub const HEADER_FAILED_AT: &str = "x-dlq-failed-at";

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, record: &EventRecord, error: &ProcessorError, attempts: u32) -> Result<()>;
}

/// Header set for a dead-lettered record, in send order
pub fn dlq_headers(record: &EventRecord, error: &ProcessorError, attempts: u32) -> Vec<(String, String)> {
    let mut headers = vec![
        (HEADER_ORIGINAL_TOPIC.to_string(), record.topic.clone()),
        (HEADER_ORIGINAL_PARTITION.to_string(), record.partition.to_string()),
        (HEADER_ORIGINAL_OFFSET.to_string(), record.offset.to_string()),
        (HEADER_ERROR.to_string(), error.to_string()),
        (HEADER_ATTEMPTS.to_string(), attempts.to_string()),
        (HEADER_FAILED_AT.to_string(), Utc::now().to_rfc3339()),
    ];
    if let Some(batch_id) = record.header(BATCH_HEADER) {
        headers.push((BATCH_HEADER.to_string(), batch_id.to_string()));
    }
    headers
}

pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    events_topic: String,
    events_dlq: String,
    mentions_topic: String,
    mentions_dlq: String,
    timeout: Duration,
}

impl KafkaDeadLetterSink {
    pub fn new(producer: FutureProducer, config: &KafkaConfig) -> Self {
        Self {
            producer,
            events_topic: config.events_topic.clone(),
            events_dlq: config.events_dlq_topic.clone(),
            mentions_topic: config.mentions_topic.clone(),
            mentions_dlq: config.mentions_dlq_topic.clone(),
            timeout: config.producer_timeout,
        }
    }

    /// DLQ for an input topic; unknown topics get `{topic}.dlq`
    pub fn dlq_topic_for(&self, topic: &str) -> String {
        if topic == self.events_topic {
            self.events_dlq.clone()
        } else if topic == self.mentions_topic {
            self.mentions_dlq.clone()
        } else {
            format!("{topic}.dlq")
        }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(&self, record: &EventRecord, error: &ProcessorError, attempts: u32) -> Result<()> {
        let topic = self.dlq_topic_for(&record.topic);
        let pairs = dlq_headers(record, error, attempts);

        let mut headers = OwnedHeaders::new();
        for (key, value) in &pairs {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut message = FutureRecord::<[u8], [u8]>::to(&topic).headers(headers);
        if let Some(key) = record.key.as_deref() {
            message = message.key(key);
        }
        if let Some(payload) = record.payload.as_deref() {
            message = message.payload(payload);
        }

        match self.producer.send(message, self.timeout).await {
            Ok((partition, offset)) => {
                info!(
                    dlq_topic = %topic,
                    partition = partition,
                    offset = offset,
                    original_topic = %record.topic,
                    original_offset = record.offset,
                    attempts = attempts,
                    "Record sent to dead-letter topic"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(
                    dlq_topic = %topic,
                    original_topic = %record.topic,
                    original_offset = record.offset,
                    error = %e,
                    "Failed to send record to dead-letter topic"
                );
                Err(ProcessorError::Publish {
                    target: topic.to_string(),
                    source: e,
                })
            }
        }
    }
}

/// Create both dead-letter topics. Topics that already exist are fine.
pub async fn ensure_dlq_topics(config: &KafkaConfig) -> Result<()> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("request.timeout.ms", "10000")
        .create()?;

    let topics = [
        NewTopic::new(
            &config.events_dlq_topic,
            config.dlq_partitions,
            TopicReplication::Fixed(config.dlq_replicas),
        ),
        NewTopic::new(
            &config.mentions_dlq_topic,
            config.dlq_partitions,
            TopicReplication::Fixed(config.dlq_replicas),
        ),
    ];
    let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(10)));

    for result in admin.create_topics(&topics, &options).await? {
        match result {
            Ok(topic) => info!(topic = %topic, "Dead-letter topic created"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                info!(topic = %topic, "Dead-letter topic already exists")
            }
            Err((topic, code)) => {
                warn!(topic = %topic, code = ?code, "Failed to create dead-letter topic");
                return Err(ProcessorError::Internal(format!(
                    "failed to create topic {topic}: {code:?}"
                )));
            }
        }
    }
    Ok(())
}
