use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::{debug, error};

use crate::config::KafkaConfig;
use crate::error::{ProcessorError, Result};
use crate::models::{ElasticEvent, ElasticMention};

/// Producer shared by the publisher and the dead-letter sink
pub fn create_producer(config: &KafkaConfig) -> Result<FutureProducer> {
    let producer = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set(
            "message.timeout.ms",
            config.producer_timeout.as_millis().to_string(),
        )
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("compression.type", "lz4")
        .set("queue.buffering.max.messages", "100000")
        .create()
        .map_err(|e| {
            error!("Failed to create Kafka producer: {}", e);
            ProcessorError::Kafka(e)
        })?;
    Ok(producer)
}

/// Sink for enriched documents
#[async_trait]
pub trait RecordPublisher: Send + Sync {
    async fn send_event(&self, event: &ElasticEvent) -> Result<()>;
    async fn send_mention(&self, mention: &ElasticMention) -> Result<()>;
}

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    events_topic: String,
    mentions_topic: String,
    timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer, config: &KafkaConfig) -> Self {
        Self {
            producer,
            events_topic: config.processed_events_topic.clone(),
            mentions_topic: config.processed_mentions_topic.clone(),
            timeout: config.producer_timeout,
        }
    }

    async fn send_json(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %topic,
                    key = %key,
                    partition = partition,
                    offset = offset,
                    "Document published"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(topic = %topic, key = %key, error = %e, "Failed to publish document");
                Err(ProcessorError::Publish {
                    target: format!("{topic}/{key}"),
                    source: e,
                })
            }
        }
    }
}

#[async_trait]
impl RecordPublisher for KafkaPublisher {
    async fn send_event(&self, event: &ElasticEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.send_json(&self.events_topic, &event.message_key(), &payload)
            .await
    }

    async fn send_mention(&self, mention: &ElasticMention) -> Result<()> {
        let payload = serde_json::to_string(mention)?;
        self.send_json(&self.mentions_topic, &mention.message_key(), &payload)
            .await
    }
}
