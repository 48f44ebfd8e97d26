use idempotent_consumer::IdempotencyError;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessorError>;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Idempotency error: {0}")]
    Idempotency(#[from] IdempotencyError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Publish to {target} failed: {source}")]
    Publish {
        target: String,
        #[source]
        source: KafkaError,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProcessorError {
    /// Infrastructure failures that heal on their own.
    ///
    /// Transient errors are retried with backoff and never count towards a
    /// record's poison attempts. Everything else is a property of the record.
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessorError::Redis(e) => redis_utils::is_transient(e),
            ProcessorError::Idempotency(e) => e.is_transient(),
            ProcessorError::Kafka(e) | ProcessorError::Publish { source: e, .. } => {
                kafka_is_transient(e)
            }
            ProcessorError::Serialization(_)
            | ProcessorError::MissingHeader(_)
            | ProcessorError::InvalidRecord(_)
            | ProcessorError::UnknownTopic(_)
            | ProcessorError::Internal(_) => false,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessorError::Redis(_) => "redis",
            ProcessorError::Idempotency(_) => "dedup",
            ProcessorError::Kafka(_) => "kafka",
            ProcessorError::Serialization(_) => "deserialize",
            ProcessorError::MissingHeader(_) => "missing_header",
            ProcessorError::InvalidRecord(_) => "invalid_record",
            ProcessorError::UnknownTopic(_) => "unknown_topic",
            ProcessorError::Publish { .. } => "publish",
            ProcessorError::Internal(_) => "internal",
        }
    }
}

/// Broker and network conditions that clear up on their own. Size, auth and
/// config errors keep failing for the same message.
fn kafka_is_transient(err: &KafkaError) -> bool {
    if matches!(err, KafkaError::NoMessageReceived) {
        return true;
    }
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::MessageTimedOut
                | RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::Resolve
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::TimedOutQueue
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::NotEnoughReplicas
                | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
                | RDKafkaErrorCode::NotCoordinator
                | RDKafkaErrorCode::CoordinatorNotAvailable
                | RDKafkaErrorCode::CoordinatorLoadInProgress
                | RDKafkaErrorCode::RebalanceInProgress
                | RDKafkaErrorCode::KafkaStorageError
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let io = ProcessorError::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "broken pipe",
        )));
        assert!(io.is_transient());
        assert!(ProcessorError::Kafka(KafkaError::NoMessageReceived).is_transient());

        let bad_json = serde_json::from_str::<u32>("x").unwrap_err();
        assert!(!ProcessorError::Serialization(bad_json).is_transient());
        assert!(!ProcessorError::MissingHeader("X-Batch-ID").is_transient());
    }

    #[test]
    fn test_kafka_errors_classified_by_code() {
        let publish = |code| ProcessorError::Publish {
            target: "adapter.event.dlq".into(),
            source: KafkaError::MessageProduction(code),
        };

        assert!(publish(RDKafkaErrorCode::MessageTimedOut).is_transient());
        assert!(publish(RDKafkaErrorCode::QueueFull).is_transient());
        assert!(publish(RDKafkaErrorCode::NotEnoughReplicas).is_transient());

        assert!(!publish(RDKafkaErrorCode::MessageSizeTooLarge).is_transient());
        assert!(!publish(RDKafkaErrorCode::TopicAuthorizationFailed).is_transient());
        assert!(!ProcessorError::Kafka(KafkaError::MessageProduction(
            RDKafkaErrorCode::InvalidRecord
        ))
        .is_transient());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ProcessorError::MissingHeader("X-Batch-ID").kind(), "missing_header");
        let publish = ProcessorError::Publish {
            target: "processed.event".into(),
            source: KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut),
        };
        assert_eq!(publish.kind(), "publish");
    }
}
