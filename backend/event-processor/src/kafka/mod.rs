pub mod consumer;
pub mod dlq;
pub mod producer;

pub use consumer::{ConsumerWorker, EventConsumer, RecordSource};
pub use dlq::{ensure_dlq_topics, DeadLetterSink, KafkaDeadLetterSink};
pub use producer::{create_producer, KafkaPublisher, RecordPublisher};
