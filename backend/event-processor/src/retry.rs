//! Bounded retries for records that keep failing
//!
//! A record gets one attempt plus `max_retries` retries on a fixed interval.
//! If every attempt fails it is handed to the dead-letter sink and counts as
//! done, so its offset can be committed. Transient errors end the delivery
//! early and are returned to the caller, which backs off and delivers the
//! record again from scratch.

use resilience::{with_retry_if, FixedBackoff, RetryConfig};
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::Result;
use crate::kafka::dlq::DeadLetterSink;
use crate::metrics;
use crate::models::EventRecord;
use crate::processor::{ProcessOutcome, Processor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Processed(ProcessOutcome),
    DeadLettered { attempts: u32 },
}

#[derive(Clone)]
pub struct PoisonRetry {
    backoff: FixedBackoff,
    dlq: Arc<dyn DeadLetterSink>,
    dlq_retry: RetryConfig,
}

impl PoisonRetry {
    pub fn new(backoff: FixedBackoff, dlq: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            backoff,
            dlq,
            dlq_retry: RetryConfig::default(),
        }
    }

    pub fn with_dlq_retry(mut self, config: RetryConfig) -> Self {
        self.dlq_retry = config;
        self
    }

    pub fn backoff(&self) -> FixedBackoff {
        self.backoff
    }

    pub async fn deliver(&self, processor: &dyn Processor, record: &EventRecord) -> Result<Delivery> {
        let mut failures = 0u32;

        loop {
            let err = match processor.process(record).await {
                Ok(outcome) => return Ok(Delivery::Processed(outcome)),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => e,
            };

            failures += 1;
            metrics::record_error(&err);

            if let Some(delay) = self.backoff.next_delay(failures) {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    attempt = failures,
                    max_attempts = self.backoff.max_attempts(),
                    error = %err,
                    "Record failed, retrying"
                );
                metrics::record_poison_retry(&record.topic);
                tokio::time::sleep(delay).await;
                continue;
            }

            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                attempts = failures,
                error = %err,
                "Record failed permanently, routing to dead-letter topic"
            );

            let dlq = self.dlq.clone();
            let err_ref = &err;
            with_retry_if(
                self.dlq_retry.clone(),
                || {
                    let dlq = dlq.clone();
                    async move { dlq.send(record, err_ref, failures).await }
                },
                |e| e.is_transient(),
            )
            .await
            .map_err(|e| e.into_inner())?;

            metrics::record_dead_lettered(&record.topic);
            return Ok(Delivery::DeadLettered { attempts: failures });
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::ProcessorError;
    use async_trait::async_trait;
    use rdkafka::error::KafkaError;
    use rdkafka::types::RDKafkaErrorCode;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Dead-letter sink that records what it was sent
    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<(EventRecord, String, u32)>>,
        pub failures_before_success: AtomicU32,
        /// Reject every send as the broker does an oversized message
        pub rejects: AtomicBool,
        pub calls: AtomicU32,
    }

    pub fn send_error(code: RDKafkaErrorCode) -> ProcessorError {
        ProcessorError::Publish {
            target: "adapter.event.dlq".to_string(),
            source: KafkaError::MessageProduction(code),
        }
    }

    #[async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn send(&self, record: &EventRecord, error: &ProcessorError, attempts: u32) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.rejects.load(Ordering::SeqCst) {
                return Err(send_error(RDKafkaErrorCode::MessageSizeTooLarge));
            }
            if self
                .failures_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(send_error(RDKafkaErrorCode::AllBrokersDown));
            }
            self.sent
                .lock()
                .await
                .push((record.clone(), error.to_string(), attempts));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::error::ProcessorError;
    use crate::models::fixtures::record;
    use crate::models::RecordKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `fail_times` calls with a poison or transient error
    struct FlakyProcessor {
        calls: AtomicU32,
        fail_times: u32,
        transient: bool,
    }

    impl FlakyProcessor {
        fn new(fail_times: u32, transient: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_times,
                transient,
            }
        }
    }

    #[async_trait]
    impl Processor for FlakyProcessor {
        async fn process(&self, _record: &EventRecord) -> Result<ProcessOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                if self.transient {
                    return Err(ProcessorError::Redis(redis::RedisError::from((
                        redis::ErrorKind::IoError,
                        "connection reset",
                    ))));
                }
                return Err(ProcessorError::InvalidRecord("bad".to_string()));
            }
            Ok(ProcessOutcome::Duplicate {
                kind: RecordKind::Event,
            })
        }
    }

    fn fast_retry(max_retries: u32, sink: Arc<RecordingSink>) -> PoisonRetry {
        PoisonRetry::new(FixedBackoff::new(Duration::from_millis(1), max_retries), sink)
            .with_dlq_retry(RetryConfig {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                jitter: false,
                ..Default::default()
            })
    }

    #[tokio::test]
    async fn test_poison_record_retried_exactly_n_times() {
        let sink = Arc::new(RecordingSink::default());
        let retry = fast_retry(3, sink.clone());
        let processor = FlakyProcessor::new(u32::MAX, false);
        let rec = record("adapter.event", 5, Some("b1"), b"{}");

        let delivery = retry.deliver(&processor, &rec).await.unwrap();

        assert_eq!(delivery, Delivery::DeadLettered { attempts: 4 });
        assert_eq!(processor.calls.load(Ordering::SeqCst), 4);
        let sent = sink.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.offset, 5);
        assert_eq!(sent[0].2, 4);
        assert!(sent[0].1.contains("bad"));
    }

    #[tokio::test]
    async fn test_zero_retries_dead_letters_after_one_attempt() {
        let sink = Arc::new(RecordingSink::default());
        let processor = FlakyProcessor::new(u32::MAX, false);

        let delivery = fast_retry(0, sink.clone())
            .deliver(&processor, &record("t", 0, None, b"{}"))
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::DeadLettered { attempts: 1 });
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovery_before_budget_is_spent() {
        let sink = Arc::new(RecordingSink::default());
        let processor = FlakyProcessor::new(3, false);

        let delivery = fast_retry(3, sink.clone())
            .deliver(&processor, &record("t", 0, None, b"{}"))
            .await
            .unwrap();

        assert!(matches!(delivery, Delivery::Processed(_)));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 4);
        assert!(sink.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_error_is_returned_not_counted() {
        let sink = Arc::new(RecordingSink::default());
        let processor = FlakyProcessor::new(1, true);

        let err = fast_retry(3, sink.clone())
            .deliver(&processor, &record("t", 0, None, b"{}"))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert!(sink.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_send_is_retried() {
        let sink = Arc::new(RecordingSink::default());
        sink.failures_before_success.store(2, Ordering::SeqCst);
        let processor = FlakyProcessor::new(u32::MAX, false);

        let delivery = fast_retry(1, sink.clone())
            .deliver(&processor, &record("t", 0, None, b"{}"))
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::DeadLettered { attempts: 2 });
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sink.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_dead_letter_is_not_transient() {
        let sink = Arc::new(RecordingSink::default());
        sink.rejects.store(true, Ordering::SeqCst);
        let processor = FlakyProcessor::new(u32::MAX, false);

        let err = fast_retry(1, sink.clone())
            .deliver(&processor, &record("t", 0, None, b"{}"))
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert_eq!(err.kind(), "publish");
        // a permanent broker rejection is not retried
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert!(sink.sent.lock().await.is_empty());
    }
}
