//! Closes batch windows and publishes ready batches

use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::batch::{BatchState, BatchStore};
use crate::config::BatchConfig;
use crate::error::{ProcessorError, Result};
use crate::kafka::RecordPublisher;
use crate::mapper;
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Published {
        batch_id: String,
        events: usize,
        mentions: usize,
    },
    /// Some sends failed; the batch is back in the ready set with its data
    Requeued { batch_id: String, failed: usize },
}

pub struct BatchScheduler {
    state: BatchState,
    store: BatchStore,
    publisher: Arc<dyn RecordPublisher>,
    config: BatchConfig,
}

impl BatchScheduler {
    pub fn new(
        state: BatchState,
        store: BatchStore,
        publisher: Arc<dyn RecordPublisher>,
        config: BatchConfig,
    ) -> Self {
        Self {
            state,
            store,
            publisher,
            config,
        }
    }

    pub async fn check_windows(&self) -> Result<usize> {
        self.state.check_expired_windows().await
    }

    /// Publish one ready batch, if any.
    pub async fn process_ready_batch(&self) -> Result<Option<BatchOutcome>> {
        let Some(batch_id) = self.state.next_ready_batch().await? else {
            return Ok(None);
        };
        let started = Instant::now();
        info!(batch_id = %batch_id, "Publishing batch");

        let data = match self.store.load_batch(&batch_id).await {
            Ok(data) => data,
            Err(e) => {
                self.requeue(&batch_id).await;
                return Err(e);
            }
        };

        if data.is_empty() {
            warn!(batch_id = %batch_id, "Batch has no staged records");
            self.store.cleanup_batch(&batch_id).await;
            metrics::record_batch_published(true, 0, 0, started.elapsed());
            return Ok(Some(BatchOutcome::Published {
                batch_id,
                events: 0,
                mentions: 0,
            }));
        }

        let events = mapper::to_elastic_events(&data.events);
        let mentions = mapper::to_elastic_mentions(&data.mentions);

        let publisher = self.publisher.as_ref();
        let (event_results, mention_results) = tokio::join!(
            join_all(events.iter().map(|e| publisher.send_event(e))),
            join_all(mentions.iter().map(|m| publisher.send_mention(m))),
        );

        let failures: Vec<&ProcessorError> = event_results
            .iter()
            .chain(mention_results.iter())
            .filter_map(|r| r.as_ref().err())
            .collect();

        if failures.is_empty() {
            self.store.cleanup_batch(&batch_id).await;
            metrics::record_batch_published(true, events.len(), mentions.len(), started.elapsed());
            info!(
                batch_id = %batch_id,
                events = events.len(),
                mentions = mentions.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Batch published"
            );
            return Ok(Some(BatchOutcome::Published {
                batch_id,
                events: events.len(),
                mentions: mentions.len(),
            }));
        }

        let failed = failures.len();
        error!(
            batch_id = %batch_id,
            failed,
            total = events.len() + mentions.len(),
            first_error = %failures[0],
            "Batch publish failed, requeueing"
        );
        self.requeue(&batch_id).await;
        metrics::record_batch_published(false, events.len(), mentions.len(), started.elapsed());
        Ok(Some(BatchOutcome::Requeued { batch_id, failed }))
    }

    async fn requeue(&self, batch_id: &str) {
        if let Err(e) = self.state.requeue(batch_id).await {
            error!(batch_id = %batch_id, error = %e, "Failed to requeue batch");
        }
        if let Err(e) = self.store.extend_ttl(batch_id).await {
            warn!(batch_id = %batch_id, error = %e, "Failed to extend batch TTL");
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut check = tokio::time::interval(self.config.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut process = tokio::time::interval(self.config.process_interval);
        process.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            check_interval_ms = self.config.check_interval.as_millis() as u64,
            process_interval_ms = self.config.process_interval.as_millis() as u64,
            "Batch scheduler started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = check.tick() => {
                    if let Err(e) = self.check_windows().await {
                        error!(error = %e, "Failed to check batch windows");
                    }
                }
                _ = process.tick() => {
                    if let Err(e) = self.process_ready_batch().await {
                        error!(error = %e, "Failed to process ready batch");
                    }
                }
            }
        }

        info!("Batch scheduler stopped");
    }
}
