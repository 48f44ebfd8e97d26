//! Per-record processing: validate, deduplicate, stage into the batch window

use async_trait::async_trait;
use idempotent_consumer::{IdempotencyGuard, ProcessingResult};
use std::time::Instant;
use tracing::debug;

use crate::batch::{BatchState, BatchStore};
use crate::error::{ProcessorError, Result};
use crate::keys;
use crate::metrics;
use crate::models::{Event, EventRecord, Mention, RecordKind, BATCH_HEADER};

/// What happened to a record that processed without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// First delivery; staged under its dedup marker
    Stored {
        kind: RecordKind,
        batch_id: String,
        new_batch: bool,
    },
    /// Marker already present; nothing was written
    Duplicate { kind: RecordKind },
    /// Staged without a marker because the dedup store was down (fail-open)
    Unguarded {
        kind: RecordKind,
        batch_id: String,
        new_batch: bool,
    },
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Stored { .. } => "stored",
            ProcessOutcome::Duplicate { .. } => "duplicate",
            ProcessOutcome::Unguarded { .. } => "unguarded",
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            ProcessOutcome::Stored { kind, .. }
            | ProcessOutcome::Duplicate { kind }
            | ProcessOutcome::Unguarded { kind, .. } => *kind,
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, record: &EventRecord) -> Result<ProcessOutcome>;
}

/// Input topic names, for routing records to a [`RecordKind`]
#[derive(Debug, Clone)]
pub struct TopicRoutes {
    pub events: String,
    pub mentions: String,
}

impl TopicRoutes {
    pub fn kind_of(&self, topic: &str) -> Option<RecordKind> {
        if topic == self.events {
            Some(RecordKind::Event)
        } else if topic == self.mentions {
            Some(RecordKind::Mention)
        } else {
            None
        }
    }
}

enum Parsed {
    Event(Event),
    Mention(Mention),
}

impl Parsed {
    fn record_id(&self) -> String {
        match self {
            Parsed::Event(e) => e.record_id(),
            Parsed::Mention(m) => m.record_id(),
        }
    }
}

#[derive(Clone)]
pub struct EventProcessor {
    routes: TopicRoutes,
    guard: IdempotencyGuard,
    state: BatchState,
    store: BatchStore,
}

impl EventProcessor {
    pub fn new(
        routes: TopicRoutes,
        guard: IdempotencyGuard,
        state: BatchState,
        store: BatchStore,
    ) -> Self {
        Self {
            routes,
            guard,
            state,
            store,
        }
    }

    fn parse(kind: RecordKind, record: &EventRecord) -> Result<Parsed> {
        let payload = record
            .payload
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ProcessorError::InvalidRecord("empty payload".to_string()))?;

        match kind {
            RecordKind::Event => {
                let event: Event = serde_json::from_slice(payload)?;
                if event.global_event_id <= 0 {
                    return Err(ProcessorError::InvalidRecord(format!(
                        "globalEventId must be positive, got {}",
                        event.global_event_id
                    )));
                }
                Ok(Parsed::Event(event))
            }
            RecordKind::Mention => {
                let mention: Mention = serde_json::from_slice(payload)?;
                if mention.mention_identifier.trim().is_empty() {
                    return Err(ProcessorError::InvalidRecord(
                        "mentionIdentifier is empty".to_string(),
                    ));
                }
                Ok(Parsed::Mention(mention))
            }
        }
    }

    async fn stage(&self, batch_id: &str, parsed: &Parsed) -> Result<bool> {
        let new_batch = self.state.register_batch(batch_id).await?;
        match parsed {
            Parsed::Event(event) => self.store.store_event(batch_id, event).await?,
            Parsed::Mention(mention) => self.store.store_mention(batch_id, mention).await?,
        }
        Ok(new_batch)
    }
}

#[async_trait]
impl Processor for EventProcessor {
    async fn process(&self, record: &EventRecord) -> Result<ProcessOutcome> {
        let started = Instant::now();

        let batch_id = record
            .batch_id()
            .ok_or(ProcessorError::MissingHeader(BATCH_HEADER))?;
        let kind = self
            .routes
            .kind_of(&record.topic)
            .ok_or_else(|| ProcessorError::UnknownTopic(record.topic.clone()))?;
        let parsed = Self::parse(kind, record)?;
        let dedup_key = keys::dedup(kind, batch_id, &parsed.record_id());

        let result = self
            .guard
            .process_if_new(&dedup_key, || self.stage(batch_id, &parsed))
            .await?;

        let outcome = match result {
            ProcessingResult::Success(new_batch) => ProcessOutcome::Stored {
                kind,
                batch_id: batch_id.to_string(),
                new_batch,
            },
            ProcessingResult::Unguarded(new_batch) => ProcessOutcome::Unguarded {
                kind,
                batch_id: batch_id.to_string(),
                new_batch,
            },
            ProcessingResult::AlreadyProcessed => {
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    key = %dedup_key,
                    "Duplicate record skipped"
                );
                ProcessOutcome::Duplicate { kind }
            }
            ProcessingResult::Failed(e) => return Err(e),
        };

        metrics::record_processed(kind.as_str(), outcome.label(), started.elapsed());
        Ok(outcome)
    }
}
