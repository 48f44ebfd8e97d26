//! Batch windows and the records staged inside them
//!
//! A batch opens when its first record arrives and closes `window` later.
//! Closed batches move from `active:batches` to `ready:batches`, where the
//! scheduler picks them up. All staged keys expire after `window + extra_ttl`
//! so an abandoned batch cleans itself up.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::CacheClient;
use crate::config::BatchConfig;
use crate::error::Result;
use crate::keys;
use crate::metrics;
use crate::models::{BatchData, Event, Mention, RecordKind};

#[derive(Clone)]
pub struct BatchState {
    cache: Arc<dyn CacheClient>,
    config: BatchConfig,
}

impl BatchState {
    pub fn new(cache: Arc<dyn CacheClient>, config: BatchConfig) -> Self {
        Self { cache, config }
    }

    /// Open the window for `batch_id` if this is its first record.
    ///
    /// Returns `true` only for the caller that created the start key. The
    /// active-set insert runs every time so a registration interrupted
    /// between the two commands heals on the next record.
    pub async fn register_batch(&self, batch_id: &str) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis().to_string();
        let created = self
            .cache
            .set_if_absent(
                &keys::batch_start(batch_id),
                &now_ms,
                self.config.effective_ttl(),
            )
            .await?;
        self.cache.set_add(keys::ACTIVE_BATCHES, batch_id).await?;

        if created {
            metrics::record_batch_registered();
            info!(batch_id = %batch_id, "New batch window opened");
        }
        Ok(created)
    }

    /// Move every active batch whose window has elapsed to the ready set.
    pub async fn check_expired_windows(&self) -> Result<usize> {
        let active = self.cache.set_members(keys::ACTIVE_BATCHES).await?;
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = i64::try_from(self.config.window.as_millis()).unwrap_or(i64::MAX);
        let mut moved = 0;

        for batch_id in active {
            let start = self.cache.get(&keys::batch_start(&batch_id)).await?;
            let Some(start_ms) = start.and_then(|s| s.parse::<i64>().ok()) else {
                warn!(batch_id = %batch_id, "Active batch has no valid start time, dropping");
                self.cache.set_remove(keys::ACTIVE_BATCHES, &batch_id).await?;
                continue;
            };

            if now_ms - start_ms < window_ms {
                continue;
            }

            if self
                .cache
                .set_move(keys::ACTIVE_BATCHES, keys::READY_BATCHES, &batch_id)
                .await?
            {
                debug!(batch_id = %batch_id, "Batch window closed");
                moved += 1;
            }
        }

        if moved > 0 {
            metrics::record_batches_ready(moved);
            info!(count = moved, "Batches ready for publishing");
        }
        Ok(moved)
    }

    /// Claim one ready batch. SPOP hands each batch to a single instance.
    pub async fn next_ready_batch(&self) -> Result<Option<String>> {
        self.cache.set_pop(keys::READY_BATCHES).await
    }

    pub async fn requeue(&self, batch_id: &str) -> Result<()> {
        self.cache.set_add(keys::READY_BATCHES, batch_id).await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct BatchStore {
    cache: Arc<dyn CacheClient>,
    ttl: Duration,
}

impl BatchStore {
    pub fn new(cache: Arc<dyn CacheClient>, config: &BatchConfig) -> Self {
        Self {
            cache,
            ttl: config.effective_ttl(),
        }
    }

    pub async fn store_event(&self, batch_id: &str, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.stage(RecordKind::Event, batch_id, &event.record_id(), &json)
            .await
    }

    pub async fn store_mention(&self, batch_id: &str, mention: &Mention) -> Result<()> {
        let json = serde_json::to_string(mention)?;
        self.stage(RecordKind::Mention, batch_id, &mention.record_id(), &json)
            .await
    }

    async fn stage(&self, kind: RecordKind, batch_id: &str, id: &str, json: &str) -> Result<()> {
        let ids_key = keys::batch_ids(kind, batch_id);
        self.cache
            .set(&keys::data(kind, batch_id, id), json, Some(self.ttl))
            .await?;
        self.cache.set_add(&ids_key, id).await?;
        self.cache.expire(&ids_key, self.ttl).await?;
        debug!(kind = %kind, batch_id = %batch_id, id = %id, "Record staged");
        Ok(())
    }

    /// Read everything staged for `batch_id`. Entries that expired or no
    /// longer deserialize are skipped.
    pub async fn load_batch(&self, batch_id: &str) -> Result<BatchData> {
        let mut data = BatchData::default();

        for id in self
            .cache
            .set_members(&keys::batch_ids(RecordKind::Event, batch_id))
            .await?
        {
            if let Some(event) = self.load_one::<Event>(RecordKind::Event, batch_id, &id).await? {
                data.events.push(event);
            }
        }

        for id in self
            .cache
            .set_members(&keys::batch_ids(RecordKind::Mention, batch_id))
            .await?
        {
            if let Some(mention) = self
                .load_one::<Mention>(RecordKind::Mention, batch_id, &id)
                .await?
            {
                data.mentions.push(mention);
            }
        }

        debug!(
            batch_id = %batch_id,
            events = data.events.len(),
            mentions = data.mentions.len(),
            "Batch loaded"
        );
        Ok(data)
    }

    async fn load_one<T: serde::de::DeserializeOwned>(
        &self,
        kind: RecordKind,
        batch_id: &str,
        id: &str,
    ) -> Result<Option<T>> {
        let Some(json) = self.cache.get(&keys::data(kind, batch_id, id)).await? else {
            warn!(kind = %kind, batch_id = %batch_id, id = %id, "Staged record missing");
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(kind = %kind, batch_id = %batch_id, id = %id, error = %e, "Staged record unreadable");
                Ok(None)
            }
        }
    }

    /// Delete every key belonging to `batch_id`. Failures are logged; the
    /// keys expire on their own.
    pub async fn cleanup_batch(&self, batch_id: &str) {
        let keys_to_delete = self.batch_keys(batch_id).await;

        match self.cache.delete(&keys_to_delete).await {
            Ok(deleted) => debug!(batch_id = %batch_id, deleted, "Batch keys deleted"),
            Err(e) => warn!(batch_id = %batch_id, error = %e, "Failed to delete batch keys"),
        }

        for set in [keys::ACTIVE_BATCHES, keys::READY_BATCHES] {
            if let Err(e) = self.cache.set_remove(set, batch_id).await {
                warn!(batch_id = %batch_id, set = set, error = %e, "Failed to unlink batch");
            }
        }
    }

    /// Push every key of `batch_id` out by a full TTL so a requeued batch
    /// does not expire while it waits.
    pub async fn extend_ttl(&self, batch_id: &str) -> Result<()> {
        for key in self.batch_keys(batch_id).await {
            self.cache.expire(&key, self.ttl).await?;
        }
        Ok(())
    }

    async fn batch_keys(&self, batch_id: &str) -> Vec<String> {
        let mut all = Vec::new();
        for kind in [RecordKind::Event, RecordKind::Mention] {
            let ids_key = keys::batch_ids(kind, batch_id);
            match self.cache.set_members(&ids_key).await {
                Ok(ids) => all.extend(ids.iter().map(|id| keys::data(kind, batch_id, id))),
                Err(e) => warn!(batch_id = %batch_id, kind = %kind, error = %e, "Failed to list staged ids"),
            }
            all.push(ids_key);
        }
        all.push(keys::batch_start(batch_id));
        all
    }
}
