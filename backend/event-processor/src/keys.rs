//! Redis key layout
//!
//! ```text
//! data:event:{batch}:{globalEventId}         staged Event JSON
//! data:mention:{batch}:{mentionId}           staged Mention JSON
//! batch:events:{batch}                       SET of staged event ids
//! batch:mentions:{batch}                     SET of staged mention ids
//! batch:start:{batch}                        window start, epoch millis
//! active:batches                             SET of batches inside their window
//! ready:batches                              SET of batches waiting to be published
//! dedup:{event|mention}:{batch}:{id}         Dedup Marker
//! ```
//!
//! A record id longer than [`MAX_DEDUP_ID_LEN`] (long mention URLs) is
//! replaced by `sha256:{hex}` in the dedup key.

use sha2::{Digest, Sha256};

use crate::models::RecordKind;

const EVENT_DATA_PREFIX: &str = "data:event:";
const MENTION_DATA_PREFIX: &str = "data:mention:";
const BATCH_EVENTS_PREFIX: &str = "batch:events:";
const BATCH_MENTIONS_PREFIX: &str = "batch:mentions:";
const BATCH_START_PREFIX: &str = "batch:start:";
const DEDUP_PREFIX: &str = "dedup:";

pub const ACTIVE_BATCHES: &str = "active:batches";
pub const READY_BATCHES: &str = "ready:batches";

/// Longest record id kept verbatim in a dedup key, in bytes
pub const MAX_DEDUP_ID_LEN: usize = 256;

pub fn event_data(batch_id: &str, event_id: i64) -> String {
    format!("{EVENT_DATA_PREFIX}{batch_id}:{event_id}")
}

pub fn mention_data(batch_id: &str, mention_id: &str) -> String {
    format!("{MENTION_DATA_PREFIX}{batch_id}:{mention_id}")
}

/// Data key for a staged record, by the id stored in the batch's id set
pub fn data(kind: RecordKind, batch_id: &str, id: &str) -> String {
    match kind {
        RecordKind::Event => format!("{EVENT_DATA_PREFIX}{batch_id}:{id}"),
        RecordKind::Mention => mention_data(batch_id, id),
    }
}

pub fn batch_ids(kind: RecordKind, batch_id: &str) -> String {
    match kind {
        RecordKind::Event => format!("{BATCH_EVENTS_PREFIX}{batch_id}"),
        RecordKind::Mention => format!("{BATCH_MENTIONS_PREFIX}{batch_id}"),
    }
}

pub fn batch_start(batch_id: &str) -> String {
    format!("{BATCH_START_PREFIX}{batch_id}")
}

pub fn dedup(kind: RecordKind, batch_id: &str, id: &str) -> String {
    if id.len() > MAX_DEDUP_ID_LEN {
        let digest = hex::encode(Sha256::digest(id.as_bytes()));
        return format!("{DEDUP_PREFIX}{}:{batch_id}:sha256:{digest}", kind.as_str());
    }
    format!("{DEDUP_PREFIX}{}:{batch_id}:{id}", kind.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_keys() {
        assert_eq!(event_data("b-1", 42), "data:event:b-1:42");
        assert_eq!(mention_data("b-1", "42_http://x"), "data:mention:b-1:42_http://x");
        assert_eq!(data(RecordKind::Event, "b-1", "42"), event_data("b-1", 42));
    }

    #[test]
    fn test_state_keys() {
        assert_eq!(batch_ids(RecordKind::Event, "b-1"), "batch:events:b-1");
        assert_eq!(batch_ids(RecordKind::Mention, "b-1"), "batch:mentions:b-1");
        assert_eq!(batch_start("b-1"), "batch:start:b-1");
        assert_eq!(ACTIVE_BATCHES, "active:batches");
        assert_eq!(READY_BATCHES, "ready:batches");
    }

    #[test]
    fn test_dedup_key() {
        assert_eq!(dedup(RecordKind::Mention, "b-1", "7_a"), "dedup:mention:b-1:7_a");
    }

    #[test]
    fn test_long_dedup_id_is_hashed() {
        let url = format!("7_https://news.example/{}", "a".repeat(2000));
        let key = dedup(RecordKind::Mention, "b-1", &url);

        assert!(key.starts_with("dedup:mention:b-1:sha256:"));
        assert_eq!(key.len(), "dedup:mention:b-1:sha256:".len() + 64);
        assert_eq!(key, dedup(RecordKind::Mention, "b-1", &url));

        let other = format!("7_https://news.example/{}", "b".repeat(2000));
        assert_ne!(key, dedup(RecordKind::Mention, "b-1", &other));
    }
}
