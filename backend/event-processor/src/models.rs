use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Header carrying the adapter's batch identifier
pub const BATCH_HEADER: &str = "X-Batch-ID";

/// Which input stream a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Event,
    Mention,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Event => "event",
            RecordKind::Mention => "mention",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Kafka record detached from the consumer. Immutable once read.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<(String, Option<Vec<u8>>)>,
    pub timestamp_ms: Option<i64>,
}

impl EventRecord {
    /// First header named `name` (case-insensitive) with a UTF-8 value
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn batch_id(&self) -> Option<&str> {
        self.header(BATCH_HEADER)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }
}

/// GDELT event as published by the adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub global_event_id: i64,
    pub day: Option<i64>,
    pub month_year: Option<i32>,
    pub year: Option<i32>,
    pub fraction_date: Option<f64>,

    pub actor1_code: Option<String>,
    pub actor1_name: Option<String>,
    pub actor1_country_code: Option<String>,
    pub actor1_known_group_code: Option<String>,
    pub actor1_ethnic_code: Option<String>,
    pub actor1_religion1_code: Option<String>,
    pub actor1_religion2_code: Option<String>,
    pub actor1_type1_code: Option<String>,
    pub actor1_type2_code: Option<String>,
    pub actor1_type3_code: Option<String>,

    pub actor2_code: Option<String>,
    pub actor2_name: Option<String>,
    pub actor2_country_code: Option<String>,
    pub actor2_known_group_code: Option<String>,
    pub actor2_ethnic_code: Option<String>,
    pub actor2_religion1_code: Option<String>,
    pub actor2_religion2_code: Option<String>,
    pub actor2_type1_code: Option<String>,
    pub actor2_type2_code: Option<String>,
    pub actor2_type3_code: Option<String>,

    pub is_root_event: Option<i32>,
    pub event_code: Option<String>,
    pub event_base_code: Option<String>,
    pub event_root_code: Option<String>,
    pub quad_class: Option<i32>,
    pub goldstein_scale: Option<f64>,
    pub num_mentions: Option<i32>,
    pub num_sources: Option<i32>,
    pub num_articles: Option<i32>,
    pub avg_tone: Option<f64>,

    pub actor1_geo_type: Option<i32>,
    pub actor1_geo_full_name: Option<String>,
    pub actor1_geo_country_code: Option<String>,
    pub actor1_geo_adm1_code: Option<String>,
    pub actor1_geo_adm2_code: Option<String>,
    pub actor1_geo_lat: Option<f64>,
    pub actor1_geo_long: Option<f64>,
    pub actor1_geo_feature_id: Option<String>,

    pub actor2_geo_type: Option<i32>,
    pub actor2_geo_full_name: Option<String>,
    pub actor2_geo_country_code: Option<String>,
    pub actor2_geo_adm1_code: Option<String>,
    pub actor2_geo_adm2_code: Option<String>,
    pub actor2_geo_lat: Option<f64>,
    pub actor2_geo_long: Option<f64>,
    pub actor2_geo_feature_id: Option<String>,

    pub action_geo_type: Option<i32>,
    pub action_geo_full_name: Option<String>,
    pub action_geo_country_code: Option<String>,
    pub action_geo_adm1_code: Option<String>,
    pub action_geo_adm2_code: Option<String>,
    pub action_geo_lat: Option<f64>,
    pub action_geo_long: Option<f64>,
    pub action_geo_feature_id: Option<String>,

    /// YYYYMMDDHHMMSS
    pub date_added: Option<i64>,
    pub source_url: Option<String>,
}

impl Event {
    /// Staging and dedup identity
    pub fn record_id(&self) -> String {
        self.global_event_id.to_string()
    }
}

/// GDELT mention of an event in a source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub global_event_id: i64,
    /// YYYYMMDDHHMMSS
    pub event_time_date: Option<i64>,
    /// YYYYMMDDHHMMSS
    pub mention_time_date: Option<i64>,
    pub mention_type: Option<i32>,
    pub mention_source_name: Option<String>,
    pub mention_identifier: String,
    pub sentence_id: Option<i32>,
    pub actor1_char_offset: Option<i32>,
    pub actor2_char_offset: Option<i32>,
    pub action_char_offset: Option<i32>,
    pub in_raw_text: Option<i32>,
    pub confidence: Option<i32>,
    pub mention_doc_len: Option<i32>,
    pub mention_doc_tone: Option<f64>,
    pub mention_doc_translation_info: Option<String>,
}

impl Mention {
    /// `{globalEventId}_{mentionIdentifier}`
    pub fn record_id(&self) -> String {
        mention_id(self.global_event_id, &self.mention_identifier)
    }
}

pub fn mention_id(global_event_id: i64, mention_identifier: &str) -> String {
    format!("{}_{}", global_event_id, mention_identifier)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Event enriched for search indexing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElasticEvent {
    pub global_event_id: i64,
    /// YYYY-MM-DD, selects the daily index
    pub elastic_index_date: Option<String>,
    pub event_date: Option<DateTime<Utc>>,

    pub actor1_code: Option<String>,
    pub actor1_name: Option<String>,
    pub actor1_country_code: Option<String>,
    pub actor1_known_group_code: Option<String>,
    pub actor1_ethnic_code: Option<String>,
    pub actor1_religion1_code: Option<String>,
    pub actor1_religion2_code: Option<String>,
    pub actor1_type1_code: Option<String>,
    pub actor1_type2_code: Option<String>,
    pub actor1_type3_code: Option<String>,

    pub actor2_code: Option<String>,
    pub actor2_name: Option<String>,
    pub actor2_country_code: Option<String>,
    pub actor2_known_group_code: Option<String>,
    pub actor2_ethnic_code: Option<String>,
    pub actor2_religion1_code: Option<String>,
    pub actor2_religion2_code: Option<String>,
    pub actor2_type1_code: Option<String>,
    pub actor2_type2_code: Option<String>,
    pub actor2_type3_code: Option<String>,

    pub is_root_event: Option<i32>,
    pub event_code: Option<String>,
    pub event_base_code: Option<String>,
    pub event_root_code: Option<String>,
    pub quad_class: Option<i32>,
    pub goldstein_scale: Option<f64>,
    pub num_mentions: Option<i32>,
    pub num_sources: Option<i32>,
    pub num_articles: Option<i32>,
    pub avg_tone: Option<f64>,

    pub actor1_geo_type: Option<i32>,
    pub actor1_geo_full_name: Option<String>,
    pub actor1_geo_country_code: Option<String>,
    pub actor1_geo_adm1_code: Option<String>,
    pub actor1_geo_adm2_code: Option<String>,
    pub actor1_location: Option<GeoPoint>,
    pub actor1_geo_feature_id: Option<String>,

    pub actor2_geo_type: Option<i32>,
    pub actor2_geo_full_name: Option<String>,
    pub actor2_geo_country_code: Option<String>,
    pub actor2_geo_adm1_code: Option<String>,
    pub actor2_geo_adm2_code: Option<String>,
    pub actor2_location: Option<GeoPoint>,
    pub actor2_geo_feature_id: Option<String>,

    pub action_geo_type: Option<i32>,
    pub action_geo_full_name: Option<String>,
    pub action_geo_country_code: Option<String>,
    pub action_geo_adm1_code: Option<String>,
    pub action_geo_adm2_code: Option<String>,
    pub action_location: Option<GeoPoint>,
    pub action_geo_feature_id: Option<String>,

    pub date_added: Option<DateTime<Utc>>,
    pub source_url: Option<String>,
}

impl ElasticEvent {
    /// Kafka key on the processed-events topic
    pub fn message_key(&self) -> String {
        self.global_event_id.to_string()
    }
}

/// Mention enriched for search indexing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElasticMention {
    pub global_event_id: i64,
    pub elastic_index_date: Option<String>,
    pub event_time_date: Option<DateTime<Utc>>,
    pub mention_time_date: Option<DateTime<Utc>>,
    pub mention_type: Option<i32>,
    pub mention_source_name: Option<String>,
    pub mention_identifier: String,
    pub sentence_id: Option<i32>,
    pub actor1_char_offset: Option<i32>,
    pub actor2_char_offset: Option<i32>,
    pub action_char_offset: Option<i32>,
    pub in_raw_text: Option<i32>,
    pub confidence: Option<i32>,
    pub mention_doc_len: Option<i32>,
    pub mention_doc_tone: Option<f64>,
    pub mention_doc_translation_info: Option<String>,
}

impl ElasticMention {
    /// Kafka key on the processed-mentions topic
    pub fn message_key(&self) -> String {
        mention_id(self.global_event_id, &self.mention_identifier)
    }
}

/// Everything staged for one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchData {
    pub events: Vec<Event>,
    pub mentions: Vec<Mention>,
}

impl BatchData {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.mentions.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_event_deserializes_camel_case() {
        let e = event(1001);
        assert_eq!(e.global_event_id, 1001);
        assert_eq!(e.day, Some(20240315));
        assert_eq!(e.actor1_geo_lat, Some(38.9));
        assert_eq!(e.actor2_geo_long, None);
        assert_eq!(e.record_id(), "1001");
    }

    #[test]
    fn test_mention_id() {
        let m = mention(7, "https://news/x");
        assert_eq!(m.record_id(), "7_https://news/x");
    }

    #[test]
    fn test_event_requires_id() {
        let result = serde_json::from_str::<Event>(r#"{"day": 20240101}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_batch_header_lookup() {
        let rec = record("adapter.event", 0, Some("  b-9 "), b"{}");
        assert_eq!(rec.batch_id(), Some("b-9"));
        assert_eq!(rec.header("x-batch-id"), Some("  b-9 "));

        let blank = record("adapter.event", 0, Some(""), b"{}");
        assert_eq!(blank.batch_id(), None);
    }
}
