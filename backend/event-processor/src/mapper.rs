//! Event/Mention → search documents
//!
//! GDELT encodes dates as integers (`YYYYMMDD` and `YYYYMMDDHHMMSS`). A value
//! that does not decode becomes `None` and is logged; it never fails the batch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tracing::warn;

use crate::models::{ElasticEvent, ElasticMention, Event, GeoPoint, Mention};

pub fn to_elastic_event(event: &Event) -> ElasticEvent {
    let e = event.clone();
    ElasticEvent {
        global_event_id: e.global_event_id,
        elastic_index_date: day_to_index_date(e.day),
        event_date: day_to_datetime(e.day),

        actor1_code: e.actor1_code,
        actor1_name: e.actor1_name,
        actor1_country_code: e.actor1_country_code,
        actor1_known_group_code: e.actor1_known_group_code,
        actor1_ethnic_code: e.actor1_ethnic_code,
        actor1_religion1_code: e.actor1_religion1_code,
        actor1_religion2_code: e.actor1_religion2_code,
        actor1_type1_code: e.actor1_type1_code,
        actor1_type2_code: e.actor1_type2_code,
        actor1_type3_code: e.actor1_type3_code,

        actor2_code: e.actor2_code,
        actor2_name: e.actor2_name,
        actor2_country_code: e.actor2_country_code,
        actor2_known_group_code: e.actor2_known_group_code,
        actor2_ethnic_code: e.actor2_ethnic_code,
        actor2_religion1_code: e.actor2_religion1_code,
        actor2_religion2_code: e.actor2_religion2_code,
        actor2_type1_code: e.actor2_type1_code,
        actor2_type2_code: e.actor2_type2_code,
        actor2_type3_code: e.actor2_type3_code,

        is_root_event: e.is_root_event,
        event_code: e.event_code,
        event_base_code: e.event_base_code,
        event_root_code: e.event_root_code,
        quad_class: e.quad_class,
        goldstein_scale: e.goldstein_scale,
        num_mentions: e.num_mentions,
        num_sources: e.num_sources,
        num_articles: e.num_articles,
        avg_tone: e.avg_tone,

        actor1_geo_type: e.actor1_geo_type,
        actor1_geo_full_name: e.actor1_geo_full_name,
        actor1_geo_country_code: e.actor1_geo_country_code,
        actor1_geo_adm1_code: e.actor1_geo_adm1_code,
        actor1_geo_adm2_code: e.actor1_geo_adm2_code,
        actor1_location: geo_point(e.actor1_geo_lat, e.actor1_geo_long),
        actor1_geo_feature_id: e.actor1_geo_feature_id,

        actor2_geo_type: e.actor2_geo_type,
        actor2_geo_full_name: e.actor2_geo_full_name,
        actor2_geo_country_code: e.actor2_geo_country_code,
        actor2_geo_adm1_code: e.actor2_geo_adm1_code,
        actor2_geo_adm2_code: e.actor2_geo_adm2_code,
        actor2_location: geo_point(e.actor2_geo_lat, e.actor2_geo_long),
        actor2_geo_feature_id: e.actor2_geo_feature_id,

        action_geo_type: e.action_geo_type,
        action_geo_full_name: e.action_geo_full_name,
        action_geo_country_code: e.action_geo_country_code,
        action_geo_adm1_code: e.action_geo_adm1_code,
        action_geo_adm2_code: e.action_geo_adm2_code,
        action_location: geo_point(e.action_geo_lat, e.action_geo_long),
        action_geo_feature_id: e.action_geo_feature_id,

        date_added: timestamp_to_datetime(e.date_added),
        source_url: e.source_url,
    }
}

pub fn to_elastic_events(events: &[Event]) -> Vec<ElasticEvent> {
    events.iter().map(to_elastic_event).collect()
}

pub fn to_elastic_mention(mention: &Mention) -> ElasticMention {
    let m = mention.clone();
    ElasticMention {
        global_event_id: m.global_event_id,
        elastic_index_date: timestamp_to_index_date(m.mention_time_date),
        event_time_date: timestamp_to_datetime(m.event_time_date),
        mention_time_date: timestamp_to_datetime(m.mention_time_date),
        mention_type: m.mention_type,
        mention_source_name: m.mention_source_name,
        mention_identifier: m.mention_identifier,
        sentence_id: m.sentence_id,
        actor1_char_offset: m.actor1_char_offset,
        actor2_char_offset: m.actor2_char_offset,
        action_char_offset: m.action_char_offset,
        in_raw_text: m.in_raw_text,
        confidence: m.confidence,
        mention_doc_len: m.mention_doc_len,
        mention_doc_tone: m.mention_doc_tone,
        mention_doc_translation_info: m.mention_doc_translation_info,
    }
}

pub fn to_elastic_mentions(mentions: &[Mention]) -> Vec<ElasticMention> {
    mentions.iter().map(to_elastic_mention).collect()
}

/// Both coordinates or nothing
pub fn geo_point(lat: Option<f64>, lon: Option<f64>) -> Option<GeoPoint> {
    match (lat, lon) {
        (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
        _ => None,
    }
}

/// `20210101` → `"2021-01-01"`
pub fn day_to_index_date(day: Option<i64>) -> Option<String> {
    let digits = day?.to_string();
    if digits.len() == 8 && digits.bytes().all(|b| b.is_ascii_digit()) {
        return Some(dashed_date(&digits));
    }
    warn!(day = ?day, "Malformed day for elasticIndexDate");
    None
}

/// `20210101` → `2021-01-01T00:00:00Z`
pub fn day_to_datetime(day: Option<i64>) -> Option<DateTime<Utc>> {
    let digits = day?.to_string();
    if digits.len() != 8 {
        warn!(day = ?day, "Malformed day length for eventDate");
        return None;
    }
    match NaiveDate::parse_from_str(&digits, "%Y%m%d") {
        Ok(date) => date
            .and_hms_opt(0, 0, 0)
            .map(|midnight| Utc.from_utc_datetime(&midnight)),
        Err(e) => {
            warn!(day = ?day, error = %e, "Malformed day for eventDate");
            None
        }
    }
}

/// `20210101123456` → `2021-01-01T12:34:56Z`
pub fn timestamp_to_datetime(timestamp: Option<i64>) -> Option<DateTime<Utc>> {
    let digits = timestamp?.to_string();
    if digits.len() != 14 {
        warn!(timestamp = ?timestamp, "Malformed timestamp length");
        return None;
    }
    match NaiveDateTime::parse_from_str(&digits, "%Y%m%d%H%M%S") {
        Ok(ndt) => Some(Utc.from_utc_datetime(&ndt)),
        Err(e) => {
            warn!(timestamp = ?timestamp, error = %e, "Malformed timestamp");
            None
        }
    }
}

/// `20210101123456` → `"2021-01-01"`; only the leading `YYYYMMDD` is read
pub fn timestamp_to_index_date(timestamp: Option<i64>) -> Option<String> {
    let digits = timestamp?.to_string();
    if digits.len() >= 8 && digits.bytes().all(|b| b.is_ascii_digit()) {
        return Some(dashed_date(&digits[..8]));
    }
    warn!(timestamp = ?timestamp, "Malformed timestamp for elasticIndexDate");
    None
}

fn dashed_date(yyyymmdd: &str) -> String {
    format!("{}-{}-{}", &yyyymmdd[0..4], &yyyymmdd[4..6], &yyyymmdd[6..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{event, mention};

    #[test]
    fn test_day_conversions() {
        assert_eq!(day_to_index_date(Some(20210101)).as_deref(), Some("2021-01-01"));
        assert_eq!(day_to_index_date(Some(202101)), None);
        assert_eq!(day_to_index_date(None), None);

        let midnight = day_to_datetime(Some(20210101)).unwrap();
        assert_eq!(midnight.to_rfc3339(), "2021-01-01T00:00:00+00:00");
        assert_eq!(day_to_datetime(Some(20211301)), None);
        assert_eq!(day_to_datetime(Some(123)), None);
    }

    #[test]
    fn test_timestamp_conversions() {
        let ts = timestamp_to_datetime(Some(20210101123456)).unwrap();
        assert_eq!(ts.to_rfc3339(), "2021-01-01T12:34:56+00:00");
        assert_eq!(timestamp_to_datetime(Some(20210101)), None);
        assert_eq!(timestamp_to_datetime(Some(20210132123456)), None);

        assert_eq!(
            timestamp_to_index_date(Some(20210101123456)).as_deref(),
            Some("2021-01-01")
        );
        assert_eq!(timestamp_to_index_date(Some(20210101)).as_deref(), Some("2021-01-01"));
        assert_eq!(timestamp_to_index_date(Some(2021)), None);
    }

    #[test]
    fn test_geo_point_needs_both_coordinates() {
        assert_eq!(
            geo_point(Some(1.0), Some(2.0)),
            Some(GeoPoint { lat: 1.0, lon: 2.0 })
        );
        assert_eq!(geo_point(Some(1.0), None), None);
        assert_eq!(geo_point(None, Some(2.0)), None);
    }

    #[test]
    fn test_event_mapping() {
        let mapped = to_elastic_event(&event(55));

        assert_eq!(mapped.global_event_id, 55);
        assert_eq!(mapped.elastic_index_date.as_deref(), Some("2024-03-15"));
        assert_eq!(
            mapped.date_added.map(|d| d.to_rfc3339()).as_deref(),
            Some("2024-03-15T12:34:56+00:00")
        );
        assert_eq!(mapped.actor1_location, Some(GeoPoint { lat: 38.9, lon: -77.0 }));
        // actor2 has a latitude only
        assert_eq!(mapped.actor2_location, None);
        assert_eq!(mapped.event_code.as_deref(), Some("042"));
        assert_eq!(mapped.message_key(), "55");
    }

    #[test]
    fn test_mention_mapping() {
        let mapped = to_elastic_mentions(&[mention(9, "doc-1")]);

        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].elastic_index_date.as_deref(), Some("2024-03-15"));
        assert_eq!(
            mapped[0].mention_time_date.map(|d| d.to_rfc3339()).as_deref(),
            Some("2024-03-15T13:15:00+00:00")
        );
        assert_eq!(mapped[0].message_key(), "9_doc-1");
    }

    #[test]
    fn test_serialized_document_uses_camel_case() {
        let json = serde_json::to_value(to_elastic_event(&event(1))).unwrap();
        assert_eq!(json["globalEventId"], 1);
        assert_eq!(json["actor1Location"]["lon"], -77.0);
        assert_eq!(json["elasticIndexDate"], "2024-03-15");
    }
}
