use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
    Opts, TextEncoder,
};

use crate::error::ProcessorError;

static RECORDS_CONSUMED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_processor_records_consumed_total",
            "Records pulled from the input topics",
        ),
        &["topic"],
    )
    .expect("failed to create event_processor_records_consumed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_processor_records_consumed_total");
    counter
});

static RECORDS_PROCESSED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_processor_records_processed_total",
            "Records processed by outcome (stored, duplicate, unguarded)",
        ),
        &["kind", "outcome"],
    )
    .expect("failed to create event_processor_records_processed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_processor_records_processed_total");
    counter
});

static PROCESSING_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_processor_processing_errors_total",
            "Processing failures by error kind and class",
        ),
        &["error", "class"],
    )
    .expect("failed to create event_processor_processing_errors_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_processor_processing_errors_total");
    counter
});

static PROCESSING_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "event_processor_processing_duration_seconds",
            "Time spent processing a single record",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["kind"],
    )
    .expect("failed to create event_processor_processing_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register event_processor_processing_duration_seconds");
    histogram
});

static POISON_RETRIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_processor_poison_retries_total",
            "Retries of records that failed processing",
        ),
        &["topic"],
    )
    .expect("failed to create event_processor_poison_retries_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_processor_poison_retries_total");
    counter
});

static DEAD_LETTERED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_processor_dead_lettered_total",
            "Records routed to a dead-letter topic",
        ),
        &["topic"],
    )
    .expect("failed to create event_processor_dead_lettered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_processor_dead_lettered_total");
    counter
});

static COMMITTED_OFFSET: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "event_processor_committed_offset",
            "Last committed offset per partition",
        ),
        &["topic", "partition"],
    )
    .expect("failed to create event_processor_committed_offset");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register event_processor_committed_offset");
    gauge
});

static CONSUMER_LAG: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "event_processor_consumer_lag",
            "High watermark minus next offset to consume",
        ),
        &["topic", "partition"],
    )
    .expect("failed to create event_processor_consumer_lag");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register event_processor_consumer_lag");
    gauge
});

static CONSUMER_BACKOFF_ERRORS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "event_processor_consumer_consecutive_errors",
            "Consecutive transient errors per consumer worker",
        ),
        &["worker"],
    )
    .expect("failed to create event_processor_consumer_consecutive_errors");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register event_processor_consumer_consecutive_errors");
    gauge
});

static RECORDS_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_processor_records_dropped_total",
            "Records skipped because the dead-letter topic rejected them",
        ),
        &["topic"],
    )
    .expect("failed to create event_processor_records_dropped_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_processor_records_dropped_total");
    counter
});

static BATCHES_REGISTERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "event_processor_batches_registered_total",
        "Batch windows opened",
    )
    .expect("failed to create event_processor_batches_registered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_processor_batches_registered_total");
    counter
});

static BATCHES_READY_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "event_processor_batches_ready_total",
        "Batch windows closed and queued for publishing",
    )
    .expect("failed to create event_processor_batches_ready_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_processor_batches_ready_total");
    counter
});

static BATCHES_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_processor_batches_published_total",
            "Batch publish attempts by result",
        ),
        &["result"],
    )
    .expect("failed to create event_processor_batches_published_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_processor_batches_published_total");
    counter
});

static RECORDS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "event_processor_records_published_total",
            "Enriched documents sent to the output topics",
        ),
        &["kind"],
    )
    .expect("failed to create event_processor_records_published_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register event_processor_records_published_total");
    counter
});

static BATCH_PUBLISH_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "event_processor_batch_publish_duration_seconds",
            "Time to load, map and publish one batch",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["result"],
    )
    .expect("failed to create event_processor_batch_publish_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register event_processor_batch_publish_duration_seconds");
    histogram
});

pub fn record_consumed(topic: &str) {
    RECORDS_CONSUMED_TOTAL.with_label_values(&[topic]).inc();
}

pub fn record_processed(kind: &str, outcome: &str, elapsed: Duration) {
    RECORDS_PROCESSED_TOTAL
        .with_label_values(&[kind, outcome])
        .inc();
    PROCESSING_DURATION_SECONDS
        .with_label_values(&[kind])
        .observe(elapsed.as_secs_f64());
}

pub fn record_error(err: &ProcessorError) {
    let class = if err.is_transient() { "transient" } else { "poison" };
    PROCESSING_ERRORS_TOTAL
        .with_label_values(&[err.kind(), class])
        .inc();
}

pub fn record_poison_retry(topic: &str) {
    POISON_RETRIES_TOTAL.with_label_values(&[topic]).inc();
}

pub fn record_dead_lettered(topic: &str) {
    DEAD_LETTERED_TOTAL.with_label_values(&[topic]).inc();
}

pub fn set_committed_offset(topic: &str, partition: i32, offset: i64) {
    COMMITTED_OFFSET
        .with_label_values(&[topic, &partition.to_string()])
        .set(offset);
}

pub fn set_consumer_lag(topic: &str, partition: i32, lag: i64) {
    CONSUMER_LAG
        .with_label_values(&[topic, &partition.to_string()])
        .set(lag.max(0));
}

pub fn set_consecutive_errors(worker: usize, count: u32) {
    CONSUMER_BACKOFF_ERRORS
        .with_label_values(&[&worker.to_string()])
        .set(i64::from(count));
}

pub fn record_dropped(topic: &str) {
    RECORDS_DROPPED_TOTAL.with_label_values(&[topic]).inc();
}

pub fn record_batch_registered() {
    BATCHES_REGISTERED_TOTAL.inc();
}

pub fn record_batches_ready(count: usize) {
    BATCHES_READY_TOTAL.inc_by(count as u64);
}

pub fn record_batch_published(success: bool, events: usize, mentions: usize, elapsed: Duration) {
    let result = if success { "success" } else { "failure" };
    BATCHES_PUBLISHED_TOTAL.with_label_values(&[result]).inc();
    BATCH_PUBLISH_DURATION_SECONDS
        .with_label_values(&[result])
        .observe(elapsed.as_secs_f64());
    if success {
        RECORDS_PUBLISHED_TOTAL
            .with_label_values(&["event"])
            .inc_by(events as u64);
        RECORDS_PUBLISHED_TOTAL
            .with_label_values(&["mention"])
            .inc_by(mentions as u64);
    }
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
