//! Event Mosaic processor
//!
//! Consumes GDELT events and mentions from Kafka, drops duplicates through
//! Redis dedup markers, stages records into time-boxed batches and publishes
//! each closed batch as enriched documents.

pub mod app;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod kafka;
pub mod keys;
pub mod mapper;
pub mod metrics;
pub mod models;
pub mod offsets;
pub mod processor;
pub mod retry;
pub mod scheduler;

pub use config::Config;
pub use error::{ProcessorError, Result};
