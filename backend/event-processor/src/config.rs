use anyhow::{bail, Context, Result};
use idempotent_consumer::DedupFailurePolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Service configuration, read from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub kafka: KafkaConfig,
    pub retry: RetryConfig,
    pub redis: RedisConfig,
    pub batch: BatchConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: String,
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub group_id: String,
    pub events_topic: String,
    pub mentions_topic: String,
    pub processed_events_topic: String,
    pub processed_mentions_topic: String,
    pub events_dlq_topic: String,
    pub mentions_dlq_topic: String,
    pub dlq_partitions: i32,
    pub dlq_replicas: i32,
    /// Consumer tasks, each with its own Kafka consumer in the group
    pub workers: usize,
    pub poll_max_records: usize,
    pub poll_timeout: Duration,
    pub producer_timeout: Duration,
    pub auto_offset_reset: String,
    pub session_timeout_ms: u32,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first failed attempt before a record is dead-lettered
    pub max_attempts: u32,
    pub interval: Duration,
    /// Backoff bounds for broker and Redis outages
    pub infra_backoff_min: Duration,
    pub infra_backoff_max: Duration,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub command_timeout: Duration,
    pub dedup_ttl: Duration,
    /// How long an unfinished claim blocks redeliveries of the same record
    pub dedup_pending_ttl: Duration,
    pub dedup_failure_policy: DedupFailurePolicy,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub window: Duration,
    pub extra_ttl: Duration,
    pub check_interval: Duration,
    pub process_interval: Duration,
}

impl BatchConfig {
    /// TTL for staged records and batch state
    pub fn effective_ttl(&self) -> Duration {
        self.window + self.extra_ttl
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub enabled: bool,
    pub url: String,
    pub instance_host: String,
    pub instance_id: Option<String>,
    pub renewal_interval: Duration,
    pub lease_duration: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let app = AppConfig {
            env: env_string("APP_ENV", "development"),
            name: env_string("SERVICE_NAME", "em-processor"),
            host: env_string("HTTP_HOST", "0.0.0.0"),
            port: env_parse("HTTP_PORT", 8080)?,
        };

        let kafka = KafkaConfig {
            brokers: env_string("KAFKA_BROKERS", "localhost:9092"),
            group_id: env_string("KAFKA_GROUP_ID", "em-processor"),
            events_topic: env_string("KAFKA_EVENTS_TOPIC", "adapter.event"),
            mentions_topic: env_string("KAFKA_MENTIONS_TOPIC", "adapter.mention"),
            processed_events_topic: env_string("KAFKA_PROCESSED_EVENTS_TOPIC", "processor.event"),
            processed_mentions_topic: env_string(
                "KAFKA_PROCESSED_MENTIONS_TOPIC",
                "processor.mention",
            ),
            events_dlq_topic: env_string("KAFKA_EVENTS_DLQ_TOPIC", "adapter.event.dlq"),
            mentions_dlq_topic: env_string("KAFKA_MENTIONS_DLQ_TOPIC", "adapter.mention.dlq"),
            dlq_partitions: env_parse("KAFKA_DLQ_PARTITIONS", 1)?,
            dlq_replicas: env_parse("KAFKA_DLQ_REPLICAS", 1)?,
            workers: env_parse("KAFKA_CONSUMER_WORKERS", 2)?,
            poll_max_records: env_parse("KAFKA_POLL_MAX_RECORDS", 100)?,
            poll_timeout: Duration::from_millis(env_parse("KAFKA_POLL_TIMEOUT_MS", 1000)?),
            producer_timeout: Duration::from_millis(env_parse("KAFKA_PRODUCER_TIMEOUT_MS", 5000)?),
            auto_offset_reset: env_string("KAFKA_AUTO_OFFSET_RESET", "earliest"),
            session_timeout_ms: env_parse("KAFKA_SESSION_TIMEOUT_MS", 30_000)?,
        };

        let retry = RetryConfig {
            max_attempts: env_parse("RETRY_MAX_ATTEMPTS", 3)?,
            interval: Duration::from_millis(env_parse("RETRY_INTERVAL_MS", 1000)?),
            infra_backoff_min: Duration::from_millis(env_parse("INFRA_BACKOFF_MIN_MS", 1000)?),
            infra_backoff_max: Duration::from_millis(env_parse("INFRA_BACKOFF_MAX_MS", 60_000)?),
        };

        let redis = RedisConfig {
            url: env_string("REDIS_URL", "redis://127.0.0.1:6379"),
            command_timeout: Duration::from_millis(env_parse("REDIS_COMMAND_TIMEOUT_MS", 3000)?),
            dedup_ttl: Duration::from_secs(env_parse("DEDUP_TTL_SECS", 3600)?),
            dedup_pending_ttl: Duration::from_millis(env_parse("DEDUP_PENDING_TTL_MS", 30_000)?),
            dedup_failure_policy: env::var("DEDUP_FAILURE_POLICY")
                .ok()
                .map(|v| v.parse::<DedupFailurePolicy>())
                .transpose()
                .map_err(anyhow::Error::msg)
                .context("Invalid DEDUP_FAILURE_POLICY")?
                .unwrap_or_default(),
        };

        let batch = BatchConfig {
            window: Duration::from_millis(env_parse("BATCH_WINDOW_DURATION_MS", 60_000)?),
            extra_ttl: Duration::from_millis(env_parse("BATCH_EXTRA_TTL_MS", 10_000)?),
            check_interval: Duration::from_millis(env_parse("BATCH_CHECK_INTERVAL_MS", 5000)?),
            process_interval: Duration::from_millis(env_parse("BATCH_PROCESS_INTERVAL_MS", 3000)?),
        };

        let registry = RegistryConfig {
            enabled: env_parse("EUREKA_ENABLED", true)?,
            url: env_string("EUREKA_URL", "http://localhost:8761/eureka"),
            instance_host: env::var("EUREKA_INSTANCE_HOST")
                .or_else(|_| env::var("HOSTNAME"))
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            instance_id: env::var("EUREKA_INSTANCE_ID").ok().filter(|v| !v.is_empty()),
            renewal_interval: Duration::from_secs(env_parse("EUREKA_RENEWAL_INTERVAL_SECS", 30)?),
            lease_duration: Duration::from_secs(env_parse("EUREKA_LEASE_DURATION_SECS", 90)?),
        };

        Ok(Self {
            app,
            kafka,
            retry,
            redis,
            batch,
            registry,
        })
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.trim().is_empty() {
            bail!("KAFKA_BROKERS must not be empty");
        }
        if self.kafka.events_topic == self.kafka.mentions_topic {
            bail!("KAFKA_EVENTS_TOPIC and KAFKA_MENTIONS_TOPIC must differ");
        }
        let inputs = [&self.kafka.events_topic, &self.kafka.mentions_topic];
        for dlq in [&self.kafka.events_dlq_topic, &self.kafka.mentions_dlq_topic] {
            if inputs.contains(&dlq) {
                bail!("DLQ topic {} must not be an input topic", dlq);
            }
        }
        if self.kafka.workers == 0 {
            bail!("KAFKA_CONSUMER_WORKERS must be at least 1");
        }
        if self.kafka.poll_max_records == 0 {
            bail!("KAFKA_POLL_MAX_RECORDS must be at least 1");
        }
        if self.kafka.dlq_partitions < 1 || self.kafka.dlq_replicas < 1 {
            bail!("KAFKA_DLQ_PARTITIONS and KAFKA_DLQ_REPLICAS must be at least 1");
        }
        if self.retry.infra_backoff_min > self.retry.infra_backoff_max {
            bail!("INFRA_BACKOFF_MIN_MS must not exceed INFRA_BACKOFF_MAX_MS");
        }
        if self.batch.window.is_zero() {
            bail!("BATCH_WINDOW_DURATION_MS must be positive");
        }
        if self.batch.check_interval.is_zero() || self.batch.process_interval.is_zero() {
            bail!("Batch scheduler intervals must be positive");
        }
        if self.redis.dedup_ttl.is_zero() {
            bail!("DEDUP_TTL_SECS must be positive");
        }
        if self.redis.dedup_pending_ttl < self.redis.command_timeout * 3 {
            bail!("DEDUP_PENDING_TTL_MS must be at least three Redis command timeouts");
        }
        if self.registry.enabled && self.registry.renewal_interval >= self.registry.lease_duration
        {
            bail!("EUREKA_RENEWAL_INTERVAL_SECS must be shorter than EUREKA_LEASE_DURATION_SECS");
        }
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse `key` when set; a set but malformed value is an error, not a silent default
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", key, raw, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear(keys: &[&str]) {
        for key in keys {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear(&[
            "KAFKA_EVENTS_TOPIC",
            "RETRY_MAX_ATTEMPTS",
            "DEDUP_FAILURE_POLICY",
            "BATCH_WINDOW_DURATION_MS",
        ]);

        let config = Config::from_env().unwrap();
        assert_eq!(config.kafka.events_topic, "adapter.event");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.interval, Duration::from_secs(1));
        assert_eq!(config.redis.dedup_failure_policy, DedupFailurePolicy::Closed);
        assert_eq!(config.redis.dedup_pending_ttl, Duration::from_secs(30));
        assert_eq!(config.batch.effective_ttl(), Duration::from_millis(70_000));
        assert_eq!(config.batch.check_interval, Duration::from_millis(5000));
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_overrides() {
        env::set_var("RETRY_MAX_ATTEMPTS", "5");
        env::set_var("DEDUP_FAILURE_POLICY", "open");

        let config = Config::from_env().unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.redis.dedup_failure_policy, DedupFailurePolicy::Open);

        clear(&["RETRY_MAX_ATTEMPTS", "DEDUP_FAILURE_POLICY"]);
    }

    #[test]
    #[serial]
    fn test_malformed_value_is_error() {
        env::set_var("RETRY_MAX_ATTEMPTS", "three");
        assert!(Config::from_env().is_err());
        clear(&["RETRY_MAX_ATTEMPTS"]);

        env::set_var("DEDUP_FAILURE_POLICY", "sometimes");
        assert!(Config::from_env().is_err());
        clear(&["DEDUP_FAILURE_POLICY"]);
    }

    #[test]
    #[serial]
    fn test_validate_rejects_dlq_equal_to_input() {
        let mut config = Config::from_env().unwrap();
        config.kafka.events_dlq_topic = config.kafka.events_topic.clone();
        assert!(config.validate().is_err());

        let mut config = Config::from_env().unwrap();
        config.kafka.workers = 0;
        assert!(config.validate().is_err());

        // a claim must outlive the Redis calls made while holding it
        let mut config = Config::from_env().unwrap();
        config.redis.dedup_pending_ttl = config.redis.command_timeout;
        assert!(config.validate().is_err());
    }
}
