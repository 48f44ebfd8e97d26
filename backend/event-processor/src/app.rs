//! Service wiring and lifecycle
//!
//! Startup: registry lease, Redis, dead-letter topics, consumer workers,
//! batch scheduler, HTTP. Shutdown runs the other way round: stop polling,
//! let workers finish their batch and commit, stop the scheduler, flush the
//! producer, stop HTTP, deregister. A failed startup step still deregisters.

use anyhow::{Context, Result};
use idempotent_consumer::{IdempotencyGuard, RedisDedupStore};
use rdkafka::producer::{FutureProducer, Producer};
use redis_utils::RedisPool;
use resilience::{ErrorStreak, ExponentialBackoff, FixedBackoff};
use service_registry::{EurekaClient, InstanceInfo, LeaseKeeper};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::batch::{BatchState, BatchStore};
use crate::cache::{CacheClient, RedisCache};
use crate::config::Config;
use crate::http::{self, HealthState};
use crate::kafka::{
    create_producer, ensure_dlq_topics, ConsumerWorker, EventConsumer, KafkaDeadLetterSink,
    KafkaPublisher,
};
use crate::processor::{EventProcessor, Processor, TopicRoutes};
use crate::retry::PoisonRetry;
use crate::scheduler::BatchScheduler;

const PRODUCER_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn start_registry(config: &Config) -> Result<Option<LeaseKeeper>> {
    if !config.registry.enabled {
        info!("Service registry disabled");
        return Ok(None);
    }

    let client = EurekaClient::new(&config.registry.url)
        .context("Invalid EUREKA_URL")?;
    let mut instance = InstanceInfo::new(
        &config.app.name,
        &config.registry.instance_host,
        config.app.port,
    )
    .with_lease(config.registry.renewal_interval, config.registry.lease_duration)
    .with_metadata("environment", &config.app.env);
    if let Some(id) = &config.registry.instance_id {
        instance = instance.with_instance_id(id);
    }

    let keeper = LeaseKeeper::start(client, instance)
        .await
        .context("Failed to register with service registry")?;
    info!(
        instance_id = %keeper.instance().instance_id,
        registry = %config.registry.url,
        "Registered with service registry"
    );
    Ok(Some(keeper))
}

async fn flush_producer(producer: FutureProducer) {
    let result =
        tokio::task::spawn_blocking(move || producer.flush(PRODUCER_FLUSH_TIMEOUT)).await;
    match result {
        Ok(Ok(())) => info!("Kafka producer flushed"),
        Ok(Err(e)) => warn!(error = %e, "Kafka producer flush incomplete"),
        Err(e) => warn!(error = %e, "Kafka producer flush task failed"),
    }
}

pub async fn run(config: Config) -> Result<()> {
    let lease = start_registry(&config).await?;

    let result = run_pipeline(&config).await;

    if let Some(lease) = lease {
        lease.shutdown().await;
        info!("Deregistered from service registry");
    }
    result
}

/// Everything between registration and deregistration. Returns once the
/// pipeline has shut down, or on the first startup failure.
async fn run_pipeline(config: &Config) -> Result<()> {
    let pool = RedisPool::connect(&config.redis.url, config.redis.command_timeout)
        .await
        .context("Failed to connect to Redis")?;
    pool.ping().await.context("Redis did not answer PING")?;

    let cache: Arc<dyn CacheClient> = Arc::new(RedisCache::new(pool.clone()));
    let guard = IdempotencyGuard::new(
        Arc::new(RedisDedupStore::new(pool.clone())),
        config.redis.dedup_ttl,
    )
    .with_pending_ttl(config.redis.dedup_pending_ttl)
    .with_policy(config.redis.dedup_failure_policy);
    info!(
        ttl_secs = config.redis.dedup_ttl.as_secs(),
        pending_ttl_ms = config.redis.dedup_pending_ttl.as_millis() as u64,
        policy = ?config.redis.dedup_failure_policy,
        "Dedup guard ready"
    );

    ensure_dlq_topics(&config.kafka)
        .await
        .context("Failed to create dead-letter topics")?;
    let producer = create_producer(&config.kafka).context("Failed to create Kafka producer")?;
    let publisher = Arc::new(KafkaPublisher::new(producer.clone(), &config.kafka));
    let dlq = Arc::new(KafkaDeadLetterSink::new(producer.clone(), &config.kafka));

    let state = BatchState::new(cache.clone(), config.batch.clone());
    let store = BatchStore::new(cache, &config.batch);
    let routes = TopicRoutes {
        events: config.kafka.events_topic.clone(),
        mentions: config.kafka.mentions_topic.clone(),
    };
    let processor: Arc<dyn Processor> = Arc::new(EventProcessor::new(
        routes,
        guard,
        state.clone(),
        store.clone(),
    ));
    let retry = PoisonRetry::new(
        FixedBackoff::new(config.retry.interval, config.retry.max_attempts),
        dlq,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let topics = [
        config.kafka.events_topic.as_str(),
        config.kafka.mentions_topic.as_str(),
    ];
    let mut workers = JoinSet::new();
    let mut streaks = Vec::with_capacity(config.kafka.workers);
    for id in 0..config.kafka.workers {
        let consumer = EventConsumer::new(&config.kafka, id)
            .with_context(|| format!("Failed to create consumer {id}"))?;
        consumer.subscribe(&topics)?;
        let streak = Arc::new(ErrorStreak::new(ExponentialBackoff::new(
            config.retry.infra_backoff_min,
            config.retry.infra_backoff_max,
        )));
        streaks.push(streak.clone());
        let worker = ConsumerWorker::new(
            id,
            consumer,
            processor.clone(),
            retry.clone(),
            streak,
            config.kafka.poll_max_records,
            config.kafka.poll_timeout,
        );
        workers.spawn(worker.run(shutdown_rx.clone()));
    }
    info!(workers = config.kafka.workers, topics = ?topics, "Consumer workers started");

    let scheduler = BatchScheduler::new(state, store, publisher, config.batch.clone());
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let health = HealthState::new(&config.app.name, Some(pool), streaks);
    let server = http::serve(&config.app.host, config.app.port, health.clone())
        .context("Failed to bind HTTP server")?;
    let server_handle = server.handle();
    let http_task = tokio::spawn(server);
    health.set_ready(true);

    info!(
        service = %config.app.name,
        env = %config.app.env,
        "Event processor started"
    );

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        Some(result) = workers.join_next() => {
            match result {
                Ok(Ok(())) => warn!("Consumer worker exited"),
                Ok(Err(e)) => error!(error = %e, "Consumer worker failed"),
                Err(e) => error!(error = %e, "Consumer worker panicked"),
            }
        }
    }

    health.set_ready(false);
    let _ = shutdown_tx.send(true);

    while let Some(result) = workers.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Consumer worker failed during shutdown"),
            Err(e) => error!(error = %e, "Consumer worker panicked during shutdown"),
        }
    }
    info!("Consumer workers stopped");

    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Batch scheduler panicked");
    }

    flush_producer(producer).await;

    server_handle.stop(true).await;
    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "HTTP server stopped with error"),
        Err(e) => warn!(error = %e, "HTTP server task failed"),
    }

    info!("Event processor stopped");
    Ok(())
}
