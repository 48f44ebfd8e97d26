//! Operational HTTP endpoints: liveness, readiness, Prometheus scrape

use actix_web::{dev::Server, web, App, HttpResponse, HttpServer};
use redis_utils::RedisPool;
use resilience::ErrorStreak;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::metrics::serve_metrics;

/// Any worker above this many consecutive transient errors reports not-ready
const MAX_READY_ERROR_STREAK: u32 = 5;

#[derive(Clone)]
pub struct HealthState {
    service: String,
    ready: Arc<AtomicBool>,
    redis: Option<RedisPool>,
    streaks: Vec<Arc<ErrorStreak>>,
}

impl HealthState {
    /// `streaks` holds one entry per consumer worker
    pub fn new(
        service: impl Into<String>,
        redis: Option<RedisPool>,
        streaks: Vec<Arc<ErrorStreak>>,
    ) -> Self {
        Self {
            service: service.into(),
            ready: Arc::new(AtomicBool::new(false)),
            redis,
            streaks,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Longest current error streak over all workers
    pub fn max_consecutive_errors(&self) -> u32 {
        self.streaks
            .iter()
            .map(|s| s.consecutive_errors())
            .max()
            .unwrap_or(0)
    }
}

async fn health(state: web::Data<HealthState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": state.service,
    }))
}

async fn ready(state: web::Data<HealthState>) -> HttpResponse {
    let started = state.is_ready();
    let redis_ok = match &state.redis {
        Some(pool) => match pool.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Readiness: Redis ping failed");
                false
            }
        },
        None => true,
    };
    let consecutive_errors = state.max_consecutive_errors();
    let consumers_ok = consecutive_errors <= MAX_READY_ERROR_STREAK;
    let seconds_since_success = state
        .streaks
        .iter()
        .map(|s| s.time_since_success().as_secs())
        .max()
        .unwrap_or(0);

    let body = json!({
        "ready": started && redis_ok && consumers_ok,
        "started": started,
        "redis": redis_ok,
        "consecutive_errors": consecutive_errors,
        "seconds_since_success": seconds_since_success,
    });

    if started && redis_ok && consumers_ok {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/ready", web::get().to(ready))
        .route("/metrics", web::get().to(serve_metrics));
}

/// Bind the operational server. Signals are left to the caller.
pub fn serve(host: &str, port: u16, state: HealthState) -> std::io::Result<Server> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .workers(1)
        .disable_signals()
        .bind((host, port))?
        .run();
    info!(host = %host, port, "Operational HTTP server listening");
    Ok(server)
}
