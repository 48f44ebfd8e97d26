use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, IntoConnectionInfo, RedisError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Shared Redis connection manager guarded by a Tokio mutex.
///
/// `ConnectionManager` is cheap to clone and multiplexes commands, so callers
/// lock only long enough to clone it.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Default per-command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Lower bound for a configured command timeout
const MIN_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Redis connection pool with a per-command timeout.
#[derive(Clone)]
pub struct RedisPool {
    manager: SharedConnectionManager,
    command_timeout: Duration,
}

impl RedisPool {
    pub async fn connect(redis_url: &str, command_timeout: Duration) -> Result<Self> {
        let info = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let addr_label = info.addr.to_string();

        let client = Client::open(info).context("failed to construct Redis client")?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .context("failed to initialize Redis connection manager")?;

        info!(addr = %addr_label, "Connected to Redis");

        Ok(Self {
            manager: Arc::new(Mutex::new(connection_manager)),
            command_timeout: command_timeout.max(MIN_COMMAND_TIMEOUT),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Clone of the underlying connection for issuing commands
    pub async fn connection(&self) -> ConnectionManager {
        self.manager.lock().await.clone()
    }

    /// Round-trip a PING, bounded by the command timeout
    pub async fn ping(&self) -> Result<(), RedisError> {
        let mut conn = self.connection().await;
        let pong: String = with_timeout(
            self.command_timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await?;
        debug!(reply = %pong, "Redis ping");
        Ok(())
    }
}

/// Run a Redis future, turning an elapsed timeout into an IO-kind `RedisError`.
///
/// IO-kind errors report `is_io_error() == true`, so callers classify a
/// timeout the same way as a dropped connection.
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, RedisError>
where
    F: Future<Output = Result<T, RedisError>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(res) => res,
        Err(_) => Err(RedisError::from((
            redis::ErrorKind::IoError,
            "redis command timed out",
        ))),
    }
}

/// Whether a Redis error is worth retrying.
///
/// Connection drops, refused connections, timeouts and the server's own
/// "try later" replies are transient. Type errors and bad commands are not.
pub fn is_transient(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || matches!(
            err.kind(),
            redis::ErrorKind::TryAgain
                | redis::ErrorKind::BusyLoadingError
                | redis::ErrorKind::ClusterDown
                | redis::ErrorKind::MasterDown
        )
}
