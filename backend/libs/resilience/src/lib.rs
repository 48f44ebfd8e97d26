/// Resilience patterns for the event processor
///
/// - **Retry**: exponential backoff with jitter for transient infrastructure failures
/// - **Backoff policies**: fixed spacing for bounded redelivery of poison records,
///   capped exponential spacing for consumer-level error streaks
///
/// # Example: Redis call with retry
///
/// ```rust,no_run
/// use resilience::{with_retry, RetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let result = with_retry(RetryConfig::default(), || async {
///         // Your Redis or Kafka admin call here
///         Ok::<_, String>(())
///     })
///     .await;
/// }
/// ```
pub mod backoff;
pub mod retry;

pub use backoff::{ErrorStreak, ExponentialBackoff, FixedBackoff};
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
