//! Eureka service registry client
//!
//! Registers a service instance with a Eureka server, renews its lease in the
//! background and removes it again on shutdown.
//!
//! ```ignore
//! use service_registry::{EurekaClient, InstanceInfo, LeaseKeeper};
//!
//! # async fn example() -> Result<(), service_registry::RegistryError> {
//! let client = EurekaClient::new("http://localhost:8761/eureka")?;
//! let instance = InstanceInfo::new("em-processor", "10.0.0.5", 8080);
//! let keeper = LeaseKeeper::start(client, instance).await?;
//!
//! // ... serve traffic ...
//!
//! keeper.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod instance;
mod lease;

pub use client::{EurekaClient, RenewOutcome};
pub use error::{RegistryError, RegistryResult};
pub use instance::{InstanceInfo, InstanceStatus};
pub use lease::LeaseKeeper;
