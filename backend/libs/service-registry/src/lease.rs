use resilience::{with_retry_if, RetryConfig};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::{EurekaClient, RenewOutcome};
use crate::error::{RegistryError, RegistryResult};
use crate::instance::InstanceInfo;

/// Owns a registration: registers on start, renews the lease every
/// `renewal_interval`, deregisters on shutdown.
pub struct LeaseKeeper {
    client: EurekaClient,
    instance: InstanceInfo,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LeaseKeeper {
    /// Register `instance` and spawn the renewal loop.
    ///
    /// Registration is retried on transient failures; the error of the last
    /// attempt is returned when the registry stays unreachable.
    pub async fn start(client: EurekaClient, instance: InstanceInfo) -> RegistryResult<Self> {
        Self::start_with_retry(client, instance, RetryConfig::default()).await
    }

    pub async fn start_with_retry(
        client: EurekaClient,
        instance: InstanceInfo,
        retry: RetryConfig,
    ) -> RegistryResult<Self> {
        with_retry_if(
            retry,
            || client.register(&instance),
            RegistryError::is_transient,
        )
        .await
        .map_err(|e| e.into_inner())?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(renewal_loop(
            client.clone(),
            instance.clone(),
            shutdown_rx,
        ));

        Ok(Self {
            client,
            instance,
            shutdown_tx,
            handle,
        })
    }

    pub fn instance(&self) -> &InstanceInfo {
        &self.instance
    }

    /// Stop renewing and remove the instance from the registry
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Lease renewal task ended abnormally");
        }

        if let Err(e) = self.client.deregister(&self.instance).await {
            error!(
                instance_id = %self.instance.instance_id,
                error = %e,
                "Failed to deregister from service registry"
            );
        }
    }
}

async fn renewal_loop(
    client: EurekaClient,
    instance: InstanceInfo,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = instance.renewal_interval.max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    // First tick fires immediately and registration just happened
    interval.tick().await;

    info!(
        instance_id = %instance.instance_id,
        interval_ms = period.as_millis() as u64,
        "Starting lease renewal"
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                // a dropped keeper closes the channel
                if changed.is_err() || *shutdown.borrow() {
                    info!("Lease renewal shutting down");
                    break;
                }
            }
            _ = interval.tick() => {
                match client.renew(&instance).await {
                    Ok(RenewOutcome::Renewed) => {}
                    Ok(RenewOutcome::NotFound) => {
                        if let Err(e) = client.register(&instance).await {
                            warn!(error = %e, "Re-registration failed, will retry on next renewal");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Lease renewal failed, will retry on next renewal");
                    }
                }
            }
        }
    }
}
