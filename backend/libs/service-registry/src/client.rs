use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::instance::{InstanceInfo, InstanceStatus};

/// Result of a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// The registry no longer knows the instance; it must register again
    NotFound,
}

/// Eureka REST client
#[derive(Clone)]
pub struct EurekaClient {
    http: Client,
    base_url: String,
}

impl EurekaClient {
    /// `base_url` is the Eureka service URL, e.g. `http://localhost:8761/eureka`
    pub fn new(base_url: &str) -> RegistryResult<Self> {
        Self::with_timeout(base_url, Duration::from_secs(5))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> RegistryResult<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(RegistryError::InvalidUrl(base_url));
        }

        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn app_url(&self, instance: &InstanceInfo) -> String {
        format!("{}/apps/{}", self.base_url, instance.app_id())
    }

    fn instance_url(&self, instance: &InstanceInfo) -> String {
        format!("{}/{}", self.app_url(instance), instance.instance_id)
    }

    /// `POST /apps/{APP}`
    pub async fn register(&self, instance: &InstanceInfo) -> RegistryResult<()> {
        let response = self
            .http
            .post(self.app_url(instance))
            .json(&instance.registration())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(unexpected("register", response).await);
        }

        info!(
            app = %instance.app_id(),
            instance_id = %instance.instance_id,
            "Registered with service registry"
        );
        Ok(())
    }

    /// `PUT /apps/{APP}/{instanceId}` heartbeat
    pub async fn renew(&self, instance: &InstanceInfo) -> RegistryResult<RenewOutcome> {
        let response = self.http.put(self.instance_url(instance)).send().await?;

        match response.status() {
            s if s.is_success() => {
                debug!(instance_id = %instance.instance_id, "Lease renewed");
                Ok(RenewOutcome::Renewed)
            }
            StatusCode::NOT_FOUND => {
                warn!(instance_id = %instance.instance_id, "Registry lost instance lease");
                Ok(RenewOutcome::NotFound)
            }
            _ => Err(unexpected("renew", response).await),
        }
    }

    /// `PUT /apps/{APP}/{instanceId}/status?value=...`
    pub async fn set_status(
        &self,
        instance: &InstanceInfo,
        status: InstanceStatus,
    ) -> RegistryResult<()> {
        let url = format!("{}/status", self.instance_url(instance));
        let response = self
            .http
            .put(url)
            .query(&[("value", status.to_string())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(unexpected("set_status", response).await);
        }

        info!(instance_id = %instance.instance_id, status = %status, "Instance status updated");
        Ok(())
    }

    /// `DELETE /apps/{APP}/{instanceId}`; an unknown instance is not an error
    pub async fn deregister(&self, instance: &InstanceInfo) -> RegistryResult<()> {
        let response = self.http.delete(self.instance_url(instance)).send().await?;

        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => {
                info!(instance_id = %instance.instance_id, "Deregistered from service registry");
                Ok(())
            }
            _ => Err(unexpected("deregister", response).await),
        }
    }
}

async fn unexpected(operation: &'static str, response: reqwest::Response) -> RegistryError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    RegistryError::UnexpectedStatus {
        operation,
        status,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_rejects_non_http_url() {
        assert!(matches!(
            EurekaClient::new("localhost:8761"),
            Err(RegistryError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_urls() {
        let client = EurekaClient::new("http://registry:8761/eureka/").unwrap();
        let instance = InstanceInfo::new("em-processor", "host", 8080).with_instance_id("i-1");

        assert_eq!(client.base_url(), "http://registry:8761/eureka");
        assert_eq!(
            client.instance_url(&instance),
            "http://registry:8761/eureka/apps/EM-PROCESSOR/i-1"
        );
    }
}
