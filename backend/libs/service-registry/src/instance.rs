use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Instance status as understood by Eureka
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Up,
    Down,
    Starting,
    OutOfService,
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
            InstanceStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Identity and address of one process, as registered with the registry
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub app: String,
    pub instance_id: String,
    pub host_name: String,
    pub ip_addr: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub renewal_interval: Duration,
    pub lease_duration: Duration,
    pub health_path: String,
    pub metadata: BTreeMap<String, String>,
}

impl InstanceInfo {
    /// Instance with Eureka's default lease (30s renewals, 90s expiry)
    pub fn new(app: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let app = app.into();
        let host = host.into();
        Self {
            instance_id: format!("{}:{}:{}", host, app.to_lowercase(), port),
            app,
            host_name: host.clone(),
            ip_addr: host,
            port,
            status: InstanceStatus::Up,
            renewal_interval: Duration::from_secs(30),
            lease_duration: Duration::from_secs(90),
            health_path: "/health".to_string(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_lease(mut self, renewal_interval: Duration, lease_duration: Duration) -> Self {
        self.renewal_interval = renewal_interval;
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Application name as Eureka keys it (upper case)
    pub fn app_id(&self) -> String {
        self.app.to_uppercase()
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host_name, self.port)
    }

    pub(crate) fn registration(&self) -> Registration {
        let base = self.base_url();
        Registration {
            instance: RegistrationInstance {
                instance_id: self.instance_id.clone(),
                host_name: self.host_name.clone(),
                app: self.app_id(),
                ip_addr: self.ip_addr.clone(),
                vip_address: self.app.to_lowercase(),
                secure_vip_address: self.app.to_lowercase(),
                status: self.status,
                port: PortInfo {
                    port: self.port,
                    enabled: "true",
                },
                secure_port: PortInfo {
                    port: 443,
                    enabled: "false",
                },
                home_page_url: format!("{}/", base),
                status_page_url: format!("{}{}", base, self.health_path),
                health_check_url: format!("{}{}", base, self.health_path),
                data_center_info: DataCenterInfo {
                    class: "com.netflix.appinfo.InstanceInfo$DefaultDataCenterInfo",
                    name: "MyOwn",
                },
                lease_info: LeaseInfo {
                    renewal_interval_in_secs: self.renewal_interval.as_secs().max(1),
                    duration_in_secs: self.lease_duration.as_secs().max(1),
                },
                metadata: self.metadata.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Registration {
    instance: RegistrationInstance,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationInstance {
    instance_id: String,
    host_name: String,
    app: String,
    ip_addr: String,
    vip_address: String,
    secure_vip_address: String,
    status: InstanceStatus,
    port: PortInfo,
    secure_port: PortInfo,
    home_page_url: String,
    status_page_url: String,
    health_check_url: String,
    data_center_info: DataCenterInfo,
    lease_info: LeaseInfo,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct PortInfo {
    #[serde(rename = "$")]
    port: u16,
    #[serde(rename = "@enabled")]
    enabled: &'static str,
}

#[derive(Debug, Serialize)]
struct DataCenterInfo {
    #[serde(rename = "@class")]
    class: &'static str,
    name: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaseInfo {
    renewal_interval_in_secs: u64,
    duration_in_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_body_shape() {
        let instance = InstanceInfo::new("em-processor", "10.0.0.5", 8080)
            .with_metadata("zone", "a");
        let body = serde_json::to_value(instance.registration()).unwrap();
        let inst = &body["instance"];

        assert_eq!(inst["app"], "EM-PROCESSOR");
        assert_eq!(inst["instanceId"], "10.0.0.5:em-processor:8080");
        assert_eq!(inst["status"], "UP");
        assert_eq!(inst["port"]["$"], 8080);
        assert_eq!(inst["port"]["@enabled"], "true");
        assert_eq!(inst["healthCheckUrl"], "http://10.0.0.5:8080/health");
        assert_eq!(inst["leaseInfo"]["durationInSecs"], 90);
        assert_eq!(inst["metadata"]["zone"], "a");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(InstanceStatus::OutOfService.to_string(), "OUT_OF_SERVICE");
        assert_eq!(
            serde_json::to_value(InstanceStatus::OutOfService).unwrap(),
            "OUT_OF_SERVICE"
        );
    }
}
