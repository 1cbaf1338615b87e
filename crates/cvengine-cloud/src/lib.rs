//! Cloud provisioning for cvengine.
//!
//! `CloudProvider` opens an authenticated `CloudApi` session exposing the
//! compute and network primitives a cloud-provisioned environment needs:
//! image/flavor/network/keypair lookup, server create/poll/delete, port
//! listing, and floating-IP allocation. `OpenStackProvider` speaks the
//! OpenStack REST APIs through ureq; `mock::MockCloud` is an in-memory fake
//! for tests.

pub mod mock;
pub mod openstack;

pub use openstack::OpenStackProvider;

use cvengine_schema::OpenStackAuth;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error("no '{0}' endpoint in the service catalog")]
    MissingService(String),
    #[error("malformed response: {0}")]
    Serialization(String),
}

/// A looked-up cloud object (image, flavor, network, keypair).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudResource {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequest {
    pub name: String,
    pub image_id: String,
    pub flavor_id: String,
    pub network_id: String,
    pub key_name: String,
    /// Base64-encoded cloud-init payload.
    pub user_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Building,
    Active,
    Error(String),
    Other(String),
}

impl ServerStatus {
    pub fn parse(status: &str, fault: Option<&str>) -> Self {
        match status.to_ascii_uppercase().as_str() {
            "BUILD" | "BUILDING" => Self::Building,
            "ACTIVE" => Self::Active,
            "ERROR" => Self::Error(fault.unwrap_or("unknown fault").to_owned()),
            other => Self::Other(other.to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    #[serde(rename = "floating_ip_address")]
    pub address: String,
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default, alias = "project_id")]
    pub tenant_id: String,
    #[serde(default, rename = "floating_network_id")]
    pub network_id: String,
}

/// An authenticated session against one cloud project.
pub trait CloudApi: Send {
    fn tenant_id(&self) -> &str;

    fn find_image(&self, name: &str) -> Result<CloudResource, CloudError>;
    fn find_flavor(&self, name: &str) -> Result<CloudResource, CloudError>;
    fn find_network(&self, name: &str) -> Result<CloudResource, CloudError>;
    fn find_keypair(&self, name: &str) -> Result<CloudResource, CloudError>;

    /// Start building a server and return its id without waiting.
    fn create_server(&self, request: &ServerRequest) -> Result<String, CloudError>;
    fn server_status(&self, server_id: &str) -> Result<ServerStatus, CloudError>;
    fn delete_server(&self, server_id: &str) -> Result<(), CloudError>;

    fn list_ports(&self, device_id: &str) -> Result<Vec<Port>, CloudError>;

    fn list_floating_ips(&self, network_id: &str) -> Result<Vec<FloatingIp>, CloudError>;
    fn create_floating_ip(&self, network_id: &str, port_id: &str)
        -> Result<FloatingIp, CloudError>;
    fn attach_floating_ip(&self, floating_ip_id: &str, port_id: &str)
        -> Result<FloatingIp, CloudError>;
    fn delete_floating_ip(&self, floating_ip_id: &str) -> Result<(), CloudError>;
}

/// Opens cloud sessions.
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn open_session(&self, auth: &OpenStackAuth) -> Result<Box<dyn CloudApi>, CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_status_parsing() {
        assert_eq!(ServerStatus::parse("BUILD", None), ServerStatus::Building);
        assert_eq!(ServerStatus::parse("active", None), ServerStatus::Active);
        assert_eq!(
            ServerStatus::parse("ERROR", Some("no valid host")),
            ServerStatus::Error("no valid host".to_owned())
        );
        assert_eq!(
            ServerStatus::parse("SHUTOFF", None),
            ServerStatus::Other("SHUTOFF".to_owned())
        );
    }

    #[test]
    fn floating_ip_accepts_project_id() {
        let fip: FloatingIp = serde_json::from_str(
            r#"{"id":"f1","floating_ip_address":"172.24.4.10","port_id":null,
                "project_id":"t1","floating_network_id":"ext"}"#,
        )
        .unwrap();
        assert_eq!(fip.tenant_id, "t1");
        assert_eq!(fip.network_id, "ext");
        assert!(fip.port_id.is_none());
    }
}
