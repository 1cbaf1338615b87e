use crate::{
    CloudApi, CloudError, CloudProvider, CloudResource, FloatingIp, Port, ServerRequest,
    ServerStatus,
};
use cvengine_schema::OpenStackAuth;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// In-memory cloud. Clones share state, so a test keeps one handle while the
/// code under test owns sessions opened from another.
#[derive(Clone)]
pub struct MockCloud {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
pub struct MockState {
    /// Address handed out for new floating IPs.
    pub address: String,
    /// Status polls that report `Building` before a server goes active.
    pub boot_polls: u32,
    pub servers: BTreeMap<String, ServerRequest>,
    pub floating_ips: Vec<FloatingIp>,
    pub created_floating_ips: Vec<String>,
    pub deleted_servers: Vec<String>,
    pub deleted_floating_ips: Vec<String>,
    pub calls: Vec<String>,
    failing: HashSet<String>,
    polls: u32,
    next_id: u32,
}

pub const MOCK_TENANT: &str = "tenant-mock";
pub const EXTERNAL_NETWORK_ID: &str = "net-public";
pub const PRIVATE_NETWORK_ID: &str = "net-private";

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    pub fn new() -> Self {
        let state = MockState {
            address: "127.0.0.1".to_owned(),
            ..MockState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Seed an unattached floating IP owned by the mock tenant.
    pub fn with_unattached_ip(self, id: &str, address: &str) -> Self {
        self.lock().floating_ips.push(FloatingIp {
            id: id.to_owned(),
            address: address.to_owned(),
            port_id: None,
            tenant_id: MOCK_TENANT.to_owned(),
            network_id: EXTERNAL_NETWORK_ID.to_owned(),
        });
        self
    }

    /// Seed a floating IP that must never be reused.
    pub fn with_foreign_ip(self, id: &str, tenant: &str, port: Option<&str>) -> Self {
        self.lock().floating_ips.push(FloatingIp {
            id: id.to_owned(),
            address: "203.0.113.7".to_owned(),
            port_id: port.map(str::to_owned),
            tenant_id: tenant.to_owned(),
            network_id: EXTERNAL_NETWORK_ID.to_owned(),
        });
        self
    }

    pub fn with_boot_polls(self, polls: u32) -> Self {
        self.lock().boot_polls = polls;
        self
    }

    /// Make the named operation (e.g. `create_server`) fail.
    pub fn fail_on(self, op: &str) -> Self {
        self.lock().failing.insert(op.to_owned());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn enter(&self, op: &str) -> Result<MutexGuard<'_, MockState>, CloudError> {
        let mut s = self.lock();
        s.calls.push(op.to_owned());
        if s.failing.contains(op) {
            return Err(CloudError::Http(format!("injected failure in {op}")));
        }
        Ok(s)
    }
}

fn resource(prefix: &str, name: &str) -> CloudResource {
    CloudResource {
        id: format!("{prefix}-{name}"),
        name: name.to_owned(),
    }
}

impl CloudProvider for MockCloud {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn open_session(&self, _auth: &OpenStackAuth) -> Result<Box<dyn CloudApi>, CloudError> {
        drop(self.enter("open_session")?);
        Ok(Box::new(self.clone()))
    }
}

impl CloudApi for MockCloud {
    fn tenant_id(&self) -> &str {
        MOCK_TENANT
    }

    fn find_image(&self, name: &str) -> Result<CloudResource, CloudError> {
        drop(self.enter("find_image")?);
        Ok(resource("img", name))
    }

    fn find_flavor(&self, name: &str) -> Result<CloudResource, CloudError> {
        drop(self.enter("find_flavor")?);
        Ok(resource("flv", name))
    }

    fn find_network(&self, name: &str) -> Result<CloudResource, CloudError> {
        drop(self.enter("find_network")?);
        Ok(CloudResource {
            id: if name == "public" {
                EXTERNAL_NETWORK_ID.to_owned()
            } else {
                PRIVATE_NETWORK_ID.to_owned()
            },
            name: name.to_owned(),
        })
    }

    fn find_keypair(&self, name: &str) -> Result<CloudResource, CloudError> {
        drop(self.enter("find_keypair")?);
        Ok(CloudResource {
            id: name.to_owned(),
            name: name.to_owned(),
        })
    }

    fn create_server(&self, request: &ServerRequest) -> Result<String, CloudError> {
        let mut s = self.enter("create_server")?;
        s.next_id += 1;
        let id = format!("srv-{}", s.next_id);
        s.servers.insert(id.clone(), request.clone());
        Ok(id)
    }

    fn server_status(&self, server_id: &str) -> Result<ServerStatus, CloudError> {
        let mut s = self.enter("server_status")?;
        if !s.servers.contains_key(server_id) {
            return Err(CloudError::NotFound {
                kind: "server",
                name: server_id.to_owned(),
            });
        }
        if s.polls < s.boot_polls {
            s.polls += 1;
            return Ok(ServerStatus::Building);
        }
        Ok(ServerStatus::Active)
    }

    fn delete_server(&self, server_id: &str) -> Result<(), CloudError> {
        let mut s = self.enter("delete_server")?;
        if s.servers.remove(server_id).is_none() {
            return Err(CloudError::NotFound {
                kind: "server",
                name: server_id.to_owned(),
            });
        }
        s.deleted_servers.push(server_id.to_owned());
        Ok(())
    }

    fn list_ports(&self, device_id: &str) -> Result<Vec<Port>, CloudError> {
        let s = self.enter("list_ports")?;
        if !s.servers.contains_key(device_id) {
            return Ok(Vec::new());
        }
        Ok(vec![Port {
            id: format!("port-{device_id}"),
            device_id: device_id.to_owned(),
        }])
    }

    fn list_floating_ips(&self, network_id: &str) -> Result<Vec<FloatingIp>, CloudError> {
        let s = self.enter("list_floating_ips")?;
        Ok(s.floating_ips
            .iter()
            .filter(|f| f.network_id == network_id)
            .cloned()
            .collect())
    }

    fn create_floating_ip(
        &self,
        network_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp, CloudError> {
        let mut s = self.enter("create_floating_ip")?;
        s.next_id += 1;
        let fip = FloatingIp {
            id: format!("fip-{}", s.next_id),
            address: s.address.clone(),
            port_id: Some(port_id.to_owned()),
            tenant_id: MOCK_TENANT.to_owned(),
            network_id: network_id.to_owned(),
        };
        s.created_floating_ips.push(fip.id.clone());
        s.floating_ips.push(fip.clone());
        Ok(fip)
    }

    fn attach_floating_ip(
        &self,
        floating_ip_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp, CloudError> {
        let mut s = self.enter("attach_floating_ip")?;
        let address = s.address.clone();
        let fip = s
            .floating_ips
            .iter_mut()
            .find(|f| f.id == floating_ip_id)
            .ok_or_else(|| CloudError::NotFound {
                kind: "floating ip",
                name: floating_ip_id.to_owned(),
            })?;
        fip.port_id = Some(port_id.to_owned());
        let mut attached = fip.clone();
        // Seeded addresses are not routable; report the reachable one.
        attached.address = address;
        Ok(attached)
    }

    fn delete_floating_ip(&self, floating_ip_id: &str) -> Result<(), CloudError> {
        let mut s = self.enter("delete_floating_ip")?;
        let before = s.floating_ips.len();
        s.floating_ips.retain(|f| f.id != floating_ip_id);
        if s.floating_ips.len() == before {
            return Err(CloudError::NotFound {
                kind: "floating ip",
                name: floating_ip_id.to_owned(),
            });
        }
        s.deleted_floating_ips.push(floating_ip_id.to_owned());
        Ok(())
    }
}
