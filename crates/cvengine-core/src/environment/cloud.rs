use super::EnvironmentHandler;
use crate::CoreError;
use base64::Engine as _;
use cvengine_cloud::{
    CloudApi, CloudError, CloudProvider, FloatingIp, ServerRequest, ServerStatus,
};
use cvengine_remote::{wait_for_port, CancelToken, ReachabilityCache};
use cvengine_schema::{CloudSettings, EnvironmentDescriptor};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
// Punctuation minus quoting and templating characters.
const PUNCTUATION: &[u8] = b"!#$&()*+,-./:;<=>?@[]^_|~";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Random password of 8 to 18 characters.
pub fn generate_password<R: Rng>(rng: &mut R) -> String {
    let charset: Vec<u8> = [LETTERS, DIGITS, PUNCTUATION].concat();
    let len = rng.gen_range(8..=18);
    (0..len)
        .filter_map(|_| charset.choose(rng).map(|&b| char::from(b)))
        .collect()
}

/// Base64 cloud-init payload that sets `user`'s password and enables
/// password login over ssh.
pub fn cloud_init_user_data(user: &str, password: &str) -> String {
    let raw = format!(
        "#cloud-config\n\
         ssh_pwauth: True\n\
         disable_root: False\n\
         chpasswd:\n  \
           list: |\n    \
             {user}:{password}\n  \
           expire: False"
    );
    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// First IP in the pool that belongs to `tenant` and has no port.
pub fn select_floating_ip<'a>(ips: &'a [FloatingIp], tenant: &str) -> Option<&'a FloatingIp> {
    ips.iter()
        .find(|ip| ip.port_id.is_none() && ip.tenant_id == tenant)
}

/// Attach a reusable floating IP from `pool_id` to `port_id`, allocating a
/// new one only when none is free.
pub fn acquire_floating_ip(
    api: &dyn CloudApi,
    pool_id: &str,
    port_id: &str,
) -> Result<FloatingIp, CloudError> {
    let existing = api.list_floating_ips(pool_id)?;
    match select_floating_ip(&existing, api.tenant_id()) {
        Some(free) => {
            info!("reusing floating ip {} ({})", free.address, free.id);
            api.attach_floating_ip(&free.id, port_id)
        }
        None => {
            info!("allocating a new floating ip");
            api.create_floating_ip(pool_id, port_id)
        }
    }
}

fn wait_for_active(
    api: &dyn CloudApi,
    server_id: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancelToken,
) -> Result<(), CoreError> {
    let start = Instant::now();
    loop {
        cancel.check()?;
        match api.server_status(server_id)? {
            ServerStatus::Active => {
                info!("server {server_id} active after {:?}", start.elapsed());
                return Ok(());
            }
            ServerStatus::Error(fault) => {
                return Err(CoreError::Provisioning(format!(
                    "server {server_id} failed to boot: {fault}"
                )));
            }
            status => debug!("server {server_id} is {status:?}"),
        }
        if start.elapsed() >= timeout {
            return Err(CoreError::Provisioning(format!(
                "server {server_id} not active after {}s",
                timeout.as_secs()
            )));
        }
        cancel.sleep(interval)?;
    }
}

/// A host built in the cloud for this run and destroyed after it.
pub struct CloudEnvironment {
    settings: CloudSettings,
    provider: Arc<dyn CloudProvider>,
    reachability: Arc<ReachabilityCache>,
    cancel: CancelToken,
    poll_interval: Duration,
    server_name: String,
    password: String,
    user_data: String,
    session: Option<Box<dyn CloudApi>>,
    server_id: Option<String>,
    floating_ip: Option<FloatingIp>,
    descriptor: Option<EnvironmentDescriptor>,
}

impl CloudEnvironment {
    pub fn new(
        settings: CloudSettings,
        provider: Arc<dyn CloudProvider>,
        reachability: Arc<ReachabilityCache>,
        cancel: CancelToken,
    ) -> Self {
        let password = generate_password(&mut rand::thread_rng());
        let user_data = cloud_init_user_data(&settings.host.login_user, &password);
        Self {
            settings,
            provider,
            reachability,
            cancel,
            poll_interval: DEFAULT_POLL_INTERVAL,
            server_name: format!("cvhost-{}", uuid::Uuid::new_v4()),
            password,
            user_data,
            session: None,
            server_id: None,
            floating_ip: None,
            descriptor: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }
}

impl EnvironmentHandler for CloudEnvironment {
    fn name(&self) -> &str {
        "cloud"
    }

    fn prepare(&mut self) -> Result<EnvironmentDescriptor, CoreError> {
        let host = self.settings.host.clone();
        info!(
            "provisioning {} on {} ({})",
            self.server_name,
            self.provider.name(),
            self.settings.openstack.auth_url
        );
        let session = self.provider.open_session(&self.settings.openstack)?;
        let api = &**self.session.insert(session);

        let image = api.find_image(&host.image_name)?;
        let flavor = api.find_flavor(&host.flavor_name)?;
        let network = api.find_network(&host.network_name)?;
        let keypair = api.find_keypair(&host.keypair_name)?;

        let server_id = api.create_server(&ServerRequest {
            name: self.server_name.clone(),
            image_id: image.id,
            flavor_id: flavor.id,
            network_id: network.id,
            key_name: keypair.name,
            user_data: self.user_data.clone(),
        })?;
        info!("created server {} ({server_id})", self.server_name);
        self.server_id = Some(server_id.clone());
        wait_for_active(
            api,
            &server_id,
            Duration::from_secs(host.boot_timeout_secs),
            self.poll_interval,
            &self.cancel,
        )?;

        let pool = api.find_network(&host.floating_ip_pool_name)?;
        let port = api
            .list_ports(&server_id)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                CoreError::Provisioning(format!("server {server_id} has no network port"))
            })?;
        let floating_ip = acquire_floating_ip(api, &pool.id, &port.id)?;
        let address = floating_ip.address.clone();
        info!("floating ip {address} attached to {}", self.server_name);
        self.floating_ip = Some(floating_ip);

        info!("waiting for ssh on {address}:{}", host.ssh_port);
        wait_for_port(
            &self.reachability,
            &address,
            host.ssh_port,
            Duration::from_secs(host.ssh_timeout_secs),
            self.poll_interval,
            &self.cancel,
        )?;

        let descriptor = EnvironmentDescriptor {
            host_name: self.server_name.clone(),
            host_ip: address,
            username: host.login_user,
            password: Some(self.password.clone()),
            ssh_key_path: None,
            port: host.ssh_port,
        };
        self.descriptor = Some(descriptor.clone());
        Ok(descriptor)
    }

    fn describe(&self) -> Option<&EnvironmentDescriptor> {
        self.descriptor.as_ref()
    }

    fn teardown(&mut self) {
        self.descriptor = None;
        let Some(api) = self.session.as_deref() else {
            debug!("no cloud session was opened; nothing to release");
            return;
        };

        if let Some(fip) = self.floating_ip.take() {
            self.reachability
                .invalidate(&fip.address, self.settings.host.ssh_port);
            match api.delete_floating_ip(&fip.id) {
                Ok(()) => info!("released floating ip {}", fip.address),
                Err(e) => warn!("failed to release floating ip {}: {e}", fip.address),
            }
        }

        if let Some(server_id) = self.server_id.take() {
            match api.delete_server(&server_id) {
                Ok(()) => info!("deleted server {} ({server_id})", self.server_name),
                Err(e) => warn!("failed to delete server {server_id}: {e}"),
            }
        }
    }
}
