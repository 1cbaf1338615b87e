//! Acquisition and release of the host a platform runs on.

mod cloud;
mod local;
mod preconfigured;

pub use cloud::{
    acquire_floating_ip, cloud_init_user_data, generate_password, select_floating_ip,
    CloudEnvironment,
};
pub use local::LocalEnvironment;
pub use preconfigured::PreconfiguredEnvironment;

use crate::CoreError;
use cvengine_cloud::CloudProvider;
use cvengine_remote::{CancelToken, ReachabilityCache};
use cvengine_schema::{EnvironmentConfig, EnvironmentDescriptor};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Owns the host for the duration of a run.
pub trait EnvironmentHandler: Send {
    fn name(&self) -> &str;

    /// Acquire the host. Not to be called twice without a teardown between.
    fn prepare(&mut self) -> Result<EnvironmentDescriptor, CoreError>;

    /// The prepared host, if `prepare` succeeded.
    fn describe(&self) -> Option<&EnvironmentDescriptor>;

    /// Release whatever `prepare` actually created. Never fails; release
    /// errors are logged.
    fn teardown(&mut self);
}

/// Collaborators available to environment constructors.
#[derive(Clone)]
pub struct EnvironmentToolkit {
    pub cloud: Arc<dyn CloudProvider>,
    pub reachability: Arc<ReachabilityCache>,
    pub cancel: CancelToken,
    /// Interval between boot and reachability polls.
    pub poll_interval: Duration,
}

pub type EnvironmentFactory = Box<
    dyn Fn(
            &EnvironmentConfig,
            &EnvironmentToolkit,
        ) -> Result<Box<dyn EnvironmentHandler>, CoreError>
        + Send
        + Sync,
>;

fn preconfigured(
    config: &EnvironmentConfig,
    _kit: &EnvironmentToolkit,
) -> Result<Box<dyn EnvironmentHandler>, CoreError> {
    Ok(Box::new(PreconfiguredEnvironment::from_config(config)?))
}

fn cloud(
    config: &EnvironmentConfig,
    kit: &EnvironmentToolkit,
) -> Result<Box<dyn EnvironmentHandler>, CoreError> {
    let env = CloudEnvironment::new(
        config.cloud_settings()?,
        Arc::clone(&kit.cloud),
        Arc::clone(&kit.reachability),
        kit.cancel.clone(),
    );
    Ok(Box::new(env.with_poll_interval(kit.poll_interval)))
}

fn local(
    _config: &EnvironmentConfig,
    _kit: &EnvironmentToolkit,
) -> Result<Box<dyn EnvironmentHandler>, CoreError> {
    Ok(Box::new(LocalEnvironment::new()))
}

/// Closed set of environment variants, keyed by `environment.handler`.
pub struct EnvironmentRegistry {
    toolkit: EnvironmentToolkit,
    factories: BTreeMap<String, EnvironmentFactory>,
}

impl EnvironmentRegistry {
    pub fn new(toolkit: EnvironmentToolkit) -> Self {
        Self {
            toolkit,
            factories: BTreeMap::new(),
        }
    }

    pub fn with_defaults(toolkit: EnvironmentToolkit) -> Self {
        let mut registry = Self::new(toolkit);
        registry.register("preconfigured", Box::new(preconfigured));
        registry.register("cloud", Box::new(cloud));
        registry.register("openstack", Box::new(cloud));
        registry.register("local", Box::new(local));
        registry
    }

    pub fn register(&mut self, key: &str, factory: EnvironmentFactory) {
        self.factories.insert(key.to_owned(), factory);
    }

    pub fn keys(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build and validate the handler named by `config.handler`. No I/O
    /// happens here; missing keys surface before any provisioning.
    pub fn create(
        &self,
        config: &EnvironmentConfig,
    ) -> Result<Box<dyn EnvironmentHandler>, CoreError> {
        let key = config.handler_key();
        let factory = self.factories.get(&key).ok_or_else(|| {
            CoreError::Configuration(format!(
                "unknown environment handler '{key}' (known: {})",
                self.keys().join(", ")
            ))
        })?;
        factory(config, &self.toolkit)
    }
}
