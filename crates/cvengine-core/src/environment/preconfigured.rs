use super::EnvironmentHandler;
use crate::CoreError;
use cvengine_schema::{EnvironmentConfig, EnvironmentDescriptor};
use tracing::info;

/// A host that already exists. `prepare` hands back the configured block
/// and `teardown` leaves the host alone.
#[derive(Debug)]
pub struct PreconfiguredEnvironment {
    host: EnvironmentDescriptor,
    prepared: bool,
}

impl PreconfiguredEnvironment {
    pub fn new(host: EnvironmentDescriptor) -> Self {
        Self {
            host,
            prepared: false,
        }
    }

    /// Validate the `host` (or legacy `atomic-host`) block.
    pub fn from_config(config: &EnvironmentConfig) -> Result<Self, CoreError> {
        Ok(Self::new(config.preconfigured_host()?))
    }
}

impl EnvironmentHandler for PreconfiguredEnvironment {
    fn name(&self) -> &str {
        "preconfigured"
    }

    fn prepare(&mut self) -> Result<EnvironmentDescriptor, CoreError> {
        info!(
            "using preconfigured host {} ({})",
            self.host.host_name, self.host.host_ip
        );
        self.prepared = true;
        Ok(self.host.clone())
    }

    fn describe(&self) -> Option<&EnvironmentDescriptor> {
        self.prepared.then_some(&self.host)
    }

    fn teardown(&mut self) {
        self.prepared = false;
    }
}
