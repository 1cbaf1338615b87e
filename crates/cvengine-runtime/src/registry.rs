//! Host type to platform variant lookup table.

use crate::ansible::AutomationRunner;
use crate::cluster::{ClusterCli, OcClient};
use crate::local_cli::LocalCliPlatform;
use crate::platform::{PlatformContext, PlatformHandler};
use crate::remote_shell::{fedora_bootstrap, RemoteShellPlatform};
use crate::RuntimeError;
use cvengine_remote::ShellConnector;
use std::collections::BTreeMap;
use std::sync::Arc;

/// External collaborators handed to every platform the registry builds.
#[derive(Clone)]
pub struct Toolkit {
    pub runner: Arc<dyn AutomationRunner>,
    pub connector: Arc<dyn ShellConnector>,
    /// Cluster CLI; located on demand when `None`.
    pub cluster: Option<Arc<dyn ClusterCli>>,
}

impl Toolkit {
    fn cluster(&self, ctx: &PlatformContext) -> Result<Arc<dyn ClusterCli>, RuntimeError> {
        match &self.cluster {
            Some(cluster) => Ok(Arc::clone(cluster)),
            None => Ok(Arc::new(OcClient::locate(ctx.cancel.clone())?)),
        }
    }
}

pub type PlatformFactory = Box<
    dyn Fn(PlatformContext, &Toolkit) -> Result<Box<dyn PlatformHandler>, RuntimeError>
        + Send
        + Sync,
>;

fn remote_shell(
    ctx: PlatformContext,
    kit: &Toolkit,
) -> Result<Box<dyn PlatformHandler>, RuntimeError> {
    Ok(Box::new(RemoteShellPlatform::new(
        ctx,
        Arc::clone(&kit.runner),
        Arc::clone(&kit.connector),
    )))
}

fn bootstrapped_remote_shell(
    ctx: PlatformContext,
    kit: &Toolkit,
) -> Result<Box<dyn PlatformHandler>, RuntimeError> {
    let platform = RemoteShellPlatform::new(
        ctx,
        Arc::clone(&kit.runner),
        Arc::clone(&kit.connector),
    );
    Ok(Box::new(platform.with_bootstrap(fedora_bootstrap())))
}

fn local_cli(
    ctx: PlatformContext,
    kit: &Toolkit,
) -> Result<Box<dyn PlatformHandler>, RuntimeError> {
    let cluster = kit.cluster(&ctx)?;
    Ok(Box::new(LocalCliPlatform::new(
        ctx,
        Arc::clone(&kit.runner),
        cluster,
    )))
}

/// Closed set of platform variants, keyed by scenario host type.
pub struct PlatformRegistry {
    toolkit: Toolkit,
    factories: BTreeMap<String, PlatformFactory>,
}

impl PlatformRegistry {
    pub fn new(toolkit: Toolkit) -> Self {
        Self {
            toolkit,
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in platforms.
    pub fn with_defaults(toolkit: Toolkit) -> Self {
        let mut registry = Self::new(toolkit);
        registry.register("atomic", Box::new(remote_shell));
        registry.register("dashost", Box::new(remote_shell));
        registry.register("fedora", Box::new(bootstrapped_remote_shell));
        registry.register("openshift", Box::new(local_cli));
        registry.register("existing-openshift", Box::new(local_cli));
        registry
    }

    pub fn register(&mut self, key: &str, factory: PlatformFactory) {
        self.factories.insert(key.to_owned(), factory);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the platform for `ctx.host_type`.
    pub fn create(&self, ctx: PlatformContext) -> Result<Box<dyn PlatformHandler>, RuntimeError> {
        let factory = self
            .factories
            .get(ctx.host_type.as_str())
            .ok_or_else(|| RuntimeError::UnknownPlatform(ctx.host_type.clone()))?;
        factory(ctx, &self.toolkit)
    }
}
