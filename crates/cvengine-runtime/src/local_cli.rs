//! Platforms driven from the local machine through a cluster CLI.

use crate::ansible::{AutomationRunner, Inventory};
use crate::cluster::ClusterCli;
use crate::lifecycle::PlatformState;
use crate::platform::{
    copy_local_path, ContainerAccess, PlatformContext, PlatformCore, PlatformHandler,
    RetrievalLog,
};
use crate::RuntimeError;
use cvengine_schema::EnvironmentDescriptor;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs playbooks locally against an existing cluster.
pub struct LocalCliPlatform {
    name: String,
    core: PlatformCore,
    cluster: Arc<dyn ClusterCli>,
}

impl LocalCliPlatform {
    pub fn new(
        ctx: PlatformContext,
        runner: Arc<dyn AutomationRunner>,
        cluster: Arc<dyn ClusterCli>,
    ) -> Self {
        let access = ContainerAccess::cluster_cli(cluster.program());
        Self {
            name: ctx.host_type.clone(),
            core: PlatformCore::new(ctx, runner, access),
            cluster,
        }
    }
}

impl PlatformHandler for LocalCliPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> PlatformState {
        self.core.state()
    }

    fn setup(&mut self, target: &EnvironmentDescriptor) -> Result<(), RuntimeError> {
        if target.host_ip != "127.0.0.1" {
            info!(
                "{} runs playbooks locally; ignoring host {}",
                self.name, target.host_ip
            );
        }
        let local = EnvironmentDescriptor::local();
        self.core
            .bind(Inventory::local()?, &local.host_ip, &local.host_name);

        if let Some(connection) = &self.core.ctx.scenario.openshift_instance {
            self.cluster.login(connection)?;
            warn!("clearing all workload resources from the target namespace");
            self.cluster.clear_resources()?;
        }

        self.core.advance(PlatformState::Setup)
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        self.core.begin_run()?;
        if self.core.wants_deploy() {
            self.deploy_container()?;
        }
        self.core.run_playbooks()
    }

    fn deploy_container(&mut self) -> Result<(), RuntimeError> {
        let template = self.core.ctx.scenario.template.as_ref().ok_or_else(|| {
            RuntimeError::Config(
                "do_container_deploy is set but the scenario has no template".to_owned(),
            )
        })?;

        if let Some(path) = &template.path {
            self.cluster.add_template(&template.name, Path::new(path))?;
        }

        let mut params = template.params.clone();
        if let Some(param) = &template.image_param {
            params.insert(param.clone(), self.core.ctx.image_url.clone());
        }
        let app = self.core.instance_name();
        self.cluster.new_app(&template.name, &app, &params)?;

        match self.cluster.route_host(&app)? {
            Some(host) => info!("{app} is exposed at {host}"),
            None => info!("{app} has no route"),
        }
        Ok(())
    }

    fn teardown(&mut self, artifacts_dir: &Path) -> Result<(), RuntimeError> {
        if !self.core.begin_teardown()? {
            return Ok(());
        }
        fs::create_dir_all(artifacts_dir)?;

        let policy = self.core.ctx.policy;
        let mut log = RetrievalLog::default();
        self.core.copy_container_artifacts(&mut log);

        let scratch = self.core.scratch_dir();
        let copied = copy_local_path(Path::new(&scratch), artifacts_dir);
        if let Ok(dest) = &copied {
            info!("scratch output retrieved to {}", dest.display());
        }
        log.record("scratch output", policy.scratch_output, copied);

        for path in &self.core.ctx.artifacts.test_host_artifacts {
            log.record(
                &format!("host artifact {path}"),
                policy.test_host_artifacts,
                copy_local_path(Path::new(path), artifacts_dir),
            );
        }
        log.finish()
    }
}
