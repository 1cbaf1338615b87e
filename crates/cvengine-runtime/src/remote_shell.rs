//! Platforms reached over a remote shell, with an optional bootstrap.

use crate::ansible::{AdHocModule, AutomationRunner, Inventory};
use crate::lifecycle::PlatformState;
use crate::platform::{
    ContainerAccess, PlatformContext, PlatformCore, PlatformHandler, RetrievalLog,
};
use crate::RuntimeError;
use cvengine_remote::{fetch_remote_path, with_session, RemoteError, ShellConnector};
use cvengine_schema::EnvironmentDescriptor;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// One ad-hoc command run against a fresh host before it is usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapStep {
    pub module: AdHocModule,
    pub command: String,
}

impl BootstrapStep {
    pub fn new(module: AdHocModule, command: &str) -> Self {
        Self {
            module,
            command: command.to_owned(),
        }
    }
}

/// Fedora hosts need python for ansible modules and a running docker.
pub fn fedora_bootstrap() -> Vec<BootstrapStep> {
    vec![
        BootstrapStep::new(AdHocModule::Raw, "dnf -y install python3"),
        BootstrapStep::new(AdHocModule::Command, "dnf -y install docker"),
        BootstrapStep::new(AdHocModule::Command, "systemctl enable docker"),
        BootstrapStep::new(AdHocModule::Command, "systemctl start docker"),
    ]
}

/// Runs against the environment's remote host, driving containers with
/// the docker CLI. Bootstrap steps, when present, run during `setup`.
pub struct RemoteShellPlatform {
    name: String,
    core: PlatformCore,
    connector: Arc<dyn ShellConnector>,
    bootstrap: Vec<BootstrapStep>,
    target: Option<EnvironmentDescriptor>,
}

impl RemoteShellPlatform {
    pub fn new(
        ctx: PlatformContext,
        runner: Arc<dyn AutomationRunner>,
        connector: Arc<dyn ShellConnector>,
    ) -> Self {
        Self {
            name: ctx.host_type.clone(),
            core: PlatformCore::new(ctx, runner, ContainerAccess::docker()),
            connector,
            bootstrap: Vec::new(),
            target: None,
        }
    }

    pub fn with_bootstrap(mut self, steps: Vec<BootstrapStep>) -> Self {
        self.bootstrap = steps;
        self
    }

    fn collect_from_host(
        &self,
        target: &EnvironmentDescriptor,
        artifacts_dir: &Path,
        log: &mut RetrievalLog,
    ) {
        let policy = self.core.ctx.policy;
        let scratch = self.core.scratch_dir();
        let host_paths = &self.core.ctx.artifacts.test_host_artifacts;

        let session = self.connector.open(target).and_then(|mut shell| {
            with_session(shell.as_mut(), |shell| {
                let scratch_result = fetch_remote_path(shell, &scratch, artifacts_dir);
                if let Ok(dest) = &scratch_result {
                    info!("scratch output retrieved to {}", dest.display());
                }
                log.record(
                    "scratch output",
                    policy.scratch_output,
                    scratch_result.map_err(RuntimeError::from),
                );
                for path in host_paths {
                    log.record(
                        &format!("host artifact {path}"),
                        policy.test_host_artifacts,
                        fetch_remote_path(shell, path, artifacts_dir).map_err(RuntimeError::from),
                    );
                }
                Ok::<(), RemoteError>(())
            })
        });

        if let Err(e) = session {
            let reason = format!("no session to {}: {e}", target.host_ip);
            log.record::<()>(
                "scratch output",
                policy.scratch_output,
                Err(RuntimeError::ArtifactRetrieval(reason.clone())),
            );
            if !host_paths.is_empty() {
                log.record::<()>(
                    "host artifacts",
                    policy.test_host_artifacts,
                    Err(RuntimeError::ArtifactRetrieval(reason)),
                );
            }
        }
    }
}

impl PlatformHandler for RemoteShellPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> PlatformState {
        self.core.state()
    }

    fn setup(&mut self, target: &EnvironmentDescriptor) -> Result<(), RuntimeError> {
        let inventory = Inventory::remote(target)?;
        self.core.bind(inventory, &target.host_ip, &target.host_name);
        self.target = Some(target.clone());

        for step in &self.bootstrap {
            self.core.ctx.cancel.check()?;
            info!("bootstrap on {}: {}", target.host_name, step.command);
            self.core
                .ad_hoc(step.module, &step.command)
                .map_err(|e| match e {
                    RuntimeError::Remote(RemoteError::CommandFailed { code, .. }) => {
                        RuntimeError::Bootstrap {
                            step: step.command.clone(),
                            code,
                        }
                    }
                    other => other,
                })?;
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

    fn teardown(&mut self, artifacts_dir: &Path) -> Result<(), RuntimeError> {
        if !self.core.begin_teardown()? {
            return Ok(());
        }
        fs::create_dir_all(artifacts_dir)?;

        let mut log = RetrievalLog::default();
        self.core.copy_container_artifacts(&mut log);
        if let Some(target) = &self.target {
            self.collect_from_host(target, artifacts_dir, &mut log);
        }
        log.finish()
    }
}
