//! The platform handler contract and the state shared by every variant.

use crate::ansible::{AdHocModule, AutomationRunner, Inventory};
use crate::lifecycle::{validate_transition, PlatformState};
use crate::RuntimeError;
use cvengine_remote::{CancelToken, RemoteError};
use cvengine_schema::{
    ArtifactPolicy, ArtifactSpec, Criticality, EnvironmentDescriptor, ExtraVariables,
    RuntimeVars, TestScenario, VarMap, INSTANCE_NAME_KEY,
};
use serde_json::Value;
use std::borrow::Cow;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scratch directory on the execution target unless `artifact_output_dir`
/// is overridden by a variable layer.
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp/cvartifacts";

/// Everything a platform needs to know about the run.
#[derive(Debug, Clone)]
pub struct PlatformContext {
    pub host_type: String,
    /// The resolved scenario, with every playbook's `local_path` filled in.
    pub scenario: TestScenario,
    pub artifacts: ArtifactSpec,
    pub image_url: String,
    pub extra_vars: VarMap,
    pub policy: ArtifactPolicy,
    pub cancel: CancelToken,
}

/// Drives validation against one container platform.
///
/// The orchestrator calls `setup`, `run` and `teardown` in that order.
/// `teardown` runs even when an earlier step failed and must be called
/// exactly once.
pub trait PlatformHandler: Send {
    fn name(&self) -> &str;

    fn state(&self) -> PlatformState;

    /// Establish the execution surface for `target`. The descriptor stays
    /// owned by the environment; the platform keeps a read-only copy.
    fn setup(&mut self, target: &EnvironmentDescriptor) -> Result<(), RuntimeError>;

    /// Create the scratch directory, deploy the container when the scenario
    /// asks for it, then run every playbook in order, stopping at the first
    /// failure.
    fn run(&mut self) -> Result<(), RuntimeError>;

    /// Deploy the image under test. Platforms that cannot deploy keep this
    /// default.
    fn deploy_container(&mut self) -> Result<(), RuntimeError> {
        Err(RuntimeError::UnsupportedOperation(format!(
            "the {} platform cannot deploy containers",
            self.name()
        )))
    }

    /// Copy artifacts back into `artifacts_dir`. Only the categories marked
    /// required in the artifact policy can fail this call.
    fn teardown(&mut self, artifacts_dir: &Path) -> Result<(), RuntimeError>;
}

/// How the image's container is reached on the execution target.
#[derive(Debug, Clone)]
pub struct ContainerAccess {
    /// Exec prefix; `{0}` stands for the container name.
    pub exec_cmd: String,
    /// Copy command taking `<container>:<path> <dest>`.
    pub copy_cmd: String,
}

impl ContainerAccess {
    pub fn docker() -> Self {
        Self {
            exec_cmd: "docker exec -i {0}".to_owned(),
            copy_cmd: "docker cp".to_owned(),
        }
    }

    pub fn cluster_cli(program: &Path) -> Self {
        let program = program.display();
        Self {
            exec_cmd: format!("{program} exec -i {{0}}"),
            copy_cmd: format!("{program} rsync"),
        }
    }
}

/// Per-category outcome of teardown's artifact retrieval.
#[derive(Debug, Default)]
pub(crate) struct RetrievalLog {
    failures: Vec<String>,
}

impl RetrievalLog {
    pub(crate) fn record<T>(
        &mut self,
        what: &str,
        criticality: Criticality,
        result: Result<T, RuntimeError>,
    ) {
        let Err(e) = result else { return };
        if criticality.is_required() {
            warn!("required {what} not retrieved: {e}");
            self.failures.push(format!("{what}: {e}"));
        } else {
            warn!("optional {what} not retrieved: {e}");
        }
    }

    pub(crate) fn finish(self) -> Result<(), RuntimeError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::ArtifactRetrieval(self.failures.join("; ")))
        }
    }
}

/// State and behavior common to every platform variant.
pub(crate) struct PlatformCore {
    pub(crate) ctx: PlatformContext,
    runner: Arc<dyn AutomationRunner>,
    access: ContainerAccess,
    state: PlatformState,
    vars: ExtraVariables,
    inventory: Option<Inventory>,
}

impl PlatformCore {
    pub(crate) fn new(
        ctx: PlatformContext,
        runner: Arc<dyn AutomationRunner>,
        access: ContainerAccess,
    ) -> Self {
        let vars = ExtraVariables::new(
            &ctx.scenario.instance_name,
            DEFAULT_SCRATCH_DIR,
            &ctx.scenario.common_vars,
            &ctx.extra_vars,
        );
        Self {
            ctx,
            runner,
            access,
            state: PlatformState::Created,
            vars,
            inventory: None,
        }
    }

    pub(crate) fn state(&self) -> PlatformState {
        self.state
    }

    pub(crate) fn advance(&mut self, to: PlatformState) -> Result<(), RuntimeError> {
        validate_transition(self.state, to)?;
        debug!("platform {}: {} -> {to}", self.ctx.host_type, self.state);
        self.state = to;
        Ok(())
    }

    /// Fix the execution target and the reserved runtime variables.
    pub(crate) fn bind(&mut self, inventory: Inventory, host_ip: &str, host_name: &str) {
        self.vars.set_runtime(RuntimeVars {
            image_url: self.ctx.image_url.clone(),
            current_host_ip: host_ip.to_owned(),
            host_machine_name: host_name.to_owned(),
            exec_cmd: self.access.exec_cmd.clone(),
        });
        self.inventory = Some(inventory);
    }

    pub(crate) fn scratch_dir(&self) -> String {
        self.vars
            .artifact_output_dir()
            .unwrap_or(DEFAULT_SCRATCH_DIR)
            .to_owned()
    }

    /// Container name after variable layering.
    pub(crate) fn instance_name(&self) -> String {
        self.vars
            .snapshot()
            .get(INSTANCE_NAME_KEY)
            .and_then(Value::as_str)
            .map_or_else(|| self.ctx.scenario.instance_name.clone(), str::to_owned)
    }

    pub(crate) fn is_local(&self) -> bool {
        self.inventory.as_ref().is_some_and(Inventory::is_local)
    }

    fn inventory(&self) -> Result<&Inventory, RuntimeError> {
        self.inventory.as_ref().ok_or_else(|| {
            RuntimeError::ConnectionSetup("platform has no execution target".to_owned())
        })
    }

    /// Run an ad-hoc command on the execution target, failing on non-zero exit.
    pub(crate) fn ad_hoc(&self, module: AdHocModule, command: &str) -> Result<(), RuntimeError> {
        let code = self
            .runner
            .run_command(self.inventory()?, module, command, &self.ctx.cancel)?;
        if code == 0 {
            Ok(())
        } else {
            let program = command.split_whitespace().next().unwrap_or(command);
            Err(RemoteError::CommandFailed {
                program: program.to_owned(),
                code,
            }
            .into())
        }
    }

    /// Enter `Running`, log the runner version and create the scratch dir.
    pub(crate) fn begin_run(&mut self) -> Result<(), RuntimeError> {
        self.advance(PlatformState::Running)?;
        match self.runner.version() {
            Ok(version) => info!("automation runner: {version}"),
            Err(e) => warn!("could not determine automation runner version: {e}"),
        }
        let scratch = self.scratch_dir();
        if self.is_local() {
            fs::create_dir_all(&scratch)?;
        } else {
            let command = format!("mkdir -p {}", shell_word(&scratch));
            self.ad_hoc(AdHocModule::Command, &command)?;
        }
        Ok(())
    }

    pub(crate) fn wants_deploy(&self) -> bool {
        self.ctx.scenario.do_container_deploy
    }

    /// Run every playbook in document order; the first failure aborts.
    pub(crate) fn run_playbooks(&self) -> Result<(), RuntimeError> {
        let inventory = self.inventory()?;
        let total = self.ctx.scenario.playbooks.len();
        for (idx, playbook) in self.ctx.scenario.playbooks.iter().enumerate() {
            self.ctx.cancel.check()?;
            let path = playbook.local_path.as_deref().ok_or_else(|| {
                RuntimeError::Config(format!("playbook {} was not fetched", playbook.url))
            })?;

            let merged = self.vars.for_playbook(&playbook.vars);
            let handoff = write_vars_file(&merged)?;

            info!(
                "[{}/{total}] playbook {} ({})",
                idx + 1,
                playbook.file_name(),
                playbook.url
            );
            let code =
                self.runner
                    .run_playbook(inventory, path, handoff.path(), &self.ctx.cancel)?;
            if code != 0 {
                return Err(RuntimeError::PlaybookFailed {
                    playbook: playbook.file_name().to_owned(),
                    code,
                });
            }
        }
        info!("all {total} playbooks passed");
        Ok(())
    }

    /// Enter `TornDown`. Returns whether artifacts should be collected,
    /// which is only the case once `run` has started.
    pub(crate) fn begin_teardown(&mut self) -> Result<bool, RuntimeError> {
        let was_running = self.state == PlatformState::Running;
        self.advance(PlatformState::TornDown)?;
        if !was_running {
            info!("platform never ran; skipping artifact retrieval");
        }
        Ok(was_running)
    }

    /// Copy declared in-container paths into the scratch directory.
    pub(crate) fn copy_container_artifacts(&self, log: &mut RetrievalLog) {
        let instance = self.instance_name();
        let scratch = self.scratch_dir();
        for path in &self.ctx.artifacts.container_artifacts {
            let command = format!(
                "{} {}:{} {}",
                self.access.copy_cmd,
                shell_word(&instance),
                shell_word(path),
                shell_word(&scratch)
            );
            log.record(
                &format!("container artifact {path}"),
                self.ctx.policy.container_artifacts,
                self.ad_hoc(AdHocModule::Command, &command),
            );
        }
    }
}

/// Write the merged variables to a transient JSON handoff file.
fn write_vars_file(vars: &VarMap) -> Result<tempfile::NamedTempFile, RuntimeError> {
    let mut file = tempfile::Builder::new()
        .prefix("cvengine-vars-")
        .suffix(".json")
        .tempfile()?;
    let body = serde_json::to_vec_pretty(vars)
        .map_err(|e| RuntimeError::Config(format!("variables are not serializable: {e}")))?;
    file.write_all(&body)?;
    file.flush()?;
    Ok(file)
}

/// Copy a local file or directory into `dest_dir`, keeping its basename.
pub(crate) fn copy_local_path(src: &Path, dest_dir: &Path) -> Result<PathBuf, RuntimeError> {
    if !src.exists() {
        return Err(RemoteError::NotFound(src.display().to_string()).into());
    }
    fs::create_dir_all(dest_dir)?;
    let name = src
        .file_name()
        .map_or_else(|| PathBuf::from("artifact"), PathBuf::from);
    let dest = dest_dir.join(name);
    copy_recursive(src, &dest)?;
    Ok(dest)
}

fn copy_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        fs::copy(src, dest)?;
    }
    Ok(())
}

/// Quote one word of an ad-hoc command line for POSIX-style splitting.
fn shell_word(word: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(word.into())
}
