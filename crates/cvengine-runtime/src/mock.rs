//! Recording fakes for the external collaborators a platform drives.

use crate::ansible::{AdHocModule, AutomationRunner, Inventory};
use crate::cluster::ClusterCli;
use crate::RuntimeError;
use cvengine_remote::{CancelToken, PathType, RemoteError, RemoteShell, ShellConnector};
use cvengine_schema::{ClusterConnection, EnvironmentDescriptor, VarMap};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookCall {
    pub playbook: PathBuf,
    /// Contents of the handoff file at the time of the call.
    pub vars: VarMap,
    pub local: bool,
}

impl PlaybookCall {
    pub fn file_name(&self) -> String {
        self.playbook
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCall {
    pub module: AdHocModule,
    pub command: String,
    pub local: bool,
}

#[derive(Debug, Default)]
struct RunnerState {
    playbooks: Vec<PlaybookCall>,
    commands: Vec<CommandCall>,
    failing_playbooks: Vec<(String, i32)>,
    failing_commands: Vec<(String, i32)>,
}

/// Automation runner that records every call and exits zero unless told
/// otherwise.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    state: Mutex<RunnerState>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `code` for playbooks whose file name contains `fragment`.
    pub fn fail_playbook(self, fragment: &str, code: i32) -> Self {
        self.lock().failing_playbooks.push((fragment.to_owned(), code));
        self
    }

    /// Exit with `code` for ad-hoc commands containing `fragment`.
    pub fn fail_command(self, fragment: &str, code: i32) -> Self {
        self.lock().failing_commands.push((fragment.to_owned(), code));
        self
    }

    pub fn playbooks(&self) -> Vec<PlaybookCall> {
        self.lock().playbooks.clone()
    }

    pub fn playbook_names(&self) -> Vec<String> {
        self.lock()
            .playbooks
            .iter()
            .map(PlaybookCall::file_name)
            .collect()
    }

    pub fn commands(&self) -> Vec<CommandCall> {
        self.lock().commands.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn exit_code(rules: &[(String, i32)], subject: &str) -> i32 {
    rules
        .iter()
        .find(|(fragment, _)| subject.contains(fragment.as_str()))
        .map_or(0, |(_, code)| *code)
}

impl AutomationRunner for RecordingRunner {
    fn version(&self) -> Result<String, RuntimeError> {
        Ok("ansible-playbook [mock]".to_owned())
    }

    fn run_playbook(
        &self,
        inventory: &Inventory,
        playbook: &Path,
        vars_file: &Path,
        cancel: &CancelToken,
    ) -> Result<i32, RuntimeError> {
        cancel.check()?;
        let text = fs::read_to_string(vars_file)?;
        let vars: VarMap = serde_json::from_str(&text)
            .map_err(|e| RuntimeError::Config(format!("bad handoff file: {e}")))?;
        let call = PlaybookCall {
            playbook: playbook.to_path_buf(),
            vars,
            local: inventory.is_local(),
        };
        let mut state = self.lock();
        let code = exit_code(&state.failing_playbooks, &call.file_name());
        state.playbooks.push(call);
        Ok(code)
    }

    fn run_command(
        &self,
        inventory: &Inventory,
        module: AdHocModule,
        command: &str,
        cancel: &CancelToken,
    ) -> Result<i32, RuntimeError> {
        cancel.check()?;
        let mut state = self.lock();
        let code = exit_code(&state.failing_commands, command);
        state.commands.push(CommandCall {
            module,
            command: command.to_owned(),
            local: inventory.is_local(),
        });
        Ok(code)
    }
}

#[derive(Debug, Default)]
pub struct ShellState {
    /// Remote paths that exist, and what they are.
    pub paths: BTreeMap<String, PathType>,
    pub opened: Vec<String>,
    pub connects: u32,
    pub closes: u32,
    pub fetched: Vec<String>,
    pub refuse_connect: bool,
}

/// Connector whose shells share one in-memory remote filesystem.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ShellState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.lock().paths.insert(path.to_owned(), PathType::Directory);
        self
    }

    pub fn with_file(self, path: &str) -> Self {
        self.lock().paths.insert(path.to_owned(), PathType::File);
        self
    }

    pub fn refusing_connections(self) -> Self {
        self.lock().refuse_connect = true;
        self
    }

    pub fn state(&self) -> MutexGuard<'_, ShellState> {
        self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, ShellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ShellConnector for MockConnector {
    fn open(&self, target: &EnvironmentDescriptor) -> Result<Box<dyn RemoteShell>, RemoteError> {
        self.lock().opened.push(target.host_ip.clone());
        Ok(Box::new(MockShell {
            state: Arc::clone(&self.state),
            connected: false,
        }))
    }
}

pub struct MockShell {
    state: Arc<Mutex<ShellState>>,
    connected: bool,
}

impl MockShell {
    fn lock(&self) -> MutexGuard<'_, ShellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RemoteShell for MockShell {
    fn connect(&mut self) -> Result<(), RemoteError> {
        if self.connected {
            return Ok(());
        }
        let mut state = self.lock();
        if state.refuse_connect {
            return Err(RemoteError::Ssh("connection refused".to_owned()));
        }
        state.connects += 1;
        drop(state);
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn path_type(&mut self, path: &str) -> Result<PathType, RemoteError> {
        Ok(self
            .lock()
            .paths
            .get(path)
            .copied()
            .unwrap_or(PathType::Missing))
    }

    fn get_file(
        &mut self,
        remote: &str,
        local: &Path,
        recursive: bool,
    ) -> Result<(), RemoteError> {
        if recursive {
            fs::create_dir_all(local)?;
            fs::write(local.join("fetched.txt"), remote)?;
        } else {
            fs::write(local, remote)?;
        }
        self.lock().fetched.push(remote.to_owned());
        Ok(())
    }

    fn close(&mut self) {
        if self.connected {
            self.connected = false;
            self.lock().closes += 1;
        }
    }
}

/// Cluster CLI that records each call as a short string.
#[derive(Debug, Default)]
pub struct MockClusterCli {
    calls: Mutex<Vec<String>>,
    route: Option<String>,
    failing: HashSet<String>,
}

impl MockClusterCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, host: &str) -> Self {
        self.route = Some(host.to_owned());
        self
    }

    /// Make the named operation (e.g. `login`) fail.
    pub fn fail_on(mut self, op: &str) -> Self {
        self.failing.insert(op.to_owned());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, op: &str, call: String) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        if self.failing.contains(op) {
            return Err(RuntimeError::Cluster(format!("injected failure in {op}")));
        }
        Ok(())
    }
}

impl ClusterCli for MockClusterCli {
    fn program(&self) -> &Path {
        Path::new("oc")
    }

    fn login(&self, connection: &ClusterConnection) -> Result<(), RuntimeError> {
        self.record("login", format!("login {}", connection.server))
    }

    fn clear_resources(&self) -> Result<(), RuntimeError> {
        self.record("clear_resources", "clear_resources".to_owned())
    }

    fn add_template(&self, name: &str, definition: &Path) -> Result<(), RuntimeError> {
        self.record(
            "add_template",
            format!("add_template {name} {}", definition.display()),
        )
    }

    fn new_app(
        &self,
        template: &str,
        app_name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let params: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        self.record(
            "new_app",
            format!("new_app {template} {app_name} {}", params.join(",")),
        )
    }

    fn route_host(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        self.record("route_host", format!("route_host {name}"))?;
        Ok(self.route.clone())
    }
}
