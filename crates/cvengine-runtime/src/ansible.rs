//! External automation runner: ansible-playbook and ad-hoc ansible.

use crate::RuntimeError;
use cvengine_remote::{capture_process, run_process, CancelToken};
use cvengine_schema::{AuthMethod, EnvironmentDescriptor};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::{debug, info};

const SSH_COMMON_ARGS: &str = "-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null";

/// Module used for a one-off ad-hoc command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdHocModule {
    Command,
    /// Runs without a Python interpreter on the target.
    Raw,
}

impl fmt::Display for AdHocModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Raw => write!(f, "raw"),
        }
    }
}

/// Runs playbooks and ad-hoc commands against an execution target.
pub trait AutomationRunner: Send + Sync {
    fn version(&self) -> Result<String, RuntimeError>;

    /// Run one playbook; returns the runner's exit code.
    fn run_playbook(
        &self,
        inventory: &Inventory,
        playbook: &Path,
        vars_file: &Path,
        cancel: &CancelToken,
    ) -> Result<i32, RuntimeError>;

    fn run_command(
        &self,
        inventory: &Inventory,
        module: AdHocModule,
        command: &str,
        cancel: &CancelToken,
    ) -> Result<i32, RuntimeError>;
}

/// A rendered single-host inventory file.
pub struct Inventory {
    file: NamedTempFile,
    host: String,
    local: bool,
}

impl Inventory {
    /// Inventory for the local machine.
    pub fn local() -> Result<Self, RuntimeError> {
        let host = json!({ "ansible_connection": "local" });
        Self::write("localhost", &host, true)
    }

    /// Inventory for a remote host. A key path wins over a password.
    pub fn remote(target: &EnvironmentDescriptor) -> Result<Self, RuntimeError> {
        let auth = target.auth().ok_or_else(|| {
            RuntimeError::ConnectionSetup(format!(
                "no password or ssh key available for {}@{}",
                target.username, target.host_ip
            ))
        })?;

        let mut host = json!({
            "ansible_host": target.host_ip,
            "ansible_user": target.username,
            "ansible_port": target.port,
            "ansible_ssh_common_args": SSH_COMMON_ARGS,
        });
        if let Value::Object(map) = &mut host {
            match &auth {
                AuthMethod::Key(path) => {
                    map.insert(
                        "ansible_ssh_private_key_file".to_owned(),
                        Value::from(path.display().to_string()),
                    );
                }
                AuthMethod::Password(password) => {
                    map.insert("ansible_ssh_pass".to_owned(), Value::from(password.as_str()));
                    map.insert(
                        "ansible_become_pass".to_owned(),
                        Value::from(password.as_str()),
                    );
                }
            }
        }
        debug!("inventory for {} uses {auth}", target.host_name);
        Self::write(&target.host_name, &host, false)
    }

    fn write(name: &str, host: &Value, local: bool) -> Result<Self, RuntimeError> {
        let mut hosts = serde_json::Map::new();
        hosts.insert(name.to_owned(), host.clone());
        let doc = json!({ "all": { "hosts": hosts } });
        let rendered = serde_yaml::to_string(&doc)
            .map_err(|e| RuntimeError::ConnectionSetup(format!("inventory rendering: {e}")))?;

        let mut file = tempfile::Builder::new()
            .prefix("cvengine-inventory-")
            .suffix(".yml")
            .tempfile()?;
        file.write_all(rendered.as_bytes())?;
        file.flush()?;
        Ok(Self {
            file,
            host: name.to_owned(),
            local,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_local(&self) -> bool {
        self.local
    }
}

impl fmt::Debug for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inventory")
            .field("path", &self.file.path())
            .field("host", &self.host)
            .field("local", &self.local)
            .finish()
    }
}

/// Render the runner configuration file.
pub fn render_config(overrides: &BTreeMap<String, String>) -> String {
    let mut defaults = BTreeMap::from([
        ("force_color".to_owned(), "1".to_owned()),
        ("host_key_checking".to_owned(), "False".to_owned()),
    ]);
    defaults.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut out = String::from("[defaults]\n");
    for (key, value) in &defaults {
        out.push_str(key);
        out.push_str(" = ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// `AutomationRunner` backed by the ansible command-line tools.
pub struct AnsibleRunner {
    config: NamedTempFile,
}

impl AnsibleRunner {
    pub fn new(overrides: &BTreeMap<String, String>) -> Result<Self, RuntimeError> {
        let mut config = tempfile::Builder::new()
            .prefix("cvengine-ansible-")
            .suffix(".cfg")
            .tempfile()?;
        config.write_all(render_config(overrides).as_bytes())?;
        config.flush()?;
        Ok(Self { config })
    }

    pub fn config_path(&self) -> &Path {
        self.config.path()
    }

    fn command(&self, program: &str, inventory: &Inventory) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("ANSIBLE_CONFIG", self.config.path());
        cmd.arg("-v").arg("-i").arg(inventory.path());
        if inventory.is_local() {
            cmd.args(["-c", "local"]);
        }
        cmd
    }
}

impl AutomationRunner for AnsibleRunner {
    fn version(&self) -> Result<String, RuntimeError> {
        let mut cmd = Command::new("ansible-playbook");
        cmd.arg("--version");
        let out = capture_process(cmd, &CancelToken::new())?;
        if !out.success() {
            return Err(RuntimeError::Config(format!(
                "ansible-playbook --version exited with {}",
                out.code
            )));
        }
        Ok(out.lines.first().cloned().unwrap_or_default())
    }

    fn run_playbook(
        &self,
        inventory: &Inventory,
        playbook: &Path,
        vars_file: &Path,
        cancel: &CancelToken,
    ) -> Result<i32, RuntimeError> {
        let mut cmd = self.command("ansible-playbook", inventory);
        cmd.arg(playbook)
            .arg("--extra-vars")
            .arg(format!("@{}", vars_file.display()));
        info!("running playbook {}", playbook.display());
        Ok(run_process(cmd, cancel)?.code)
    }

    fn run_command(
        &self,
        inventory: &Inventory,
        module: AdHocModule,
        command: &str,
        cancel: &CancelToken,
    ) -> Result<i32, RuntimeError> {
        let mut cmd = self.command("ansible", inventory);
        if !inventory.is_local() {
            cmd.arg("--become");
        }
        cmd.arg("-m").arg(module.to_string()).arg("-a").arg(command);
        cmd.arg("all");
        debug!("ad-hoc {module} on {}: {command}", inventory.host());
        Ok(run_process(cmd, cancel)?.code)
    }
}
