use crate::process::{capture_process, run_process, status_process};
use crate::{CancelToken, ReachabilityCache, RemoteError};
use cvengine_schema::{AuthMethod, EnvironmentDescriptor};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// What a remote path turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Missing,
    File,
    Directory,
}

/// A session to one remote host.
///
/// `connect` is a no-op while a session is already up; callers check
/// [`is_connected`](RemoteShell::is_connected) instead of relying on drop.
pub trait RemoteShell: Send {
    fn connect(&mut self) -> Result<(), RemoteError>;

    fn is_connected(&self) -> bool;

    fn path_type(&mut self, path: &str) -> Result<PathType, RemoteError>;

    /// Copy `remote` to the local path `local`, recursing for directories.
    fn get_file(&mut self, remote: &str, local: &Path, recursive: bool)
        -> Result<(), RemoteError>;

    /// Release the session. Safe to call when not connected.
    fn close(&mut self);
}

/// Opens shells to the host an environment describes.
pub trait ShellConnector: Send + Sync {
    fn open(&self, target: &EnvironmentDescriptor) -> Result<Box<dyn RemoteShell>, RemoteError>;
}

/// Connect, run `work`, and close the session on every exit path.
pub fn with_session<T, E, F>(shell: &mut dyn RemoteShell, work: F) -> Result<T, E>
where
    E: From<RemoteError>,
    F: FnOnce(&mut dyn RemoteShell) -> Result<T, E>,
{
    if let Err(e) = shell.connect() {
        shell.close();
        return Err(e.into());
    }
    let result = work(shell);
    shell.close();
    result
}

/// Copy a remote file or directory into `local_dir`, keeping its basename.
///
/// A missing remote path is reported as `NotFound`.
pub fn fetch_remote_path(
    shell: &mut dyn RemoteShell,
    remote: &str,
    local_dir: &Path,
) -> Result<PathBuf, RemoteError> {
    fs::create_dir_all(local_dir)?;
    let kind = shell.path_type(remote)?;
    if kind == PathType::Missing {
        return Err(RemoteError::NotFound(remote.to_owned()));
    }
    let base = Path::new(remote.trim_end_matches('/'))
        .file_name()
        .map_or_else(|| PathBuf::from("artifact"), PathBuf::from);
    let dest = local_dir.join(base);
    shell.get_file(remote, &dest, kind == PathType::Directory)?;
    Ok(dest)
}

/// Remote shell snippet printing `directory`, `file` or `missing` for `path`.
fn path_type_script(path: &str) -> String {
    let quoted = shell_escape::unix::escape(path.into());
    format!(
        "if test -d {quoted}; then echo directory; \
         elif test -e {quoted}; then echo file; \
         else echo missing; fi"
    )
}

/// [`ShellConnector`] producing [`OpenSshClient`]s.
pub struct OpenSshConnector {
    reachability: Arc<ReachabilityCache>,
    cancel: CancelToken,
}

impl OpenSshConnector {
    pub fn new(reachability: Arc<ReachabilityCache>, cancel: CancelToken) -> Self {
        Self {
            reachability,
            cancel,
        }
    }
}

impl ShellConnector for OpenSshConnector {
    fn open(&self, target: &EnvironmentDescriptor) -> Result<Box<dyn RemoteShell>, RemoteError> {
        let client = OpenSshClient::new(
            target,
            Arc::clone(&self.reachability),
            self.cancel.clone(),
        )?;
        Ok(Box::new(client))
    }
}

/// Drives the system `ssh` and `scp` binaries over a shared control master.
///
/// Password auth goes through `sshpass -e` with the secret in the
/// environment, never on the command line.
pub struct OpenSshClient {
    host: String,
    user: String,
    port: u16,
    auth: AuthMethod,
    control: Option<TempDir>,
    reachability: Arc<ReachabilityCache>,
    cancel: CancelToken,
}

impl OpenSshClient {
    pub fn new(
        target: &EnvironmentDescriptor,
        reachability: Arc<ReachabilityCache>,
        cancel: CancelToken,
    ) -> Result<Self, RemoteError> {
        let auth = target.auth().ok_or_else(|| RemoteError::NoCredentials {
            user: target.username.clone(),
            host: target.host_ip.clone(),
        })?;
        Ok(Self {
            host: target.host_ip.clone(),
            user: target.username.clone(),
            port: target.port,
            auth,
            control: None,
            reachability,
            cancel,
        })
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn control_path(&self) -> Option<PathBuf> {
        self.control.as_ref().map(|dir| dir.path().join("master.sock"))
    }

    /// Base invocation of `program` (`ssh` or `scp`) with auth wiring.
    fn base_command(&self, program: &str) -> Command {
        let mut cmd = match &self.auth {
            AuthMethod::Password(password) => {
                let mut c = Command::new("sshpass");
                c.arg("-e").arg(program).env("SSHPASS", password);
                c
            }
            AuthMethod::Key(_) => Command::new(program),
        };
        let port_flag = if program == "scp" { "-P" } else { "-p" };
        cmd.args(self.option_args());
        cmd.arg(port_flag).arg(self.port.to_string());
        cmd
    }

    fn option_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_owned(),
            "StrictHostKeyChecking=no".to_owned(),
            "-o".to_owned(),
            "UserKnownHostsFile=/dev/null".to_owned(),
            "-o".to_owned(),
            "ConnectTimeout=10".to_owned(),
            "-o".to_owned(),
            "LogLevel=ERROR".to_owned(),
        ];
        match &self.auth {
            AuthMethod::Key(key) => {
                args.push("-i".to_owned());
                args.push(key.display().to_string());
                args.push("-o".to_owned());
                args.push("BatchMode=yes".to_owned());
            }
            AuthMethod::Password(_) => {
                args.push("-o".to_owned());
                args.push("PreferredAuthentications=password,keyboard-interactive".to_owned());
                args.push("-o".to_owned());
                args.push("PubkeyAuthentication=no".to_owned());
            }
        }
        if let Some(path) = self.control_path() {
            args.push("-o".to_owned());
            args.push(format!("ControlPath={}", path.display()));
        }
        args
    }

    fn ensure_connected(&mut self) -> Result<(), RemoteError> {
        if self.is_connected() {
            debug!("reusing ssh session to {}", self.host);
            Ok(())
        } else {
            self.connect()
        }
    }
}

impl RemoteShell for OpenSshClient {
    fn connect(&mut self) -> Result<(), RemoteError> {
        if self.is_connected() {
            return Ok(());
        }
        if !self.reachability.check(&self.host, self.port, true) {
            return Err(RemoteError::Unreachable {
                addr: self.host.clone(),
                port: self.port,
                waited_secs: 0,
            });
        }

        let dir = tempfile::Builder::new().prefix("cvengine-ssh-").tempdir()?;
        let socket = dir.path().join("master.sock");
        let mut cmd = self.base_command("ssh");
        cmd.arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg(format!("ControlPath={}", socket.display()))
            .args(["-M", "-N", "-f"])
            .arg(self.destination());

        debug!("opening ssh session to {} with {}", self.host, self.auth);
        let code = status_process(cmd, &self.cancel)?;
        if code != 0 {
            return Err(RemoteError::Ssh(format!(
                "could not open session to {} (exit {code})",
                self.destination()
            )));
        }
        self.control = Some(dir);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.control_path().is_some_and(|p| p.exists())
    }

    fn path_type(&mut self, path: &str) -> Result<PathType, RemoteError> {
        self.ensure_connected()?;
        let mut cmd = self.base_command("ssh");
        cmd.arg(self.destination()).arg("--").arg(path_type_script(path));
        let out = capture_process(cmd, &self.cancel)?;
        if !out.success() {
            return Err(RemoteError::Ssh(format!("checking {path} failed (exit {})", out.code)));
        }
        match out.lines.iter().rev().find(|l| !l.trim().is_empty()).map(|l| l.trim()) {
            Some("directory") => Ok(PathType::Directory),
            Some("file") => Ok(PathType::File),
            _ => Ok(PathType::Missing),
        }
    }

    fn get_file(
        &mut self,
        remote: &str,
        local: &Path,
        recursive: bool,
    ) -> Result<(), RemoteError> {
        self.ensure_connected()?;
        info!("copying {}:{remote} -> {}", self.host, local.display());
        let mut cmd = self.base_command("scp");
        if recursive {
            cmd.arg("-r");
        }
        cmd.arg(format!("{}:{remote}", self.destination())).arg(local);
        let out = run_process(cmd, &self.cancel)?;
        if out.success() {
            Ok(())
        } else {
            Err(RemoteError::CommandFailed {
                program: "scp".to_owned(),
                code: out.code,
            })
        }
    }

    fn close(&mut self) {
        let Some(path) = self.control_path() else {
            return;
        };
        if path.exists() {
            let mut cmd = Command::new("ssh");
            cmd.arg("-o")
                .arg(format!("ControlPath={}", path.display()))
                .args(["-O", "exit"])
                .arg(self.destination());
            if let Err(e) = status_process(cmd, &CancelToken::new()) {
                debug!("closing ssh master for {}: {e}", self.host);
            }
        }
        self.control = None;
        debug!("ssh session to {} closed", self.host);
    }
}
