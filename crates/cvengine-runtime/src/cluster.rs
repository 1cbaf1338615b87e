//! Platform CLI client for an existing OpenShift cluster.

use crate::RuntimeError;
use cvengine_remote::{capture_process, run_process, CancelToken, ProcessOutput};
use cvengine_schema::ClusterConnection;
use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Preferred install location, checked before `PATH`.
pub const OC_INSTALL_PATH: &str = "/tmp/oc/oc";

/// Workload kinds removed by `clear_resources`.
pub const CLEARED_KINDS: [&str; 6] = [
    "buildconfigs",
    "deploymentconfigs",
    "services",
    "routes",
    "templates",
    "imagestreams",
];

pub trait ClusterCli: Send + Sync {
    /// Path of the CLI binary, used to build in-container exec/copy commands.
    fn program(&self) -> &Path;

    fn login(&self, connection: &ClusterConnection) -> Result<(), RuntimeError>;

    /// Delete every workload resource in the current namespace.
    fn clear_resources(&self) -> Result<(), RuntimeError>;

    /// Replace the template `name` with the definition at `definition`.
    fn add_template(&self, name: &str, definition: &Path) -> Result<(), RuntimeError>;

    fn new_app(
        &self,
        template: &str,
        app_name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), RuntimeError>;

    /// Host of the route named `name`, or `None` when there is no such route.
    fn route_host(&self, name: &str) -> Result<Option<String>, RuntimeError>;
}

/// `ClusterCli` driving the `oc` binary.
pub struct OcClient {
    path: PathBuf,
    cancel: CancelToken,
}

impl OcClient {
    pub fn new(path: impl Into<PathBuf>, cancel: CancelToken) -> Self {
        Self {
            path: path.into(),
            cancel,
        }
    }

    /// Find `oc` at the install location or on `PATH`.
    pub fn locate(cancel: CancelToken) -> Result<Self, RuntimeError> {
        Self::locate_in(Path::new(OC_INSTALL_PATH), env::var_os("PATH"), cancel)
    }

    /// `installed` wins when it exists; otherwise the first executable `oc`
    /// on `search_path`.
    fn locate_in(
        installed: &Path,
        search_path: Option<OsString>,
        cancel: CancelToken,
    ) -> Result<Self, RuntimeError> {
        if installed.is_file() {
            return Ok(Self::new(installed, cancel));
        }
        let cwd = env::current_dir()?;
        match which::which_in("oc", search_path, cwd) {
            Ok(path) => {
                debug!("using oc at {}", path.display());
                Ok(Self::new(path, cancel))
            }
            Err(e) => Err(RuntimeError::Config(format!(
                "oc not found at {} or on PATH ({e}); install the OpenShift client",
                installed.display()
            ))),
        }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.path);
        cmd.args(args);
        cmd
    }

    fn run(&self, cmd: Command, what: &str) -> Result<ProcessOutput, RuntimeError> {
        let out = run_process(cmd, &self.cancel)?;
        if out.success() {
            Ok(out)
        } else {
            Err(RuntimeError::Cluster(format!(
                "oc {what} failed with exit code {}",
                out.code
            )))
        }
    }
}

impl ClusterCli for OcClient {
    fn program(&self) -> &Path {
        &self.path
    }

    fn login(&self, connection: &ClusterConnection) -> Result<(), RuntimeError> {
        let mut args = vec![
            "login".to_owned(),
            "--server".to_owned(),
            connection.server.clone(),
            format!("--token={}", connection.token),
            "--insecure-skip-tls-verify".to_owned(),
        ];
        if let Some(ns) = &connection.namespace {
            args.push(format!("-n={ns}"));
        }
        info!("logging in to {}", connection.server);
        self.run(self.command(args), "login").map(drop)
    }

    fn clear_resources(&self) -> Result<(), RuntimeError> {
        for kind in CLEARED_KINDS {
            info!("deleting all {kind}");
            self.run(self.command(["delete", kind, "--all"]), "delete")?;
        }
        Ok(())
    }

    fn add_template(&self, name: &str, definition: &Path) -> Result<(), RuntimeError> {
        let existing = capture_process(
            self.command(["get", "templates", name, "-o", "json"]),
            &self.cancel,
        )?;
        if existing.success() {
            debug!("template {name} exists, replacing it");
            self.run(self.command(["delete", "template", name]), "delete template")?;
        }
        let mut cmd = self.command(["create", "-f"]);
        cmd.arg(definition);
        self.run(cmd, "create").map(drop)
    }

    fn new_app(
        &self,
        template: &str,
        app_name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut args = vec![
            "new-app".to_owned(),
            template.to_owned(),
            format!("--name={app_name}"),
        ];
        for (key, value) in params {
            args.push("-p".to_owned());
            args.push(format!("{key}={value}"));
        }
        info!("creating application {app_name} from template {template}");
        self.run(self.command(args), "new-app").map(drop)
    }

    fn route_host(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        let out = capture_process(
            self.command(["get", "routes", name, "--output=json"]),
            &self.cancel,
        )?;
        if !out.success() {
            return Ok(None);
        }
        parse_route_host(&out.lines.join("\n"))
    }
}

/// Extract `spec.host` from `oc get routes -o json` output.
pub fn parse_route_host(json: &str) -> Result<Option<String>, RuntimeError> {
    let doc: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| RuntimeError::Cluster(format!("malformed route output: {e}")))?;
    Ok(doc
        .pointer("/spec/host")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_host_parsing() {
        let json = r#"{"kind":"Route","spec":{"host":"app-ns.apps.example.com","to":{}}}"#;
        assert_eq!(
            parse_route_host(json).unwrap().as_deref(),
            Some("app-ns.apps.example.com")
        );
        assert_eq!(parse_route_host(r#"{"spec":{}}"#).unwrap(), None);
        assert!(parse_route_host("not json").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn locate_skips_non_executable_oc_on_path() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let (plain, exec) = (root.path().join("a"), root.path().join("b"));
        for (dir, mode) in [(&plain, 0o644), (&exec, 0o755)] {
            std::fs::create_dir(dir).unwrap();
            let oc = dir.join("oc");
            std::fs::write(&oc, "#!/bin/sh\n").unwrap();
            std::fs::set_permissions(&oc, std::fs::Permissions::from_mode(mode)).unwrap();
        }
        let search = env::join_paths([&plain, &exec]).unwrap();
        let missing = root.path().join("installed/oc");

        let client = OcClient::locate_in(&missing, Some(search), CancelToken::new()).unwrap();
        assert_eq!(client.program(), exec.join("oc"));
    }

    #[test]
    fn locate_prefers_install_location() {
        let root = tempfile::tempdir().unwrap();
        let installed = root.path().join("oc");
        std::fs::write(&installed, "").unwrap();
        let client = OcClient::locate_in(&installed, None, CancelToken::new()).unwrap();
        assert_eq!(client.program(), installed);
    }

    #[test]
    fn locate_without_oc_is_a_configuration_error() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("oc");
        let empty = root.path().as_os_str().to_owned();
        let err = OcClient::locate_in(&missing, Some(empty), CancelToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::Config(ref m) if m.contains("oc not found")));
    }

    #[test]
    fn cleared_kinds_cover_workloads() {
        assert!(CLEARED_KINDS.contains(&"deploymentconfigs"));
        assert!(CLEARED_KINDS.contains(&"imagestreams"));
        assert_eq!(CLEARED_KINDS.len(), 6);
    }

    #[test]
    fn failing_cli_maps_to_cluster_error() {
        let oc = OcClient::new("false", CancelToken::new());
        let err = oc.clear_resources().unwrap_err();
        assert!(matches!(err, RuntimeError::Cluster(_)));
        assert_eq!(oc.route_host("web").unwrap(), None);
    }
}
