//! Platform handlers for cvengine.
//!
//! A `PlatformHandler` drives validation against one container platform:
//! `setup` establishes the execution surface, `run` deploys the container
//! when asked and executes the scenario's playbooks in order through an
//! `AutomationRunner`, and `teardown` copies artifacts back to the caller.
//! Variants are selected by host type through `PlatformRegistry`.

pub mod ansible;
pub mod cluster;
pub mod lifecycle;
pub mod local_cli;
pub mod mock;
pub mod platform;
pub mod prereq;
pub mod registry;
pub mod remote_shell;

pub use ansible::{AdHocModule, AnsibleRunner, AutomationRunner, Inventory};
pub use cluster::{ClusterCli, OcClient};
pub use lifecycle::{validate_transition, PlatformState};
pub use local_cli::LocalCliPlatform;
pub use platform::{PlatformContext, PlatformHandler, DEFAULT_SCRATCH_DIR};
pub use prereq::{
    check_cluster_prereqs, check_runner_prereqs, check_ssh_prereqs, format_missing,
    prereqs_skipped, MissingPrereq,
};
pub use registry::{PlatformFactory, PlatformRegistry, Toolkit};
pub use remote_shell::{fedora_bootstrap, BootstrapStep, RemoteShellPlatform};

use cvengine_remote::RemoteError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no platform handler registered for host type '{0}'")]
    UnknownPlatform(String),
    #[error("connection setup failed: {0}")]
    ConnectionSetup(String),
    #[error("bootstrap step '{step}' failed with exit code {code}")]
    Bootstrap { step: String, code: i32 },
    #[error("playbook '{playbook}' failed with exit code {code}")]
    PlaybookFailed { playbook: String, code: i32 },
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("artifact retrieval failed: {0}")]
    ArtifactRetrieval(String),
    #[error("invalid platform state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("platform CLI error: {0}")]
    Cluster(String),
}

impl RuntimeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Remote(e) if e.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_detected_through_remote_errors() {
        assert!(RuntimeError::from(RemoteError::Cancelled).is_cancelled());
        assert!(!RuntimeError::Config("x".to_owned()).is_cancelled());
    }

    #[test]
    fn playbook_failure_message_names_playbook() {
        let e = RuntimeError::PlaybookFailed {
            playbook: "02-check.yml".to_owned(),
            code: 2,
        };
        assert_eq!(
            e.to_string(),
            "playbook '02-check.yml' failed with exit code 2"
        );
    }
}
