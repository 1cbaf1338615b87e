//! Validation-run orchestration for cvengine.
//!
//! This crate ties the schema, remote, cloud and runtime layers together:
//! `EnvironmentHandler` variants acquire and release the host a platform
//! runs on, and the `Orchestrator` composes scenario resolution, one
//! environment and one platform into a single run whose platform and
//! environment teardowns always execute, in that order, exactly once.

pub mod environment;
pub mod orchestrator;
pub mod signal;

pub use environment::{
    CloudEnvironment, EnvironmentFactory, EnvironmentHandler, EnvironmentRegistry,
    EnvironmentToolkit, LocalEnvironment, PreconfiguredEnvironment,
};
pub use orchestrator::{run_container_validation, Orchestrator, RunReport, RunRequest, Services};
pub use signal::install_signal_handler;

use cvengine_cloud::CloudError;
use cvengine_remote::RemoteError;
use cvengine_runtime::RuntimeError;
use cvengine_schema::{ConfigError, MetadataError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// The part of a run an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Configuration,
    Resolution,
    Provisioning,
    ConnectionSetup,
    PlaybookExecution,
    ArtifactRetrieval,
    Cancelled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Resolution => write!(f, "resolution"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::ConnectionSetup => write!(f, "connection-setup"),
            Self::PlaybookExecution => write!(f, "playbook-execution"),
            Self::ArtifactRetrieval => write!(f, "artifact-retrieval"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("resolution: {0}")]
    Metadata(#[from] MetadataError),
    #[error("resolution: failed to fetch {url}: {source}")]
    Fetch { url: String, source: RemoteError },
    #[error("provisioning: {0}")]
    Cloud(#[from] CloudError),
    #[error("provisioning: {0}")]
    Provisioning(String),
    #[error("{stage}: {source}")]
    Platform { stage: Stage, source: RuntimeError },
    #[error("cancelled")]
    Cancelled,
    #[error("configuration: I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Config(_) | Self::Configuration(_) | Self::Io(_) => Stage::Configuration,
            Self::Metadata(_) | Self::Fetch { .. } => Stage::Resolution,
            Self::Cloud(_) | Self::Provisioning(_) => Stage::Provisioning,
            Self::Platform { stage, .. } => *stage,
            Self::Cancelled => Stage::Cancelled,
        }
    }

    /// Classify a platform error raised while in `during`.
    pub fn from_runtime(during: Stage, e: RuntimeError) -> Self {
        if e.is_cancelled() {
            return Self::Cancelled;
        }
        let stage = match &e {
            RuntimeError::Config(_) | RuntimeError::UnknownPlatform(_) => Stage::Configuration,
            RuntimeError::ConnectionSetup(_) | RuntimeError::Bootstrap { .. } => {
                Stage::ConnectionSetup
            }
            RuntimeError::PlaybookFailed { .. } => Stage::PlaybookExecution,
            RuntimeError::ArtifactRetrieval(_) => Stage::ArtifactRetrieval,
            _ => during,
        };
        Self::Platform { stage, source: e }
    }
}

/// Remote failures outside a platform happen while acquiring the host.
impl From<RemoteError> for CoreError {
    fn from(e: RemoteError) -> Self {
        if e.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Provisioning(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_prefixed_with_stage() {
        let e = CoreError::from(MetadataError::ScenarioNotFound {
            requested: Some("rhel".to_owned()),
        });
        assert_eq!(e.stage(), Stage::Resolution);
        assert!(e.to_string().starts_with("resolution: scenario not found"));

        let e = CoreError::from_runtime(
            Stage::PlaybookExecution,
            RuntimeError::PlaybookFailed {
                playbook: "one.yml".to_owned(),
                code: 2,
            },
        );
        assert_eq!(
            e.to_string(),
            "playbook-execution: playbook 'one.yml' failed with exit code 2"
        );
    }

    #[test]
    fn runtime_errors_classified_by_kind_then_stage() {
        let e = CoreError::from_runtime(
            Stage::PlaybookExecution,
            RuntimeError::ConnectionSetup("no auth".to_owned()),
        );
        assert_eq!(e.stage(), Stage::ConnectionSetup);

        let e = CoreError::from_runtime(
            Stage::ConnectionSetup,
            RuntimeError::Cluster("login failed".to_owned()),
        );
        assert_eq!(e.stage(), Stage::ConnectionSetup);

        let e = CoreError::from_runtime(
            Stage::PlaybookExecution,
            RuntimeError::Remote(RemoteError::Cancelled),
        );
        assert!(matches!(e, CoreError::Cancelled));
    }

    #[test]
    fn remote_errors_are_provisioning_unless_cancelled() {
        let e = CoreError::from(RemoteError::Unreachable {
            addr: "10.0.0.1".to_owned(),
            port: 22,
            waited_secs: 5,
        });
        assert_eq!(e.stage(), Stage::Provisioning);
        assert_eq!(CoreError::from(RemoteError::Cancelled).stage(), Stage::Cancelled);
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::ConnectionSetup.to_string(), "connection-setup");
        assert_eq!(
            serde_json::to_string(&Stage::ArtifactRetrieval).unwrap(),
            "\"artifact-retrieval\""
        );
    }
}
