use crate::types::HostType;
use crate::vars::VarMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name given to the container under test when a scenario does not set one.
pub const DEFAULT_INSTANCE_NAME: &str = "container_instance";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read metadata file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse metadata: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("{}", scenario_not_found_message(.requested.as_deref()))]
    ScenarioNotFound { requested: Option<String> },
}

fn scenario_not_found_message(requested: Option<&str>) -> String {
    match requested {
        Some(host_type) => format!(
            "scenario not found: no entry has host_type '{host_type}'"
        ),
        None => "scenario not found: no host_type requested and no entry is flagged default"
            .to_owned(),
    }
}

/// The fetched scenario document. Entry order is significant and preserved.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ScenarioMetadata {
    #[serde(rename = "Test")]
    pub scenarios: Vec<TestScenario>,
    #[serde(rename = "Artifacts", default, deserialize_with = "null_as_default")]
    pub artifacts: ArtifactSpec,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TestScenario {
    pub host_type: HostType,
    #[serde(rename = "default", alias = "is_default", default)]
    pub is_default: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub playbooks: Vec<PlaybookRef>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub common_vars: VarMap,
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default)]
    pub do_container_deploy: bool,
    /// Connection details for an existing cluster (local-CLI platforms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openshift_instance: Option<ClusterConnection>,
    /// Template used when the platform deploys the container itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateRef>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PlaybookRef {
    pub url: String,
    /// Filled in by the pre-fetch step; `None` until the playbook is downloaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub vars: VarMap,
}

/// Artifact paths to collect at teardown. Missing categories are empty.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ArtifactSpec {
    #[serde(default, deserialize_with = "null_as_default")]
    pub container_artifacts: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub test_host_artifacts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterConnection {
    pub server: String,
    pub token: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TemplateRef {
    /// Template name as known to the cluster.
    pub name: String,
    /// Local path or URL of a template definition to (re)create before use.
    #[serde(default)]
    pub path: Option<String>,
    /// Template parameter that receives the image under test.
    #[serde(default)]
    pub image_param: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl TestScenario {
    pub fn playbook_urls(&self) -> Vec<&str> {
        self.playbooks.iter().map(|p| p.url.as_str()).collect()
    }
}

impl PlaybookRef {
    /// File name component of the playbook URL, used to name the local copy.
    pub fn file_name(&self) -> &str {
        let path = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or(self.url.as_str());
        path.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("playbook.yml")
    }
}

fn default_instance_name() -> String {
    DEFAULT_INSTANCE_NAME.to_owned()
}

/// YAML writes an empty section as `key:` which parses to null.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub fn parse_metadata_str(input: &str) -> Result<ScenarioMetadata, MetadataError> {
    Ok(serde_yaml::from_str(input)?)
}

pub fn parse_metadata_file(path: impl AsRef<Path>) -> Result<ScenarioMetadata, MetadataError> {
    let content = fs::read_to_string(path)?;
    parse_metadata_str(&content)
}
