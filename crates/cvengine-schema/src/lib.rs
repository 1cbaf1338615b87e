//! Data model for cvengine container validation runs.
//!
//! This crate defines the schema layer: YAML scenario metadata
//! (`ScenarioMetadata`, `TestScenario`, `PlaybookRef`, `ArtifactSpec`), the run
//! configuration (`RunConfig`, `ArtifactPolicy`), the host description handed from
//! an environment to a platform (`EnvironmentDescriptor`), the layered
//! extra-variables merge (`ExtraVariables`), and scenario resolution
//! (`resolve_scenario`).

pub mod config;
pub mod descriptor;
pub mod metadata;
pub mod resolve;
pub mod types;
pub mod vars;

pub use config::{
    parse_config_file, parse_config_str, ArtifactPolicy, CloudHostSettings, CloudSettings,
    ConfigError, Criticality, EnvironmentConfig, FetchSettings, OpenStackAuth, RunConfig,
};
pub use descriptor::{AuthMethod, EnvironmentDescriptor, DEFAULT_SSH_PORT};
pub use metadata::{
    parse_metadata_file, parse_metadata_str, ArtifactSpec, ClusterConnection, MetadataError,
    PlaybookRef, ScenarioMetadata, TemplateRef, TestScenario, DEFAULT_INSTANCE_NAME,
};
pub use resolve::resolve_scenario;
pub use types::{HostType, RunId};
pub use vars::{
    merge_variables, ExtraVariables, RuntimeVars, VarMap, ARTIFACT_OUTPUT_DIR_KEY,
    INSTANCE_NAME_KEY, RESERVED_KEYS,
};
