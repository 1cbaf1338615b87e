use crate::descriptor::{EnvironmentDescriptor, DEFAULT_SSH_PORT};
use crate::vars::VarMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid '{section}' section: {source}")]
    InvalidSection {
        section: String,
        source: serde_json::Error,
    },
    #[error("'{section}' is missing required keys: {}", .keys.join(", "))]
    MissingKeys { section: String, keys: Vec<String> },
    #[error("environment.handler must not be empty")]
    EmptyHandler,
}

/// Top-level run configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RunConfig {
    #[serde(default)]
    pub target_host_platform: Option<String>,
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub artifact_policy: ArtifactPolicy,
    #[serde(default)]
    pub fetch: FetchSettings,
}

/// The `environment` block: a handler key plus handler-specific settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EnvironmentConfig {
    pub handler: String,
    #[serde(flatten)]
    pub settings: VarMap,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    Required,
    Optional,
}

impl Criticality {
    pub fn is_required(self) -> bool {
        self == Self::Required
    }
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => f.write_str("required"),
            Self::Optional => f.write_str("optional"),
        }
    }
}

/// Which artifact categories fail the run when they cannot be retrieved.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ArtifactPolicy {
    #[serde(default = "required")]
    pub scratch_output: Criticality,
    #[serde(default = "optional")]
    pub container_artifacts: Criticality,
    #[serde(default = "optional")]
    pub test_host_artifacts: Criticality,
}

impl Default for ArtifactPolicy {
    fn default() -> Self {
        Self {
            scratch_output: Criticality::Required,
            container_artifacts: Criticality::Optional,
            test_host_artifacts: Criticality::Optional,
        }
    }
}

fn required() -> Criticality {
    Criticality::Required
}

fn optional() -> Criticality {
    Criticality::Optional
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FetchSettings {
    #[serde(default)]
    pub insecure_tls: bool,
}

/// Credentials for an OpenStack identity endpoint.
#[derive(Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct OpenStackAuth {
    pub auth_url: String,
    pub project: String,
    pub username: String,
    pub password: String,
    pub region: String,
    #[serde(default)]
    pub domain: Option<String>,
}

impl fmt::Debug for OpenStackAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenStackAuth")
            .field("auth_url", &self.auth_url)
            .field("project", &self.project)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("region", &self.region)
            .field("domain", &self.domain)
            .finish()
    }
}

/// How the cloud host is built.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CloudHostSettings {
    pub image_name: String,
    pub flavor_name: String,
    pub network_name: String,
    pub keypair_name: String,
    pub floating_ip_pool_name: String,
    #[serde(default = "default_login_user")]
    pub login_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CloudSettings {
    pub openstack: OpenStackAuth,
    pub host: CloudHostSettings,
}

fn default_login_user() -> String {
    "root".to_owned()
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_boot_timeout() -> u64 {
    600
}

fn default_ssh_timeout() -> u64 {
    300
}

const OPENSTACK_KEYS: [&str; 5] = ["auth_url", "project", "username", "password", "region"];
const CLOUD_HOST_KEYS: [&str; 5] = [
    "image_name",
    "flavor_name",
    "network_name",
    "keypair_name",
    "floating_ip_pool_name",
];
const PRECONFIGURED_HOST_KEYS: [&str; 3] = ["machine_name", "ip_address", "credentials.user"];

impl EnvironmentConfig {
    /// Normalized handler key used for lookup.
    pub fn handler_key(&self) -> String {
        self.handler.trim().to_ascii_lowercase()
    }

    pub fn section(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    /// Host block for a pre-configured environment.
    ///
    /// Read from `host`, or from the first entry of the legacy `atomic-host`
    /// list.
    pub fn preconfigured_host(&self) -> Result<EnvironmentDescriptor, ConfigError> {
        let (section, host) = if let Some(host) = self.section("host") {
            ("environment.host", host)
        } else if let Some(Value::Array(list)) = self.section("atomic-host") {
            match list.first() {
                Some(first) => ("environment.atomic-host[0]", first),
                None => {
                    return Err(ConfigError::MissingKeys {
                        section: "environment.atomic-host".to_owned(),
                        keys: vec!["[0]".to_owned()],
                    })
                }
            }
        } else {
            return Err(ConfigError::MissingKeys {
                section: "environment".to_owned(),
                keys: vec!["host".to_owned()],
            });
        };

        require_keys(section, host, &PRECONFIGURED_HOST_KEYS)?;
        let parsed: PreconfiguredHost = from_section(section, host)?;
        let creds = parsed.credentials;
        Ok(EnvironmentDescriptor {
            host_name: parsed.machine_name,
            host_ip: parsed.ip_address,
            username: creds.user,
            password: creds.password,
            ssh_key_path: creds.ssh_key_path,
            port: creds.port.unwrap_or(DEFAULT_SSH_PORT),
        })
    }

    /// `openstack` and `host` blocks for a cloud-provisioned environment.
    pub fn cloud_settings(&self) -> Result<CloudSettings, ConfigError> {
        let Some(openstack) = self.section("openstack") else {
            return Err(ConfigError::MissingKeys {
                section: "environment".to_owned(),
                keys: vec!["openstack".to_owned()],
            });
        };
        let Some(host) = self.section("host") else {
            return Err(ConfigError::MissingKeys {
                section: "environment".to_owned(),
                keys: vec!["host".to_owned()],
            });
        };
        require_keys("environment.openstack", openstack, &OPENSTACK_KEYS)?;
        require_keys("environment.host", host, &CLOUD_HOST_KEYS)?;
        Ok(CloudSettings {
            openstack: from_section("environment.openstack", openstack)?,
            host: from_section("environment.host", host)?,
        })
    }
}

#[derive(Deserialize)]
struct PreconfiguredHost {
    machine_name: String,
    ip_address: String,
    credentials: HostCredentials,
}

#[derive(Deserialize)]
struct HostCredentials {
    user: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    ssh_key_path: Option<PathBuf>,
    #[serde(default)]
    port: Option<u16>,
}

/// Check that every dotted key path in `keys` is present in `value`.
fn require_keys(section: &str, value: &Value, keys: &[&str]) -> Result<(), ConfigError> {
    let missing: Vec<String> = keys
        .iter()
        .filter(|path| {
            let mut cursor = Some(value);
            for part in path.split('.') {
                cursor = cursor.and_then(|v| v.get(part)).filter(|v| !v.is_null());
            }
            cursor.is_none()
        })
        .map(|path| (*path).to_owned())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::MissingKeys {
            section: section.to_owned(),
            keys: missing,
        })
    }
}

fn from_section<T: DeserializeOwned>(section: &str, value: &Value) -> Result<T, ConfigError> {
    serde_json::from_value(value.clone()).map_err(|source| ConfigError::InvalidSection {
        section: section.to_owned(),
        source,
    })
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.handler.trim().is_empty() {
            return Err(ConfigError::EmptyHandler);
        }
        Ok(())
    }
}

/// Parse a YAML run configuration.
pub fn parse_config_str(input: &str) -> Result<RunConfig, ConfigError> {
    let config: RunConfig = serde_yaml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

/// Parse a run configuration file; `.toml` files are read as TOML,
/// everything else as YAML.
pub fn parse_config_file(path: impl AsRef<Path>) -> Result<RunConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    if path.extension().is_some_and(|ext| ext == "toml") {
        let config: RunConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    } else {
        parse_config_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AuthMethod;

    const CLOUD: &str = r"
target_host_platform: fedora
environment:
  handler: cloud
  openstack:
    auth_url: https://keystone:5000/v3
    project: cv
    username: bot
    password: s3cret
    region: RegionOne
  host:
    image_name: fedora-28
    flavor_name: m1.medium
    network_name: private
    keypair_name: cv-key
    floating_ip_pool_name: public
artifact_policy:
  container_artifacts: required
fetch:
  insecure_tls: true
";

    #[test]
    fn parses_cloud_config() {
        let cfg = parse_config_str(CLOUD).unwrap();
        assert_eq!(cfg.target_host_platform.as_deref(), Some("fedora"));
        assert_eq!(cfg.environment.handler_key(), "cloud");
        assert!(cfg.fetch.insecure_tls);
        assert_eq!(cfg.artifact_policy.scratch_output, Criticality::Required);
        assert!(cfg.artifact_policy.container_artifacts.is_required());
        assert!(!cfg.artifact_policy.test_host_artifacts.is_required());

        let cloud = cfg.environment.cloud_settings().unwrap();
        assert_eq!(cloud.openstack.region, "RegionOne");
        assert_eq!(cloud.host.login_user, "root");
        assert_eq!(cloud.host.ssh_port, 22);
        assert_eq!(cloud.host.boot_timeout_secs, 600);
        assert!(!format!("{:?}", cloud.openstack).contains("s3cret"));
    }

    #[test]
    fn cloud_config_names_missing_keys() {
        let cfg = parse_config_str(
            r"
environment:
  handler: cloud
  openstack:
    auth_url: https://keystone
    username: bot
  host:
    image_name: img
",
        )
        .unwrap();
        let err = cfg.environment.cloud_settings().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("environment.openstack"), "{msg}");
        assert!(msg.contains("project"));
        assert!(msg.contains("password"));
        assert!(msg.contains("region"));
    }

    #[test]
    fn preconfigured_host_block() {
        let cfg = parse_config_str(
            r"
environment:
  handler: preconfigured
  host:
    machine_name: box
    ip_address: 10.0.0.9
    credentials:
      user: cloud-user
      ssh_key_path: /keys/id
      port: 2222
",
        )
        .unwrap();
        let d = cfg.environment.preconfigured_host().unwrap();
        assert_eq!(d.host_name, "box");
        assert_eq!(d.port, 2222);
        assert!(matches!(d.auth(), Some(AuthMethod::Key(_))));
    }

    #[test]
    fn preconfigured_legacy_list_uses_first_entry() {
        let cfg = parse_config_str(
            r"
environment:
  handler: preconfigured
  atomic-host:
    - machine_name: first
      ip_address: 10.0.0.1
      credentials:
        user: root
        password: pw
    - machine_name: second
      ip_address: 10.0.0.2
      credentials:
        user: root
",
        )
        .unwrap();
        let d = cfg.environment.preconfigured_host().unwrap();
        assert_eq!(d.host_name, "first");
        assert_eq!(d.port, DEFAULT_SSH_PORT);
    }

    #[test]
    fn preconfigured_missing_keys_are_named() {
        let cfg = parse_config_str(
            r"
environment:
  handler: preconfigured
  host:
    machine_name: box
    credentials: {}
",
        )
        .unwrap();
        match cfg.environment.preconfigured_host().unwrap_err() {
            ConfigError::MissingKeys { keys, .. } => {
                assert_eq!(keys, vec!["ip_address", "credentials.user"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_handler_rejected() {
        let err = parse_config_str("environment:\n  handler: ''\n").unwrap_err();
        assert!(matches!(err, ConfigError::EmptyHandler));
    }

    #[test]
    fn toml_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
target_host_platform = "atomic"

[environment]
handler = "preconfigured"

[environment.host]
machine_name = "box"
ip_address = "10.0.0.3"

[environment.host.credentials]
user = "root"
password = "pw"

[artifact_policy]
scratch_output = "optional"
"#,
        )
        .unwrap();
        let cfg = parse_config_file(&path).unwrap();
        assert_eq!(cfg.artifact_policy.scratch_output, Criticality::Optional);
        let d = cfg.environment.preconfigured_host().unwrap();
        assert_eq!(d.host_ip, "10.0.0.3");
    }

    #[test]
    fn yaml_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yml");
        fs::write(&path, CLOUD).unwrap();
        assert!(parse_config_file(&path).is_ok());
    }

    #[test]
    fn unknown_policy_value_rejected() {
        let err = parse_config_str(
            "environment:\n  handler: local\nartifact_policy:\n  scratch_output: maybe\n",
        );
        assert!(err.is_err());
    }
}
