use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection details for the host a platform runs against.
///
/// Produced by an environment handler and lent to the platform for the
/// duration of the run. The platform never tears the host down.
#[derive(Clone, PartialEq, Eq)]
pub struct EnvironmentDescriptor {
    pub host_name: String,
    pub host_ip: String,
    pub username: String,
    pub password: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
    pub port: u16,
}

/// How to authenticate against a remote host.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Key(PathBuf),
    Password(String),
}

impl EnvironmentDescriptor {
    /// The local machine, used when playbooks run without a remote host.
    pub fn local() -> Self {
        Self {
            host_name: "localhost".to_owned(),
            host_ip: "127.0.0.1".to_owned(),
            username: std::env::var("USER").unwrap_or_else(|_| "root".to_owned()),
            password: None,
            ssh_key_path: None,
            port: DEFAULT_SSH_PORT,
        }
    }

    /// Preferred auth method: the key path wins over the password.
    pub fn auth(&self) -> Option<AuthMethod> {
        if let Some(key) = &self.ssh_key_path {
            return Some(AuthMethod::Key(key.clone()));
        }
        self.password
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| AuthMethod::Password(p.clone()))
    }
}

impl fmt::Debug for EnvironmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentDescriptor")
            .field("host_name", &self.host_name)
            .field("host_ip", &self.host_ip)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssh_key_path", &self.ssh_key_path)
            .field("port", &self.port)
            .finish()
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(path) => f.debug_tuple("Key").field(path).finish(),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(path) => write!(f, "key {}", path.display()),
            Self::Password(_) => f.write_str("password"),
        }
    }
}
