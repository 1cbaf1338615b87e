//! Plumbing to the outside world for cvengine.
//!
//! This crate wraps the external collaborators a validation run talks to:
//! downloading metadata and playbooks (`Fetch`, `HttpFetcher`), secure-shell
//! sessions to a remote host (`RemoteShell`, `OpenSshClient`), TCP
//! reachability checks with an explicit cache (`ReachabilityCache`),
//! cancellable subprocess execution (`run_process`), and the run-wide
//! cancellation flag (`CancelToken`).

pub mod cancel;
pub mod fetch;
pub mod net;
pub mod process;
pub mod ssh;

pub use cancel::CancelToken;
pub use fetch::{prefetch_playbooks, Fetch, HttpFetcher};
pub use net::{wait_for_port, ReachabilityCache};
pub use process::{capture_process, run_process, status_process, ProcessOutput};
pub use ssh::{
    fetch_remote_path, with_session, OpenSshClient, OpenSshConnector, PathType, RemoteShell,
    ShellConnector,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported URL: {0}")]
    InvalidUrl(String),
    #[error("ssh error: {0}")]
    Ssh(String),
    #[error("no password or ssh key available for {user}@{host}")]
    NoCredentials { user: String, host: String },
    #[error("{addr}:{port} not reachable after {waited_secs}s")]
    Unreachable {
        addr: String,
        port: u16,
        waited_secs: u64,
    },
    #[error("'{program}' failed with exit code {code}")]
    CommandFailed { program: String, code: i32 },
    #[error("operation cancelled")]
    Cancelled,
}

impl RemoteError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
