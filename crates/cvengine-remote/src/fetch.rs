use crate::{CancelToken, RemoteError};
use cvengine_schema::PlaybookRef;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

/// Retrieves a document by URL or path.
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, RemoteError>;

    fn fetch_string(&self, url: &str) -> Result<String, RemoteError> {
        let bytes = self.fetch(url)?;
        String::from_utf8(bytes).map_err(|e| RemoteError::Http(format!("{url}: {e}")))
    }
}

/// Fetches `http(s)://` URLs with ureq, `file://` URLs and bare paths from
/// the local filesystem.
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new(insecure_tls: bool) -> Self {
        let mut builder =
            ureq::Agent::config_builder().timeout_global(Some(Duration::from_secs(120)));
        if insecure_tls {
            builder = builder.tls_config(
                ureq::tls::TlsConfig::builder()
                    .disable_verification(true)
                    .build(),
            );
        }
        let agent = ureq::Agent::new_with_config(builder.build());
        Self { agent }
    }

    fn do_get(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let resp = match self.agent.get(url).call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(RemoteError::NotFound(url.to_owned()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(RemoteError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => {
                return Err(RemoteError::Http(format!("{url}: {e}")));
            }
        };

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(body)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            debug!("GET {url}");
            return self.do_get(url);
        }
        let path = if let Some(rest) = url.strip_prefix("file://") {
            rest
        } else if url.contains("://") {
            return Err(RemoteError::InvalidUrl(url.to_owned()));
        } else {
            url
        };
        debug!("reading {path}");
        read_local(Path::new(path))
    }
}

fn read_local(path: &Path) -> Result<Vec<u8>, RemoteError> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(RemoteError::NotFound(path.display().to_string()))
        }
        Err(e) => Err(RemoteError::Io(e)),
    }
}

/// Download every playbook into a fresh temporary directory and record
/// where each one landed in its `local_path`.
///
/// Files are named `NN-<basename>` so two playbooks with the same name do
/// not collide. The returned directory must outlive playbook execution.
pub fn prefetch_playbooks(
    fetcher: &dyn Fetch,
    playbooks: &mut [PlaybookRef],
    cancel: &CancelToken,
) -> Result<TempDir, RemoteError> {
    let dir = tempfile::Builder::new().prefix("cvengine-playbooks-").tempdir()?;
    for (idx, playbook) in playbooks.iter_mut().enumerate() {
        cancel.check()?;
        let bytes = fetcher.fetch(&playbook.url)?;
        let target = dir.path().join(format!("{idx:02}-{}", playbook.file_name()));
        fs::write(&target, bytes)?;
        info!("fetched playbook {} -> {}", playbook.url, target.display());
        playbook.local_path = Some(target);
    }
    Ok(dir)
}
