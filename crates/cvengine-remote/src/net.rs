use crate::{CancelToken, RemoteError};
use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Memo of TCP reachability checks keyed by `(address, port)`.
///
/// Only saves redundant checks; a stale entry is corrected by checking with
/// `force` or calling [`invalidate`](Self::invalidate). Passed explicitly to
/// whatever needs it rather than living in a global.
pub struct ReachabilityCache {
    results: Mutex<HashMap<(String, u16), bool>>,
    connect_timeout: Duration,
}

impl Default for ReachabilityCache {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl ReachabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Whether `addr:port` accepts TCP connections. Uses the cached answer
    /// unless `force` is set or nothing is cached yet.
    pub fn check(&self, addr: &str, port: u16, force: bool) -> bool {
        let key = (addr.to_owned(), port);
        if !force {
            if let Some(known) = self.lock().get(&key) {
                return *known;
            }
        }
        let reachable = tcp_reachable(addr, port, self.connect_timeout);
        debug!("reachability {addr}:{port} -> {reachable}");
        self.lock().insert(key, reachable);
        reachable
    }

    pub fn invalidate(&self, addr: &str, port: u16) {
        self.lock().remove(&(addr.to_owned(), port));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, u16), bool>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn tcp_reachable(addr: &str, port: u16, timeout: Duration) -> bool {
    let Ok(resolved) = (addr, port).to_socket_addrs() else {
        return false;
    };
    resolved
        .into_iter()
        .any(|sock| TcpStream::connect_timeout(&sock, timeout).is_ok())
}

/// Poll until `addr:port` is reachable or `timeout` elapses.
pub fn wait_for_port(
    cache: &ReachabilityCache,
    addr: &str,
    port: u16,
    timeout: Duration,
    interval: Duration,
    cancel: &CancelToken,
) -> Result<(), RemoteError> {
    let start = Instant::now();
    loop {
        cancel.check()?;
        if cache.check(addr, port, true) {
            debug!("{addr}:{port} reachable after {:?}", start.elapsed());
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(RemoteError::Unreachable {
                addr: addr.to_owned(),
                port,
                waited_secs: start.elapsed().as_secs(),
            });
        }
        cancel.sleep(interval)?;
    }
}
