use crate::{CancelToken, RemoteError};
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const POLL: Duration = Duration::from_millis(100);
const DRAIN: Duration = Duration::from_millis(500);

/// Exit code and combined output lines of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: i32,
    pub lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Run `cmd` to completion, forwarding each output line to the log at info
/// level. The child is killed if `cancel` fires.
pub fn run_process(cmd: Command, cancel: &CancelToken) -> Result<ProcessOutput, RemoteError> {
    execute(cmd, cancel, true)
}

/// Same as [`run_process`] but output lines are only logged at debug level.
pub fn capture_process(cmd: Command, cancel: &CancelToken) -> Result<ProcessOutput, RemoteError> {
    execute(cmd, cancel, false)
}

fn execute(
    mut cmd: Command,
    cancel: &CancelToken,
    echo: bool,
) -> Result<ProcessOutput, RemoteError> {
    cancel.check()?;
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("spawning {program} {}", printable_args(&cmd));

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            std::io::Error::new(e.kind(), format!("failed to spawn '{program}': {e}"))
        })?;

    let (tx, rx) = mpsc::channel::<String>();
    if let Some(out) = child.stdout.take() {
        forward_lines(out, tx.clone());
    }
    if let Some(err) = child.stderr.take() {
        forward_lines(err, tx.clone());
    }
    drop(tx);

    let mut lines = Vec::new();
    let status = loop {
        for line in rx.try_iter() {
            log_line(&line, echo);
            lines.push(line);
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            debug!("{program} killed on cancel");
            return Err(RemoteError::Cancelled);
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => thread::sleep(POLL),
        }
    };

    // A daemonized grandchild may keep the pipes open; stop waiting once
    // output goes quiet.
    while let Ok(line) = rx.recv_timeout(DRAIN) {
        log_line(&line, echo);
        lines.push(line);
    }

    let code = status.code().unwrap_or(-1);
    debug!("{program} exited with {code}");
    Ok(ProcessOutput { code, lines })
}

/// Run `cmd` with all stdio detached and return its exit code.
///
/// For commands that daemonize and would otherwise hold output pipes open.
pub fn status_process(mut cmd: Command, cancel: &CancelToken) -> Result<i32, RemoteError> {
    cancel.check()?;
    let program = cmd.get_program().to_string_lossy().into_owned();
    debug!("spawning {program} {}", printable_args(&cmd));
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RemoteError::Cancelled);
        }
        if let Some(status) = child.try_wait()? {
            return Ok(status.code().unwrap_or(-1));
        }
        thread::sleep(POLL);
    }
}

/// Arguments joined for logging, with secret-bearing values masked.
fn printable_args(cmd: &Command) -> String {
    cmd.get_args()
        .map(|arg| {
            let arg = arg.to_string_lossy();
            match arg.split_once('=') {
                Some((key, _)) if is_secret_key(key) => format!("{key}=***"),
                _ => arg.into_owned(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_secret_key(key: &str) -> bool {
    let key = key.trim_start_matches('-').to_ascii_lowercase();
    key.contains("token") || key.contains("password") || key.contains("pass")
}

fn forward_lines<R: Read + Send + 'static>(source: R, tx: mpsc::Sender<String>) {
    thread::spawn(move || {
        for line in BufReader::new(source).lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

fn log_line(line: &str, echo: bool) {
    if echo {
        info!("{line}");
    } else {
        debug!("{line}");
    }
}
