pub mod completions;
pub mod doctor;
pub mod resolve;
pub mod run;

use cvengine_core::{CoreError, Stage};
use cvengine_schema::{parse_config_file, parse_config_str, RunConfig, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_PLAYBOOK_FAILURE: u8 = 3;
pub const EXIT_PROVISIONING_ERROR: u8 = 4;
pub const EXIT_ARTIFACT_ERROR: u8 = 5;

/// Process exit code for a run that failed at `stage`.
pub fn exit_code_for(stage: Stage) -> u8 {
    match stage {
        Stage::Configuration | Stage::Resolution => EXIT_CONFIG_ERROR,
        Stage::PlaybookExecution => EXIT_PLAYBOOK_FAILURE,
        Stage::Provisioning | Stage::ConnectionSetup => EXIT_PROVISIONING_ERROR,
        Stage::ArtifactRetrieval => EXIT_ARTIFACT_ERROR,
        Stage::Cancelled => EXIT_FAILURE,
    }
}

/// A failed command. Errors without a stage exit with `EXIT_FAILURE`.
#[derive(Debug)]
pub struct CommandError {
    pub stage: Option<Stage>,
    pub message: String,
}

impl CommandError {
    /// `message` prefixed with its stage, as core errors render.
    pub fn at(stage: Stage, message: impl fmt::Display) -> Self {
        Self {
            stage: Some(stage),
            message: format!("{stage}: {message}"),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.stage.map_or(EXIT_FAILURE, exit_code_for)
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<CoreError> for CommandError {
    fn from(e: CoreError) -> Self {
        Self {
            stage: Some(e.stage()),
            message: e.to_string(),
        }
    }
}

impl From<String> for CommandError {
    fn from(message: String) -> Self {
        Self {
            stage: None,
            message,
        }
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Read the run configuration from a file, or treat the argument as inline
/// YAML when no such file exists.
pub fn load_config(value: &str) -> Result<RunConfig, CommandError> {
    let path = Path::new(value);
    let parsed = if path.is_file() {
        parse_config_file(path)
    } else {
        parse_config_str(value)
    };
    parsed.map_err(|e| CommandError::at(Stage::Configuration, e))
}

/// Parse caller extra variables: a YAML or JSON mapping, or `@path` to a
/// file holding one.
pub fn parse_extra_vars(value: &str) -> Result<VarMap, CommandError> {
    let config_error = |msg: String| CommandError::at(Stage::Configuration, msg);
    let text = match value.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| config_error(format!("cannot read extra vars {path}: {e}")))?,
        None => value.to_owned(),
    };
    if text.trim().is_empty() {
        return Ok(VarMap::new());
    }
    let parsed: serde_json::Value = serde_yaml::from_str(&text)
        .map_err(|e| config_error(format!("invalid extra vars: {e}")))?;
    match parsed {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(VarMap::new()),
        _ => Err(config_error("extra vars must be a mapping".to_owned())),
    }
}
