//! Layered extra-variables handed to every playbook.
//!
//! Precedence, lowest to highest: run defaults, scenario `common_vars`,
//! caller-supplied extras, per-playbook `vars`, then the reserved runtime
//! keys which are always written last.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered string-keyed map used for every variable layer.
pub type VarMap = serde_json::Map<String, Value>;

pub const INSTANCE_NAME_KEY: &str = "instance_name";
pub const ARTIFACT_OUTPUT_DIR_KEY: &str = "artifact_output_dir";

/// Keys owned by the engine. No variable layer can override them.
pub const RESERVED_KEYS: [&str; 4] = [
    "image_url",
    "current_host_ip",
    "host_machine_name",
    "exec_cmd",
];

/// Values for the reserved keys, fixed by the platform once the execution
/// target is known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeVars {
    pub image_url: String,
    pub current_host_ip: String,
    pub host_machine_name: String,
    /// Command prefix for executing inside the container; `{0}` stands for
    /// the container name.
    pub exec_cmd: String,
}

impl RuntimeVars {
    pub fn to_map(&self) -> VarMap {
        let mut map = VarMap::new();
        map.insert("image_url".to_owned(), Value::from(self.image_url.as_str()));
        map.insert(
            "current_host_ip".to_owned(),
            Value::from(self.current_host_ip.as_str()),
        );
        map.insert(
            "host_machine_name".to_owned(),
            Value::from(self.host_machine_name.as_str()),
        );
        map.insert("exec_cmd".to_owned(), Value::from(self.exec_cmd.as_str()));
        map
    }
}

/// Merge `layers` lowest-first, then apply `runtime` unconditionally.
///
/// Reserved keys found in any layer are dropped.
pub fn merge_variables(layers: &[&VarMap], runtime: &RuntimeVars) -> VarMap {
    let mut merged = merge_layers(layers);
    merged.extend(runtime.to_map());
    merged
}

fn merge_layers(layers: &[&VarMap]) -> VarMap {
    let mut merged = VarMap::new();
    for layer in layers {
        for (key, value) in *layer {
            if RESERVED_KEYS.contains(&key.as_str()) {
                tracing::debug!("ignoring reserved variable '{key}' from variable layer");
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// The run's variable snapshot: everything below per-playbook `vars`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraVariables {
    base: VarMap,
    runtime: RuntimeVars,
}

impl ExtraVariables {
    pub fn new(
        instance_name: &str,
        artifact_output_dir: &str,
        common_vars: &VarMap,
        caller_extras: &VarMap,
    ) -> Self {
        let mut defaults = VarMap::new();
        defaults.insert(INSTANCE_NAME_KEY.to_owned(), Value::from(instance_name));
        defaults.insert(
            ARTIFACT_OUTPUT_DIR_KEY.to_owned(),
            Value::from(artifact_output_dir),
        );
        Self {
            base: merge_layers(&[&defaults, common_vars, caller_extras]),
            runtime: RuntimeVars::default(),
        }
    }

    pub fn set_runtime(&mut self, runtime: RuntimeVars) {
        self.runtime = runtime;
    }

    pub fn runtime(&self) -> &RuntimeVars {
        &self.runtime
    }

    /// Value of `artifact_output_dir` after all layers below the playbook.
    pub fn artifact_output_dir(&self) -> Option<&str> {
        self.base.get(ARTIFACT_OUTPUT_DIR_KEY).and_then(Value::as_str)
    }

    /// Snapshot plus runtime keys, without any playbook layer.
    pub fn snapshot(&self) -> VarMap {
        merge_variables(&[&self.base], &self.runtime)
    }

    /// Full variable set for one playbook.
    pub fn for_playbook(&self, playbook_vars: &VarMap) -> VarMap {
        merge_variables(&[&self.base, playbook_vars], &self.runtime)
    }
}
