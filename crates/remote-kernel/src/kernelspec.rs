//! Typed kernelspec (`kernel.json`) structs.
//!
//! Remote kernel specs are ordinary Jupyter kernelspecs whose
//! `metadata.kernel_provisioner` block points at the remote provisioner and
//! carries the launch configuration (resource spec, workdir, ...). Keys this
//! crate does not track are kept in `extra` maps so a spec read from disk or
//! from the control plane round-trips without losing fields.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::launch::ResourceMap;
use crate::PROVISIONER_NAME;

fn default_argv() -> Vec<String> {
    vec!["{connection_info}".to_string()]
}

/// The contents of a `kernel.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecFile {
    /// Launch command. Remote specs only pass the connection file through.
    #[serde(default = "default_argv")]
    pub argv: Vec<String>,

    #[serde(default)]
    pub display_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default)]
    pub env: Map<String, Value>,

    #[serde(default)]
    pub metadata: KernelSpecMetadata,

    /// Fields such as `interrupt_mode` that we pass through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `metadata` block of a kernelspec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_provisioner: Option<KernelProvisioner>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `metadata.kernel_provisioner` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelProvisioner {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner_name: Option<String>,

    #[serde(default)]
    pub config: ProvisionerConfig,
}

/// Launch configuration consumed by the remote provisioner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Scheduler resources (e.g. `cpus-per-task`, `time`), in server order.
    #[serde(default)]
    pub spec: ResourceMap,

    #[serde(default)]
    pub workdir: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_scripts: Option<String>,

    /// `cluster`, `gateway_url`, `transport`, `username`, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl KernelSpecFile {
    /// Parse a kernelspec from a JSON value.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// The provisioner configuration, if this spec declares a provisioner.
    pub fn provisioner_config(&self) -> Option<&ProvisionerConfig> {
        self.metadata.kernel_provisioner.as_ref().map(|p| &p.config)
    }

    /// Whether this spec is launched through the remote provisioner.
    pub fn is_remote(&self) -> bool {
        self.metadata
            .kernel_provisioner
            .as_ref()
            .and_then(|p| p.provisioner_name.as_deref())
            == Some(PROVISIONER_NAME)
    }
}

/// A kernelspec as enumerated by a registry, keyed by its name.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSpecDescriptor {
    /// Directory name of the spec; unique within the registry.
    pub name: String,
    /// Directory the spec was read from, when it came from disk.
    pub resource_dir: Option<PathBuf>,
    pub spec: KernelSpecFile,
}

impl KernelSpecDescriptor {
    /// Display name, falling back to the spec name when the file has none.
    pub fn display_name(&self) -> &str {
        if self.spec.display_name.is_empty() {
            &self.name
        } else {
            &self.spec.display_name
        }
    }
}
