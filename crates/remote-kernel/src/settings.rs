//! Settings for remote kernel launches.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/runt-remote/settings.json
//! - Linux: ~/.config/runt-remote/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\runt-remote\settings.json
//!
//! Every field has a default, so a partial file is fine. `RUNT_REMOTE_GATEWAY_URL`
//! and `RUNT_REMOTE_USER` override the file.

use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

/// Error type for reading and writing the settings file.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// How the delay between registry polls grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Constant,
    Exponential,
}

/// Registry synchronization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Registry refreshes before giving up on a new spec.
    pub max_attempts: u32,
    /// Delay after a miss (first delay for exponential backoff).
    pub delay_ms: u64,
    pub backoff: BackoffKind,
    /// Upper bound for exponential backoff.
    pub max_delay_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 1000,
            backoff: BackoffKind::Constant,
            max_delay_ms: 8000,
        }
    }
}

/// Remote kernel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteKernelSettings {
    /// Base URL of the kernelspec control plane.
    pub gateway_url: String,

    /// User identity sent to the control plane. Falls back to `$USER`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Cluster preselected in the launch form when it is offered.
    pub default_cluster: String,

    /// Kernel language sent on create.
    pub language: String,

    /// Directory the local registry scans and the mirror writes to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernels_dir: Option<PathBuf>,

    pub request_timeout_secs: u64,

    pub sync: SyncSettings,

    /// Seconds between mirror passes.
    pub mirror_interval_secs: u64,
}

impl Default for RemoteKernelSettings {
    fn default() -> Self {
        Self {
            gateway_url: "http://localhost:5000".to_string(),
            username: None,
            default_cluster: "gkeyll".to_string(),
            language: "python".to_string(),
            kernels_dir: None,
            request_timeout_secs: 30,
            sync: SyncSettings::default(),
            mirror_interval_secs: 5,
        }
    }
}

impl RemoteKernelSettings {
    /// The user identity to present to the control plane.
    pub fn username(&self) -> String {
        self.username
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_default()
    }

    /// The kernels directory, defaulting to the Jupyter user data dir.
    pub fn kernels_dir(&self) -> PathBuf {
        self.kernels_dir
            .clone()
            .unwrap_or_else(crate::default_kernels_dir)
    }

    /// Apply `RUNT_REMOTE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RUNT_REMOTE_GATEWAY_URL") {
            if !url.is_empty() {
                self.gateway_url = url;
            }
        }
        if let Ok(user) = std::env::var("RUNT_REMOTE_USER") {
            if !user.is_empty() {
                self.username = Some(user);
            }
        }
    }
}

/// Load settings from a specific file.
pub fn load_settings_from(path: &Path) -> Result<RemoteKernelSettings, SettingsError> {
    let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load settings from disk, returning defaults if the file is missing or
/// unreadable. Environment overrides are applied either way.
pub fn load_settings() -> RemoteKernelSettings {
    let path = crate::settings_json_path();
    let mut settings = if path.exists() {
        load_settings_from(&path).unwrap_or_else(|e| {
            warn!("[settings] {}; using defaults", e);
            RemoteKernelSettings::default()
        })
    } else {
        RemoteKernelSettings::default()
    };
    settings.apply_env_overrides();
    settings
}

/// Save settings to a specific file, creating its directory.
pub fn save_settings_to(settings: &RemoteKernelSettings, path: &Path) -> Result<(), SettingsError> {
    let io_err = |source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, format!("{json}\n")).map_err(io_err)
}

/// Save settings to the default location.
pub fn save_settings(settings: &RemoteKernelSettings) -> Result<(), SettingsError> {
    save_settings_to(settings, &crate::settings_json_path())
}
