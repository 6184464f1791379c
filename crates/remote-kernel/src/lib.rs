//! remote-kernel - Provision kernels on remote clusters and attach notebooks to them.
//!
//! A launch turns user intent (cluster, working directory, executable path,
//! user scripts, resource values) into a kernel spec registered with the
//! remote control plane, waits until that spec shows up in the local
//! kernelspec registry, and then binds a notebook session to it.
//!
//! Kernel-spec creation and registry refresh lag independently of each
//! other, so the only bounded wait in the whole flow lives in [`sync`].
//! Everything the host application owns (sessions, documents, dialogs) is
//! reached through the capability traits in [`attach`] and [`commands`].

use std::path::PathBuf;

pub mod attach;
pub mod client;
pub mod commands;
pub mod coordinator;
pub mod error;
pub mod kernelspec;
pub mod launch;
pub mod mirror;
pub mod notebook_file;
pub mod registry;
pub mod settings;
pub mod sync;

pub use error::{ErrorKind, LaunchFailure};

/// Provisioner name stamped into remote kernel specs.
pub const PROVISIONER_NAME: &str = "cybershuttle";

/// Get the directory holding runt-remote configuration.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runt-remote")
}

/// Get the path to the JSON settings file.
pub fn settings_json_path() -> PathBuf {
    config_dir().join("settings.json")
}

/// Get the Jupyter user data directory.
///
/// Honors `JUPYTER_DATA_DIR`, otherwise follows the platform layout Jupyter
/// itself uses:
/// - macOS: ~/Library/Jupyter
/// - Linux: ~/.local/share/jupyter
/// - Windows: %APPDATA%\jupyter
pub fn jupyter_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("JUPYTER_DATA_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Library")
            .join("Jupyter")
    }

    #[cfg(not(target_os = "macos"))]
    {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("jupyter")
    }
}

/// Get the default directory where user kernelspecs live.
pub fn default_kernels_dir() -> PathBuf {
    jupyter_data_dir().join("kernels")
}
