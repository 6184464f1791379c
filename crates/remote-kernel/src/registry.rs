//! Local kernelspec registry.
//!
//! The host's registry caches its listing; a spec written to disk after the
//! last refresh is invisible until `refresh()` runs again. That staleness is
//! deliberate here too, so [`crate::sync`] exercises the same lag it will see
//! against a real host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::RwLock;

use crate::kernelspec::{KernelSpecDescriptor, KernelSpecFile};
use crate::mirror::KernelspecMirror;

/// Enumerates kernelspecs known to the host application.
#[async_trait]
pub trait KernelSpecRegistry: Send + Sync {
    /// Re-enumerate kernelspecs so later `list()` calls see server-side changes.
    async fn refresh(&self) -> anyhow::Result<()>;

    /// The listing as of the last refresh.
    async fn list(&self) -> anyhow::Result<BTreeMap<String, KernelSpecDescriptor>>;
}

/// Registry over one or more kernel directories on disk.
pub struct LocalKernelSpecRegistry {
    dirs: Vec<PathBuf>,
    mirror: Option<Arc<KernelspecMirror>>,
    cache: RwLock<BTreeMap<String, KernelSpecDescriptor>>,
}

impl LocalKernelSpecRegistry {
    /// Create a registry scanning the given kernel directories.
    ///
    /// Earlier directories win when two contain a spec with the same name.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            mirror: None,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    /// Pull from the control plane before every rescan.
    pub fn with_mirror(mut self, mirror: Arc<KernelspecMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }
}

#[async_trait]
impl KernelSpecRegistry for LocalKernelSpecRegistry {
    async fn refresh(&self) -> anyhow::Result<()> {
        if let Some(mirror) = &self.mirror {
            // A failed pull only delays visibility; the synchronizer handles that
            if let Err(e) = mirror.sync_once().await {
                warn!("[registry] Mirror pull failed: {}", e);
            }
        }

        let mut listing = BTreeMap::new();
        for dir in &self.dirs {
            let found = match scan_kernels_dir(dir).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("[registry] Skipping {}: {}", dir.display(), e);
                    continue;
                }
            };
            for descriptor in found {
                listing.entry(descriptor.name.clone()).or_insert(descriptor);
            }
        }

        debug!("[registry] Refreshed: {} kernelspec(s)", listing.len());
        *self.cache.write().await = listing;
        Ok(())
    }

    async fn list(&self) -> anyhow::Result<BTreeMap<String, KernelSpecDescriptor>> {
        Ok(self.cache.read().await.clone())
    }
}

/// Read every `<dir>/<name>/kernel.json` below a kernels directory.
///
/// A missing directory yields nothing. Unparseable specs are skipped with a
/// warning rather than failing the whole scan.
pub async fn scan_kernels_dir(dir: &Path) -> anyhow::Result<Vec<KernelSpecDescriptor>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let resource_dir = entry.path();
        let spec_path = resource_dir.join("kernel.json");
        let contents = match tokio::fs::read_to_string(&spec_path).await {
            Ok(c) => c,
            Err(_) => continue,
        };
        let spec: KernelSpecFile = match serde_json::from_str(&contents) {
            Ok(spec) => spec,
            Err(e) => {
                warn!("[registry] Skipping {}: {}", spec_path.display(), e);
                continue;
            }
        };
        let name = entry.file_name().to_string_lossy().to_string();
        found.push(KernelSpecDescriptor {
            name,
            resource_dir: Some(resource_dir),
            spec,
        });
    }
    Ok(found)
}

/// Write a kernelspec to `<dir>/<name>/kernel.json`.
///
/// Returns `false` without touching the file when its content is unchanged.
pub async fn write_kernelspec(
    dir: &Path,
    name: &str,
    spec: &serde_json::Value,
) -> anyhow::Result<bool> {
    let resource_dir = dir.join(name);
    let spec_path = resource_dir.join("kernel.json");

    if let Ok(existing) = tokio::fs::read_to_string(&spec_path).await {
        if let Ok(existing) = serde_json::from_str::<serde_json::Value>(&existing) {
            if &existing == spec {
                return Ok(false);
            }
        }
    }

    tokio::fs::create_dir_all(&resource_dir).await?;
    let json = serde_json::to_string_pretty(spec)?;
    tokio::fs::write(&spec_path, format!("{json}\n")).await?;
    Ok(true)
}
