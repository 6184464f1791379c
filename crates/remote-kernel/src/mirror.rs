//! Kernelspec mirror.
//!
//! Periodically copies the kernelspecs the control plane lists for a user
//! into a local kernels directory, where the Jupyter registry (and
//! [`crate::registry::LocalKernelSpecRegistry`]) can find them. A new spec
//! created remotely becomes locally visible after the next mirror pass plus
//! the next registry refresh.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;

use crate::client::HttpKernelSpecClient;
use crate::registry::write_kernelspec;

/// Result of one mirror pass.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorReport {
    /// Specs written because they were new or changed.
    pub written: usize,
    pub unchanged: usize,
    /// Entries skipped for an unusable name or shape.
    pub skipped: usize,
    pub synced_at: DateTime<Utc>,
}

/// Mirrors a user's remote kernelspecs into a kernels directory.
pub struct KernelspecMirror {
    client: HttpKernelSpecClient,
    user: String,
    kernels_dir: PathBuf,
}

impl KernelspecMirror {
    pub fn new(
        client: HttpKernelSpecClient,
        user: impl Into<String>,
        kernels_dir: PathBuf,
    ) -> Self {
        Self {
            client,
            user: user.into(),
            kernels_dir,
        }
    }

    pub fn kernels_dir(&self) -> &Path {
        &self.kernels_dir
    }

    /// Fetch the listing once and write every entry to disk.
    pub async fn sync_once(&self) -> anyhow::Result<MirrorReport> {
        let listing = self.client.fetch_listing(&self.user).await?;

        let mut report = MirrorReport {
            written: 0,
            unchanged: 0,
            skipped: 0,
            synced_at: Utc::now(),
        };

        for (name, mut spec) in listing {
            if !is_safe_kernel_name(&name) {
                warn!("[mirror] Skipping kernelspec with unusable name {:?}", name);
                report.skipped += 1;
                continue;
            }
            let Some(obj) = spec.as_object_mut() else {
                warn!("[mirror] Skipping {}: kernelspec is not an object", name);
                report.skipped += 1;
                continue;
            };
            let has_display_name = obj
                .get("display_name")
                .and_then(Value::as_str)
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            if !has_display_name {
                obj.insert("display_name".to_string(), Value::String(name.clone()));
            }

            match write_kernelspec(&self.kernels_dir, &name, &spec).await {
                Ok(true) => {
                    debug!("[mirror] Wrote {}", name);
                    report.written += 1;
                }
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    warn!("[mirror] Failed to write {}: {}", name, e);
                    report.skipped += 1;
                }
            }
        }

        info!(
            "[mirror] Synced {} kernelspec(s) to {} ({} written, {} unchanged, {} skipped)",
            report.written + report.unchanged,
            self.kernels_dir.display(),
            report.written,
            report.unchanged,
            report.skipped
        );
        Ok(report)
    }

    /// Run mirror passes every `interval` until `shutdown` is notified.
    ///
    /// A failed pass is logged and retried on the next tick.
    pub async fn run(&self, interval: Duration, shutdown: Arc<Notify>) {
        info!(
            "[mirror] Mirroring kernelspecs for {} every {:?}",
            self.user, interval
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!("[mirror] Error getting kernels: {}", e);
                    }
                }
                _ = shutdown.notified() => {
                    info!("[mirror] Shutting down");
                    break;
                }
            }
        }
    }
}

/// A kernelspec name usable as a single directory component.
fn is_safe_kernel_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_kernel_names() {
        assert!(is_safe_kernel_name("gkeyll"));
        assert!(is_safe_kernel_name("k-7f3a"));
        assert!(!is_safe_kernel_name(""));
        assert!(!is_safe_kernel_name(".."));
        assert!(!is_safe_kernel_name("../etc"));
        assert!(!is_safe_kernel_name("a\\b"));
    }
}
