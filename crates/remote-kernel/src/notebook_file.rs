//! `.ipynb` files on disk as a notebook host.
//!
//! A session here is just a notebook path: binding a kernel rewrites
//! `metadata.kernelspec`, and every other field of the file is preserved.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use log::info;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;

use crate::attach::{KernelChoice, NotebookSession, Workspace};
use crate::registry::KernelSpecRegistry;

const UNTITLED_STEM: &str = "Untitled";

/// An empty nbformat 4.5 notebook.
pub fn empty_notebook() -> Value {
    json!({
        "cells": [],
        "metadata": {},
        "nbformat": 4,
        "nbformat_minor": 5
    })
}

/// Workspace that creates and opens notebooks on the local filesystem.
pub struct IpynbWorkspace {
    registry: Arc<dyn KernelSpecRegistry>,
}

impl IpynbWorkspace {
    /// Kernel names are resolved against `registry` when a session attaches.
    pub fn new(registry: Arc<dyn KernelSpecRegistry>) -> Self {
        Self { registry }
    }

    pub fn session(&self, path: impl Into<PathBuf>) -> IpynbSession {
        IpynbSession {
            path: path.into(),
            registry: self.registry.clone(),
        }
    }
}

#[async_trait]
impl Workspace for IpynbWorkspace {
    /// `path_hint` is either a directory or the path of a notebook that does
    /// not exist yet. In a directory the first free `Untitled.ipynb`,
    /// `Untitled1.ipynb`, ... is used. An existing file hint falls back to
    /// the directory it lives in.
    async fn create_untitled(&self, path_hint: &Path) -> anyhow::Result<PathBuf> {
        let contents = notebook_bytes(&empty_notebook())?;

        if is_notebook_path(path_hint) && !path_hint.exists() {
            if let Some(parent) = path_hint.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            write_new(path_hint, &contents).await?;
            info!("[notebook] Created {}", path_hint.display());
            return Ok(path_hint.to_path_buf());
        }

        // An existing file names its directory
        let dir = match tokio::fs::metadata(path_hint).await {
            Ok(meta) if !meta.is_dir() => path_hint
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new(".")),
            _ => path_hint,
        };
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        for index in 0u32.. {
            let file_name = if index == 0 {
                format!("{UNTITLED_STEM}.ipynb")
            } else {
                format!("{UNTITLED_STEM}{index}.ipynb")
            };
            let path = dir.join(file_name);
            match write_new(&path, &contents).await {
                Ok(()) => {
                    info!("[notebook] Created {}", path.display());
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(anyhow!(e).context(format!("Failed to write {}", path.display())))
                }
            }
        }
        bail!("No free untitled notebook name in {}", dir.display())
    }

    async fn open(&self, path: &Path) -> anyhow::Result<Arc<dyn NotebookSession>> {
        // Fail early on a missing or unparseable file.
        read_notebook(path).await?;
        Ok(Arc::new(self.session(path)))
    }
}

/// A notebook file whose kernel is recorded in `metadata.kernelspec`.
pub struct IpynbSession {
    path: PathBuf,
    registry: Arc<dyn KernelSpecRegistry>,
}

impl IpynbSession {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The kernelspec name currently recorded in the notebook, if any.
    pub async fn kernel_name(&self) -> anyhow::Result<Option<String>> {
        let notebook = read_notebook(&self.path).await?;
        Ok(notebook
            .pointer("/metadata/kernelspec/name")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn kernelspec_entry(&self, name: &str) -> anyhow::Result<Value> {
        let listing = self.registry.list().await?;
        let descriptor = listing
            .get(name)
            .ok_or_else(|| anyhow!("No kernelspec named {name} is registered"))?;

        let mut entry = Map::new();
        entry.insert("name".into(), Value::String(name.to_string()));
        entry.insert(
            "display_name".into(),
            Value::String(descriptor.display_name().to_string()),
        );
        if let Some(language) = &descriptor.spec.language {
            entry.insert("language".into(), Value::String(language.clone()));
        }
        Ok(Value::Object(entry))
    }
}

#[async_trait]
impl NotebookSession for IpynbSession {
    fn id(&self) -> String {
        self.path.display().to_string()
    }

    async fn change_kernel(&self, choice: KernelChoice) -> anyhow::Result<()> {
        let mut notebook = read_notebook(&self.path).await?;
        let root = notebook
            .as_object_mut()
            .ok_or_else(|| anyhow!("{} is not a notebook object", self.path.display()))?;
        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        let metadata = metadata
            .as_object_mut()
            .ok_or_else(|| anyhow!("{} has non-object metadata", self.path.display()))?;

        match &choice {
            KernelChoice::NoKernel => {
                metadata.shift_remove("kernelspec");
            }
            KernelChoice::Named(name) => {
                let entry = self.kernelspec_entry(name).await?;
                metadata.insert("kernelspec".into(), entry);
            }
        }

        tokio::fs::write(&self.path, notebook_bytes(&notebook)?)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

fn is_notebook_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "ipynb")
}

async fn read_notebook(path: &Path) -> anyhow::Result<Value> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Serialize the way Jupyter does: one-space indent, trailing newline.
fn notebook_bytes(notebook: &Value) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    notebook.serialize(&mut serializer)?;
    buf.push(b'\n');
    Ok(buf)
}

async fn write_new(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{write_kernelspec, LocalKernelSpecRegistry};
    use tempfile::TempDir;

    async fn registry_with(kernels: &Path, names: &[&str]) -> Arc<LocalKernelSpecRegistry> {
        for name in names {
            write_kernelspec(
                kernels,
                name,
                &json!({"display_name": format!("Remote {name}"), "language": "python"}),
            )
            .await
            .unwrap();
        }
        let registry = Arc::new(LocalKernelSpecRegistry::new(vec![kernels.to_path_buf()]));
        registry.refresh().await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_untitled_names_increment() {
        let dir = TempDir::new().unwrap();
        let workspace = IpynbWorkspace::new(registry_with(&dir.path().join("kernels"), &[]).await);

        let first = workspace.create_untitled(dir.path()).await.unwrap();
        let second = workspace.create_untitled(dir.path()).await.unwrap();
        assert_eq!(first, dir.path().join("Untitled.ipynb"));
        assert_eq!(second, dir.path().join("Untitled1.ipynb"));

        let notebook = read_notebook(&first).await.unwrap();
        assert_eq!(notebook, empty_notebook());
    }

    #[tokio::test]
    async fn test_untitled_at_explicit_path() {
        let dir = TempDir::new().unwrap();
        let workspace = IpynbWorkspace::new(registry_with(&dir.path().join("kernels"), &[]).await);

        let hint = dir.path().join("runs/analysis.ipynb");
        let created = workspace.create_untitled(&hint).await.unwrap();
        assert_eq!(created, hint);
        assert!(hint.exists());
    }

    #[tokio::test]
    async fn test_existing_file_hint_uses_its_directory() {
        let dir = TempDir::new().unwrap();
        let workspace = IpynbWorkspace::new(registry_with(&dir.path().join("kernels"), &[]).await);

        let existing = dir.path().join("analysis.ipynb");
        std::fs::write(&existing, "{\"keep\": true}").unwrap();
        let created = workspace.create_untitled(&existing).await.unwrap();
        assert_eq!(created, dir.path().join("Untitled.ipynb"));
        assert_eq!(
            std::fs::read_to_string(&existing).unwrap(),
            "{\"keep\": true}"
        );

        let plain = dir.path().join("notes.txt");
        std::fs::write(&plain, "todo").unwrap();
        let created = workspace.create_untitled(&plain).await.unwrap();
        assert_eq!(created, dir.path().join("Untitled1.ipynb"));
    }

    #[tokio::test]
    async fn test_change_kernel_rewrites_kernelspec_only() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir.path().join("kernels"), &["k-7f3a"]).await;
        let workspace = IpynbWorkspace::new(registry);

        let path = dir.path().join("nb.ipynb");
        tokio::fs::write(
            &path,
            serde_json::to_string(&json!({
                "cells": [{"cell_type": "code", "source": "1 + 1", "metadata": {}, "outputs": []}],
                "metadata": {
                    "kernelspec": {"name": "k-0000", "display_name": "old"},
                    "language_info": {"name": "python"},
                    "title": "keep"
                },
                "nbformat": 4,
                "nbformat_minor": 5
            }))
            .unwrap(),
        )
        .await
        .unwrap();

        let session = workspace.session(&path);
        session.change_kernel(KernelChoice::NoKernel).await.unwrap();
        assert_eq!(session.kernel_name().await.unwrap(), None);
        let notebook = read_notebook(&path).await.unwrap();
        let keys: Vec<_> = notebook["metadata"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(keys, vec!["language_info", "title"]);

        session
            .change_kernel(KernelChoice::named("k-7f3a"))
            .await
            .unwrap();
        let notebook = read_notebook(&path).await.unwrap();
        assert_eq!(
            notebook["metadata"]["kernelspec"],
            json!({"name": "k-7f3a", "display_name": "Remote k-7f3a", "language": "python"})
        );
        assert_eq!(notebook["metadata"]["title"], "keep");
        assert_eq!(notebook["cells"][0]["source"], "1 + 1");
    }

    #[tokio::test]
    async fn test_unregistered_kernel_is_refused() {
        let dir = TempDir::new().unwrap();
        let workspace = IpynbWorkspace::new(registry_with(&dir.path().join("kernels"), &[]).await);
        let path = workspace.create_untitled(dir.path()).await.unwrap();
        let session = workspace.open(&path).await.unwrap();

        let err = session
            .change_kernel(KernelChoice::named("k-missing"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("k-missing"));
        assert_eq!(read_notebook(&path).await.unwrap(), empty_notebook());
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let workspace = IpynbWorkspace::new(registry_with(&dir.path().join("kernels"), &[]).await);
        assert!(workspace.open(&dir.path().join("nope.ipynb")).await.is_err());
    }
}
