//! Binding a kernel spec to a notebook session.
//!
//! The host's session abstraction does not support an atomic kernel
//! replace: switching while a kernel is bound is order-sensitive and can
//! silently no-op. Every attach is therefore two calls, detach (`{}`) and
//! then attach (`{name}`), even when nothing is currently bound.
//!
//! Two launches attaching to the same session must be serialized by the
//! caller. Interleaved detach/attach pairs leave the session in whatever
//! state the last call produced.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Argument to [`NotebookSession::change_kernel`].
///
/// Serializes to `{}` for [`KernelChoice::NoKernel`] and `{"name": ...}`
/// for [`KernelChoice::Named`], matching the host's `changeKernel` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelChoice {
    NoKernel,
    Named(String),
}

impl KernelChoice {
    pub fn named(name: impl Into<String>) -> Self {
        KernelChoice::Named(name.into())
    }
}

impl Serialize for KernelChoice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let KernelChoice::Named(name) = self {
            map.serialize_entry("name", name)?;
        }
        map.end()
    }
}

/// A host notebook session.
#[async_trait]
pub trait NotebookSession: Send + Sync {
    /// Opaque session handle, used in logs and errors.
    fn id(&self) -> String;

    async fn change_kernel(&self, choice: KernelChoice) -> anyhow::Result<()>;
}

/// The host's document/workspace layer.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Create a new untitled notebook at or near `path_hint`; returns its path.
    async fn create_untitled(&self, path_hint: &Path) -> anyhow::Result<PathBuf>;

    /// Open a notebook and return its session.
    async fn open(&self, path: &Path) -> anyhow::Result<Arc<dyn NotebookSession>>;
}

/// Which half of the two-step bind failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStep {
    Detach,
    Attach,
}

impl fmt::Display for BindStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindStep::Detach => write!(f, "detach"),
            BindStep::Attach => write!(f, "attach"),
        }
    }
}

/// Where a create-and-attach failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStage {
    CreateDocument,
    OpenDocument,
    /// The document exists; only the bind failed and may be retried alone.
    Attach,
}

impl fmt::Display for CreationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreationStage::CreateDocument => write!(f, "creating the document"),
            CreationStage::OpenDocument => write!(f, "opening the document"),
            CreationStage::Attach => write!(f, "attaching the kernel"),
        }
    }
}

/// Error type for session attachment.
///
/// After a failure the session's kernel state is unspecified; nothing here
/// tries to restore the previous kernel.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("Failed to {step} kernel {spec_name} on session {session}: {source}")]
    AttachFailed {
        session: String,
        spec_name: String,
        step: BindStep,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed while {stage} at {}: {source}", .path.display())]
    CreationFailed {
        stage: CreationStage,
        /// The path hint, or the created document once it exists.
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// A document created by [`SessionAttacher::create_and_attach`].
#[derive(Clone)]
pub struct DocumentHandle {
    pub path: PathBuf,
    pub session: Arc<dyn NotebookSession>,
}

impl fmt::Debug for DocumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentHandle")
            .field("path", &self.path)
            .field("session", &self.session.id())
            .finish()
    }
}

/// Attaches resolved kernel spec names to sessions.
#[derive(Clone)]
pub struct SessionAttacher {
    workspace: Arc<dyn Workspace>,
}

impl SessionAttacher {
    pub fn new(workspace: Arc<dyn Workspace>) -> Self {
        Self { workspace }
    }

    /// Detach, then attach `spec_name`, unconditionally in that order.
    pub async fn attach_to_existing(
        &self,
        session: &dyn NotebookSession,
        spec_name: &str,
    ) -> Result<(), AttachError> {
        let session_id = session.id();
        let failed = |step: BindStep, source: anyhow::Error| AttachError::AttachFailed {
            session: session_id.clone(),
            spec_name: spec_name.to_string(),
            step,
            source,
        };

        session
            .change_kernel(KernelChoice::NoKernel)
            .await
            .map_err(|e| failed(BindStep::Detach, e))?;
        session
            .change_kernel(KernelChoice::named(spec_name))
            .await
            .map_err(|e| failed(BindStep::Attach, e))?;

        info!("[attach] Session {} now uses {}", session_id, spec_name);
        Ok(())
    }

    /// Create an untitled notebook near `path_hint`, open it, and attach.
    pub async fn create_and_attach(
        &self,
        path_hint: &Path,
        spec_name: &str,
    ) -> Result<DocumentHandle, AttachError> {
        let path = self
            .workspace
            .create_untitled(path_hint)
            .await
            .map_err(|source| AttachError::CreationFailed {
                stage: CreationStage::CreateDocument,
                path: path_hint.to_path_buf(),
                source,
            })?;

        let session = self
            .workspace
            .open(&path)
            .await
            .map_err(|source| AttachError::CreationFailed {
                stage: CreationStage::OpenDocument,
                path: path.clone(),
                source,
            })?;

        if let Err(e) = self.attach_to_existing(session.as_ref(), spec_name).await {
            warn!(
                "[attach] Created {} but could not attach {}",
                path.display(),
                spec_name
            );
            return Err(AttachError::CreationFailed {
                stage: CreationStage::Attach,
                path,
                source: e.into(),
            });
        }

        Ok(DocumentHandle { path, session })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Session that records every change_kernel call.
    struct RecordingSession {
        calls: Mutex<Vec<KernelChoice>>,
        fail_on: Option<BindStep>,
    }

    impl RecordingSession {
        fn new(fail_on: Option<BindStep>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_on,
            })
        }

        fn calls(&self) -> Vec<KernelChoice> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotebookSession for RecordingSession {
        fn id(&self) -> String {
            "session-1".to_string()
        }

        async fn change_kernel(&self, choice: KernelChoice) -> anyhow::Result<()> {
            let step = match &choice {
                KernelChoice::NoKernel => BindStep::Detach,
                KernelChoice::Named(_) => BindStep::Attach,
            };
            self.calls.lock().unwrap().push(choice);
            if self.fail_on == Some(step) {
                anyhow::bail!("session refused {step}");
            }
            Ok(())
        }
    }

    struct FakeWorkspace {
        session: Arc<RecordingSession>,
        fail_create: bool,
    }

    #[async_trait]
    impl Workspace for FakeWorkspace {
        async fn create_untitled(&self, path_hint: &Path) -> anyhow::Result<PathBuf> {
            if self.fail_create {
                anyhow::bail!("read-only directory");
            }
            Ok(path_hint.join("Untitled.ipynb"))
        }

        async fn open(&self, _path: &Path) -> anyhow::Result<Arc<dyn NotebookSession>> {
            Ok(self.session.clone())
        }
    }

    fn attacher(session: Arc<RecordingSession>, fail_create: bool) -> SessionAttacher {
        SessionAttacher::new(Arc::new(FakeWorkspace {
            session,
            fail_create,
        }))
    }

    #[test]
    fn test_kernel_choice_payloads() {
        assert_eq!(
            serde_json::to_value(KernelChoice::NoKernel).unwrap(),
            serde_json::json!({})
        );
        assert_eq!(
            serde_json::to_value(KernelChoice::named("k-7f3a")).unwrap(),
            serde_json::json!({"name": "k-7f3a"})
        );
    }

    #[tokio::test]
    async fn test_detach_then_attach() {
        let session = RecordingSession::new(None);
        attacher(session.clone(), false)
            .attach_to_existing(session.as_ref(), "k-7f3a")
            .await
            .unwrap();

        assert_eq!(
            session.calls(),
            vec![KernelChoice::NoKernel, KernelChoice::named("k-7f3a")]
        );
    }

    #[tokio::test]
    async fn test_detach_failure_skips_attach() {
        let session = RecordingSession::new(Some(BindStep::Detach));
        let err = attacher(session.clone(), false)
            .attach_to_existing(session.as_ref(), "k-7f3a")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AttachError::AttachFailed {
                step: BindStep::Detach,
                ..
            }
        ));
        assert_eq!(session.calls(), vec![KernelChoice::NoKernel]);
    }

    #[tokio::test]
    async fn test_create_and_attach() {
        let session = RecordingSession::new(None);
        let handle = attacher(session.clone(), false)
            .create_and_attach(Path::new("/work"), "k-7f3a")
            .await
            .unwrap();

        assert_eq!(handle.path, PathBuf::from("/work/Untitled.ipynb"));
        assert_eq!(session.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_creation_errors_are_distinguished() {
        let session = RecordingSession::new(None);
        let err = attacher(session.clone(), true)
            .create_and_attach(Path::new("/work"), "k-7f3a")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AttachError::CreationFailed {
                stage: CreationStage::CreateDocument,
                ..
            }
        ));
        assert!(session.calls().is_empty());

        let session = RecordingSession::new(Some(BindStep::Attach));
        let err = attacher(session.clone(), false)
            .create_and_attach(Path::new("/work"), "k-7f3a")
            .await
            .unwrap_err();
        match err {
            AttachError::CreationFailed { stage, path, .. } => {
                assert_eq!(stage, CreationStage::Attach);
                assert_eq!(path, PathBuf::from("/work/Untitled.ipynb"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
