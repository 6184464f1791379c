//! Host-facing commands.
//!
//! Three actions are exposed under stable ids:
//! - [`CREATE_NOTEBOOK`]: create, sync, and attach to a new notebook
//! - [`SWITCH_KERNEL`]: create, sync, and attach to the current session
//! - [`CHOOSE`]: show the offerings, collect a request, then do one of the above
//!
//! Commands never exit the process. A failure is logged with its kind and
//! returned to the host.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};

use crate::attach::NotebookSession;
use crate::coordinator::{
    CancelHandle, Launch, LaunchCoordinator, LaunchError, LaunchOutcome, LaunchTarget,
};
use crate::launch::{LaunchRequest, Offerings};

pub const CREATE_NOTEBOOK: &str = "remote-kernel:create-notebook";
pub const SWITCH_KERNEL: &str = "remote-kernel:switch-kernel";
pub const CHOOSE: &str = "remote-kernel:choose";

/// Where a chosen kernel should be attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// A new untitled notebook in the context's working directory.
    NewDocument,
    /// The context's current session.
    CurrentSession,
}

/// What the user submitted from the launch dialog.
#[derive(Debug, Clone)]
pub struct PromptAnswer {
    pub request: LaunchRequest,
    pub mode: LaunchMode,
}

/// Dialog and form that turn offerings into a launch request.
#[async_trait]
pub trait LaunchPrompt: Send + Sync {
    /// Returns `None` when the user dismisses the dialog.
    async fn prompt(
        &self,
        offerings: &Offerings,
        defaults: &LaunchRequest,
    ) -> anyhow::Result<Option<PromptAnswer>>;
}

/// Host state a command runs against.
#[derive(Clone)]
pub struct CommandContext {
    pub user: String,
    /// Where new notebooks are created.
    pub working_dir: PathBuf,
    pub current_session: Option<Arc<dyn NotebookSession>>,
    /// Use this request instead of the preferred cluster's defaults.
    pub request: Option<LaunchRequest>,
    pub cancel: CancelHandle,
}

impl CommandContext {
    pub fn new(user: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            working_dir: working_dir.into(),
            current_session: None,
            request: None,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_session(mut self, session: Arc<dyn NotebookSession>) -> Self {
        self.current_session = Some(session);
        self
    }

    pub fn with_request(mut self, request: LaunchRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("No notebook session is active")]
    NoActiveSession,

    #[error("No clusters are offered to {0}")]
    NoOfferings(String),

    #[error("Launch dialog failed: {0}")]
    Prompt(#[source] anyhow::Error),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl CommandError {
    /// Short label for structured error reports.
    pub fn kind_label(&self) -> String {
        match self {
            CommandError::UnknownCommand(_) => "unknown_command".to_string(),
            CommandError::NoActiveSession => "no_active_session".to_string(),
            CommandError::NoOfferings(_) => "no_offerings".to_string(),
            CommandError::Prompt(_) => "prompt".to_string(),
            CommandError::Launch(e) => match e.kind() {
                Some(kind) => kind.as_str().to_string(),
                None if matches!(e, LaunchError::Cancelled { .. }) => "cancelled".to_string(),
                None => "invalid_state".to_string(),
            },
        }
    }
}

/// The three remote-kernel commands.
#[derive(Clone)]
pub struct RemoteKernelCommands {
    coordinator: LaunchCoordinator,
    prompt: Arc<dyn LaunchPrompt>,
    default_cluster: String,
}

impl RemoteKernelCommands {
    pub fn new(
        coordinator: LaunchCoordinator,
        prompt: Arc<dyn LaunchPrompt>,
        default_cluster: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            prompt,
            default_cluster: default_cluster.into(),
        }
    }

    /// Run a command by id.
    ///
    /// `Ok(None)` means the user dismissed the dialog.
    pub async fn execute(
        &self,
        command_id: &str,
        ctx: CommandContext,
    ) -> Result<Option<LaunchOutcome>, CommandError> {
        let result = match command_id {
            CREATE_NOTEBOOK => self.create_with_remote_kernel(ctx).await.map(Some),
            SWITCH_KERNEL => self.switch_to_remote_kernel(ctx).await.map(Some),
            CHOOSE => self.choose_remote_kernel(ctx).await,
            other => Err(CommandError::UnknownCommand(other.to_string())),
        };

        if let Err(e) = &result {
            error!(
                "[commands] command={} kind={} detail={}",
                command_id,
                e.kind_label(),
                e
            );
        }
        result
    }

    /// Launch into a new notebook in the context's working directory.
    pub async fn create_with_remote_kernel(
        &self,
        ctx: CommandContext,
    ) -> Result<LaunchOutcome, CommandError> {
        let target = LaunchTarget::NewDocument {
            path_hint: ctx.working_dir.clone(),
        };
        self.launch_with(ctx, target).await
    }

    /// Launch and switch the context's current session to the new kernel.
    pub async fn switch_to_remote_kernel(
        &self,
        ctx: CommandContext,
    ) -> Result<LaunchOutcome, CommandError> {
        let session = ctx
            .current_session
            .clone()
            .ok_or(CommandError::NoActiveSession)?;
        self.launch_with(ctx, LaunchTarget::ExistingSession(session))
            .await
    }

    /// Prompt for a request and launch it in the chosen mode.
    pub async fn choose_remote_kernel(
        &self,
        ctx: CommandContext,
    ) -> Result<Option<LaunchOutcome>, CommandError> {
        let (mut launch, offerings) = self.open(&ctx).await?;
        let defaults = match &ctx.request {
            Some(request) => request.clone(),
            None => self.default_request(&offerings, &ctx.user)?,
        };

        let answer = match self.prompt.prompt(&offerings, &defaults).await {
            Ok(Some(answer)) => answer,
            Ok(None) => {
                info!("[commands] Launch {} dismissed", launch.id());
                launch.cancel();
                return Ok(None);
            }
            Err(e) => {
                launch.cancel();
                return Err(CommandError::Prompt(e));
            }
        };

        let target = match answer.mode {
            LaunchMode::NewDocument => LaunchTarget::NewDocument {
                path_hint: ctx.working_dir.clone(),
            },
            LaunchMode::CurrentSession => LaunchTarget::ExistingSession(
                ctx.current_session
                    .clone()
                    .ok_or(CommandError::NoActiveSession)?,
            ),
        };
        let outcome = launch.submit(answer.request, target).await?;
        Ok(Some(outcome))
    }

    async fn launch_with(
        &self,
        ctx: CommandContext,
        target: LaunchTarget,
    ) -> Result<LaunchOutcome, CommandError> {
        let (mut launch, offerings) = self.open(&ctx).await?;
        let request = match ctx.request {
            Some(request) => request,
            None => self.default_request(&offerings, &ctx.user)?,
        };
        Ok(launch.submit(request, target).await?)
    }

    async fn open(&self, ctx: &CommandContext) -> Result<(Launch, Offerings), CommandError> {
        let mut launch = self.coordinator.begin(ctx.cancel.clone());
        let offerings = launch.open(&ctx.user).await?;
        Ok((launch, offerings))
    }

    fn default_request(
        &self,
        offerings: &Offerings,
        user: &str,
    ) -> Result<LaunchRequest, CommandError> {
        offerings
            .preferred_cluster(&self.default_cluster)
            .and_then(|cluster| offerings.default_request(cluster))
            .ok_or_else(|| CommandError::NoOfferings(user.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::json;

    use crate::attach::{KernelChoice, SessionAttacher, Workspace};
    use crate::client::{ClientError, KernelSpecClient};
    use crate::error::ErrorKind;
    use crate::kernelspec::{KernelSpecDescriptor, KernelSpecFile};
    use crate::launch::ClusterOffering;
    use crate::registry::KernelSpecRegistry;
    use crate::sync::{Backoff, SpecSynchronizer, SyncPolicy};

    fn template(workdir: &str) -> KernelSpecFile {
        KernelSpecFile::from_value(json!({
            "metadata": {"kernel_provisioner": {"config": {
                "spec": {"cpus": "4"}, "workdir": workdir
            }}}
        }))
        .unwrap()
    }

    /// Offers two clusters; every created spec is immediately visible.
    #[derive(Default)]
    struct FakeBackend {
        created: Mutex<Vec<LaunchRequest>>,
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl KernelSpecClient for FakeBackend {
        async fn list_offerings(&self, _user: &str) -> Result<Offerings, ClientError> {
            Ok(Offerings::new(vec![
                ClusterOffering {
                    cluster: "anvil".into(),
                    template: template("/anvil/home"),
                },
                ClusterOffering {
                    cluster: "gkeyll".into(),
                    template: template("/gkeyll/home"),
                },
            ]))
        }

        async fn create_spec(&self, request: &LaunchRequest) -> Result<String, ClientError> {
            let mut created = self.created.lock().unwrap();
            created.push(request.clone());
            Ok(format!("k-{}", created.len()))
        }
    }

    #[async_trait]
    impl KernelSpecRegistry for FakeBackend {
        async fn refresh(&self) -> anyhow::Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn list(&self) -> anyhow::Result<BTreeMap<String, KernelSpecDescriptor>> {
            let count = self.created.lock().unwrap().len();
            Ok((1..=count)
                .map(|i| {
                    let name = format!("k-{i}");
                    let descriptor = KernelSpecDescriptor {
                        name: name.clone(),
                        resource_dir: None,
                        spec: template("/"),
                    };
                    (name, descriptor)
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeSession {
        calls: Mutex<Vec<KernelChoice>>,
    }

    #[async_trait]
    impl NotebookSession for FakeSession {
        fn id(&self) -> String {
            "current".into()
        }

        async fn change_kernel(&self, choice: KernelChoice) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(choice);
            Ok(())
        }
    }

    struct FakeWorkspace;

    #[async_trait]
    impl Workspace for FakeWorkspace {
        async fn create_untitled(&self, path_hint: &Path) -> anyhow::Result<PathBuf> {
            Ok(path_hint.join("Untitled.ipynb"))
        }

        async fn open(&self, _path: &Path) -> anyhow::Result<Arc<dyn NotebookSession>> {
            Ok(Arc::new(FakeSession::default()))
        }
    }

    /// Answers with a fixed mode after bumping the cpus, or dismisses.
    struct ScriptedPrompt {
        mode: Option<LaunchMode>,
    }

    #[async_trait]
    impl LaunchPrompt for ScriptedPrompt {
        async fn prompt(
            &self,
            _offerings: &Offerings,
            defaults: &LaunchRequest,
        ) -> anyhow::Result<Option<PromptAnswer>> {
            let Some(mode) = self.mode.clone() else {
                return Ok(None);
            };
            let mut request = defaults.clone();
            request.set_resource("cpus", "16")?;
            Ok(Some(PromptAnswer { request, mode }))
        }
    }

    fn commands(prompt_mode: Option<LaunchMode>) -> (RemoteKernelCommands, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        let synchronizer = SpecSynchronizer::new(
            backend.clone(),
            SyncPolicy {
                max_attempts: 2,
                backoff: Backoff::Constant(std::time::Duration::from_millis(1)),
            },
        );
        let coordinator = LaunchCoordinator::new(
            backend.clone(),
            synchronizer,
            SessionAttacher::new(Arc::new(FakeWorkspace)),
        );
        let commands = RemoteKernelCommands::new(
            coordinator,
            Arc::new(ScriptedPrompt { mode: prompt_mode }),
            "gkeyll",
        );
        (commands, backend)
    }

    #[tokio::test]
    async fn test_create_uses_default_cluster() {
        let (commands, backend) = commands(None);
        let outcome = commands
            .execute(CREATE_NOTEBOOK, CommandContext::new("yasith", "/work"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.spec_name, "k-1");
        assert_eq!(
            outcome.document.unwrap().path,
            PathBuf::from("/work/Untitled.ipynb")
        );
        let created = backend.created.lock().unwrap();
        assert_eq!(created[0].cluster, "gkeyll");
        assert_eq!(created[0].workdir, "/gkeyll/home");
    }

    #[tokio::test]
    async fn test_switch_requires_session() {
        let (commands, backend) = commands(None);
        let err = commands
            .execute(SWITCH_KERNEL, CommandContext::new("yasith", "/work"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NoActiveSession));
        assert!(backend.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_switch_attaches_current_session() {
        let (commands, _) = commands(None);
        let session = Arc::new(FakeSession::default());
        let ctx = CommandContext::new("yasith", "/work").with_session(session.clone());

        commands.execute(SWITCH_KERNEL, ctx).await.unwrap();
        assert_eq!(
            *session.calls.lock().unwrap(),
            vec![KernelChoice::NoKernel, KernelChoice::named("k-1")]
        );
    }

    #[tokio::test]
    async fn test_choose_dismissed_creates_nothing() {
        let (commands, backend) = commands(None);
        let outcome = commands
            .execute(CHOOSE, CommandContext::new("yasith", "/work"))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(backend.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_choose_submits_edited_request() {
        let (commands, backend) = commands(Some(LaunchMode::CurrentSession));
        let session = Arc::new(FakeSession::default());
        let ctx = CommandContext::new("yasith", "/work").with_session(session.clone());

        let outcome = commands.execute(CHOOSE, ctx).await.unwrap().unwrap();
        assert!(outcome.document.is_none());
        assert_eq!(
            backend.created.lock().unwrap()[0].resources.get("cpus"),
            Some("16")
        );
        assert_eq!(session.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let (commands, backend) = commands(None);
        let request = LaunchRequest {
            cluster: "expanse".into(),
            workdir: "/tmp".into(),
            exec_path: String::new(),
            user_scripts: String::new(),
            resources: Default::default(),
        };
        let ctx = CommandContext::new("yasith", "/work").with_request(request);

        let err = commands.execute(CREATE_NOTEBOOK, ctx).await.unwrap_err();
        match err {
            CommandError::Launch(e) => assert_eq!(e.kind(), Some(ErrorKind::RequestRejected)),
            other => panic!("unexpected error {other}"),
        }
        assert!(backend.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (commands, _) = commands(None);
        let err = commands
            .execute("remote-kernel:nope", CommandContext::new("yasith", "/work"))
            .await
            .unwrap_err();
        assert_eq!(err.kind_label(), "unknown_command");
    }
}
