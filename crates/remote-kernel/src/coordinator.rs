//! Launch orchestration.
//!
//! A launch moves through
//! `Idle → AwaitingSpecList → AwaitingCreate → AwaitingSync → AwaitingAttach → Done`,
//! with `Failed` reachable from every awaiting state and `Cancelled` from
//! every state before `AwaitingAttach`.
//!
//! [`transition`] is the whole state machine: it takes a state and an event
//! and returns the next state plus the effects to run. [`Launch`] runs those
//! effects against real collaborators and feeds their results back in.
//! Each launch owns its state; concurrent launches share only the
//! collaborators behind [`LaunchCoordinator`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::watch;
use uuid::Uuid;

use crate::attach::{AttachError, DocumentHandle, NotebookSession, SessionAttacher};
use crate::client::{ClientError, KernelSpecClient};
use crate::error::{ErrorKind, LaunchFailure};
use crate::launch::{LaunchRequest, Offerings};
use crate::sync::{SpecSynchronizer, SyncError, SyncOutcome};

/// Where the new kernel ends up.
#[derive(Clone)]
pub enum LaunchTarget {
    /// Create an untitled notebook at or near `path_hint` and attach there.
    NewDocument { path_hint: PathBuf },
    /// Switch an already-open session.
    ExistingSession(Arc<dyn NotebookSession>),
}

impl fmt::Debug for LaunchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchTarget::NewDocument { path_hint } => f
                .debug_struct("NewDocument")
                .field("path_hint", path_hint)
                .finish(),
            LaunchTarget::ExistingSession(session) => f
                .debug_tuple("ExistingSession")
                .field(&session.id())
                .finish(),
        }
    }
}

#[derive(Debug)]
pub enum LaunchState {
    Idle,
    /// Offerings requested; `offerings` is filled in once they arrive.
    AwaitingSpecList {
        offerings: Option<Offerings>,
    },
    AwaitingCreate {
        target: LaunchTarget,
    },
    AwaitingSync {
        name: String,
        target: LaunchTarget,
    },
    AwaitingAttach {
        name: String,
        target: LaunchTarget,
    },
    Done {
        name: String,
        /// Present when the launch created a new notebook.
        document: Option<DocumentHandle>,
    },
    Failed(Arc<LaunchFailure>),
    Cancelled,
}

impl LaunchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LaunchState::Done { .. } | LaunchState::Failed(_) | LaunchState::Cancelled
        )
    }

    /// Whether a cancel request would still be honored.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            LaunchState::Idle
                | LaunchState::AwaitingSpecList { .. }
                | LaunchState::AwaitingCreate { .. }
                | LaunchState::AwaitingSync { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            LaunchState::Idle => "idle",
            LaunchState::AwaitingSpecList { .. } => "awaiting-spec-list",
            LaunchState::AwaitingCreate { .. } => "awaiting-create",
            LaunchState::AwaitingSync { .. } => "awaiting-sync",
            LaunchState::AwaitingAttach { .. } => "awaiting-attach",
            LaunchState::Done { .. } => "done",
            LaunchState::Failed(_) => "failed",
            LaunchState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub enum LaunchEvent {
    /// The user opened the launch dialog.
    DialogOpened { user: String },
    OfferingsListed(Offerings),
    OfferingsFailed(ClientError),
    /// The user submitted a populated request.
    Submitted {
        request: LaunchRequest,
        target: LaunchTarget,
    },
    SpecCreated { name: String },
    CreateFailed(ClientError),
    Synchronized(SyncOutcome),
    SyncFailed(SyncError),
    Attached {
        document: Option<DocumentHandle>,
    },
    AttachFailed(AttachError),
    Cancel,
}

/// Work requested by a transition.
#[derive(Debug)]
pub enum Effect {
    ListOfferings { user: String },
    CreateSpec {
        request: LaunchRequest,
    },
    WaitUntilVisible {
        name: String,
    },
    Attach {
        name: String,
        target: LaunchTarget,
    },
}

fn failed(failure: impl Into<LaunchFailure>) -> (LaunchState, Vec<Effect>) {
    (LaunchState::Failed(Arc::new(failure.into())), Vec::new())
}

/// Advance a launch by one event.
///
/// Events that do not apply to the current state leave it unchanged and
/// request nothing. Terminal states absorb every event.
pub fn transition(state: LaunchState, event: LaunchEvent) -> (LaunchState, Vec<Effect>) {
    use LaunchEvent as E;
    use LaunchState as S;

    match (state, event) {
        (S::Idle, E::DialogOpened { user }) => (
            S::AwaitingSpecList { offerings: None },
            vec![Effect::ListOfferings { user }],
        ),

        (S::AwaitingSpecList { offerings: None }, E::OfferingsListed(offerings)) => (
            S::AwaitingSpecList {
                offerings: Some(offerings),
            },
            Vec::new(),
        ),
        (S::AwaitingSpecList { offerings: None }, E::OfferingsFailed(e)) => failed(e),
        (
            S::AwaitingSpecList {
                offerings: Some(offerings),
            },
            E::Submitted { request, target },
        ) => match request.validate(&offerings) {
            Ok(()) => (
                S::AwaitingCreate { target },
                vec![Effect::CreateSpec { request }],
            ),
            Err(e) => failed(e),
        },

        (S::AwaitingCreate { target }, E::SpecCreated { name }) => (
            S::AwaitingSync {
                name: name.clone(),
                target,
            },
            vec![Effect::WaitUntilVisible { name }],
        ),
        (S::AwaitingCreate { .. }, E::CreateFailed(e)) => failed(e),

        (S::AwaitingSync { name, target }, E::Synchronized(_)) => (
            S::AwaitingAttach {
                name: name.clone(),
                target: target.clone(),
            },
            vec![Effect::Attach { name, target }],
        ),
        (S::AwaitingSync { .. }, E::SyncFailed(e)) => failed(e),

        (S::AwaitingAttach { name, .. }, E::Attached { document }) => {
            (S::Done { name, document }, Vec::new())
        }
        (S::AwaitingAttach { .. }, E::AttachFailed(e)) => failed(e),

        (state, E::Cancel) if state.is_cancellable() => (S::Cancelled, Vec::new()),

        (state, event) => {
            debug!(
                "[launch] Ignoring {} in state {}",
                event_label(&event),
                state.label()
            );
            (state, Vec::new())
        }
    }
}

fn event_label(event: &LaunchEvent) -> &'static str {
    match event {
        LaunchEvent::DialogOpened { .. } => "dialog-opened",
        LaunchEvent::OfferingsListed(_) => "offerings-listed",
        LaunchEvent::OfferingsFailed(_) => "offerings-failed",
        LaunchEvent::Submitted { .. } => "submitted",
        LaunchEvent::SpecCreated { .. } => "spec-created",
        LaunchEvent::CreateFailed(_) => "create-failed",
        LaunchEvent::Synchronized(_) => "synchronized",
        LaunchEvent::SyncFailed(_) => "sync-failed",
        LaunchEvent::Attached { .. } => "attached",
        LaunchEvent::AttachFailed(_) => "attach-failed",
        LaunchEvent::Cancel => "cancel",
    }
}

// ── Cancellation ─────────────────────────────────────────────────────

/// Shared flag for abandoning a launch (dialog dismissed, Ctrl-C).
///
/// Clones observe the same flag. Cancellation is only honored before
/// attachment starts.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelHandle::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ── Driver ───────────────────────────────────────────────────────────

/// A launch that ended without an attached kernel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LaunchError {
    #[error("Launch {launch_id} failed ({}): {failure}", .failure.kind())]
    Failed {
        launch_id: Uuid,
        failure: Arc<LaunchFailure>,
    },

    #[error("Launch {launch_id} was cancelled")]
    Cancelled { launch_id: Uuid },

    /// The caller drove the launch out of order (e.g. submitted twice).
    #[error("Launch {launch_id} cannot {action} while {state}")]
    InvalidState {
        launch_id: Uuid,
        action: &'static str,
        state: &'static str,
    },
}

impl LaunchError {
    /// The failure kind, if the launch failed rather than being abandoned.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            LaunchError::Failed { failure, .. } => Some(failure.kind()),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LaunchError::Failed { failure, .. } if failure.is_retryable())
    }
}

/// A launch that reached `Done`.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub launch_id: Uuid,
    pub spec_name: String,
    pub document: Option<DocumentHandle>,
}

/// Shared collaborators for launches.
#[derive(Clone)]
pub struct LaunchCoordinator {
    client: Arc<dyn KernelSpecClient>,
    synchronizer: SpecSynchronizer,
    attacher: SessionAttacher,
}

impl LaunchCoordinator {
    pub fn new(
        client: Arc<dyn KernelSpecClient>,
        synchronizer: SpecSynchronizer,
        attacher: SessionAttacher,
    ) -> Self {
        Self {
            client,
            synchronizer,
            attacher,
        }
    }

    /// Start a new launch with its own id and state.
    pub fn begin(&self, cancel: CancelHandle) -> Launch {
        Launch {
            id: Uuid::new_v4(),
            state: LaunchState::Idle,
            coordinator: self.clone(),
            cancel,
        }
    }

    /// List offerings for `user`, then create, sync, and attach `request`.
    pub async fn launch(
        &self,
        user: &str,
        request: LaunchRequest,
        target: LaunchTarget,
        cancel: CancelHandle,
    ) -> Result<LaunchOutcome, LaunchError> {
        let mut launch = self.begin(cancel);
        launch.open(user).await?;
        launch.submit(request, target).await
    }
}

/// One launch request in flight.
pub struct Launch {
    id: Uuid,
    state: LaunchState,
    coordinator: LaunchCoordinator,
    cancel: CancelHandle,
}

impl Launch {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &LaunchState {
        &self.state
    }

    /// Fetch the offerings the user picks from.
    pub async fn open(&mut self, user: &str) -> Result<Offerings, LaunchError> {
        if !matches!(self.state, LaunchState::Idle) {
            return Err(self.invalid("open"));
        }
        self.drive(LaunchEvent::DialogOpened {
            user: user.to_string(),
        })
        .await;

        match &self.state {
            LaunchState::AwaitingSpecList {
                offerings: Some(offerings),
            } => Ok(offerings.clone()),
            _ => Err(self.terminal_error()),
        }
    }

    /// Submit a populated request and run the launch to completion.
    pub async fn submit(
        &mut self,
        request: LaunchRequest,
        target: LaunchTarget,
    ) -> Result<LaunchOutcome, LaunchError> {
        if !matches!(
            self.state,
            LaunchState::AwaitingSpecList { offerings: Some(_) }
        ) {
            return Err(self.invalid("submit"));
        }
        info!(
            "[launch:{}] Submitting {} in {}",
            self.id, request.cluster, request.workdir
        );
        self.drive(LaunchEvent::Submitted { request, target }).await;

        match &self.state {
            LaunchState::Done { name, document } => Ok(LaunchOutcome {
                launch_id: self.id,
                spec_name: name.clone(),
                document: document.clone(),
            }),
            _ => Err(self.terminal_error()),
        }
    }

    /// Abandon the launch if it has not started attaching.
    ///
    /// A launch that already ended keeps its outcome.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.cancel.cancel();
        let state = std::mem::replace(&mut self.state, LaunchState::Idle);
        let (next, _) = transition(state, LaunchEvent::Cancel);
        self.state = next;
    }

    async fn drive(&mut self, event: LaunchEvent) {
        let mut pending = vec![event];
        while let Some(event) = pending.pop() {
            let from = self.state.label();
            let state = std::mem::replace(&mut self.state, LaunchState::Idle);
            let (next, effects) = transition(state, event);
            self.state = next;
            if self.state.label() != from {
                debug!("[launch:{}] {} -> {}", self.id, from, self.state.label());
            }
            if let LaunchState::Failed(failure) = &self.state {
                error!(
                    "[launch:{}] Failed ({}): {}",
                    self.id,
                    failure.kind(),
                    failure
                );
            }
            for effect in effects {
                pending.push(self.run_effect(effect).await);
            }
        }
    }

    async fn run_effect(&self, effect: Effect) -> LaunchEvent {
        let coordinator = &self.coordinator;
        match effect {
            Effect::ListOfferings { user } => {
                self.cancellable(async {
                    match coordinator.client.list_offerings(&user).await {
                        Ok(offerings) => LaunchEvent::OfferingsListed(offerings),
                        Err(e) => LaunchEvent::OfferingsFailed(e),
                    }
                })
                .await
            }
            Effect::CreateSpec { request } => {
                self.cancellable(async {
                    match coordinator.client.create_spec(&request).await {
                        Ok(name) => {
                            info!("[launch:{}] Created kernelspec {}", self.id, name);
                            LaunchEvent::SpecCreated { name }
                        }
                        Err(e) => LaunchEvent::CreateFailed(e),
                    }
                })
                .await
            }
            Effect::WaitUntilVisible { name } => {
                self.cancellable(async {
                    match coordinator.synchronizer.wait_until_visible(&name).await {
                        Ok(outcome) => LaunchEvent::Synchronized(outcome),
                        Err(e) => LaunchEvent::SyncFailed(e),
                    }
                })
                .await
            }
            // Not cancellable: a half-detached session is worse than a late one.
            Effect::Attach { name, target } => {
                let result = match &target {
                    LaunchTarget::ExistingSession(session) => coordinator
                        .attacher
                        .attach_to_existing(session.as_ref(), &name)
                        .await
                        .map(|()| None),
                    LaunchTarget::NewDocument { path_hint } => coordinator
                        .attacher
                        .create_and_attach(path_hint, &name)
                        .await
                        .map(Some),
                };
                match result {
                    Ok(document) => LaunchEvent::Attached { document },
                    Err(e) => LaunchEvent::AttachFailed(e),
                }
            }
        }
    }

    async fn cancellable<F>(&self, step: F) -> LaunchEvent
    where
        F: std::future::Future<Output = LaunchEvent>,
    {
        if self.cancel.is_cancelled() {
            return LaunchEvent::Cancel;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!("[launch:{}] Cancelled", self.id);
                LaunchEvent::Cancel
            }
            event = step => event,
        }
    }

    fn terminal_error(&self) -> LaunchError {
        match &self.state {
            LaunchState::Failed(failure) => LaunchError::Failed {
                launch_id: self.id,
                failure: failure.clone(),
            },
            LaunchState::Cancelled => LaunchError::Cancelled { launch_id: self.id },
            other => LaunchError::InvalidState {
                launch_id: self.id,
                action: "finish",
                state: other.label(),
            },
        }
    }

    fn invalid(&self, action: &'static str) -> LaunchError {
        match &self.state {
            LaunchState::Failed(_) | LaunchState::Cancelled => self.terminal_error(),
            other => LaunchError::InvalidState {
                launch_id: self.id,
                action,
                state: other.label(),
            },
        }
    }
}
