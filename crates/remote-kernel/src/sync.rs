//! Waiting for a newly created kernel spec to show up locally.
//!
//! Creating a spec on the control plane and seeing it in the local registry
//! are two independently lagging systems. [`SpecSynchronizer`] bridges them
//! with a bounded refresh-and-check loop; it is the only place in a launch
//! with an intrinsic timeout. Nothing may attach to a spec name before
//! `wait_until_visible` has returned `Ok`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::registry::KernelSpecRegistry;
use crate::settings::{BackoffKind, SyncSettings};

/// Delay policy between registry polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every miss.
    Constant(Duration),
    /// Doubles from `initial` after each miss, capped at `max`.
    Exponential { initial: Duration, max: Duration },
    /// Explicit delays; the last one repeats once the list runs out.
    Sequence(Vec<Duration>),
}

impl Backoff {
    /// Delay to wait after the `attempt`-th miss (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant(delay) => *delay,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << shift).min(*max)
            }
            Backoff::Sequence(delays) => {
                let idx = (attempt.saturating_sub(1) as usize).min(delays.len().saturating_sub(1));
                delays.get(idx).copied().unwrap_or_default()
            }
        }
    }
}

/// How long and how often to poll the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for SyncPolicy {
    /// A few registry refresh cycles, one second apart.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::Constant(Duration::from_secs(1)),
        }
    }
}

impl From<&SyncSettings> for SyncPolicy {
    fn from(settings: &SyncSettings) -> Self {
        let delay = Duration::from_millis(settings.delay_ms);
        let backoff = match settings.backoff {
            BackoffKind::Constant => Backoff::Constant(delay),
            BackoffKind::Exponential => Backoff::Exponential {
                initial: delay,
                max: Duration::from_millis(settings.max_delay_ms.max(settings.delay_ms)),
            },
        };
        Self {
            max_attempts: settings.max_attempts,
            backoff,
        }
    }
}

/// One registry poll, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynchronizationAttempt {
    /// 1-based.
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// Time since the first refresh began.
    pub elapsed: Duration,
}

/// A successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The attempt on which the spec first became visible.
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Error type for synchronization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Kernel not ready: {name} was not visible after {attempts} registry refresh(es) ({elapsed:?})")]
    NotSynchronized {
        name: String,
        attempts: u32,
        elapsed: Duration,
    },
}

/// Callback invoked after every poll with whether the spec was visible.
pub type AttemptObserver = Arc<dyn Fn(&SynchronizationAttempt, bool) + Send + Sync>;

/// Polls a registry until a kernel spec name becomes visible.
#[derive(Clone)]
pub struct SpecSynchronizer {
    registry: Arc<dyn KernelSpecRegistry>,
    policy: SyncPolicy,
    observer: Option<AttemptObserver>,
}

impl SpecSynchronizer {
    pub fn new(registry: Arc<dyn KernelSpecRegistry>, policy: SyncPolicy) -> Self {
        Self {
            registry,
            policy,
            observer: None,
        }
    }

    /// Report every poll to `observer` (progress UI, tests).
    pub fn with_observer(mut self, observer: AttemptObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Wait for `name` using the configured policy.
    pub async fn wait_until_visible(&self, name: &str) -> Result<SyncOutcome, SyncError> {
        self.wait_until_visible_with(name, self.policy.max_attempts, &self.policy.backoff)
            .await
    }

    /// Refresh, check, and back off up to `max_attempts` times.
    ///
    /// Returns on the first attempt that sees `name`. A refresh or list error
    /// counts as a miss. There is no sleep after the final attempt. A
    /// `max_attempts` of zero is treated as one.
    pub async fn wait_until_visible_with(
        &self,
        name: &str,
        max_attempts: u32,
        backoff: &Backoff,
    ) -> Result<SyncOutcome, SyncError> {
        let max_attempts = max_attempts.max(1);
        let started = Instant::now();

        for attempt_number in 1..=max_attempts {
            let visible = self.poll_once(name).await;
            let attempt = SynchronizationAttempt {
                attempt_number,
                max_attempts,
                elapsed: started.elapsed(),
            };
            if let Some(observer) = &self.observer {
                observer(&attempt, visible);
            }

            if visible {
                info!(
                    "[spec-sync] {} visible on attempt {}/{} ({:?})",
                    name, attempt_number, max_attempts, attempt.elapsed
                );
                return Ok(SyncOutcome {
                    attempts: attempt_number,
                    elapsed: attempt.elapsed,
                });
            }

            if attempt_number < max_attempts {
                let delay = backoff.delay_after(attempt_number);
                debug!(
                    "[spec-sync] {} not visible yet ({}/{}), retrying in {:?}",
                    name, attempt_number, max_attempts, delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        let elapsed = started.elapsed();
        warn!(
            "[spec-sync] {} still not visible after {} attempt(s)",
            name, max_attempts
        );
        Err(SyncError::NotSynchronized {
            name: name.to_string(),
            attempts: max_attempts,
            elapsed,
        })
    }

    async fn poll_once(&self, name: &str) -> bool {
        if let Err(e) = self.registry.refresh().await {
            warn!("[spec-sync] Registry refresh failed: {}", e);
            return false;
        }
        match self.registry.list().await {
            Ok(listing) => listing.contains_key(name),
            Err(e) => {
                warn!("[spec-sync] Registry list failed: {}", e);
                false
            }
        }
    }
}
