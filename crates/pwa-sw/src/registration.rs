//! Service worker instances and the registration slots that hold them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
///
/// `Parsed → Installing → Installed → Activating → Activated`, with
/// `InstallFailed` as the terminal state of a failed install and `Redundant`
/// for workers that were replaced or unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Registered, install not started.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install did not complete; the worker never runs again.
    InstallFailed,
    /// Replaced by a newer worker or unregistered.
    Redundant,
}

/// A service worker instance.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Cache version this worker installs and serves from.
    pub cache_name: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            cache_name: cache_name.into(),
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        matches!(
            self.state,
            ServiceWorkerState::Redundant | ServiceWorkerState::InstallFailed
        )
    }
}

/// A service worker registration.
#[derive(Debug, Clone)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last install attempt.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Whether `url` falls under this registration's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Put `worker` in the installing slot.
    pub fn begin_install(&mut self, mut worker: ServiceWorker) -> Result<ServiceWorkerId> {
        if let Some(ref current) = self.installing {
            return Err(ServiceWorkerError::StateError(format!(
                "worker {} is already installing",
                current.id.raw()
            )));
        }
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        self.installing = Some(worker);
        self.last_update_check = Some(Instant::now());
        Ok(id)
    }

    /// Transition installing to waiting. Returns a waiting worker it displaced.
    pub fn install_complete(&mut self) -> Result<Option<ServiceWorker>> {
        let mut worker = self
            .installing
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no installing worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Installed);

        let displaced = self.waiting.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        Ok(displaced)
    }

    /// Drop the installing worker after a failed install. Other slots are untouched.
    pub fn install_failed(&mut self, reason: &str) -> Option<ServiceWorker> {
        self.installing.take().map(|mut worker| {
            worker.error = Some(reason.to_string());
            worker.set_state(ServiceWorkerState::InstallFailed);
            worker
        })
    }

    /// Promote the waiting worker to the active slot in the `Activating` state.
    ///
    /// Returns the new worker's id and the previous active worker, now redundant.
    pub fn activate(&mut self) -> Result<(ServiceWorkerId, Option<ServiceWorker>)> {
        let mut worker = self
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Activating);
        let id = worker.id;

        let replaced = self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });
        Ok((id, replaced))
    }

    /// Finish activation of the worker `id`.
    pub fn activation_complete(&mut self, id: ServiceWorkerId) -> Result<()> {
        match self.active {
            Some(ref mut worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Activated);
                Ok(())
            }
            _ => Err(ServiceWorkerError::StateError(format!(
                "worker {} is no longer the active worker",
                id.raw()
            ))),
        }
    }

    /// Unregister: every worker in every slot becomes redundant.
    pub fn unregister(&mut self) -> Vec<ServiceWorker> {
        [self.active.take(), self.waiting.take(), self.installing.take()]
            .into_iter()
            .flatten()
            .map(|mut worker| {
                worker.set_state(ServiceWorkerState::Redundant);
                worker
            })
            .collect()
    }
}
