//! Session lifecycle state shared between the public handle and its executor

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use super::error::SessionError;

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Authenticating,
    Authorized,
    Disconnected,
    Failed,
}

impl SessionState {
    /// Connected, Authenticating or Authorized
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Authenticating | SessionState::Authorized
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::Authorized => "authorized",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State visible from both sides of the executor
#[derive(Debug)]
pub(crate) struct SharedState {
    state: RwLock<SessionState>,
    last_error: Mutex<Option<SessionError>>,
    remote_banner: RwLock<Option<String>>,
    /// Set while an authentication is queued or running
    auth_pending: AtomicBool,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Idle),
            last_error: Mutex::new(None),
            remote_banner: RwLock::new(None),
            auth_pending: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Move to `next`. Disconnected is final and never left.
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.write();
        if state.is_terminal() {
            return false;
        }
        debug!("Session state {} -> {}", *state, next);
        *state = next;
        true
    }

    pub(crate) fn last_error(&self) -> Option<SessionError> {
        self.last_error.lock().clone()
    }

    pub(crate) fn set_error(&self, error: SessionError) {
        *self.last_error.lock() = Some(error);
    }

    pub(crate) fn remote_banner(&self) -> Option<String> {
        self.remote_banner.read().clone()
    }

    pub(crate) fn set_remote_banner(&self, banner: Option<String>) {
        *self.remote_banner.write() = banner;
    }

    /// Claim the single authentication slot; false if already taken
    pub(crate) fn try_begin_auth(&self) -> bool {
        !self.auth_pending.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_auth(&self) {
        self.auth_pending.store(false, Ordering::Release);
    }
}

/// Claimed authentication slot. Travels with the queued command and is
/// released when the executor finishes it or the command is dropped.
pub(crate) struct AuthSlot(Arc<SharedState>);

impl AuthSlot {
    pub(crate) fn acquire(shared: &Arc<SharedState>) -> Option<Self> {
        shared.try_begin_auth().then(|| Self(shared.clone()))
    }
}

impl Drop for AuthSlot {
    fn drop(&mut self) {
        self.0.end_auth();
    }
}
