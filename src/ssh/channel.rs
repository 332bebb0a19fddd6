//! Handles derived from an authorized session
//!
//! A handle stays usable only while its session is alive. Once the session
//! disconnects, every accessor returns `SessionClosed`.

use tokio_util::sync::CancellationToken;

use super::error::SessionError;

/// Wraps a transport object whose validity is tied to the session
#[derive(Debug)]
pub struct SessionBound<H> {
    inner: H,
    closed: CancellationToken,
}

/// Command-execution channel opened on an authorized session
pub type SessionChannel<C> = SessionBound<C>;

/// SFTP subsystem opened on an authorized session
pub type SessionSftp<S> = SessionBound<S>;

impl<H> SessionBound<H> {
    pub(crate) fn new(inner: H, closed: CancellationToken) -> Self {
        Self { inner, closed }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn get(&self) -> Result<&H, SessionError> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        Ok(&self.inner)
    }

    pub fn get_mut(&mut self) -> Result<&mut H, SessionError> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        Ok(&mut self.inner)
    }

    pub fn into_inner(self) -> Result<H, SessionError> {
        if self.is_closed() {
            return Err(SessionError::SessionClosed);
        }
        Ok(self.inner)
    }
}
