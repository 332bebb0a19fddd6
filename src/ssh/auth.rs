//! Authentication strategies
//!
//! Each variant carries only the credential material its mechanism needs and
//! is consumed by a single `attempt`. Supported mechanisms:
//! - Password
//! - Public key pair read from disk (optionally encrypted)
//! - Keyboard-interactive answered by an inline callback
//! - Keyboard-interactive answered by the session's delegate
//! - SSH agent identities, tried in agent order

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::error::SessionError;
use super::keyboard_interactive::{DelegateSlot, KbiPrompt, KbiStep, PromptCallback};
use super::transport::Transport;

/// Upper bound on InfoRequest rounds before giving up on a server
const MAX_KBI_ROUNDS: usize = 32;

/// Private key loaded from disk, ready for the transport to decode
pub struct KeyMaterial {
    pub path: PathBuf,
    pub private_key: Zeroizing<String>,
    /// Contents of the matching public key file, if one was given
    pub public_key: Option<String>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("path", &self.path)
            .field("has_public_key", &self.public_key.is_some())
            .field("has_passphrase", &self.passphrase.is_some())
            .finish()
    }
}

/// One authentication mechanism plus its credentials
pub enum AuthenticationStrategy {
    Password {
        password: Zeroizing<String>,
    },
    PublicKey {
        public_key: Option<PathBuf>,
        private_key: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
    KeyboardInteractive {
        callback: PromptCallback,
    },
    /// Prompts go to the delegate registered on the session
    KeyboardInteractiveDelegate,
    Agent,
}

impl AuthenticationStrategy {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: Zeroizing::new(password.into()),
        }
    }

    /// An empty passphrase is treated as "key is not encrypted"
    pub fn public_key(
        public_key: Option<impl Into<PathBuf>>,
        private_key: impl Into<PathBuf>,
        passphrase: Option<&str>,
    ) -> Self {
        Self::PublicKey {
            public_key: public_key.map(Into::into),
            private_key: private_key.into(),
            passphrase: passphrase
                .filter(|p| !p.is_empty())
                .map(|p| Zeroizing::new(p.to_string())),
        }
    }

    pub fn keyboard_interactive<F>(callback: F) -> Self
    where
        F: FnMut(&str) -> String + Send + 'static,
    {
        Self::KeyboardInteractive {
            callback: Box::new(callback),
        }
    }

    pub fn keyboard_interactive_delegate() -> Self {
        Self::KeyboardInteractiveDelegate
    }

    pub fn agent() -> Self {
        Self::Agent
    }

    /// SSH method name of this strategy
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::PublicKey { .. } => "publickey",
            Self::KeyboardInteractive { .. } | Self::KeyboardInteractiveDelegate => {
                "keyboard-interactive"
            }
            Self::Agent => "agent",
        }
    }

    /// Run the handshake for this mechanism. `Ok(())` means authorized.
    pub(crate) async fn attempt<T: Transport>(
        self,
        transport: &mut T,
        username: &str,
        delegate: &DelegateSlot,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        match self {
            Self::Password { password } => {
                let ok = bounded(timeout, transport.authenticate_password(username, &password)).await?;
                accepted(ok, "password")
            }

            Self::PublicKey {
                public_key,
                private_key,
                passphrase,
            } => {
                let material = load_key_material(public_key, private_key, passphrase).await?;
                debug!("Loaded private key from {:?}", material.path);
                let ok = bounded(timeout, transport.authenticate_publickey(username, &material)).await?;
                accepted(ok, "publickey")
            }

            Self::KeyboardInteractive { mut callback } => {
                run_keyboard_interactive(transport, username, timeout, |prompt| {
                    callback(prompt.prompt.as_str())
                })
                .await
            }

            Self::KeyboardInteractiveDelegate => {
                // Resolve before touching the transport so a missing handler fails fast
                let delegate = delegate.get().ok_or(SessionError::NoInteractiveHandler)?;
                run_keyboard_interactive(transport, username, timeout, |prompt| {
                    delegate.answer_prompt(prompt)
                })
                .await
            }

            Self::Agent => authenticate_with_agent(transport, username, timeout).await,
        }
    }
}

impl std::fmt::Debug for AuthenticationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthenticationStrategy({})", self.method_name())
    }
}

fn accepted(ok: bool, method: &str) -> Result<(), SessionError> {
    if ok {
        Ok(())
    } else {
        Err(SessionError::AuthenticationRejected(format!(
            "{} authentication rejected by server",
            method
        )))
    }
}

/// Bound one transport round-trip by the session timeout
pub(crate) async fn bounded<F, R>(timeout: Duration, fut: F) -> Result<R, SessionError>
where
    F: Future<Output = Result<R, SessionError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| SessionError::ConnectionTimeout(format!("no reply within {:?}", timeout)))?
}

async fn load_key_material(
    public_key: Option<PathBuf>,
    private_key: PathBuf,
    passphrase: Option<Zeroizing<String>>,
) -> Result<KeyMaterial, SessionError> {
    tokio::task::spawn_blocking(move || {
        let private = read_key_file(&private_key)?;
        let public = public_key.as_deref().map(read_key_file).transpose()?;
        Ok::<_, SessionError>(KeyMaterial {
            path: private_key,
            private_key: private,
            public_key: public.map(|p| p.to_string()),
            passphrase,
        })
    })
    .await
    .map_err(|e| SessionError::KeyFileUnreadable(format!("Task join error: {}", e)))?
}

fn read_key_file(path: &Path) -> Result<Zeroizing<String>, SessionError> {
    std::fs::read_to_string(path)
        .map(Zeroizing::new)
        .map_err(|e| SessionError::KeyFileUnreadable(format!("{}: {}", path.display(), e)))
}

async fn run_keyboard_interactive<T, F>(
    transport: &mut T,
    username: &str,
    timeout: Duration,
    mut answer: F,
) -> Result<(), SessionError>
where
    T: Transport,
    F: FnMut(&KbiPrompt) -> String,
{
    let mut step = bounded(timeout, transport.keyboard_interactive_start(username)).await?;

    for round in 0..MAX_KBI_ROUNDS {
        match step {
            KbiStep::Success => {
                info!("Keyboard-interactive authentication succeeded");
                return Ok(());
            }
            KbiStep::Failure => {
                return Err(SessionError::AuthenticationRejected(
                    "keyboard-interactive authentication rejected by server".to_string(),
                ));
            }
            KbiStep::Prompts { prompts, .. } => {
                debug!("Keyboard-interactive round {}: {} prompt(s)", round + 1, prompts.len());
                let responses: Vec<String> = prompts.iter().map(&mut answer).collect();
                step = bounded(timeout, transport.keyboard_interactive_respond(responses)).await?;
            }
        }
    }

    warn!("Keyboard-interactive exceeded {} rounds, giving up", MAX_KBI_ROUNDS);
    Err(SessionError::AuthenticationRejected(
        "too many keyboard-interactive rounds".to_string(),
    ))
}

async fn authenticate_with_agent<T: Transport>(
    transport: &mut T,
    username: &str,
    timeout: Duration,
) -> Result<(), SessionError> {
    let identities = bounded(timeout, transport.agent_identities()).await?;
    if identities.is_empty() {
        return Err(SessionError::AuthenticationRejected(
            "SSH Agent has no keys loaded".to_string(),
        ));
    }

    info!(
        "SSH Agent reports {} key(s), attempting authentication",
        identities.len()
    );

    let mut last_error: Option<SessionError> = None;
    for identity in &identities {
        debug!("Trying agent key: {} ({})", identity.algorithm, identity.comment);
        match bounded(timeout, transport.authenticate_agent_identity(username, identity)).await {
            Ok(true) => {
                info!("SSH Agent authentication succeeded with key: {}", identity.comment);
                return Ok(());
            }
            Ok(false) => debug!("Key rejected by server: {}", identity.comment),
            Err(e @ SessionError::AgentUnavailable(_)) => {
                warn!("Agent signing error for key {}: {}", identity.comment, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(SessionError::AuthenticationRejected(format!(
        "No agent key was accepted by the server (tried {} key(s)){}",
        identities.len(),
        last_error
            .map(|e| format!(". Last error: {}", e))
            .unwrap_or_default()
    )))
}
