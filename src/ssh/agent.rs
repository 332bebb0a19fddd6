//! SSH Agent Client
//!
//! Lists the identities held by the system agent and authenticates with one
//! of them, delegating the challenge signature to the agent.
//!
//! # Platform Support
//! - **Unix/Linux/macOS**: `SSH_AUTH_SOCK` Unix domain socket
//! - **Windows**: `\\.\pipe\openssh-ssh-agent` named pipe (OpenSSH for Windows)
//!
//! # The `AgentSigner` wrapper
//!
//! russh's own `impl Signer for AgentClient` borrows the `PublicKey` from the
//! server's sign request across an `.await`, which the compiler cannot prove
//! `Send` through RPITIT (rust-lang/rust#100013). `AgentSigner` clones the key
//! before the async block so the future only captures owned values.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info};

use super::client::ClientHandler;
use super::error::SessionError;

type DynAgent = AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>;

/// Send-safe [`Signer`] forwarding sign requests to the agent
struct AgentSigner<'a> {
    agent: &'a mut DynAgent,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Connected agent plus the identities it reported
pub struct SshAgentClient {
    agent: DynAgent,
    identities: Vec<ssh_key::PublicKey>,
}

impl SshAgentClient {
    /// Connect to the system SSH Agent
    pub async fn connect() -> Result<Self, SessionError> {
        info!("Connecting to system SSH Agent");

        #[cfg(unix)]
        {
            if !is_agent_available() {
                return Err(SessionError::AgentUnavailable(
                    "SSH_AUTH_SOCK is not set".to_string(),
                ));
            }
            let agent = AgentClient::connect_env().await.map_err(|e| {
                SessionError::AgentUnavailable(format!(
                    "Failed to connect to SSH Agent: {}. \
                     Make sure SSH_AUTH_SOCK is set and ssh-agent is running.",
                    e
                ))
            })?;
            debug!("Connected to SSH Agent via SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
                identities: Vec::new(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| {
                    SessionError::AgentUnavailable(format!(
                        "Failed to connect to SSH Agent via named pipe: {}. \
                         Make sure the OpenSSH Authentication Agent service is running.",
                        e
                    ))
                })?;
            debug!("Connected to SSH Agent via named pipe");
            Ok(Self {
                agent: agent.dynamic(),
                identities: Vec::new(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(SessionError::AgentUnavailable(
                "SSH Agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Ask the agent for its keys and remember them for `authenticate_identity`
    pub async fn request_identities(&mut self) -> Result<&[ssh_key::PublicKey], SessionError> {
        self.identities = self.agent.request_identities().await.map_err(|e| {
            SessionError::AgentUnavailable(format!("Failed to list agent keys: {}", e))
        })?;
        debug!("SSH Agent holds {} identities", self.identities.len());
        Ok(&self.identities)
    }

    /// Offer the identity at `index` to the server. `Ok(false)` means the
    /// server did not accept it.
    pub async fn authenticate_identity(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
        index: usize,
    ) -> Result<bool, SessionError> {
        let key = self.identities.get(index).cloned().ok_or_else(|| {
            SessionError::AgentUnavailable(format!("agent identity #{} no longer listed", index))
        })?;

        let result = handle
            .authenticate_publickey_with(
                username,
                key,
                None,
                &mut AgentSigner {
                    agent: &mut self.agent,
                },
            )
            .await
            .map_err(|e| SessionError::AgentUnavailable(format!("Agent signing failed: {}", e)))?;

        Ok(result.success())
    }
}

/// Whether an agent socket/pipe appears to be configured
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var_os("SSH_AUTH_SOCK").is_some()
    }

    #[cfg(windows)]
    {
        // The named pipe exists whenever the service is installed
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}
