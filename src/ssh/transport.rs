//! Transport boundary
//!
//! The session drives the SSH protocol engine exclusively through this trait.
//! Implementations are owned by the session's executor task and are only
//! ever called from it, one call at a time.

use std::time::Duration;

use async_trait::async_trait;

use super::auth::KeyMaterial;
use super::config::Endpoint;
use super::error::SessionError;
use super::keyboard_interactive::{DelegateSlot, KbiStep};
use super::known_hosts::HostKey;

/// Parameters for establishing the transport
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    pub timeout: Duration,
    /// Identification string sent to the server
    pub client_id: Option<String>,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: usize,
    /// Receives the server's authentication banner
    pub delegate: DelegateSlot,
}

/// What the handshake yields
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Server identification line, e.g. `SSH-2.0-OpenSSH_9.6`
    pub remote_banner: Option<String>,
    pub host_key: HostKey,
}

/// An identity offered by the SSH agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Position in the agent's identity list
    pub index: usize,
    pub algorithm: String,
    pub comment: String,
}

#[async_trait]
pub trait Transport: Send + 'static {
    /// Session channel handed to command-execution consumers
    type Channel: Send + 'static;
    /// SFTP subsystem handle
    type Sftp: Send + 'static;

    async fn handshake(
        &mut self,
        endpoint: &Endpoint,
        params: &HandshakeParams,
    ) -> Result<Handshake, SessionError>;

    /// Methods the server advertises for `username`, in server order.
    /// `None` if the server accepted the `none` method outright.
    async fn auth_methods(&mut self, username: &str) -> Result<Option<Vec<String>>, SessionError>;

    async fn authenticate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<bool, SessionError>;

    async fn authenticate_publickey(
        &mut self,
        username: &str,
        key: &KeyMaterial,
    ) -> Result<bool, SessionError>;

    async fn keyboard_interactive_start(&mut self, username: &str)
        -> Result<KbiStep, SessionError>;

    async fn keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KbiStep, SessionError>;

    /// Identities held by the local agent, in agent order
    async fn agent_identities(&mut self) -> Result<Vec<AgentIdentity>, SessionError>;

    async fn authenticate_agent_identity(
        &mut self,
        username: &str,
        identity: &AgentIdentity,
    ) -> Result<bool, SessionError>;

    async fn open_channel(&mut self) -> Result<Self::Channel, SessionError>;

    async fn open_sftp(&mut self) -> Result<Self::Sftp, SessionError>;

    /// Close the connection. Must be safe to call more than once.
    async fn disconnect(&mut self);
}
