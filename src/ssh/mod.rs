//! SSH module - client sessions over russh
//!
//! # Features
//! - Connection state machine with a serial executor per session
//! - Host key fingerprints (MD5, SHA-1, SHA-256)
//! - Host key verification against OpenSSH known_hosts files
//! - Password, public key, keyboard-interactive and SSH agent authentication
//! - Channel and SFTP handles tied to the session lifetime

mod agent;
pub mod auth;
mod channel;
mod client;
pub mod config;
mod error;
mod executor;
pub mod fingerprint;
pub mod keyboard_interactive;
pub mod known_hosts;
mod session;
mod state;
pub mod transport;

#[cfg(test)]
mod mock;

pub use agent::{is_agent_available, SshAgentClient};
pub use auth::{AuthenticationStrategy, KeyMaterial};
pub use channel::{SessionBound, SessionChannel, SessionSftp};
pub use client::{ClientHandler, RusshTransport};
pub use config::{Endpoint, SessionConfig, DEFAULT_PORT};
pub use error::SessionError;
pub use fingerprint::FingerprintHash;
pub use keyboard_interactive::{KbiPrompt, KbiStep, KeyboardInteractiveDelegate, PromptCallback};
pub use known_hosts::{hash_host_name, HostKey, KnownHostStatus, KnownHostStore};
pub use session::{Session, TransportTask};
pub use state::SessionState;
pub use transport::{AgentIdentity, Handshake, HandshakeParams, Transport};
