//! Scripted in-memory transport for exercising the session state machine

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::auth::KeyMaterial;
use super::config::Endpoint;
use super::error::SessionError;
use super::keyboard_interactive::{KbiPrompt, KbiStep};
use super::known_hosts::HostKey;
use super::transport::{AgentIdentity, Handshake, HandshakeParams, Transport};

/// Server behaviour
#[derive(Clone, Default)]
pub struct MockScript {
    /// Refuse the connection
    pub refuse: bool,
    /// Delay before the handshake completes
    pub handshake_delay: Option<Duration>,
    /// Delay applied to every authentication round-trip
    pub auth_delay: Option<Duration>,
    /// Accepted password
    pub password: Option<String>,
    /// One prompt per round: (prompt, expected response)
    pub kbi: Vec<(String, String)>,
    /// Agent identities: (comment, accepted by server)
    pub agent: Vec<(String, bool)>,
    /// Advertised methods; empty means the server accepts "none"
    pub methods: Vec<String>,
}

pub struct MockTransport {
    script: MockScript,
    journal: Arc<Mutex<Vec<String>>>,
    kbi_round: usize,
    channels: usize,
}

impl MockTransport {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            journal: Arc::new(Mutex::new(Vec::new())),
            kbi_round: 0,
            channels: 0,
        }
    }

    /// Shared call journal, readable after the transport moved into a session
    pub fn journal_handle(&self) -> Arc<Mutex<Vec<String>>> {
        self.journal.clone()
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn host_key() -> HostKey {
        HostKey::new("ssh-ed25519", b"mock-server-ed25519-public-key".to_vec())
    }

    fn record(&self, entry: impl Into<String>) {
        self.journal.lock().push(entry.into());
    }

    async fn auth_delay(&self) {
        if let Some(delay) = self.script.auth_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn kbi_prompt(&self) -> KbiStep {
        let (prompt, _) = &self.script.kbi[self.kbi_round];
        KbiStep::Prompts {
            name: String::new(),
            instructions: String::new(),
            prompts: vec![KbiPrompt {
                prompt: prompt.clone(),
                echo: false,
            }],
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Channel = String;
    type Sftp = String;

    async fn handshake(
        &mut self,
        endpoint: &Endpoint,
        params: &HandshakeParams,
    ) -> Result<Handshake, SessionError> {
        self.record(format!("handshake {}", endpoint));
        if let Some(delay) = self.script.handshake_delay {
            tokio::time::sleep(delay).await;
        }
        if self.script.refuse {
            return Err(SessionError::ConnectionRefused(format!(
                "{}: connection refused",
                endpoint
            )));
        }
        if let Some(client_id) = &params.client_id {
            self.record(format!("client_id {}", client_id));
        }
        Ok(Handshake {
            remote_banner: Some("SSH-2.0-MockSSH_1.0".to_string()),
            host_key: Self::host_key(),
        })
    }

    async fn auth_methods(&mut self, username: &str) -> Result<Option<Vec<String>>, SessionError> {
        self.record(format!("auth_methods {}", username));
        if self.script.methods.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.script.methods.clone()))
        }
    }

    async fn authenticate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<bool, SessionError> {
        self.record(format!("password {}", username));
        self.auth_delay().await;
        Ok(self.script.password.as_deref() == Some(password))
    }

    async fn authenticate_publickey(
        &mut self,
        username: &str,
        key: &KeyMaterial,
    ) -> Result<bool, SessionError> {
        self.record(format!("publickey {}", username));
        self.auth_delay().await;
        if key.private_key.contains("ENCRYPTED") && key.passphrase.as_deref().map(|p| p.as_str()) != Some("secret") {
            return Err(SessionError::KeyDecryptionFailed(
                "bad passphrase".to_string(),
            ));
        }
        Ok(key.private_key.contains("accepted key"))
    }

    async fn keyboard_interactive_start(
        &mut self,
        username: &str,
    ) -> Result<KbiStep, SessionError> {
        self.record(format!("kbi_start {}", username));
        self.auth_delay().await;
        self.kbi_round = 0;
        if self.script.kbi.is_empty() {
            return Ok(KbiStep::Success);
        }
        Ok(self.kbi_prompt())
    }

    async fn keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KbiStep, SessionError> {
        self.record(format!("kbi_respond {}", responses.len()));
        let Some((_, expected)) = self.script.kbi.get(self.kbi_round) else {
            return Ok(KbiStep::Failure);
        };
        if responses.first() != Some(expected) {
            return Ok(KbiStep::Failure);
        }
        self.kbi_round += 1;
        if self.kbi_round == self.script.kbi.len() {
            Ok(KbiStep::Success)
        } else {
            Ok(self.kbi_prompt())
        }
    }

    async fn agent_identities(&mut self) -> Result<Vec<AgentIdentity>, SessionError> {
        self.record("agent_identities");
        Ok(self
            .script
            .agent
            .iter()
            .enumerate()
            .map(|(index, (comment, _))| AgentIdentity {
                index,
                algorithm: "ssh-ed25519".to_string(),
                comment: comment.clone(),
            })
            .collect())
    }

    async fn authenticate_agent_identity(
        &mut self,
        username: &str,
        identity: &AgentIdentity,
    ) -> Result<bool, SessionError> {
        self.record(format!("agent_auth {} {}", username, identity.comment));
        Ok(self
            .script
            .agent
            .get(identity.index)
            .map(|(_, ok)| *ok)
            .unwrap_or(false))
    }

    async fn open_channel(&mut self) -> Result<Self::Channel, SessionError> {
        self.channels += 1;
        self.record("open_channel");
        Ok(format!("channel-{}", self.channels))
    }

    async fn open_sftp(&mut self) -> Result<Self::Sftp, SessionError> {
        self.record("open_sftp");
        Ok("sftp".to_string())
    }

    async fn disconnect(&mut self) {
        self.record("disconnect");
    }
}
