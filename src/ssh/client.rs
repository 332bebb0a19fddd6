//! SSH transport implementation using russh

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::MethodKind;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::auth::KeyMaterial;
use super::config::Endpoint;
use super::error::SessionError;
use super::keyboard_interactive::{DelegateSlot, KbiPrompt, KbiStep};
use super::known_hosts::HostKey;
use super::transport::{AgentIdentity, Handshake, HandshakeParams, Transport};

/// Upper bound on waiting for the server identification line
const BANNER_PEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes inspected when looking for the identification line
const BANNER_PEEK_BYTES: usize = 1024;

/// Client handler for russh callbacks
///
/// Captures the server's host key for later fingerprinting and known_hosts
/// checks, and forwards authentication banners to the registered delegate.
/// Trust decisions are left to the caller.
pub struct ClientHandler {
    endpoint: Endpoint,
    host_key: Arc<Mutex<Option<HostKey>>>,
    delegate: DelegateSlot,
}

impl ClientHandler {
    pub fn new(endpoint: Endpoint, host_key: Arc<Mutex<Option<HostKey>>>, delegate: DelegateSlot) -> Self {
        Self {
            endpoint,
            host_key,
            delegate,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SessionError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let blob = BASE64
            .decode(server_public_key.public_key_base64())
            .map_err(|e| SessionError::Protocol(format!("Unreadable host key: {}", e)))?;
        let key = HostKey::new(server_public_key.algorithm().as_str(), blob);
        debug!("Server {} presented a {} host key", self.endpoint, key.algorithm);
        *self.host_key.lock() = Some(key);
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!("Server authentication banner: {}", banner.trim());
        if let Some(delegate) = self.delegate.get() {
            delegate.banner(banner);
        }
        Ok(())
    }
}

/// Production transport over a russh client handle
#[derive(Default)]
pub struct RusshTransport {
    handle: Option<Handle<ClientHandler>>,
    agent: Option<SshAgentClient>,
}

impl RusshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&mut self) -> Result<&mut Handle<ClientHandler>, SessionError> {
        self.handle.as_mut().ok_or(SessionError::NotConnected)
    }
}

#[async_trait]
impl Transport for RusshTransport {
    type Channel = russh::Channel<client::Msg>;
    type Sftp = russh_sftp::client::SftpSession;

    async fn handshake(
        &mut self,
        endpoint: &Endpoint,
        params: &HandshakeParams,
    ) -> Result<Handshake, SessionError> {
        let addr = endpoint.socket_addr_string();
        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SessionError::ConnectionRefused(format!("DNS resolution failed for {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| SessionError::ConnectionRefused(format!("No address found for {}", addr)))?;

        let stream = TcpStream::connect(socket_addr).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => {
                SessionError::ConnectionTimeout(format!("{}: {}", addr, e))
            }
            _ => SessionError::ConnectionRefused(format!("{}: {}", addr, e)),
        })?;
        debug!("TCP connected to {}", socket_addr);

        let remote_banner =
            peek_server_ident(&stream, BANNER_PEEK_TIMEOUT.min(params.timeout / 2)).await;

        let mut ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: params.keepalive_interval,
            keepalive_max: params.keepalive_max,
            ..Default::default()
        };
        if let Some(client_id) = &params.client_id {
            ssh_config.client_id = russh::SshId::Standard(client_id.clone());
        }

        let host_key = Arc::new(Mutex::new(None));
        let handler = ClientHandler::new(endpoint.clone(), host_key.clone(), params.delegate.clone());

        let handle = client::connect_stream(Arc::new(ssh_config), stream, handler)
            .await
            .map_err(|e| {
                SessionError::ConnectionRefused(format!("SSH handshake with {} failed: {}", addr, e))
            })?;

        let host_key = host_key.lock().take().ok_or_else(|| {
            SessionError::Protocol("Handshake completed without a host key".to_string())
        })?;

        debug!("SSH handshake completed");
        self.handle = Some(handle);

        Ok(Handshake {
            remote_banner,
            host_key,
        })
    }

    async fn auth_methods(&mut self, username: &str) -> Result<Option<Vec<String>>, SessionError> {
        match self.handle()?.authenticate_none(username).await? {
            client::AuthResult::Success => Ok(None),
            client::AuthResult::Failure {
                remaining_methods, ..
            } => Ok(Some(
                remaining_methods
                    .iter()
                    .filter_map(method_name)
                    .map(str::to_string)
                    .collect(),
            )),
        }
    }

    async fn authenticate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<bool, SessionError> {
        let result = self
            .handle()?
            .authenticate_password(username, password)
            .await?;
        Ok(result.success())
    }

    async fn authenticate_publickey(
        &mut self,
        username: &str,
        key: &KeyMaterial,
    ) -> Result<bool, SessionError> {
        let secret = decode_key(key)?;

        if let Some(public) = &key.public_key {
            let expected = secret.public_key().public_key_base64();
            let listed = public.split_whitespace().nth(1).unwrap_or_default();
            if listed != expected {
                return Err(SessionError::KeyFileUnreadable(format!(
                    "{}: public key does not match private key",
                    key.path.display()
                )));
            }
        }

        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(secret), None);
        let result = self
            .handle()?
            .authenticate_publickey(username, key_with_hash)
            .await?;
        Ok(result.success())
    }

    async fn keyboard_interactive_start(
        &mut self,
        username: &str,
    ) -> Result<KbiStep, SessionError> {
        // Second parameter is submethods; None lets the server choose
        let response = self
            .handle()?
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await?;
        Ok(kbi_step(response))
    }

    async fn keyboard_interactive_respond(
        &mut self,
        responses: Vec<String>,
    ) -> Result<KbiStep, SessionError> {
        let response = self
            .handle()?
            .authenticate_keyboard_interactive_respond(responses)
            .await?;
        Ok(kbi_step(response))
    }

    async fn agent_identities(&mut self) -> Result<Vec<AgentIdentity>, SessionError> {
        let mut agent = SshAgentClient::connect().await?;
        let identities = agent
            .request_identities()
            .await?
            .iter()
            .enumerate()
            .map(|(index, key)| AgentIdentity {
                index,
                algorithm: key.algorithm().as_str().to_string(),
                comment: key.comment().to_string(),
            })
            .collect();
        self.agent = Some(agent);
        Ok(identities)
    }

    async fn authenticate_agent_identity(
        &mut self,
        username: &str,
        identity: &AgentIdentity,
    ) -> Result<bool, SessionError> {
        let handle = self.handle.as_mut().ok_or(SessionError::NotConnected)?;
        let agent = self.agent.as_mut().ok_or_else(|| {
            SessionError::AgentUnavailable("agent identities were not listed".to_string())
        })?;
        agent.authenticate_identity(handle, username, identity.index).await
    }

    async fn open_channel(&mut self) -> Result<Self::Channel, SessionError> {
        Ok(self.handle()?.channel_open_session().await?)
    }

    async fn open_sftp(&mut self) -> Result<Self::Sftp, SessionError> {
        let channel = self.handle()?.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SessionError::Protocol(format!("Failed to request SFTP subsystem: {}", e))
        })?;
        russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SessionError::Protocol(format!("SFTP subsystem not available: {}", e)))
    }

    async fn disconnect(&mut self) {
        self.agent = None;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
                .await
            {
                debug!("Disconnect message not delivered: {}", e);
            }
        }
    }
}

fn method_name(kind: &MethodKind) -> Option<&'static str> {
    match kind {
        MethodKind::None => None,
        MethodKind::Password => Some("password"),
        MethodKind::PublicKey => Some("publickey"),
        MethodKind::HostBased => Some("hostbased"),
        MethodKind::KeyboardInteractive => Some("keyboard-interactive"),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

fn kbi_step(response: KeyboardInteractiveAuthResponse) -> KbiStep {
    match response {
        KeyboardInteractiveAuthResponse::Success => KbiStep::Success,
        KeyboardInteractiveAuthResponse::Failure { .. } => KbiStep::Failure,
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => KbiStep::Prompts {
            name,
            instructions,
            prompts: prompts
                .iter()
                .map(|p| KbiPrompt {
                    prompt: p.prompt.clone(),
                    echo: p.echo,
                })
                .collect(),
        },
    }
}

fn decode_key(key: &KeyMaterial) -> Result<russh::keys::PrivateKey, SessionError> {
    let passphrase = key.passphrase.as_ref().map(|p| p.as_str());
    russh::keys::decode_secret_key(&key.private_key, passphrase)
        .map_err(|e| classify_key_error(&key.path, e))
}

/// Missing or wrong passphrases surface as distinct russh variants per key format
fn classify_key_error(path: &Path, error: russh::keys::Error) -> SessionError {
    use russh::keys::ssh_key;
    use russh::keys::Error as KeyError;

    let message = format!("{}: {}", path.display(), error);
    match error {
        KeyError::KeyIsEncrypted
        | KeyError::Unpad(_)
        | KeyError::SshKey(ssh_key::Error::Crypto)
        | KeyError::SshKey(ssh_key::Error::Encrypted) => SessionError::KeyDecryptionFailed(message),
        _ => SessionError::KeyFileUnreadable(message),
    }
}

/// Read the server identification line without consuming it
async fn peek_server_ident(stream: &TcpStream, timeout: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = vec![0u8; BANNER_PEEK_BYTES];

    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("Could not peek server identification: {}", e);
                return None;
            }
            Err(_) => {
                warn!("Server sent no identification line within {:?}", timeout);
                return None;
            }
        };
        if n == 0 {
            return None;
        }
        if let Some(ident) = parse_server_ident(&buf[..n]) {
            return Some(ident);
        }
        if n == buf.len() {
            return None;
        }
        // Partial line; wait for more bytes
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// First complete `SSH-` line in `data`, without the line terminator.
/// Servers may send other lines before it.
fn parse_server_ident(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    let complete = text.matches('\n').count();
    text.split('\n')
        .take(complete)
        .map(|line| line.trim_end_matches('\r'))
        .find(|line| line.starts_with("SSH-"))
        .map(str::to_string)
}
