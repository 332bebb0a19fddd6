//! SSH Session
//!
//! `Session` is the public handle for one connection. It owns the lifecycle
//! state and the last error, and forwards every transport-touching operation
//! to the session's serial executor. Callers await the returned futures and
//! are never blocked on network I/O.
//!
//! # Usage
//!
//! ```ignore
//! let session = Session::new("example.com", 22, "alice");
//! session.connect().await?;
//!
//! if session.known_host_status(None).await? == KnownHostStatus::NotFound {
//!     session.add_known_host_name("example.com", 22, None, None).await;
//! }
//!
//! session.authenticate_by_password("hunter2").await?;
//! let channel = session.open_channel().await?;
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

use super::auth::AuthenticationStrategy;
use super::channel::{SessionBound, SessionChannel, SessionSftp};
use super::client::RusshTransport;
use super::config::{Endpoint, SessionConfig, DEFAULT_PORT};
use super::error::SessionError;
use super::executor::{raw_job, spawn_executor, ExecutorCommand, ExecutorController, SessionCore};
use super::fingerprint::FingerprintHash;
use super::keyboard_interactive::{DelegateSlot, KeyboardInteractiveDelegate};
use super::known_hosts::KnownHostStatus;
use super::state::{AuthSlot, SessionState, SharedState};
use super::transport::Transport;

/// Future returned by a `raw_transport` closure
pub type TransportTask<'a, R> = Pin<Box<dyn Future<Output = R> + Send + 'a>>;

/// A single SSH client session
pub struct Session<T: Transport = RusshTransport> {
    id: String,
    endpoint: Endpoint,
    username: String,
    config: SessionConfig,
    shared: Arc<SharedState>,
    delegate: DelegateSlot,
    executor: ExecutorController<T>,
}

impl Session<RusshTransport> {
    /// Create a session backed by russh. `host` may embed a port
    /// (`host:port`, `[v6addr]:port`), which takes precedence over `port`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(host: &str, port: u16, username: &str) -> Self {
        Self::with_config(host, port, username, SessionConfig::default())
    }

    pub fn with_config(host: &str, port: u16, username: &str, config: SessionConfig) -> Self {
        Self::with_transport(host, port, username, config, RusshTransport::new())
    }

    /// Create a session on the default port and connect it
    pub async fn connect_to_host(host: &str, username: &str) -> Result<Self, SessionError> {
        Self::connect_to_host_port(host, DEFAULT_PORT, username).await
    }

    pub async fn connect_to_host_port(
        host: &str,
        port: u16,
        username: &str,
    ) -> Result<Self, SessionError> {
        let session = Self::new(host, port, username);
        session.connect().await?;
        Ok(session)
    }
}

impl<T: Transport> Session<T> {
    /// Create a session over an arbitrary transport
    pub fn with_transport(
        host: &str,
        port: u16,
        username: &str,
        config: SessionConfig,
        transport: T,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let endpoint = Endpoint::parse(host, port);
        let shared = Arc::new(SharedState::new());
        let delegate = DelegateSlot::default();

        let executor = spawn_executor(SessionCore {
            session_id: id.clone(),
            transport,
            endpoint: endpoint.clone(),
            username: username.to_string(),
            config: config.clone(),
            shared: shared.clone(),
            delegate: delegate.clone(),
            host_key: None,
        });

        info!("Created session {} for {}@{}", id, username, endpoint);

        Self {
            id,
            endpoint,
            username: username.to_string(),
            config,
            shared,
            delegate,
            executor,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.endpoint.host
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// True once the transport is up, including while authenticating
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_authorized(&self) -> bool {
        self.state() == SessionState::Authorized
    }

    /// Most recent error reported by any operation
    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.last_error()
    }

    /// Server identification string, available after connect
    pub fn remote_banner(&self) -> Option<String> {
        self.shared.remote_banner()
    }

    /// Receiver notified once the session has released its transport
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.executor.subscribe_disconnect()
    }

    // ========================================================================
    // Connection
    // ========================================================================

    pub async fn connect(&self) -> Result<(), SessionError> {
        self.connect_with_timeout(self.config.timeout()).await
    }

    /// Establish the transport within `timeout`. Only valid on an idle
    /// session; a session never reconnects.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<(), SessionError> {
        self.call(|reply_tx| ExecutorCommand::Connect { timeout, reply_tx })
            .await
    }

    /// Close the session. Safe to call in any state and more than once.
    ///
    /// An operation already running fails with `SessionClosed`, as does every
    /// queued one. Channel and SFTP handles become unusable.
    pub async fn disconnect(&self) {
        if self.shared.transition(SessionState::Disconnected) {
            info!("Disconnecting session {}", self.id);
        }
        self.executor.shutdown().await;
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    /// Run one authentication strategy. Requires a connected, not yet
    /// authorized session.
    pub async fn authenticate(&self, strategy: AuthenticationStrategy) -> Result<(), SessionError> {
        if self.executor.is_closed() {
            return self.record(Err(SessionError::SessionClosed));
        }
        let Some(slot) = AuthSlot::acquire(&self.shared) else {
            warn!(
                "Rejecting {} authentication for session {}: another attempt is pending",
                strategy.method_name(),
                self.id
            );
            return self.record(Err(SessionError::OperationInProgress));
        };

        self.call(|reply_tx| ExecutorCommand::Authenticate {
            strategy,
            slot,
            reply_tx,
        })
        .await
    }

    pub async fn authenticate_by_password(&self, password: &str) -> Result<(), SessionError> {
        self.authenticate(AuthenticationStrategy::password(password))
            .await
    }

    /// Authenticate with a key pair read from disk. An empty passphrase is
    /// accepted and means the key is not encrypted.
    pub async fn authenticate_by_public_key(
        &self,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), SessionError> {
        self.authenticate(AuthenticationStrategy::public_key(
            public_key,
            private_key,
            passphrase,
        ))
        .await
    }

    /// Keyboard-interactive with an inline handler.
    ///
    /// `callback` runs on the session's executor, once per prompt, in the
    /// order the server sends them.
    pub async fn authenticate_by_keyboard_interactive_using<F>(
        &self,
        callback: F,
    ) -> Result<(), SessionError>
    where
        F: FnMut(&str) -> String + Send + 'static,
    {
        self.authenticate(AuthenticationStrategy::keyboard_interactive(callback))
            .await
    }

    /// Keyboard-interactive answered by the registered delegate
    pub async fn authenticate_by_keyboard_interactive(&self) -> Result<(), SessionError> {
        self.authenticate(AuthenticationStrategy::keyboard_interactive_delegate())
            .await
    }

    /// Try every identity held by the local SSH agent
    pub async fn connect_to_agent(&self) -> Result<(), SessionError> {
        self.authenticate(AuthenticationStrategy::agent()).await
    }

    /// Methods the server accepts for this user, in server order.
    ///
    /// If the server lets the user in without credentials the list is empty
    /// and the session is authorized.
    pub async fn supported_authentication_methods(&self) -> Result<Vec<String>, SessionError> {
        self.call(|reply_tx| ExecutorCommand::AuthMethods { reply_tx })
            .await
    }

    /// Register the keyboard-interactive delegate. Only a weak reference is
    /// kept; the caller owns the delegate.
    pub fn set_delegate(&self, delegate: &Arc<dyn KeyboardInteractiveDelegate>) {
        self.delegate.set(delegate);
    }

    pub fn clear_delegate(&self) {
        self.delegate.clear();
    }

    // ========================================================================
    // Host identity
    // ========================================================================

    /// Fingerprint of the server's host key
    pub async fn fingerprint(&self, hash: FingerprintHash) -> Result<String, SessionError> {
        self.call(|reply_tx| ExecutorCommand::Fingerprint { hash, reply_tx })
            .await
    }

    /// Fingerprint using the configured hash
    pub async fn fingerprint_default(&self) -> Result<String, SessionError> {
        self.fingerprint(self.config.fingerprint_hash).await
    }

    /// Check the server's host key against known_hosts files, in order.
    ///
    /// `None` uses the configured files, falling back to
    /// `~/.ssh/known_hosts` and `/etc/ssh/ssh_known_hosts`.
    pub async fn known_host_status(
        &self,
        files: Option<&[PathBuf]>,
    ) -> Result<KnownHostStatus, SessionError> {
        let files = files.map(<[PathBuf]>::to_vec);
        self.call(|reply_tx| ExecutorCommand::KnownHostStatus { files, reply_tx })
            .await
    }

    /// Record the server's host key under `host_name`.
    ///
    /// With `salt` (base64), `host_name` must already be the hashed form.
    /// Returns false if the session is not connected or the file cannot be
    /// written.
    pub async fn add_known_host_name(
        &self,
        host_name: &str,
        port: u16,
        file: Option<&Path>,
        salt: Option<&str>,
    ) -> bool {
        let result = self
            .executor
            .request(|reply_tx| ExecutorCommand::AddKnownHost {
                host_name: host_name.to_string(),
                port,
                file: file.map(Path::to_path_buf),
                salt: salt.map(str::to_string),
                reply_tx,
            })
            .await;
        result.unwrap_or(false)
    }

    // ========================================================================
    // Derived handles
    // ========================================================================

    /// Open a session channel for command execution
    pub async fn open_channel(&self) -> Result<SessionChannel<T::Channel>, SessionError> {
        let channel = self
            .call(|reply_tx| ExecutorCommand::OpenChannel { reply_tx })
            .await?;
        Ok(SessionBound::new(channel, self.executor.closed_token()))
    }

    /// Start the SFTP subsystem
    pub async fn open_sftp(&self) -> Result<SessionSftp<T::Sftp>, SessionError> {
        let sftp = self
            .call(|reply_tx| ExecutorCommand::OpenSftp { reply_tx })
            .await?;
        Ok(SessionBound::new(sftp, self.executor.closed_token()))
    }

    /// Run `f` against the underlying transport on the session's executor.
    ///
    /// This is the only supported way to reach the protocol engine directly.
    /// The session must be connected. Anything done here bypasses the
    /// session's state tracking.
    pub async fn raw_transport<R, F>(&self, f: F) -> Result<R, SessionError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut T) -> TransportTask<'a, R> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job = raw_job(move |transport| {
            Box::pin(async move {
                let value = f(transport).await;
                let _ = result_tx.send(value);
            })
        });

        self.call(|reply_tx| ExecutorCommand::Raw { job, reply_tx })
            .await?;
        result_rx.await.map_err(|_| SessionError::SessionClosed)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<R, SessionError>>) -> ExecutorCommand<T>,
    ) -> Result<R, SessionError> {
        let result = self.executor.request(make).await.and_then(|r| r);
        self.record(result)
    }

    fn record<R>(&self, result: Result<R, SessionError>) -> Result<R, SessionError> {
        if let Err(e) = &result {
            self.shared.set_error(e.clone());
        }
        result
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.shared.transition(SessionState::Disconnected);
        self.executor.close();
    }
}

impl<T: Transport> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::fingerprint;
    use crate::ssh::mock::{MockScript, MockTransport};
    use crate::ssh::known_hosts::KnownHostStore;
    use parking_lot::Mutex;

    fn mock_session(script: MockScript) -> (Session<MockTransport>, Arc<Mutex<Vec<String>>>) {
        session_with_config(script, SessionConfig::default())
    }

    fn session_with_config(
        script: MockScript,
        config: SessionConfig,
    ) -> (Session<MockTransport>, Arc<Mutex<Vec<String>>>) {
        let transport = MockTransport::new(script);
        let journal = transport.journal_handle();
        (
            Session::with_transport("example.com", 22, "alice", config, transport),
            journal,
        )
    }

    fn password_script() -> MockScript {
        MockScript {
            password: Some("hunter2".into()),
            methods: vec!["publickey".into(), "password".into()],
            ..Default::default()
        }
    }

    struct Answer(&'static str);

    impl KeyboardInteractiveDelegate for Answer {
        fn answer_prompt(&self, _prompt: &crate::ssh::keyboard_interactive::KbiPrompt) -> String {
            self.0.to_string()
        }
    }

    #[tokio::test]
    async fn test_connect_then_password() {
        let (session, _) = mock_session(password_script());
        assert_eq!(session.state(), SessionState::Idle);

        session.connect().await.unwrap();
        assert!(session.is_connected());
        assert!(!session.is_authorized());
        assert_eq!(session.remote_banner().as_deref(), Some("SSH-2.0-MockSSH_1.0"));

        session.authenticate_by_password("hunter2").await.unwrap();
        assert!(session.is_authorized());
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn test_queued_operations_observe_earlier_results() {
        let (session, journal) = mock_session(password_script());

        let (connected, authed) = tokio::join!(
            session.connect(),
            session.authenticate_by_password("hunter2")
        );
        connected.unwrap();
        authed.unwrap();
        assert_eq!(session.state(), SessionState::Authorized);
        assert_eq!(
            *journal.lock(),
            vec!["handshake example.com:22".to_string(), "password alice".to_string()]
        );
    }

    #[tokio::test]
    async fn test_authenticate_before_connect_does_no_io() {
        let (session, journal) = mock_session(password_script());

        let err = session.authenticate_by_password("hunter2").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.last_error(), Some(err));
        assert!(journal.lock().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_password_keeps_connection() {
        let (session, _) = mock_session(password_script());
        session.connect().await.unwrap();

        let err = session.authenticate_by_password("wrong").await.unwrap_err();
        assert!(matches!(err, SessionError::AuthenticationRejected(_)));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(matches!(
            session.last_error(),
            Some(SessionError::AuthenticationRejected(_))
        ));

        session.authenticate_by_password("hunter2").await.unwrap();
        assert!(session.is_authorized());

        let again = session.authenticate_by_password("hunter2").await.unwrap_err();
        assert!(matches!(again, SessionError::InvalidState(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_authentication_is_rejected_while_pending() {
        let (session, _) = mock_session(MockScript {
            password: Some("hunter2".into()),
            auth_delay: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        session.connect().await.unwrap();

        let (first, second) = tokio::join!(
            session.authenticate_by_password("hunter2"),
            session.connect_to_agent()
        );
        first.unwrap();
        assert_eq!(second.unwrap_err(), SessionError::OperationInProgress);
        assert!(session.is_authorized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_authentication_keeps_slot_until_finished() {
        let (session, _) = mock_session(MockScript {
            password: Some("hunter2".into()),
            auth_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        session.connect().await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            session.authenticate_by_password("hunter2"),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(session.state(), SessionState::Authenticating);

        let started = tokio::time::Instant::now();
        let err = session.connect_to_agent().await.unwrap_err();
        assert_eq!(err, SessionError::OperationInProgress);
        assert!(started.elapsed() < Duration::from_millis(100));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(session.is_authorized());
    }

    #[tokio::test]
    async fn test_every_operation_fails_after_disconnect() {
        let (session, journal) = mock_session(password_script());
        session.connect().await.unwrap();
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);

        assert_eq!(session.connect().await, Err(SessionError::SessionClosed));
        assert_eq!(
            session.authenticate_by_password("hunter2").await,
            Err(SessionError::SessionClosed)
        );
        assert_eq!(
            session.fingerprint(FingerprintHash::Md5).await,
            Err(SessionError::SessionClosed)
        );
        assert_eq!(
            session.known_host_status(None).await,
            Err(SessionError::SessionClosed)
        );
        assert_eq!(
            session.supported_authentication_methods().await,
            Err(SessionError::SessionClosed)
        );
        assert!(matches!(
            session.open_channel().await,
            Err(SessionError::SessionClosed)
        ));
        assert!(!session.add_known_host_name("example.com", 22, None, None).await);
        assert_eq!(session.last_error(), Some(SessionError::SessionClosed));

        // Idempotent
        session.disconnect().await;
        assert_eq!(journal.lock().last().map(String::as_str), Some("disconnect"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_in_flight_authentication() {
        let (session, _) = mock_session(MockScript {
            password: Some("hunter2".into()),
            auth_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let session = Arc::new(session);
        session.connect().await.unwrap();

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.authenticate_by_password("hunter2").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut disconnected = session.subscribe_disconnect();
        session.disconnect().await;

        assert_eq!(pending.await.unwrap(), Err(SessionError::SessionClosed));
        assert!(disconnected.recv().await.is_ok());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (session, _) = mock_session(MockScript {
            handshake_delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });

        let err = session
            .connect_with_timeout(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ConnectionTimeout(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.last_error(), Some(err));
    }

    #[tokio::test]
    async fn test_connect_refused_and_no_reconnect() {
        let (session, _) = mock_session(MockScript {
            refuse: true,
            ..Default::default()
        });

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::ConnectionRefused(_)));
        assert_eq!(session.state(), SessionState::Failed);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid() {
        let (session, _) = mock_session(MockScript::default());
        session.connect().await.unwrap();
        assert!(matches!(
            session.connect().await,
            Err(SessionError::InvalidState(_))
        ));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_embedded_port_and_banner() {
        let config = SessionConfig {
            banner: Some("MyClient_1.0".into()),
            ..Default::default()
        };
        let transport = MockTransport::new(MockScript::default());
        let journal = transport.journal_handle();
        let session = Session::with_transport("[::1]:2222", 22, "alice", config, transport);
        assert_eq!(session.host(), "::1");
        assert_eq!(session.port(), 2222);

        session.connect().await.unwrap();
        assert_eq!(
            *journal.lock(),
            vec![
                "handshake [::1]:2222".to_string(),
                "client_id SSH-2.0-MyClient_1.0".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_fingerprint_requires_connection() {
        let (session, _) = mock_session(MockScript::default());
        assert_eq!(
            session.fingerprint(FingerprintHash::Md5).await,
            Err(SessionError::NotConnected)
        );
        assert_eq!(
            session.known_host_status(None).await,
            Err(SessionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_fingerprint_hashes() {
        let (session, _) = mock_session(MockScript::default());
        session.connect().await.unwrap();

        let md5 = session.fingerprint(FingerprintHash::Md5).await.unwrap();
        let sha1 = session.fingerprint(FingerprintHash::Sha1).await.unwrap();
        assert_ne!(md5, sha1);
        assert_eq!(md5.len(), 16 * 3 - 1);
        assert_eq!(sha1.len(), 20 * 3 - 1);
        assert_eq!(md5, md5.to_uppercase());

        let blob = MockTransport::host_key().blob;
        assert_eq!(md5, fingerprint::compute(FingerprintHash::Md5, &blob));
        assert_eq!(
            session.fingerprint(FingerprintHash::Md5).await.unwrap(),
            md5
        );
        assert_eq!(session.fingerprint_default().await.unwrap(), md5);
    }

    #[tokio::test]
    async fn test_add_known_host_then_match() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("known_hosts");
        let (session, _) = mock_session(MockScript::default());
        session.connect().await.unwrap();

        let files = vec![file.clone()];
        assert_eq!(
            session.known_host_status(Some(files.as_slice())).await.unwrap(),
            KnownHostStatus::NotFound
        );

        assert!(session.add_known_host_name("example.com", 22, Some(&file), None).await);
        assert_eq!(
            session.known_host_status(Some(files.as_slice())).await.unwrap(),
            KnownHostStatus::Match
        );
    }

    #[tokio::test]
    async fn test_add_known_host_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let file = blocker.join("known_hosts");

        let (session, _) = mock_session(MockScript::default());
        session.connect().await.unwrap();

        assert!(!session.add_known_host_name("example.com", 22, Some(&file), None).await);
        assert_eq!(std::fs::read_to_string(&blocker).unwrap(), "not a directory");
        assert!(session.is_connected());
        assert!(matches!(
            session.last_error(),
            Some(SessionError::TrustFileUnreadable(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_known_host_racing_disconnect_reports_file_contents() {
        for delay_us in [0u64, 50, 200, 1_000, 5_000] {
            let dir = tempfile::tempdir().unwrap();
            let file = dir.path().join("known_hosts");
            let (session, _) = mock_session(MockScript::default());
            session.connect().await.unwrap();

            let (added, _) = tokio::join!(
                session.add_known_host_name("example.com", 22, Some(&file), None),
                async {
                    tokio::time::sleep(Duration::from_micros(delay_us)).await;
                    session.disconnect().await;
                }
            );

            let recorded = std::fs::read_to_string(&file)
                .map(|content| content.contains("example.com"))
                .unwrap_or(false);
            assert_eq!(added, recorded, "delay {}us", delay_us);
        }
    }

    #[tokio::test]
    async fn test_add_known_host_requires_connection() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("known_hosts");
        let (session, _) = mock_session(MockScript::default());

        assert!(!session.add_known_host_name("example.com", 22, Some(&file), None).await);
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_known_host_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("known_hosts");
        std::fs::write(
            &file,
            "example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl\n",
        )
        .unwrap();

        let (session, _) = mock_session(MockScript::default());
        session.connect().await.unwrap();
        assert_eq!(
            session.known_host_status(Some(&[file][..])).await.unwrap(),
            KnownHostStatus::Mismatch
        );
    }

    #[tokio::test]
    async fn test_configured_known_hosts_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("known_hosts");
        KnownHostStore::add(&file, "example.com", 22, None, &MockTransport::host_key()).unwrap();

        let config = SessionConfig {
            known_hosts_files: Some(vec![file]),
            ..Default::default()
        };
        let (session, _) = session_with_config(MockScript::default(), config);
        session.connect().await.unwrap();
        assert_eq!(
            session.known_host_status(None).await.unwrap(),
            KnownHostStatus::Match
        );
    }

    #[tokio::test]
    async fn test_keyboard_interactive_delegate() {
        let script = MockScript {
            kbi: vec![("Verification code: ".into(), "123456".into())],
            ..Default::default()
        };

        let (session, journal) = mock_session(script.clone());
        session.connect().await.unwrap();
        assert_eq!(
            session.authenticate_by_keyboard_interactive().await,
            Err(SessionError::NoInteractiveHandler)
        );
        assert!(!journal.lock().iter().any(|e| e.starts_with("kbi")));
        assert_eq!(session.state(), SessionState::Connected);

        let delegate: Arc<dyn KeyboardInteractiveDelegate> = Arc::new(Answer("123456"));
        session.set_delegate(&delegate);
        session.authenticate_by_keyboard_interactive().await.unwrap();
        assert!(session.is_authorized());

        // A dropped delegate counts as absent
        let (session, _) = mock_session(script);
        session.connect().await.unwrap();
        session.set_delegate(&delegate);
        drop(delegate);
        assert_eq!(
            session.authenticate_by_keyboard_interactive().await,
            Err(SessionError::NoInteractiveHandler)
        );
    }

    #[tokio::test]
    async fn test_keyboard_interactive_callback_sees_prompts_in_order() {
        let (session, _) = mock_session(MockScript {
            kbi: vec![
                ("Password: ".into(), "hunter2".into()),
                ("Verification code: ".into(), "123456".into()),
            ],
            ..Default::default()
        });
        session.connect().await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        session
            .authenticate_by_keyboard_interactive_using(move |request| {
                seen_cb.lock().push(request.to_string());
                match request {
                    "Password: " => "hunter2".to_string(),
                    _ => "123456".to_string(),
                }
            })
            .await
            .unwrap();

        assert_eq!(
            *seen.lock(),
            vec!["Password: ".to_string(), "Verification code: ".to_string()]
        );
    }

    #[tokio::test]
    async fn test_public_key_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("id_ed25519");
        std::fs::write(&private, "accepted key").unwrap();

        let (session, _) = mock_session(MockScript::default());
        session.connect().await.unwrap();

        let missing = dir.path().join("missing");
        assert!(matches!(
            session.authenticate_by_public_key(None, &missing, None).await,
            Err(SessionError::KeyFileUnreadable(_))
        ));
        session
            .authenticate_by_public_key(None, &private, Some(""))
            .await
            .unwrap();
        assert!(session.is_authorized());
    }

    #[tokio::test]
    async fn test_agent_identities() {
        let (session, _) = mock_session(MockScript {
            agent: vec![("old@laptop".into(), false), ("new@laptop".into(), true)],
            ..Default::default()
        });
        session.connect().await.unwrap();
        session.connect_to_agent().await.unwrap();
        assert!(session.is_authorized());
    }

    #[tokio::test]
    async fn test_supported_authentication_methods() {
        let (session, _) = mock_session(password_script());
        assert_eq!(
            session.supported_authentication_methods().await,
            Err(SessionError::NotConnected)
        );
        session.connect().await.unwrap();
        assert_eq!(
            session.supported_authentication_methods().await.unwrap(),
            vec!["publickey".to_string(), "password".to_string()]
        );
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_none_method_authorizes() {
        let (session, _) = mock_session(MockScript::default());
        session.connect().await.unwrap();
        assert!(session.supported_authentication_methods().await.unwrap().is_empty());
        assert!(session.is_authorized());
    }

    #[tokio::test]
    async fn test_channel_handles_close_with_session() {
        let (session, _) = mock_session(password_script());
        session.connect().await.unwrap();
        assert!(matches!(
            session.open_channel().await,
            Err(SessionError::InvalidState(_))
        ));

        session.authenticate_by_password("hunter2").await.unwrap();
        let channel = session.open_channel().await.unwrap();
        let sftp = session.open_sftp().await.unwrap();
        assert_eq!(channel.get().unwrap(), "channel-1");
        assert_eq!(sftp.get().unwrap(), "sftp");

        session.disconnect().await;
        assert_eq!(channel.get().unwrap_err(), SessionError::SessionClosed);
        assert_eq!(sftp.into_inner().unwrap_err(), SessionError::SessionClosed);
    }

    #[tokio::test]
    async fn test_raw_transport() {
        let (session, _) = mock_session(MockScript::default());
        assert_eq!(
            session
                .raw_transport::<usize, _>(|t: &mut MockTransport| Box::pin(async move { t.journal().len() }))
                .await,
            Err(SessionError::NotConnected)
        );

        session.connect().await.unwrap();
        let entries = session
            .raw_transport::<usize, _>(|t: &mut MockTransport| Box::pin(async move { t.journal().len() }))
            .await
            .unwrap();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let (slow, _) = mock_session(MockScript {
            password: Some("a".into()),
            auth_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let (fast, _) = mock_session(password_script());
        slow.connect().await.unwrap();
        fast.connect().await.unwrap();

        let (slow_result, fast_result) = tokio::join!(
            slow.authenticate_by_password("a"),
            async {
                let r = fast.authenticate_by_password("hunter2").await;
                (r, slow.state())
            }
        );
        slow_result.unwrap();
        let (fast_auth, slow_state_then) = fast_result;
        fast_auth.unwrap();
        assert_ne!(slow_state_then, SessionState::Authorized);
    }
}
