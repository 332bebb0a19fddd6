//! Serial Executor
//!
//! One owner task per session holds the transport exclusively. Every
//! operation reaches it as an `ExecutorCommand` over an mpsc queue and gets
//! its result back through a oneshot, so transport calls never overlap and
//! run in submission order.
//!
//! Shutdown is driven by a `CancellationToken`: the in-flight command is
//! abandoned with `SessionClosed`, queued commands are drained with the same
//! error, the transport is closed and disconnect subscribers are notified.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::{bounded, AuthenticationStrategy};
use super::config::{Endpoint, SessionConfig};
use super::error::SessionError;
use super::fingerprint::FingerprintHash;
use super::keyboard_interactive::DelegateSlot;
use super::known_hosts::{
    default_known_hosts_files, default_user_known_hosts, HostKey, KnownHostStatus, KnownHostStore,
    KnownHostsError,
};
use super::state::{AuthSlot, SessionState, SharedState};
use super::transport::{HandshakeParams, Transport};

/// Queue depth between the session handle and its owner task
const COMMAND_QUEUE_DEPTH: usize = 64;

pub(crate) type TransportFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Closure run against the transport on the owner task
pub(crate) type RawJob<T> = Box<dyn for<'a> FnOnce(&'a mut T) -> TransportFuture<'a> + Send>;

pub(crate) fn raw_job<T, F>(f: F) -> RawJob<T>
where
    F: for<'a> FnOnce(&'a mut T) -> TransportFuture<'a> + Send + 'static,
{
    Box::new(f)
}

type Reply<R> = oneshot::Sender<Result<R, SessionError>>;

/// Commands sent to the owner task
pub(crate) enum ExecutorCommand<T: Transport> {
    Connect {
        timeout: Duration,
        reply_tx: Reply<()>,
    },
    Authenticate {
        strategy: AuthenticationStrategy,
        slot: AuthSlot,
        reply_tx: Reply<()>,
    },
    AuthMethods {
        reply_tx: Reply<Vec<String>>,
    },
    Fingerprint {
        hash: FingerprintHash,
        reply_tx: Reply<String>,
    },
    KnownHostStatus {
        files: Option<Vec<PathBuf>>,
        reply_tx: Reply<KnownHostStatus>,
    },
    AddKnownHost {
        host_name: String,
        port: u16,
        file: Option<PathBuf>,
        salt: Option<String>,
        reply_tx: oneshot::Sender<bool>,
    },
    OpenChannel {
        reply_tx: Reply<T::Channel>,
    },
    OpenSftp {
        reply_tx: Reply<T::Sftp>,
    },
    /// Run a caller-supplied job; the job delivers its own result
    Raw {
        job: RawJob<T>,
        reply_tx: Reply<()>,
    },
}

impl<T: Transport> ExecutorCommand<T> {
    fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Authenticate { .. } => "authenticate",
            Self::AuthMethods { .. } => "auth_methods",
            Self::Fingerprint { .. } => "fingerprint",
            Self::KnownHostStatus { .. } => "known_host_status",
            Self::AddKnownHost { .. } => "add_known_host",
            Self::OpenChannel { .. } => "open_channel",
            Self::OpenSftp { .. } => "open_sftp",
            Self::Raw { .. } => "raw_transport",
        }
    }

    /// Answer without executing
    fn fail(self, error: SessionError) {
        match self {
            Self::Connect { reply_tx, .. }
            | Self::Authenticate { reply_tx, .. }
            | Self::Raw { reply_tx, .. } => {
                let _ = reply_tx.send(Err(error));
            }
            Self::AuthMethods { reply_tx } => {
                let _ = reply_tx.send(Err(error));
            }
            Self::Fingerprint { reply_tx, .. } => {
                let _ = reply_tx.send(Err(error));
            }
            Self::KnownHostStatus { reply_tx, .. } => {
                let _ = reply_tx.send(Err(error));
            }
            Self::AddKnownHost { reply_tx, .. } => {
                let _ = reply_tx.send(false);
            }
            Self::OpenChannel { reply_tx } => {
                let _ = reply_tx.send(Err(error));
            }
            Self::OpenSftp { reply_tx } => {
                let _ = reply_tx.send(Err(error));
            }
        }
    }
}

/// Sender side of the owner task
pub(crate) struct ExecutorController<T: Transport> {
    cmd_tx: mpsc::Sender<ExecutorCommand<T>>,
    disconnect_tx: broadcast::Sender<()>,
    closed: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> ExecutorController<T> {
    /// Queue a command and wait for its reply
    pub(crate) async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> ExecutorCommand<T>,
    ) -> Result<R, SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::SessionClosed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::SessionClosed)?;
        reply_rx.await.map_err(|_| SessionError::SessionClosed)
    }

    pub(crate) fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Token cancelled when the session shuts down
    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Signal shutdown without waiting for the owner task
    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Signal shutdown and wait until the transport has been released
    pub(crate) async fn shutdown(&self) {
        self.closed.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Session executor task ended abnormally: {}", e);
            }
        }
    }
}

/// Everything the owner task needs to run commands
pub(crate) struct SessionCore<T: Transport> {
    pub(crate) session_id: String,
    pub(crate) transport: T,
    pub(crate) endpoint: Endpoint,
    pub(crate) username: String,
    pub(crate) config: SessionConfig,
    pub(crate) shared: Arc<SharedState>,
    pub(crate) delegate: DelegateSlot,
    pub(crate) host_key: Option<HostKey>,
}

/// Spawn the owner task. Requires a running tokio runtime.
pub(crate) fn spawn_executor<T: Transport>(core: SessionCore<T>) -> ExecutorController<T> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<ExecutorCommand<T>>(COMMAND_QUEUE_DEPTH);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let closed = CancellationToken::new();

    let task = tokio::spawn(run(core, cmd_rx, disconnect_tx.clone(), closed.clone()));

    ExecutorController {
        cmd_tx,
        disconnect_tx,
        closed,
        task: Mutex::new(Some(task)),
    }
}

async fn run<T: Transport>(
    mut core: SessionCore<T>,
    mut cmd_rx: mpsc::Receiver<ExecutorCommand<T>>,
    disconnect_tx: broadcast::Sender<()>,
    closed: CancellationToken,
) {
    info!("Session executor started for session {}", core.session_id);

    loop {
        tokio::select! {
            biased;
            _ = closed.cancelled() => {
                info!("Disconnect requested for session {}", core.session_id);
                break;
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => core.execute(cmd, &closed).await,
                None => {
                    info!("Session handle dropped for session {}", core.session_id);
                    break;
                }
            }
        }
    }

    // === Cleanup phase ===
    core.shared.transition(SessionState::Disconnected);
    drain_pending_commands(&mut cmd_rx);
    core.transport.disconnect().await;
    core.host_key = None;
    let _ = disconnect_tx.send(());
    info!("Session executor terminated for session {}", core.session_id);
}

/// Drain all pending commands, returning SessionClosed to each
fn drain_pending_commands<T: Transport>(cmd_rx: &mut mpsc::Receiver<ExecutorCommand<T>>) {
    cmd_rx.close();
    let mut drained = 0usize;
    while let Ok(cmd) = cmd_rx.try_recv() {
        cmd.fail(SessionError::SessionClosed);
        drained += 1;
    }
    if drained > 0 {
        debug!("Failed {} queued command(s) with SessionClosed", drained);
    }
}

/// Race `fut` against shutdown
async fn cancellable<F, R>(closed: &CancellationToken, fut: F) -> Result<R, SessionError>
where
    F: Future<Output = Result<R, SessionError>>,
{
    tokio::select! {
        biased;
        _ = closed.cancelled() => Err(SessionError::SessionClosed),
        result = fut => result,
    }
}

fn reply<R>(session_id: &str, op: &str, reply_tx: Reply<R>, result: Result<R, SessionError>) {
    if reply_tx.send(result).is_err() {
        warn!("Caller dropped before receiving {} result for session {}", op, session_id);
    }
}

impl<T: Transport> SessionCore<T> {
    async fn execute(&mut self, cmd: ExecutorCommand<T>, closed: &CancellationToken) {
        let op = cmd.name();
        debug!("Executing {} for session {}", op, self.session_id);

        match cmd {
            ExecutorCommand::Connect { timeout, reply_tx } => {
                let result = cancellable(closed, self.connect(timeout)).await;
                reply(&self.session_id, op, reply_tx, result);
            }

            ExecutorCommand::Authenticate {
                strategy,
                slot,
                reply_tx,
            } => {
                let result = cancellable(closed, self.authenticate(strategy)).await;
                drop(slot);
                reply(&self.session_id, op, reply_tx, result);
            }

            ExecutorCommand::AuthMethods { reply_tx } => {
                let result = cancellable(closed, self.auth_methods()).await;
                reply(&self.session_id, op, reply_tx, result);
            }

            ExecutorCommand::Fingerprint { hash, reply_tx } => {
                let result = self.live_host_key().map(|key| key.fingerprint(hash));
                reply(&self.session_id, op, reply_tx, result);
            }

            ExecutorCommand::KnownHostStatus { files, reply_tx } => {
                let result = cancellable(closed, self.known_host_status(files)).await;
                reply(&self.session_id, op, reply_tx, result);
            }

            ExecutorCommand::AddKnownHost {
                host_name,
                port,
                file,
                salt,
                reply_tx,
            } => {
                // A started write runs to completion so the reply matches the file
                let added = !closed.is_cancelled()
                    && self.add_known_host(host_name, port, file, salt).await;
                let _ = reply_tx.send(added);
            }

            ExecutorCommand::OpenChannel { reply_tx } => {
                let result = cancellable(closed, async {
                    self.require(SessionState::Authorized, "opening a channel")?;
                    let timeout = self.config.timeout();
                    bounded(timeout, self.transport.open_channel()).await
                })
                .await;
                reply(&self.session_id, op, reply_tx, result);
            }

            ExecutorCommand::OpenSftp { reply_tx } => {
                let result = cancellable(closed, async {
                    self.require(SessionState::Authorized, "opening SFTP")?;
                    let timeout = self.config.timeout();
                    bounded(timeout, self.transport.open_sftp()).await
                })
                .await;
                reply(&self.session_id, op, reply_tx, result);
            }

            ExecutorCommand::Raw { job, reply_tx } => {
                let result = cancellable(closed, async {
                    self.live_host_key()?;
                    job(&mut self.transport).await;
                    Ok(())
                })
                .await;
                reply(&self.session_id, op, reply_tx, result);
            }
        }
    }

    async fn connect(&mut self, timeout: Duration) -> Result<(), SessionError> {
        match self.shared.state() {
            SessionState::Idle => {}
            SessionState::Disconnected => return Err(SessionError::SessionClosed),
            other => {
                return Err(SessionError::InvalidState(format!(
                    "connect requires an idle session (state: {})",
                    other
                )))
            }
        }

        self.shared.transition(SessionState::Connecting);
        info!("Connecting to {} for session {}", self.endpoint, self.session_id);

        let params = HandshakeParams {
            timeout,
            client_id: self.config.client_id(),
            keepalive_interval: self.config.keepalive_interval(),
            keepalive_max: self.config.keepalive_max,
            delegate: self.delegate.clone(),
        };

        let outcome = match tokio::time::timeout(
            timeout,
            self.transport.handshake(&self.endpoint, &params),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::ConnectionTimeout(format!(
                "{}: no response within {:?}",
                self.endpoint, timeout
            ))),
        };

        match outcome {
            Ok(handshake) => {
                debug!(
                    "Server {} identifies as {:?}, host key type {}",
                    self.endpoint, handshake.remote_banner, handshake.host_key.algorithm
                );
                self.shared.set_remote_banner(handshake.remote_banner);
                self.host_key = Some(handshake.host_key);
                self.shared.transition(SessionState::Connected);
                info!("Connected to {} for session {}", self.endpoint, self.session_id);
                Ok(())
            }
            Err(e) => {
                self.shared.transition(SessionState::Failed);
                warn!("Connection to {} failed: {}", self.endpoint, e);
                Err(e)
            }
        }
    }

    async fn authenticate(&mut self, strategy: AuthenticationStrategy) -> Result<(), SessionError> {
        self.require(SessionState::Connected, "authentication")?;

        let method = strategy.method_name();
        self.shared.transition(SessionState::Authenticating);
        info!(
            "Authenticating {}@{} via {} for session {}",
            self.username, self.endpoint, method, self.session_id
        );

        let result = strategy
            .attempt(
                &mut self.transport,
                &self.username,
                &self.delegate,
                self.config.timeout(),
            )
            .await;

        match &result {
            Ok(()) => {
                self.shared.transition(SessionState::Authorized);
                info!("Authenticated {} via {}", self.username, method);
            }
            Err(e) => {
                self.shared.transition(SessionState::Connected);
                warn!("{} authentication for {} failed: {}", method, self.username, e);
            }
        }
        result
    }

    async fn auth_methods(&mut self) -> Result<Vec<String>, SessionError> {
        match self.shared.state() {
            SessionState::Connected => {}
            SessionState::Disconnected => return Err(SessionError::SessionClosed),
            state if !state.is_connected() => return Err(SessionError::NotConnected),
            state => {
                return Err(SessionError::InvalidState(format!(
                    "authentication methods are only available before authenticating (state: {})",
                    state
                )))
            }
        }

        let timeout = self.config.timeout();
        match bounded(timeout, self.transport.auth_methods(&self.username)).await? {
            Some(methods) => {
                debug!("Server offers authentication methods: {:?}", methods);
                Ok(methods)
            }
            None => {
                info!("Server accepted the none method for {}", self.username);
                self.shared.transition(SessionState::Authorized);
                Ok(Vec::new())
            }
        }
    }

    async fn known_host_status(
        &mut self,
        files: Option<Vec<PathBuf>>,
    ) -> Result<KnownHostStatus, SessionError> {
        let key = self.live_host_key()?.clone();
        let files = files
            .or_else(|| self.config.known_hosts_files.clone())
            .unwrap_or_else(default_known_hosts_files);
        let endpoint = self.endpoint.clone();

        tokio::task::spawn_blocking(move || KnownHostStore::new(files).status(&endpoint, &key))
            .await
            .map_err(|e| SessionError::TrustFileUnreadable(format!("known_hosts lookup failed: {}", e)))
    }

    async fn add_known_host(
        &mut self,
        host_name: String,
        port: u16,
        file: Option<PathBuf>,
        salt: Option<String>,
    ) -> bool {
        let key = match self.live_host_key() {
            Ok(key) => key.clone(),
            Err(e) => {
                warn!("Cannot record host key for {}: {}", host_name, e);
                return false;
            }
        };
        let Some(file) = file.or_else(default_user_known_hosts) else {
            warn!("Cannot record host key for {}: no home directory", host_name);
            self.shared.set_error(KnownHostsError::NoDefaultPath.into());
            return false;
        };

        let result = tokio::task::spawn_blocking(move || {
            KnownHostStore::add(&file, &host_name, port, salt.as_deref(), &key)
        })
        .await;

        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Failed to add known host: {}", e);
                self.shared.set_error(e.into());
                false
            }
            Err(e) => {
                warn!("known_hosts write task failed: {}", e);
                false
            }
        }
    }

    fn require(&self, wanted: SessionState, op: &str) -> Result<(), SessionError> {
        match self.shared.state() {
            state if state == wanted => Ok(()),
            SessionState::Disconnected => Err(SessionError::SessionClosed),
            state => Err(SessionError::InvalidState(format!(
                "{} requires a {} session (state: {})",
                op, wanted, state
            ))),
        }
    }

    /// Host key of the live connection
    fn live_host_key(&self) -> Result<&HostKey, SessionError> {
        match self.shared.state() {
            SessionState::Disconnected => Err(SessionError::SessionClosed),
            state if state.is_connected() => self.host_key.as_ref().ok_or(SessionError::NotConnected),
            _ => Err(SessionError::NotConnected),
        }
    }
}
