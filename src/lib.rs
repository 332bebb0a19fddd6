//! SSH client session layer
//!
//! Connects to a remote host, verifies its identity against OpenSSH
//! known_hosts files, authenticates the user and hands out channel and SFTP
//! handles bound to the session's lifetime. The SSH protocol itself is
//! provided by russh.

pub mod logging;
pub mod ssh;

pub use logging::init_logging;
pub use ssh::{
    AuthenticationStrategy, FingerprintHash, KeyboardInteractiveDelegate, KnownHostStatus,
    Session, SessionConfig, SessionError, SessionState,
};
