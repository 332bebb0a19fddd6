//! Known hosts management for SSH host key verification
//!
//! Reads and appends OpenSSH `known_hosts` files. Supports comma-separated
//! host lists, `*`/`?` wildcards, `!` negation, `[host]:port` names for
//! non-standard ports and hashed (`|1|salt|hash`) names.
//!
//! Lookups walk an ordered list of files. The first file holding an entry of
//! the live key's type decides the outcome, so a mismatch in an earlier file
//! can never be hidden by a match in a later one.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Serialize;
use sha1::Sha1;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::Endpoint;
use super::fingerprint::{self, FingerprintHash};

type HmacSha1 = Hmac<Sha1>;

/// Prefix of hashed host names
const HASH_MAGIC: &str = "|1|";

/// Result of a known_hosts lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownHostStatus {
    /// A stored key equals the live key
    Match,
    /// The host is known with a different key (possible MITM)
    Mismatch,
    /// No file holds an entry for this host
    NotFound,
    /// None of the existing files could be read
    Failure,
}

#[derive(Debug, Error)]
pub enum KnownHostsError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Salt is not valid base64: {0}")]
    InvalidSalt(String),

    #[error("No default known_hosts location available")]
    NoDefaultPath,
}

impl From<KnownHostsError> for super::error::SessionError {
    fn from(err: KnownHostsError) -> Self {
        super::error::SessionError::TrustFileUnreadable(err.to_string())
    }
}

/// Public key presented by the server during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    /// Key type name as written in known_hosts, e.g. `ssh-ed25519`
    pub algorithm: String,
    /// SSH wire-format public key blob
    pub blob: Vec<u8>,
}

impl HostKey {
    pub fn new(algorithm: impl Into<String>, blob: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            blob,
        }
    }

    pub fn fingerprint(&self, hash: FingerprintHash) -> String {
        fingerprint::compute(hash, &self.blob)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.blob)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    CertAuthority,
    Revoked,
}

#[derive(Debug, Clone)]
enum HostNames {
    /// `|1|salt|hash`, both base64
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
    /// Comma-separated patterns, lowercased
    Patterns(Vec<String>),
}

impl HostNames {
    fn matches(&self, name: &str) -> bool {
        match self {
            HostNames::Hashed { salt, hash } => {
                let Ok(mut mac) = HmacSha1::new_from_slice(salt) else {
                    return false;
                };
                mac.update(name.as_bytes());
                mac.verify_slice(hash).is_ok()
            }
            HostNames::Patterns(patterns) => {
                let mut matched = false;
                for pattern in patterns {
                    if let Some(negated) = pattern.strip_prefix('!') {
                        if wildcard_match(negated, name) {
                            return false;
                        }
                    } else if wildcard_match(pattern, name) {
                        matched = true;
                    }
                }
                matched
            }
        }
    }
}

#[derive(Debug, Clone)]
struct KnownHostEntry {
    marker: Option<Marker>,
    hosts: HostNames,
    key_type: String,
    key: Vec<u8>,
}

/// Outcome of checking one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileVerdict {
    Match,
    Mismatch,
    NoEntry,
}

/// A parsed known_hosts file
#[derive(Debug, Clone)]
pub struct KnownHostsFile {
    entries: Vec<KnownHostEntry>,
}

impl KnownHostsFile {
    /// Parse file contents. Any malformed non-comment line rejects the file.
    pub fn parse(path: impl Into<PathBuf>, content: &str) -> Result<Self, KnownHostsError> {
        let path = path.into();
        let mut entries = Vec::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let malformed = |reason: &str| KnownHostsError::Malformed {
                path: path.clone(),
                line: idx + 1,
                reason: reason.to_string(),
            };

            let mut parts = line.split_whitespace();
            let mut first = parts.next().ok_or_else(|| malformed("empty line"))?;

            let marker = match first {
                "@cert-authority" => Some(Marker::CertAuthority),
                "@revoked" => Some(Marker::Revoked),
                m if m.starts_with('@') => return Err(malformed("unknown marker")),
                _ => None,
            };
            if marker.is_some() {
                first = parts.next().ok_or_else(|| malformed("missing host field"))?;
            }

            let key_type = parts.next().ok_or_else(|| malformed("missing key type"))?;
            let key_b64 = parts.next().ok_or_else(|| malformed("missing key data"))?;
            let key = BASE64
                .decode(key_b64)
                .map_err(|_| malformed("key data is not valid base64"))?;

            let hosts = if let Some(hashed) = first.strip_prefix(HASH_MAGIC) {
                let (salt, hash) = hashed
                    .split_once('|')
                    .ok_or_else(|| malformed("hashed host missing separator"))?;
                HostNames::Hashed {
                    salt: BASE64
                        .decode(salt)
                        .map_err(|_| malformed("hashed host salt is not base64"))?,
                    hash: BASE64
                        .decode(hash)
                        .map_err(|_| malformed("hashed host digest is not base64"))?,
                }
            } else {
                HostNames::Patterns(first.split(',').map(|h| h.to_lowercase()).collect())
            };

            entries.push(KnownHostEntry {
                marker,
                hosts,
                key_type: key_type.to_string(),
                key,
            });
        }

        Ok(Self { entries })
    }

    /// Read and parse a file. `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, KnownHostsError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(path, &content).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(KnownHostsError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check `name` (known_hosts form) against the live key.
    /// A matching key wins over a differing key of the same type.
    fn check(&self, name: &str, key: &HostKey) -> FileVerdict {
        let mut mismatch = false;

        for entry in &self.entries {
            if entry.marker.is_some() || entry.key_type != key.algorithm {
                continue;
            }
            if !entry.hosts.matches(name) {
                continue;
            }
            if entry.key == key.blob {
                return FileVerdict::Match;
            }
            mismatch = true;
        }

        if mismatch {
            FileVerdict::Mismatch
        } else {
            FileVerdict::NoEntry
        }
    }
}

/// Ordered list of known_hosts files
#[derive(Debug, Clone)]
pub struct KnownHostStore {
    files: Vec<PathBuf>,
}

impl KnownHostStore {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }

    /// Verify the live key for `endpoint` across all files in order
    pub fn status(&self, endpoint: &Endpoint, key: &HostKey) -> KnownHostStatus {
        let name = endpoint.known_hosts_name();
        let mut existing = 0usize;
        let mut failed = 0usize;

        for path in &self.files {
            let file = match KnownHostsFile::load(path) {
                Ok(Some(file)) => file,
                Ok(None) => {
                    debug!("known_hosts file {} not present, skipping", path.display());
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read known_hosts file: {}", e);
                    existing += 1;
                    failed += 1;
                    continue;
                }
            };
            existing += 1;

            match file.check(&name, key) {
                FileVerdict::Match => {
                    debug!("Host key for {} matched in {}", name, path.display());
                    return KnownHostStatus::Match;
                }
                FileVerdict::Mismatch => {
                    warn!(
                        "HOST KEY MISMATCH for {} in {} (type: {}, live fingerprint: {})",
                        name,
                        path.display(),
                        key.algorithm,
                        key.fingerprint(FingerprintHash::Sha256)
                    );
                    return KnownHostStatus::Mismatch;
                }
                FileVerdict::NoEntry => {}
            }
        }

        if existing > 0 && failed == existing {
            KnownHostStatus::Failure
        } else {
            debug!("No known_hosts entry for {}", name);
            KnownHostStatus::NotFound
        }
    }

    /// Append a record for `key` to `file`.
    ///
    /// With `salt`, `host_name` must already be the base64 HMAC-SHA1 digest of
    /// the host name and the record is written in hashed form.
    pub fn add(
        file: &Path,
        host_name: &str,
        port: u16,
        salt: Option<&str>,
        key: &HostKey,
    ) -> Result<(), KnownHostsError> {
        let name = match salt {
            Some(salt) => {
                BASE64
                    .decode(salt)
                    .map_err(|_| KnownHostsError::InvalidSalt(salt.to_string()))?;
                format!("{}{}|{}", HASH_MAGIC, salt, host_name)
            }
            None if port != super::config::DEFAULT_PORT && !host_name.starts_with('[') => {
                format!("[{}]:{}", host_name, port)
            }
            None => host_name.to_string(),
        };

        let io_err = |source: io::Error| KnownHostsError::Io {
            path: file.to_path_buf(),
            source,
        };

        if let Some(parent) = file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        // Keep the new record on its own line if the file lacks a trailing newline
        let needs_newline = match fs::read(file) {
            Ok(existing) => !existing.is_empty() && !existing.ends_with(b"\n"),
            Err(_) => false,
        };

        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
            .map_err(io_err)?;

        let mut record = String::new();
        if needs_newline {
            record.push('\n');
        }
        record.push_str(&format!("{} {} {}\n", name, key.algorithm, key.to_base64()));
        handle.write_all(record.as_bytes()).map_err(io_err)?;

        info!(
            "Added host key for {} (type: {}) to {}",
            name,
            key.algorithm,
            file.display()
        );
        Ok(())
    }
}

/// Default known_hosts files, user file first
pub fn default_known_hosts_files() -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Some(path) = default_user_known_hosts() {
        files.push(path);
    }
    #[cfg(unix)]
    files.push(PathBuf::from("/etc/ssh/ssh_known_hosts"));
    files
}

/// `~/.ssh/known_hosts`
pub fn default_user_known_hosts() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts"))
}

/// Fresh 20-byte salt for hashed host names
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; 20];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// base64(HMAC-SHA1(salt, name)) where name is `host` or `[host]:port`
pub fn hash_host_name(host: &str, port: u16, salt: &[u8]) -> Result<String, KnownHostsError> {
    let name = Endpoint {
        host: host.to_string(),
        port,
    }
    .known_hosts_name();
    let mut mac = HmacSha1::new_from_slice(salt)
        .map_err(|e| KnownHostsError::InvalidSalt(e.to_string()))?;
    mac.update(name.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Glob match supporting `*` and `?`
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
