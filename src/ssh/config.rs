//! SSH Session configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SessionError;
use super::fingerprint::FingerprintHash;

/// Default SSH port
pub const DEFAULT_PORT: u16 = 22;

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Timeout for connect and each authentication round-trip, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Hash used by `Session::fingerprint_default` (default: md5)
    #[serde(default)]
    pub fingerprint_hash: FingerprintHash,

    /// Identification string sent to the server, e.g. "MyClient_1.0".
    /// The `SSH-2.0-` prefix is added when missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,

    /// Keepalive interval in seconds (None disables keepalives)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: Option<u64>,

    /// Disconnect after this many unanswered keepalives
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// known_hosts files consulted when the caller passes none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_hosts_files: Option<Vec<PathBuf>>,
}

fn default_timeout() -> u64 {
    10
}

fn default_keepalive_interval() -> Option<u64> {
    Some(30)
}

fn default_keepalive_max() -> usize {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            fingerprint_hash: FingerprintHash::default(),
            banner: None,
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            known_hosts_files: None,
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a JSON document, filling in defaults
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        let config: SessionConfig = serde_json::from_str(json)?;
        if config.timeout_secs == 0 {
            return Err(SessionError::Config(
                "timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_secs.map(Duration::from_secs)
    }

    /// Client identification string in RFC 4253 form
    pub fn client_id(&self) -> Option<String> {
        self.banner.as_ref().map(|banner| {
            if banner.starts_with("SSH-2.0-") {
                banner.clone()
            } else {
                format!("SSH-2.0-{}", banner)
            }
        })
    }
}

/// A resolved (host, port) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Split a host string that may embed a port.
    ///
    /// Accepted forms: `host`, `host:port`, `[v6addr]`, `[v6addr]:port` and a
    /// bare IPv6 address. An embedded port overrides `default_port`.
    pub fn parse(host: &str, default_port: u16) -> Self {
        let host = host.trim();

        if let Some(rest) = host.strip_prefix('[') {
            if let Some(idx) = rest.find(']') {
                let name = &rest[..idx];
                let port = rest[idx + 1..]
                    .strip_prefix(':')
                    .and_then(|p| p.parse::<u16>().ok())
                    .unwrap_or(default_port);
                return Self {
                    host: name.to_string(),
                    port,
                };
            }
        }

        // Exactly one colon means host:port, more than one is a bare IPv6 address
        if host.matches(':').count() == 1 {
            if let Some((name, port)) = host.split_once(':') {
                if let Ok(port) = port.parse::<u16>() {
                    return Self {
                        host: name.to_string(),
                        port,
                    };
                }
            }
        }

        Self {
            host: host.to_string(),
            port: default_port,
        }
    }

    /// Address string suitable for DNS resolution
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Host name as written in known_hosts (`[host]:port` for non-default ports)
    pub fn known_hosts_name(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.to_lowercase()
        } else {
            format!("[{}]:{}", self.host.to_lowercase(), self.port)
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.socket_addr_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_host() {
        let ep = Endpoint::parse("example.com", 22);
        assert_eq!(ep.host, "example.com");
        assert_eq!(ep.port, 22);
    }

    #[test]
    fn test_parse_embedded_port() {
        let ep = Endpoint::parse("example.com:2222", 22);
        assert_eq!(ep.host, "example.com");
        assert_eq!(ep.port, 2222);
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let ep = Endpoint::parse("[fe80::1]:2200", 22);
        assert_eq!(ep.host, "fe80::1");
        assert_eq!(ep.port, 2200);

        let ep = Endpoint::parse("[::1]", 2022);
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 2022);
    }

    #[test]
    fn test_parse_bare_ipv6() {
        let ep = Endpoint::parse("2001:db8::1", 22);
        assert_eq!(ep.host, "2001:db8::1");
        assert_eq!(ep.port, 22);
        assert_eq!(ep.socket_addr_string(), "[2001:db8::1]:22");
    }

    #[test]
    fn test_parse_invalid_port_keeps_default() {
        let ep = Endpoint::parse("example.com:ssh", 22);
        assert_eq!(ep.host, "example.com:ssh");
        assert_eq!(ep.port, 22);
    }

    #[test]
    fn test_known_hosts_name() {
        assert_eq!(Endpoint::parse("GitHub.com", 22).known_hosts_name(), "github.com");
        assert_eq!(
            Endpoint::parse("server.com", 2222).known_hosts_name(),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.fingerprint_hash, FingerprintHash::Md5);
        assert!(config.banner.is_none());
        assert_eq!(config.keepalive_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_config_from_json() {
        let config = SessionConfig::from_json(
            r#"{ "timeout_secs": 5, "fingerprint_hash": "sha1", "banner": "Probe_1.0" }"#,
        )
        .unwrap();
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.fingerprint_hash, FingerprintHash::Sha1);
        assert_eq!(config.client_id().as_deref(), Some("SSH-2.0-Probe_1.0"));
        assert_eq!(config.keepalive_max, 3);

        let config = SessionConfig::from_json("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_config_rejects_zero_timeout() {
        let result = SessionConfig::from_json(r#"{ "timeout_secs": 0 }"#);
        assert!(matches!(result, Err(SessionError::Config(_))));
    }
}
