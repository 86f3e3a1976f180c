//! Handshake contract shared by the host and its plugins.
//!
//! The host injects a cookie into the child's environment. A conforming
//! plugin refuses to start unless the cookie matches, then announces how to
//! reach its RPC server by printing a single line on stdout:
//!
//! ```text
//! CORE|NEGOTIATED|TRANSPORT|ADDRESS|PROTOCOL
//! 1|1|tcp|127.0.0.1:50123|jsonrpc
//! ```

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Version of the handshake line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Name of the only channel protocol the host speaks.
pub const CHANNEL_PROTOCOL: &str = "jsonrpc";

/// Environment variable carrying the host's supported version set.
pub const PROTOCOL_VERSIONS_ENV: &str = "SPRIG_PLUGIN_PROTOCOL_VERSIONS";

/// The handshake shared between the host and every plugin.
pub const HANDSHAKE: HandshakeConfig = HandshakeConfig {
    cookie_key: "SPRIG_PLUGIN_COOKIE",
    cookie_value: "4c6b0e3f9d2a4e8c8f1b7a5d3e9c2f60",
    protocol_versions: &[1],
};

/// Process-wide handshake constants.
///
/// The cookie is not a security boundary; it only lets a plugin notice that
/// it was launched by hand instead of by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Environment variable name.
    pub cookie_key: &'static str,
    /// Expected value of the environment variable.
    pub cookie_value: &'static str,
    /// Supported application protocol versions, ascending.
    pub protocol_versions: &'static [u32],
}

impl HandshakeConfig {
    /// Whether `value` is the expected cookie.
    pub fn cookie_matches(&self, value: Option<&str>) -> bool {
        value == Some(self.cookie_value)
    }

    /// Whether `version` is in the supported set.
    pub fn supports(&self, version: u32) -> bool {
        self.protocol_versions.contains(&version)
    }

    /// Encode the supported set for [`PROTOCOL_VERSIONS_ENV`].
    pub fn versions_env_value(&self) -> String {
        self.protocol_versions.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
    }

    /// Parse a handshake line and validate it against this config.
    pub fn parse_line(&self, line: &str) -> Result<HandshakeLine, HandshakeError> {
        let line: HandshakeLine = line.parse()?;

        if line.core_version != CORE_PROTOCOL_VERSION {
            return Err(HandshakeError::CoreVersion(line.core_version));
        }
        if !self.supports(line.protocol_version) {
            return Err(HandshakeError::UnsupportedVersion {
                version: line.protocol_version,
                supported: self.protocol_versions.to_vec(),
            });
        }
        if line.protocol != CHANNEL_PROTOCOL {
            return Err(HandshakeError::UnsupportedProtocol(line.protocol));
        }

        Ok(line)
    }
}

/// Pick the highest version both sides support.
pub fn negotiate(ours: &[u32], theirs: &[u32]) -> Option<u32> {
    ours.iter().copied().filter(|v| theirs.contains(v)).max()
}

/// Parse a comma-separated version list, ignoring junk entries.
pub fn parse_versions(value: &str) -> Vec<u32> {
    value.split(',').filter_map(|v| v.trim().parse().ok()).collect()
}

/// Stream transport announced by the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// TCP, address is `host:port`.
    Tcp,
    /// Unix domain socket, address is a filesystem path.
    Unix,
}

impl Transport {
    /// Wire name of the transport.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            other => Err(HandshakeError::UnsupportedTransport(other.to_string())),
        }
    }
}

/// The single line a plugin prints once its server is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub core_version: u32,
    pub protocol_version: u32,
    pub transport: Transport,
    pub address: String,
    pub protocol: String,
}

impl HandshakeLine {
    /// Line announcing a server speaking [`CHANNEL_PROTOCOL`].
    pub fn new(protocol_version: u32, transport: Transport, address: impl Into<String>) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            protocol_version,
            transport,
            address: address.into(),
            protocol: CHANNEL_PROTOCOL.to_string(),
        }
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_version, self.protocol_version, self.transport, self.address, self.protocol
        )
    }
}

impl FromStr for HandshakeLine {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('|').collect();
        if parts.len() != 5 {
            return Err(HandshakeError::Malformed(trimmed.to_string()));
        }

        let number = |field: &str| {
            field.parse::<u32>().map_err(|_| HandshakeError::Malformed(trimmed.to_string()))
        };

        let address = parts[3];
        if address.is_empty() {
            return Err(HandshakeError::Malformed(trimmed.to_string()));
        }

        Ok(Self {
            core_version: number(parts[0])?,
            protocol_version: number(parts[1])?,
            transport: parts[2].parse()?,
            address: address.to_string(),
            protocol: parts[4].to_string(),
        })
    }
}

/// Reasons a handshake line is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Malformed handshake line: {0:?}")]
    Malformed(String),

    #[error("Incompatible core handshake version {0} (host speaks {core})", core = CORE_PROTOCOL_VERSION)]
    CoreVersion(u32),

    #[error("Plugin negotiated protocol version {version}, host supports {supported:?}")]
    UnsupportedVersion { version: u32, supported: Vec<u32> },

    #[error("Unsupported transport {0:?}")]
    UnsupportedTransport(String),

    #[error("Unsupported channel protocol {0:?}")]
    UnsupportedProtocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_line() {
        let line = HANDSHAKE.parse_line("1|1|tcp|127.0.0.1:40123|jsonrpc\n").unwrap();
        assert_eq!(line.transport, Transport::Tcp);
        assert_eq!(line.address, "127.0.0.1:40123");
        assert_eq!(line.protocol_version, 1);
    }

    #[test]
    fn test_display_matches_parse() {
        let line = HandshakeLine::new(1, Transport::Unix, "/tmp/plugin.sock");
        assert_eq!(line.to_string(), "1|1|unix|/tmp/plugin.sock|jsonrpc");
        assert_eq!(HANDSHAKE.parse_line(&line.to_string()).unwrap(), line);
    }

    #[test]
    fn test_unsupported_version() {
        let err = HANDSHAKE.parse_line("1|99|tcp|127.0.0.1:1|jsonrpc").unwrap_err();
        assert!(matches!(err, HandshakeError::UnsupportedVersion { version: 99, .. }));
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(
            HANDSHAKE.parse_line("hello world"),
            Err(HandshakeError::Malformed(_))
        ));
        assert!(matches!(
            HANDSHAKE.parse_line("1|x|tcp|127.0.0.1:1|jsonrpc"),
            Err(HandshakeError::Malformed(_))
        ));
        assert!(matches!(
            HANDSHAKE.parse_line("2|1|tcp|127.0.0.1:1|jsonrpc"),
            Err(HandshakeError::CoreVersion(2))
        ));
        assert!(matches!(
            HANDSHAKE.parse_line("1|1|udp|127.0.0.1:1|jsonrpc"),
            Err(HandshakeError::UnsupportedTransport(_))
        ));
        assert!(matches!(
            HANDSHAKE.parse_line("1|1|tcp|127.0.0.1:1|grpc"),
            Err(HandshakeError::UnsupportedProtocol(_))
        ));
        assert!(matches!(HANDSHAKE.parse_line("1|1|tcp||jsonrpc"), Err(HandshakeError::Malformed(_))));
    }

    #[test]
    fn test_negotiate_picks_highest_common() {
        assert_eq!(negotiate(&[1, 2, 3], &[2, 3, 4]), Some(3));
        assert_eq!(negotiate(&[1], &[2]), None);
        assert_eq!(parse_versions("1, 2,x,3"), vec![1, 2, 3]);
    }

    #[test]
    fn test_cookie() {
        assert!(HANDSHAKE.cookie_matches(Some(HANDSHAKE.cookie_value)));
        assert!(!HANDSHAKE.cookie_matches(Some("nope")));
        assert!(!HANDSHAKE.cookie_matches(None));
        assert_eq!(HANDSHAKE.versions_env_value(), "1");
    }
}
