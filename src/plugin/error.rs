//! Plugin system error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::handshake::HandshakeError;
use super::protocol::JsonRpcError;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Result type for RPC channel operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors that can occur while loading or driving a plugin process.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Plugin executable not found.
    #[error("Plugin executable not found: {0}")]
    NotFound(PathBuf),

    /// The file exists but cannot be executed.
    #[error("Permission denied executing {0}")]
    PermissionDenied(PathBuf),

    /// Any other OS-level spawn failure.
    #[error("Failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The child never printed a handshake line.
    #[error("Plugin did not complete the handshake within {0:?}")]
    HandshakeTimeout(Duration),

    /// The child exited (or closed stdout) before printing a handshake line.
    #[error("Plugin exited before completing the handshake")]
    ExitedEarly,

    /// The handshake line was received but rejected.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Connecting or talking to the plugin's RPC server failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Filesystem error while scanning the plugin directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Classify a spawn failure into a distinct variant.
    pub fn from_spawn(path: PathBuf, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Spawn { path, source },
        }
    }
}

/// Errors raised by the RPC channel.
///
/// `Status` is a logical failure reported by the plugin itself. Every other
/// variant is a transport failure.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Could not connect to the address from the handshake.
    #[error("Failed to connect to plugin at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing the stream failed.
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The call did not complete within the configured timeout.
    #[error("Plugin did not respond within {0:?}")]
    Timeout(Duration),

    /// The plugin closed the connection.
    #[error("Plugin closed the connection")]
    Disconnected,

    /// The peer sent something that is not a valid response.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The plugin answered with an error status.
    #[error("rpc error: code = {} desc = {}", .0.code, .0.message)]
    Status(JsonRpcError),
}

impl RpcError {
    /// Whether this is a plugin-reported error rather than a transport failure.
    pub fn is_status(&self) -> bool {
        matches!(self, Self::Status(_))
    }

    /// Extract the plain status message, if this is a status error.
    pub fn status_message(&self) -> Option<&str> {
        match self {
            Self::Status(status) => Some(&status.message),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_classification() {
        let path = PathBuf::from("/plugins/foo");

        let err = PluginError::from_spawn(path.clone(), std::io::ErrorKind::NotFound.into());
        assert!(matches!(err, PluginError::NotFound(_)));

        let err =
            PluginError::from_spawn(path.clone(), std::io::ErrorKind::PermissionDenied.into());
        assert!(matches!(err, PluginError::PermissionDenied(_)));

        let err = PluginError::from_spawn(path, std::io::ErrorKind::Other.into());
        assert!(matches!(err, PluginError::Spawn { .. }));
    }

    #[test]
    fn test_status_message() {
        let err = RpcError::Status(JsonRpcError::new(2, "missing --project flag"));
        assert!(err.is_status());
        assert_eq!(err.status_message(), Some("missing --project flag"));
        assert_eq!(err.to_string(), "rpc error: code = 2 desc = missing --project flag");

        let err = RpcError::Disconnected;
        assert!(!err.is_status());
        assert_eq!(err.status_message(), None);
    }
}
