//! Wire types for the plugin RPC channel.
//!
//! The channel speaks JSON-RPC 2.0 with one message per line. Only two
//! methods exist: [`METHOD_GET_INFO`] and [`METHOD_RUN`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method returning the plugin's self-description.
pub const METHOD_GET_INFO: &str = "Plugin.GetInfo";

/// Method asking the plugin to execute its command.
pub const METHOD_RUN: &str = "Plugin.Run";

/// Standard JSON-RPC error codes.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Application-level failure reported by a plugin's `Run`.
    pub const PLUGIN_FAILURE: i32 = 2;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,
    /// Request ID
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Parameters (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self { jsonrpc: "2.0".to_string(), id: id.into(), method: method.into(), params }
    }
}

/// JSON-RPC request ID (can be string or number).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// String ID
    String(String),
    /// Numeric ID
    Number(i64),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version
    pub jsonrpc: String,
    /// Request ID (null when the request could not be parsed)
    pub id: Option<RequestId>,
    /// Result (if successful)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (if failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: Some(result), error: None }
    }

    /// Build an error response.
    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: None, error: Some(error) }
    }

    /// Check if the response is successful.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Get the result value.
    ///
    /// The outer error is the plugin's status; the inner one means the result
    /// payload did not match `T`.
    pub fn into_result<T: for<'de> Deserialize<'de>>(
        self,
    ) -> Result<Result<T, serde_json::Error>, JsonRpcError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(serde_json::from_value(self.result.unwrap_or(Value::Null)))
    }
}

/// JSON-RPC 2.0 error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error without attached data.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// Result of [`METHOD_GET_INFO`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Canonical command name of the plugin.
    pub name: String,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Plugin version string.
    #[serde(default)]
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let request = JsonRpcRequest::new(1, METHOD_GET_INFO, None);
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"jsonrpc":"2.0","id":1,"method":"Plugin.GetInfo"}"#);
    }

    #[test]
    fn test_response_into_info() {
        let json = r#"{"jsonrpc":"2.0","id":1,"result":{"name":"foo","description":"Does foo","version":"1.0"}}"#;
        let response: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert!(response.is_success());

        let info: PluginInfo = response.into_result().unwrap().unwrap();
        assert_eq!(info.name, "foo");
        assert_eq!(info.version, "1.0");
    }

    #[test]
    fn test_response_with_error() {
        let json = r#"{"jsonrpc":"2.0","id":7,"error":{"code":2,"message":"boom"}}"#;
        let response: JsonRpcResponse = serde_json::from_str(json).unwrap();
        assert!(!response.is_success());

        let err = response.into_result::<PluginInfo>().unwrap_err();
        assert_eq!(err, JsonRpcError::new(2, "boom"));
    }

    #[test]
    fn test_null_id_round_trips() {
        let response = JsonRpcResponse::failure(
            None,
            JsonRpcError::new(codes::PARSE_ERROR, "Parse error"),
        );
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""id":null"#));
    }
}
