//! Plugin-side half of the host contract.
//!
//! A plugin binary implements [`PluginCommand`] and hands it to [`serve`]:
//!
//! ```rust,ignore
//! use sprig::sdk::{self, PluginCommand};
//! use sprig::plugin::PluginInfo;
//!
//! struct Hello;
//!
//! impl PluginCommand for Hello {
//!     fn info(&self) -> PluginInfo {
//!         PluginInfo {
//!             name: "hello".into(),
//!             description: "Say hello".into(),
//!             version: "0.1.0".into(),
//!         }
//!     }
//!
//!     fn run(&mut self, args: &[String]) -> Result<(), String> {
//!         println!("hello {}", args.join(" "));
//!         Ok(())
//!     }
//! }
//!
//! fn main() {
//!     if let Err(e) = sdk::serve(Hello) {
//!         eprintln!("{e}");
//!         std::process::exit(1);
//!     }
//! }
//! ```

use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpListener;

use serde_json::Value;
use thiserror::Error;

use crate::plugin::handshake::{self, HandshakeConfig, HandshakeLine, Transport, HANDSHAKE};
use crate::plugin::protocol::{
    codes, JsonRpcError, JsonRpcRequest, JsonRpcResponse, PluginInfo, METHOD_GET_INFO, METHOD_RUN,
};

/// What a plugin implements.
pub trait PluginCommand {
    /// Self-description returned to the host.
    fn info(&self) -> PluginInfo;

    /// Execute the command. The error string is reported to the host as the
    /// command's failure message.
    fn run(&mut self, args: &[String]) -> Result<(), String>;
}

/// Reasons a plugin refuses to serve.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(
        "This binary is a plugin. These are not meant to be executed directly. \
         Please execute the program that consumes these plugins, which will load \
         any plugins automatically."
    )]
    NotLaunchedByHost,

    #[error("No protocol version in common with the host (plugin {ours:?}, host {host:?})")]
    NoCommonVersion { ours: Vec<u32>, host: Vec<u32> },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Check the cookie, announce a listener, and serve the host's calls.
///
/// Arguments that are not valid UTF-8 reach [`PluginCommand::run`] lossily
/// converted. Returns once the host closes the connection.
pub fn serve<P: PluginCommand>(plugin: P) -> Result<(), ServeError> {
    let args: Vec<String> =
        std::env::args_os().skip(1).map(|arg| arg.to_string_lossy().into_owned()).collect();
    serve_with(plugin, &HANDSHAKE, args, &mut io::stdout())
}

fn serve_with<P: PluginCommand>(
    mut plugin: P,
    config: &HandshakeConfig,
    args: Vec<String>,
    announce: &mut impl Write,
) -> Result<(), ServeError> {
    let cookie = std::env::var(config.cookie_key).ok();
    if !config.cookie_matches(cookie.as_deref()) {
        return Err(ServeError::NotLaunchedByHost);
    }

    let host_versions = std::env::var(handshake::PROTOCOL_VERSIONS_ENV)
        .map(|v| handshake::parse_versions(&v))
        .unwrap_or_else(|_| config.protocol_versions.to_vec());
    let version = handshake::negotiate(config.protocol_versions, &host_versions).ok_or_else(
        || ServeError::NoCommonVersion {
            ours: config.protocol_versions.to_vec(),
            host: host_versions.clone(),
        },
    )?;

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let address = listener.local_addr()?.to_string();

    writeln!(announce, "{}", HandshakeLine::new(version, Transport::Tcp, address))?;
    announce.flush()?;

    let (stream, _) = listener.accept()?;
    drop(listener);

    let reader = BufReader::new(stream.try_clone()?);
    serve_connection(reader, stream, &mut plugin, &args)?;
    Ok(())
}

/// Answer newline-delimited requests until the reader hits end of stream.
pub fn serve_connection<P: PluginCommand>(
    mut reader: impl BufRead,
    mut writer: impl Write,
    plugin: &mut P,
    args: &[String],
) -> io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) => handle(request, plugin, args),
            Err(e) => JsonRpcResponse::failure(
                None,
                JsonRpcError::new(codes::PARSE_ERROR, format!("Parse error: {e}")),
            ),
        };

        let json = serde_json::to_string(&response)?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;
    }
}

fn handle<P: PluginCommand>(
    request: JsonRpcRequest,
    plugin: &mut P,
    args: &[String],
) -> JsonRpcResponse {
    let id = Some(request.id);
    if request.jsonrpc != "2.0" {
        return JsonRpcResponse::failure(
            id,
            JsonRpcError::new(
                codes::INVALID_REQUEST,
                format!("Unsupported JSON-RPC version: {}", request.jsonrpc),
            ),
        );
    }

    match request.method.as_str() {
        METHOD_GET_INFO => match serde_json::to_value(plugin.info()) {
            Ok(info) => JsonRpcResponse::success(id, info),
            Err(e) => JsonRpcResponse::failure(
                id,
                JsonRpcError::new(codes::INTERNAL_ERROR, e.to_string()),
            ),
        },
        METHOD_RUN => match plugin.run(args) {
            Ok(()) => JsonRpcResponse::success(id, Value::Null),
            Err(message) => {
                JsonRpcResponse::failure(id, JsonRpcError::new(codes::PLUGIN_FAILURE, message))
            }
        },
        other => JsonRpcResponse::failure(
            id,
            JsonRpcError::new(codes::METHOD_NOT_FOUND, format!("Method not found: {other}")),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct Echo {
        runs: Vec<Vec<String>>,
    }

    impl PluginCommand for Echo {
        fn info(&self) -> PluginInfo {
            PluginInfo {
                name: "echo".to_string(),
                description: "Echo arguments".to_string(),
                version: "0.1.0".to_string(),
            }
        }

        fn run(&mut self, args: &[String]) -> Result<(), String> {
            self.runs.push(args.to_vec());
            if args.iter().any(|a| a == "--fail") {
                return Err("asked to fail".to_string());
            }
            Ok(())
        }
    }

    fn exchange(input: &str, args: &[&str]) -> (Vec<JsonRpcResponse>, Echo) {
        let mut plugin = Echo { runs: Vec::new() };
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let mut out = Vec::new();

        serve_connection(input.as_bytes(), &mut out, &mut plugin, &args).unwrap();

        let responses = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (responses, plugin)
    }

    #[test]
    fn test_get_info_and_run() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"Plugin.GetInfo"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"Plugin.Run"}"#,
            "\n"
        );
        let (responses, plugin) = exchange(input, &["a", "b"]);

        assert_eq!(responses.len(), 2);
        let info: PluginInfo = responses[0].clone().into_result().unwrap().unwrap();
        assert_eq!(info.name, "echo");
        assert!(responses[1].is_success());
        assert_eq!(plugin.runs, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn test_run_failure_is_status() {
        let input = "{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"Plugin.Run\"}\n";
        let (responses, _) = exchange(input, &["--fail"]);

        let err = responses[0].clone().into_result::<Value>().unwrap_err();
        assert_eq!(err.code, codes::PLUGIN_FAILURE);
        assert_eq!(err.message, "asked to fail");
    }

    #[test]
    fn test_unknown_method_and_garbage() {
        let input = "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"Plugin.Nope\"}\nnot json\n";
        let (responses, _) = exchange(input, &[]);

        assert_eq!(responses[0].error.as_ref().unwrap().code, codes::METHOD_NOT_FOUND);
        assert_eq!(responses[1].error.as_ref().unwrap().code, codes::PARSE_ERROR);
        assert!(responses[1].id.is_none());
    }

    #[test]
    fn test_wrong_jsonrpc_version_is_invalid_request() {
        let input = "{\"jsonrpc\":\"1.0\",\"id\":3,\"method\":\"Plugin.Run\"}\n";
        let (responses, plugin) = exchange(input, &[]);

        assert_eq!(responses[0].error.as_ref().unwrap().code, codes::INVALID_REQUEST);
        assert!(plugin.runs.is_empty());
    }

    #[test]
    #[serial]
    fn test_refuses_without_cookie() {
        std::env::remove_var(HANDSHAKE.cookie_key);
        let mut announce = Vec::new();

        let err = serve_with(Echo { runs: Vec::new() }, &HANDSHAKE, Vec::new(), &mut announce)
            .unwrap_err();
        assert!(matches!(err, ServeError::NotLaunchedByHost));
        assert!(announce.is_empty());
    }

    #[test]
    #[serial]
    fn test_refuses_without_common_version() {
        std::env::set_var(HANDSHAKE.cookie_key, HANDSHAKE.cookie_value);
        std::env::set_var(handshake::PROTOCOL_VERSIONS_ENV, "7,8");
        let mut announce = Vec::new();

        let err = serve_with(Echo { runs: Vec::new() }, &HANDSHAKE, Vec::new(), &mut announce)
            .unwrap_err();

        std::env::remove_var(HANDSHAKE.cookie_key);
        std::env::remove_var(handshake::PROTOCOL_VERSIONS_ENV);
        assert!(matches!(err, ServeError::NoCommonVersion { .. }));
        assert!(announce.is_empty());
    }
}
