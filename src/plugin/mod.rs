//! Plugin system for Sprig.
//!
//! Plugins are standalone executables living in the plugin directory. At
//! startup the host spawns each one with a handshake cookie in its
//! environment, reads a single handshake line from its stdout, connects to
//! the JSON-RPC server the line announces and asks it to describe itself.
//! Every plugin that survives this becomes a top-level command.
//!
//! # Lifecycle
//!
//! ```text
//! Discovered -> Spawned -> HandshakeValidated -> Described -> [Invoked]* -> Terminated
//! ```
//!
//! Any failure before `Described` terminates the child and skips the file.
//!
//! # Handshake line
//!
//! ```text
//! CORE|NEGOTIATED|TRANSPORT|ADDRESS|PROTOCOL
//! 1|1|tcp|127.0.0.1:41823|jsonrpc
//! ```

pub mod archive;
pub mod client;
mod error;
pub mod handshake;
pub mod loader;
pub mod manager;
pub mod process;
pub mod protocol;
pub mod registrar;
pub mod release;

pub use client::{Plugin, RpcClient};
pub use error::{PluginError, PluginResult, RpcError, RpcResult};
pub use handshake::{HandshakeConfig, HandshakeError, HandshakeLine, Transport, HANDSHAKE};
pub use loader::{
    forwarded_args, load_all, load_plugin, LoadedPlugin, LoaderOptions, PluginDescriptor,
    PluginSet, DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use manager::{InstallError, InstallResult, InstallSource, PluginManager};
pub use process::{PluginProcess, Reaper};
pub use protocol::{PluginInfo, METHOD_GET_INFO, METHOD_RUN};
pub use registrar::{CommandNode, CommandRegistrar, InvocationError, RESERVED_COMMANDS};
pub use release::{GitHubReleases, Release, ReleaseAsset};
