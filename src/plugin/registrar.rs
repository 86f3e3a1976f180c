//! Turns loaded plugins into top-level commands.
//!
//! Each plugin becomes one subcommand named after its self-reported name.
//! The host does not parse anything after that name: the raw tokens were
//! already handed to the plugin process when it was spawned.
//!
//! Two plugins reporting the same name are both registered, and the one
//! registered last is the one the command resolves to.

use std::ffi::OsString;

use clap::{Arg, ArgAction, Command};
use thiserror::Error;

use super::loader::{PluginDescriptor, PluginSet};
use super::RpcError;

/// Command names owned by the host itself.
pub const RESERVED_COMMANDS: &[&str] = &["plugins", "config", "completions", "help"];

/// Id of the catch-all argument on plugin commands.
const PASSTHROUGH_ARG: &str = "args";

/// Failure of a plugin command.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The plugin reported a failure; the message is shown as-is.
    #[error("{0}")]
    Plugin(String),

    /// The channel to the plugin broke.
    #[error(transparent)]
    Transport(RpcError),

    /// No plugin is registered under this name.
    #[error("Unknown plugin command: {0}")]
    Unknown(String),
}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Status(status) => Self::Plugin(status.message),
            other => Self::Transport(other),
        }
    }
}

/// One plugin command in the host's command tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandNode {
    /// Command name (the plugin's self-reported name).
    pub name: String,
    /// Short help text.
    pub about: String,
    /// Index of the plugin in the [`PluginSet`].
    pub index: usize,
}

/// Short help for a plugin command.
pub fn help_text(descriptor: &PluginDescriptor) -> String {
    format!("{} {}: {}", descriptor.name, descriptor.version, descriptor.description)
}

/// Registry of plugin commands, in registration order.
#[derive(Debug, Default)]
pub struct CommandRegistrar {
    nodes: Vec<CommandNode>,
}

impl CommandRegistrar {
    /// Create an empty registrar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every plugin in `plugins`, in load order.
    pub fn from_plugins(plugins: &PluginSet) -> Self {
        let mut registrar = Self::new();
        for (index, plugin) in plugins.iter().enumerate() {
            registrar.register(index, plugin.descriptor());
        }
        registrar
    }

    /// Register the plugin at `index`.
    ///
    /// Returns `false` when the name belongs to a built-in command.
    pub fn register(&mut self, index: usize, descriptor: &PluginDescriptor) -> bool {
        if RESERVED_COMMANDS.contains(&descriptor.name.as_str()) {
            tracing::warn!(
                "Plugin {} uses the reserved command name '{}' and will not be available",
                descriptor.path.display(),
                descriptor.name
            );
            return false;
        }

        if let Some(previous) = self.resolve(&descriptor.name) {
            tracing::warn!(
                "Plugin command '{}' is registered more than once; the plugin loaded from {} \
                 takes precedence over plugin #{}",
                descriptor.name,
                descriptor.path.display(),
                previous.index
            );
        }

        self.nodes.push(CommandNode {
            name: descriptor.name.clone(),
            about: help_text(descriptor),
            index,
        });
        true
    }

    /// Every registered node, in registration order.
    pub fn nodes(&self) -> &[CommandNode] {
        &self.nodes
    }

    /// Node a command name dispatches to (the last one registered).
    pub fn resolve(&self, name: &str) -> Option<&CommandNode> {
        self.nodes.iter().rev().find(|node| node.name == name)
    }

    /// Nodes that win resolution, one per distinct name, in first-seen order.
    pub fn effective(&self) -> Vec<&CommandNode> {
        let mut seen: Vec<&str> = Vec::new();
        let mut winners = Vec::new();
        for node in &self.nodes {
            if seen.contains(&node.name.as_str()) {
                continue;
            }
            seen.push(&node.name);
            if let Some(winner) = self.resolve(&node.name) {
                winners.push(winner);
            }
        }
        winners
    }

    /// Append one subcommand per effective plugin command to `cmd`.
    pub fn augment(&self, mut cmd: Command) -> Command {
        for node in self.effective() {
            if cmd.find_subcommand(&node.name).is_some() {
                tracing::warn!("Plugin command '{}' collides with a built-in command", node.name);
                continue;
            }
            cmd = cmd.subcommand(plugin_command(node));
        }
        cmd
    }

    /// Whether `name` is a registered plugin command.
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Call `Run` on the plugin bound to `name`.
    pub fn dispatch(&self, name: &str, plugins: &mut PluginSet) -> Result<(), InvocationError> {
        let node = self.resolve(name).ok_or_else(|| InvocationError::Unknown(name.to_string()))?;
        let plugin =
            plugins.get_mut(node.index).ok_or_else(|| InvocationError::Unknown(name.to_string()))?;
        plugin.run().map_err(InvocationError::from)
    }
}

/// Build the clap node for a plugin: no flag parsing, every token accepted.
fn plugin_command(node: &CommandNode) -> Command {
    Command::new(node.name.clone())
        .about(node.about.clone())
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(
            Arg::new(PASSTHROUGH_ARG)
                .value_parser(clap::value_parser!(OsString))
                .num_args(0..)
                .action(ArgAction::Append)
                .trailing_var_arg(true)
                .allow_hyphen_values(true),
        )
}
