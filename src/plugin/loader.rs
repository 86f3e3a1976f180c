//! Plugin discovery and loading.
//!
//! Every file in the plugin directory is tried in turn: spawn, handshake,
//! connect, `GetInfo`. A file that fails any step is logged and skipped.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use super::client::{Plugin, RpcClient};
use super::handshake::{HandshakeConfig, HANDSHAKE};
use super::process::{PluginProcess, Reaper};
use super::protocol::PluginInfo;
use super::{PluginResult, RpcResult};

/// Default bound on how long a plugin may take to print its handshake line.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Self-description of a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginDescriptor {
    /// Self-reported command name.
    pub name: String,
    /// Self-reported description.
    pub description: String,
    /// Self-reported version.
    pub version: String,
    /// File the plugin was loaded from.
    pub path: PathBuf,
}

impl PluginDescriptor {
    fn new(info: PluginInfo, path: PathBuf) -> Self {
        Self { name: info.name, description: info.description, version: info.version, path }
    }
}

/// Settings for a discovery pass.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Arguments forwarded to every plugin process, byte for byte.
    pub args: Vec<OsString>,
    /// Bound on the handshake line.
    pub handshake_timeout: Duration,
    /// Bound on each RPC call; `None` waits forever.
    pub rpc_timeout: Option<Duration>,
    /// Handshake constants.
    pub handshake: HandshakeConfig,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            rpc_timeout: None,
            handshake: HANDSHAKE,
        }
    }
}

/// The host's own arguments minus the binary and the leading command name.
pub fn forwarded_args() -> Vec<OsString> {
    strip_command(std::env::args_os().skip(1))
}

/// Drop leading host flags (none of which take a value) and the command name.
fn strip_command(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    args.into_iter().skip_while(is_flag).skip(1).collect()
}

fn is_flag(arg: &OsString) -> bool {
    arg.to_str().is_some_and(|arg| arg.starts_with('-'))
}

/// A plugin that completed the handshake and described itself.
pub struct LoadedPlugin {
    descriptor: PluginDescriptor,
    client: Box<dyn Plugin>,
    process: Option<PluginProcess>,
}

impl LoadedPlugin {
    /// Descriptor reported by the plugin.
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Self-reported name.
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Invoke the plugin's `Run`.
    pub fn run(&mut self) -> RpcResult<()> {
        tracing::debug!("Running plugin {}", self.descriptor.name);
        self.client.run()
    }

    /// Process id of the backing child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(PluginProcess::pid)
    }

    /// Whether the backing child is still running.
    pub fn is_alive(&self) -> bool {
        self.process.as_ref().is_some_and(PluginProcess::is_alive)
    }

    /// Kill the backing child.
    pub fn terminate(&mut self) {
        if let Some(process) = self.process.as_mut() {
            process.terminate();
        }
    }

    /// Wrap an in-process [`Plugin`] with no backing child.
    #[cfg(test)]
    pub(crate) fn detached(descriptor: PluginDescriptor, client: Box<dyn Plugin>) -> Self {
        Self { descriptor, client, process: None }
    }
}

impl std::fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("descriptor", &self.descriptor)
            .field("process", &self.process)
            .finish()
    }
}

/// Insertion-ordered registry of loaded plugins.
///
/// Dropping the set terminates every plugin process it owns.
#[derive(Debug, Default)]
pub struct PluginSet {
    plugins: Vec<LoadedPlugin>,
}

impl PluginSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin.
    pub fn push(&mut self, plugin: LoadedPlugin) {
        self.plugins.push(plugin);
    }

    /// Number of loaded plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether nothing loaded.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugins in load order.
    pub fn iter(&self) -> impl Iterator<Item = &LoadedPlugin> {
        self.plugins.iter()
    }

    /// Plugin at a registry index.
    pub fn get(&self, index: usize) -> Option<&LoadedPlugin> {
        self.plugins.get(index)
    }

    /// Mutable plugin at a registry index.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut LoadedPlugin> {
        self.plugins.get_mut(index)
    }

    /// Descriptors in load order.
    pub fn descriptors(&self) -> Vec<&PluginDescriptor> {
        self.plugins.iter().map(LoadedPlugin::descriptor).collect()
    }

    /// Terminate every plugin process.
    pub fn terminate_all(&mut self) {
        for plugin in &mut self.plugins {
            plugin.terminate();
        }
    }
}

impl Drop for PluginSet {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

/// Regular files in `dir`, sorted by name. Creates `dir` if missing.
pub fn plugin_files(dir: &Path) -> PluginResult<Vec<PathBuf>> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

/// Load one plugin file.
///
/// On any failure after spawning, the child is terminated before returning.
pub fn load_plugin(
    path: &Path,
    options: &LoaderOptions,
    reaper: &Reaper,
) -> PluginResult<LoadedPlugin> {
    let mut process = PluginProcess::spawn(path, &options.args, &options.handshake, reaper)?;

    let described = (|| {
        let line = process.await_handshake(options.handshake_timeout, &options.handshake)?;
        tracing::debug!(
            "Plugin {} listening on {} {} (protocol v{})",
            path.display(),
            line.transport,
            line.address,
            line.protocol_version
        );
        let mut client = RpcClient::connect(&line, options.rpc_timeout)?;
        let info = client.info()?;
        PluginResult::Ok((client, info))
    })();

    match described {
        Ok((client, info)) => Ok(LoadedPlugin {
            descriptor: PluginDescriptor::new(info, path.to_path_buf()),
            client: Box::new(client),
            process: Some(process),
        }),
        Err(e) => {
            process.terminate();
            Err(e)
        }
    }
}

/// Load every plugin in `dir`, skipping (and logging) those that fail.
pub fn load_all(dir: &Path, options: &LoaderOptions, reaper: &Reaper) -> PluginResult<PluginSet> {
    let mut set = PluginSet::new();

    for path in plugin_files(dir)? {
        let file_name = path.file_name().map_or_else(
            || path.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        );

        match load_plugin(&path, options, reaper) {
            Ok(plugin) => {
                tracing::debug!(
                    "Loaded plugin {} v{} from {}",
                    plugin.name(),
                    plugin.descriptor().version,
                    file_name
                );
                set.push(plugin);
            }
            Err(e) => {
                tracing::warn!("Failed to load plugin {}: {}", file_name, e);
            }
        }
    }

    Ok(set)
}
