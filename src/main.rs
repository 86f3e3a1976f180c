//! Sprig - a command-line host extended by plugin executables.
//!
//! Every run loads the plugins in the plugin directory first, so they can
//! show up as top-level commands next to the built-in ones.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, CommandFactory, FromArgMatches, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sprig::core::{Config, LogFormat, LoggingConfig, SETTABLE_KEYS};
use sprig::APP_NAME;
use sprig::plugin::manager::{parse_repo_url, render_list, resolve_token, select_plugin};
use sprig::plugin::{
    forwarded_args, load_all, CommandRegistrar, InstallSource, LoaderOptions, PluginManager,
    PluginSet, Reaper, HANDSHAKE,
};

/// A command-line host extended by plugin executables
#[derive(Parser)]
#[command(name = "sprig")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage plugins
    Plugins {
        #[command(subcommand)]
        operation: PluginsOperation,
    },

    /// View or change configuration
    Config {
        #[command(subcommand)]
        operation: ConfigOperation,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum PluginsOperation {
    /// Show the list of loaded plugins
    List,

    /// Install a plugin from a GitHub release or a local file
    ///
    /// The latest release of the repository is downloaded, the artifact for
    /// this platform is extracted, and its executables are moved to the
    /// plugin directory. Private repositories need an access token; see
    /// 'sprig plugins auth --help'.
    #[command(group(ArgGroup::new("source").required(true).args(["url", "file"])))]
    Install {
        /// The plugin's GitHub repo, as github.com/<owner>/<repo>
        #[arg(short, long)]
        url: Option<String>,

        /// Name of the access token to use for private repos
        #[arg(short, long, requires = "url")]
        token: Option<String>,

        /// Install from a local archive or executable
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Remove an installed plugin
    Remove,

    /// Manage GitHub access tokens used by 'plugins install'
    Auth {
        #[command(subcommand)]
        operation: AuthOperation,
    },
}

#[derive(Subcommand)]
enum AuthOperation {
    /// Store an access token under a name
    Add {
        /// Name to refer to the token by
        name: String,

        /// Token value (read from stdin if omitted)
        #[arg(short, long)]
        token: Option<String>,
    },

    /// List stored token names
    List,

    /// Delete a stored token
    Remove {
        /// Name of the token
        name: String,
    },
}

#[derive(Subcommand)]
enum ConfigOperation {
    /// Print the config file location
    Path,

    /// Print the current configuration (tokens masked)
    Print,

    /// Change a setting
    Set {
        /// Setting key, e.g. logging.level
        key: String,

        /// New value
        value: String,
    },
}

/// Paths and settings shared by every command.
struct Host {
    config_dir: PathBuf,
    config: Config,
}

impl Host {
    fn plugins_dir(&self) -> PathBuf {
        self.config.plugins_dir(&self.config_dir)
    }

    fn save(&self) -> Result<PathBuf> {
        Ok(self.config.save_to_dir(&self.config_dir)?)
    }
}

fn main() -> Result<()> {
    let config_dir = Config::config_dir()?;
    let (config, config_error) = match Config::load_from_dir(&config_dir) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    init_logging(&config.logging, verbose_requested());
    if let Some(e) = config_error {
        tracing::warn!("Using default configuration: {}", e);
    }

    let mut host = Host { config_dir, config };

    let reaper = Reaper::new();
    let handler_reaper = reaper.clone();
    ctrlc::set_handler(move || {
        handler_reaper.terminate_all();
        std::process::exit(130);
    })?;

    let options = LoaderOptions {
        args: forwarded_args(),
        handshake_timeout: host.config.handshake_timeout(),
        rpc_timeout: host.config.run_timeout(),
        handshake: HANDSHAKE,
    };
    let mut plugins = match load_all(&host.plugins_dir(), &options, &reaper) {
        Ok(plugins) => plugins,
        Err(e) => {
            tracing::error!("Cannot read plugin directory {}: {}", host.plugins_dir().display(), e);
            PluginSet::new()
        }
    };

    let registrar = CommandRegistrar::from_plugins(&plugins);
    let cmd = registrar.augment(Cli::command());

    let matches = match cmd.clone().try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            drop(plugins);
            e.exit();
        }
    };

    if let Some((name, _)) = matches.subcommand() {
        if registrar.contains(name) && !Commands::has_subcommand(name) {
            registrar.dispatch(name, &mut plugins)?;
            return Ok(());
        }
    }

    let cli = Cli::from_arg_matches(&matches)?;
    tracing::debug!(verbose = cli.verbose, plugins = plugins.len(), "Running built-in command");
    match cli.command {
        Commands::Plugins { operation } => cmd_plugins(operation, &mut host, &plugins),
        Commands::Config { operation } => cmd_config(operation, &mut host),
        Commands::Completions { shell } => {
            let mut cmd = cmd;
            generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

/// Host flags come before the command name; look for `-v` among them.
fn verbose_requested() -> bool {
    std::env::args_os()
        .skip(1)
        .map_while(|arg| arg.into_string().ok().filter(|arg| arg.starts_with('-')))
        .any(|arg| arg == "-v" || arg == "--verbose")
}

fn init_logging(config: &LoggingConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Text => {
            registry.with(fmt::layer().with_target(false).with_writer(io::stderr)).init();
        }
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(io::stderr)).init(),
    }
}

fn cmd_plugins(operation: PluginsOperation, host: &mut Host, plugins: &PluginSet) -> Result<()> {
    let manager = PluginManager::new(host.plugins_dir());

    match operation {
        PluginsOperation::List => {
            if plugins.is_empty() {
                tracing::warn!("No plugins are currently installed");
                return Ok(());
            }
            render_list(&plugins.descriptors(), io::stdout().lock())?;
        }

        PluginsOperation::Install { url, token, file } => {
            let source = match (url, file) {
                (_, Some(path)) => InstallSource::File(path),
                (Some(url), None) => {
                    let (owner, repo) = parse_repo_url(&url)?;
                    let token = token
                        .map(|name| resolve_token(&host.config.github.tokens, &name))
                        .transpose()?;
                    InstallSource::GitHub { owner, repo, token }
                }
                (None, None) => bail!("Either --url or --file is required"),
            };

            for path in manager.install(&source)? {
                println!("Installed {}", path.display());
            }
        }

        PluginsOperation::Remove => {
            if plugins.is_empty() {
                tracing::warn!("No plugins are currently installed");
                return Ok(());
            }

            let descriptors = plugins.descriptors();
            let Some(index) = select_plugin(&descriptors, io::stdin().lock(), io::stdout())? else {
                println!("Cancelled");
                return Ok(());
            };

            let chosen = descriptors[index];
            manager.remove(&chosen.path)?;
            println!("Successfully removed {}", chosen.name);
        }

        PluginsOperation::Auth { operation } => cmd_auth(operation, host)?,
    }

    Ok(())
}

fn cmd_auth(operation: AuthOperation, host: &mut Host) -> Result<()> {
    match operation {
        AuthOperation::Add { name, token } => {
            let token = match token {
                Some(token) => token,
                None => read_token(io::stdin().lock(), &name)?,
            };
            if token.is_empty() {
                bail!("Access token must not be empty");
            }

            let replaced = host.config.github.tokens.insert(name.clone(), token).is_some();
            host.save()?;
            println!("{} access token '{}'", if replaced { "Updated" } else { "Added" }, name);
        }

        AuthOperation::List => {
            if host.config.github.tokens.is_empty() {
                tracing::warn!("No access tokens are configured");
                return Ok(());
            }
            for name in host.config.github.tokens.keys() {
                println!("{}", name);
            }
        }

        AuthOperation::Remove { name } => {
            if host.config.github.tokens.remove(&name).is_none() {
                bail!("No access token named '{}'", name);
            }
            host.save()?;
            println!("Removed access token '{}'", name);
        }
    }
    Ok(())
}

fn read_token(mut input: impl BufRead, name: &str) -> Result<String> {
    print!("Access token for '{}': ", name);
    io::stdout().flush()?;

    let mut line = String::new();
    input.read_line(&mut line).context("Failed to read access token")?;
    Ok(line.trim().to_string())
}

fn cmd_config(operation: ConfigOperation, host: &mut Host) -> Result<()> {
    match operation {
        ConfigOperation::Path => {
            println!("{}", Config::file_in(&host.config_dir).display());
        }

        ConfigOperation::Print => {
            print!("{}", toml::to_string_pretty(&host.config.masked())?);
            println!("# plugins directory: {}", host.plugins_dir().display());
        }

        ConfigOperation::Set { key, value } => {
            if let Err(e) = host.config.set(&key, &value) {
                bail!("{} (settable keys: {})", e, SETTABLE_KEYS.join(", "));
            }
            let path = host.save()?;
            println!("Updated {} in {}", key, path.display());
        }
    }
    Ok(())
}
