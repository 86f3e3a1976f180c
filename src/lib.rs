//! # Sprig
//!
//! A command-line host extended at runtime by plugin executables.
//!
//! Drop a conforming executable into the plugin directory and it shows up as
//! a top-level command on the next run:
//!
//! ```bash
//! sprig plugins install --url github.com/acme/sprig-buckets
//! sprig plugins list
//! sprig buckets --project p1
//! ```
//!
//! The host side lives in [`plugin`]; plugin authors build on [`sdk`].

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::cast_possible_truncation)]

pub mod core;
pub mod plugin;
pub mod sdk;

pub use core::Config;
pub use plugin::{
    CommandRegistrar, LoadedPlugin, LoaderOptions, Plugin, PluginDescriptor, PluginError,
    PluginInfo, PluginManager, PluginResult, PluginSet, Reaper,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "sprig";
