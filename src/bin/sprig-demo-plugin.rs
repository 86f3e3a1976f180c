//! Demonstration plugin.
//!
//! Reports its own file name (up to the first `.`) as its command name, so
//! one build can be installed under several names. Running it echoes the
//! arguments it was given; `--fail` makes the run report an error.

use std::path::PathBuf;

use sprig::plugin::PluginInfo;
use sprig::sdk::{self, PluginCommand};

struct Demo {
    name: String,
}

impl Demo {
    fn from_exe() -> Self {
        let exe = std::env::current_exe()
            .ok()
            .or_else(|| std::env::args_os().next().map(PathBuf::from))
            .unwrap_or_default();
        let file_name = exe.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let name = file_name.split('.').next().unwrap_or_default();

        Self { name: if name.is_empty() { "demo".to_string() } else { name.to_string() } }
    }
}

impl PluginCommand for Demo {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            description: "Echo the arguments it is given".to_string(),
            version: "1.0".to_string(),
        }
    }

    fn run(&mut self, args: &[String]) -> Result<(), String> {
        if args.iter().any(|a| a == "--fail") {
            return Err(format!("{} failed as requested", self.name));
        }
        println!("{} received: {}", self.name, args.join(" "));
        Ok(())
    }
}

fn main() {
    if let Err(e) = sdk::serve(Demo::from_exe()) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
