//! Defines the GoScript CLI through clap types.

mod build;
mod cache;
mod completions;
mod packages;
mod run;

use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use thiserror::Error;

use crate::config::Config;
use crate::driver::DriverOptions;

pub use self::build::BuildCommand;
pub use self::cache::{CacheCommand, CacheSubcommand};
pub use self::completions::CompletionsCommand;
pub use self::packages::PackagesCommand;
pub use self::run::RunCommand;

/// Command line options that GoScript accepts, defined using the clap
/// crate.
#[derive(Debug, Parser)]
#[clap(name = "GoScript", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation.
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand {
            Subcommand::Build(subcommand) => subcommand.run(),
            Subcommand::Run(subcommand) => subcommand.run(),
            Subcommand::Packages(subcommand) => subcommand.run(),
            Subcommand::Cache(subcommand) => subcommand.run(),
            Subcommand::Completions(subcommand) => subcommand.run(),
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Sets verbosity level. Can be specified multiple times.
    #[clap(long("verbose"), short, global(true), action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Set color behavior. Valid values are auto, always, and never.
    #[clap(long("color"), global(true), default_value("auto"))]
    pub color: ColorChoice,
}

#[derive(Debug, Clone, Copy)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl FromStr for ColorChoice {
    type Err = ColorChoiceParseError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        match source {
            "auto" => Ok(ColorChoice::Auto),
            "always" => Ok(ColorChoice::Always),
            "never" => Ok(ColorChoice::Never),
            _ => Err(ColorChoiceParseError {
                attempted: source.to_owned(),
            }),
        }
    }
}

impl From<ColorChoice> for termcolor::ColorChoice {
    fn from(value: ColorChoice) -> Self {
        match value {
            ColorChoice::Auto => termcolor::ColorChoice::Auto,
            ColorChoice::Always => termcolor::ColorChoice::Always,
            ColorChoice::Never => termcolor::ColorChoice::Never,
        }
    }
}

#[derive(Debug, Error)]
#[error("Invalid color choice '{attempted}'. Valid values are: auto, always, never")]
pub struct ColorChoiceParseError {
    attempted: String,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    Build(BuildCommand),
    Run(RunCommand),
    Packages(PackagesCommand),
    Cache(CacheCommand),
    Completions(CompletionsCommand),
}

impl Subcommand {
    pub fn command_name(&self) -> &'static str {
        match self {
            Subcommand::Build(_) => "build",
            Subcommand::Run(_) => "run",
            Subcommand::Packages(_) => "packages",
            Subcommand::Cache(_) => "cache",
            Subcommand::Completions(_) => "completions",
        }
    }
}

/// Flags shared by every subcommand that touches the toolchain.
#[derive(Debug, Parser)]
pub struct ToolchainOptions {
    /// Where to fetch the toolchain pack: an HTTP URL or a local file
    /// path. Overrides goscript.toml.
    #[clap(long("pack-url"))]
    pub pack_url: Option<String>,

    /// Directory for the persistent pack and artifact caches.
    #[clap(long("cache-dir"))]
    pub cache_dir: Option<PathBuf>,

    /// Upper bound on a single compiler or linker invocation, e.g. "90s".
    #[clap(long("tool-timeout"), value_parser = humantime::parse_duration)]
    pub tool_timeout: Option<Duration>,
}

impl ToolchainOptions {
    /// Resolves these flags against `goscript.toml` in the current
    /// directory and the built-in defaults.
    pub fn driver_options(self) -> DriverOptions {
        let dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let config = Config::load(&dir);
        config.into_driver_options(self.pack_url, self.cache_dir, self.tool_timeout)
    }
}

pub fn resolve_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().unwrap().join(path)
    }
}
