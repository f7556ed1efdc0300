use std::time::Duration;

use clap::Parser;

use crate::driver::Driver;

use super::ToolchainOptions;

/// Inspects and maintains the persistent pack and artifact caches.
#[derive(Debug, Parser)]
pub struct CacheCommand {
    #[clap(subcommand)]
    pub subcommand: CacheSubcommand,

    #[clap(flatten)]
    pub toolchain: ToolchainOptions,
}

#[derive(Debug, Parser)]
pub enum CacheSubcommand {
    /// Prints cache statistics.
    Show,

    /// Removes every cached pack and artifact.
    Clear,

    /// Removes artifacts older than the given age, e.g. "30d" or "12h".
    Sweep {
        #[clap(long("older-than"), value_parser = humantime::parse_duration)]
        older_than: Duration,
    },
}

impl CacheCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let driver = Driver::new(self.toolchain.driver_options());

        match self.subcommand {
            CacheSubcommand::Show => {
                let artifacts = driver.artifact_cache();
                println!("cached artifacts: {}", artifacts.len());
            }
            CacheSubcommand::Clear => {
                driver.artifact_cache().clear();
                driver.pack_store().clear();
                println!("cache cleared");
            }
            CacheSubcommand::Sweep { older_than } => {
                let swept = driver.artifact_cache().sweep_older_than(older_than);
                println!(
                    "swept {} artifacts older than {}",
                    swept,
                    humantime::format_duration(older_than)
                );
            }
        }

        Ok(())
    }
}
