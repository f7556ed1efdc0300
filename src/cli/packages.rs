use clap::Parser;

use crate::driver::Driver;

use super::ToolchainOptions;

/// Lists the standard-library packages available in the toolchain pack.
#[derive(Debug, Parser)]
pub struct PackagesCommand {
    /// Output the package list as JSON.
    #[clap(long)]
    pub json: bool,

    #[clap(flatten)]
    pub toolchain: ToolchainOptions,
}

impl PackagesCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let driver = Driver::new(self.toolchain.driver_options());
        driver.init()?;

        let mut packages = driver.packages();
        packages.sort();

        if self.json {
            println!("{}", serde_json::to_string_pretty(&packages)?);
        } else {
            for package in packages {
                println!("{}", package);
            }
        }

        Ok(())
    }
}
