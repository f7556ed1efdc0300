use std::{collections::BTreeMap, io::Write, path::PathBuf, process};

use anyhow::{bail, Context};
use clap::Parser;

use crate::driver::{Driver, RunOptions};

use super::build::{progress_events, read_sources};
use super::ToolchainOptions;

/// Compiles source files and immediately executes the result, printing
/// the program's output.
#[derive(Debug, Parser)]
pub struct RunCommand {
    /// Source files to compile and run.
    #[clap(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Arguments passed through to the program.
    #[clap(long("arg"))]
    pub args: Vec<String>,

    /// Environment entries passed to the program, as KEY=VALUE.
    #[clap(long("env"))]
    pub env: Vec<String>,

    #[clap(flatten)]
    pub toolchain: ToolchainOptions,
}

impl RunCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let env = parse_env(&self.env)?;

        let driver = Driver::with_events(self.toolchain.driver_options(), progress_events());

        let sources = read_sources(&self.inputs)?;
        let outcome = driver.compile(&sources);
        let Some(wasm) = outcome.wasm else {
            bail!(
                "{}",
                outcome
                    .error
                    .unwrap_or_else(|| "build failed for an unknown reason".to_owned())
            );
        };

        let result = driver.run(
            &wasm,
            RunOptions {
                args: self.args,
                env,
                timeout: None,
            },
        );

        let mut stdout = std::io::stdout();
        stdout.write_all(result.output.as_bytes())?;
        stdout.flush()?;

        if !result.success {
            if let Some(error) = &result.error {
                log::error!("{}", error);
            }
            process::exit(if result.exit_code > 0 { result.exit_code } else { 1 });
        }

        Ok(())
    }
}

fn parse_env(entries: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();

    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .with_context(|| format!("--env takes KEY=VALUE, got {:?}", entry))?;
        env.insert(key.to_owned(), value.to_owned());
    }

    Ok(env)
}
