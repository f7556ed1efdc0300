use std::{io::Write, path::PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use termcolor::{Color, ColorSpec, StandardStream, WriteColor};

use crate::driver::{Driver, SourceSet};
use crate::events::{EventSink, StageStatus};

use super::ToolchainOptions;

/// Compiles source files into a WebAssembly binary.
#[derive(Debug, Parser)]
pub struct BuildCommand {
    /// Source files to compile.
    #[clap(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Where to output the compiled binary.
    #[clap(long, short)]
    pub output: PathBuf,

    #[clap(flatten)]
    pub toolchain: ToolchainOptions,
}

impl BuildCommand {
    pub fn run(self) -> anyhow::Result<()> {
        let color = termcolor::ColorChoice::Auto;
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

        fs_err::write(&self.output, &wasm)
            .with_context(|| format!("could not write {}", self.output.display()))?;

        let mut stdout = StandardStream::stdout(color);
        let mut green = ColorSpec::new();
        green.set_fg(Some(Color::Green)).set_bold(true);

        stdout.set_color(&green)?;
        write!(stdout, "Built")?;
        stdout.reset()?;
        writeln!(
            stdout,
            " {} ({} bytes{}) in {}",
            self.output.display(),
            outcome.metadata.wasm_size,
            if outcome.metadata.cached { ", cached" } else { "" },
            humantime::format_duration(round_millis(outcome.metadata.compile_time)),
        )?;

        Ok(())
    }
}

/// Reads source files from disk, keyed by their file names. The driver
/// stages them into its own working directory.
pub(super) fn read_sources(inputs: &[PathBuf]) -> anyhow::Result<SourceSet> {
    let mut sources = SourceSet::new();

    for input in inputs {
        let name = input
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("{} is not a usable file name", input.display()))?;

        let contents = fs_err::read(input)?;
        if sources.insert(name.to_owned(), contents).is_some() {
            bail!("duplicate input file name {}", name);
        }
    }

    Ok(sources)
}

/// Progress reporting for interactive builds: stage transitions at
/// debug level, tool output forwarded to stderr.
pub(super) fn progress_events() -> EventSink {
    EventSink {
        on_stage: Some(Box::new(|stage, status| {
            if status == StageStatus::Started {
                log::debug!("{}...", stage.name());
            }
        })),
        on_progress: Some(Box::new(|pct, message| {
            log::trace!("{:>3}% {}", pct, message);
        })),
        on_output: Some(std::sync::Arc::new(|text: &str| {
            eprint!("{}", text);
        })),
        ..EventSink::default()
    }
}

fn round_millis(duration: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_millis(duration.as_millis() as u64)
}
