pub mod cli;
pub mod logging;

mod artifacts;
mod config;
mod driver;
mod events;
mod pack;
mod runner;
mod shim;

pub use artifacts::{source_hash, ArtifactCache, ArtifactMetadata, ArtifactRecord};
pub use config::{Config, CONFIG_FILE_NAME};
pub use driver::{
    CompileMetadata, CompileOutcome, Driver, DriverError, DriverOptions, DriverState, DriverStats,
    RunOptions, RunOutcome, SourceSet, DEFAULT_PACK_URL,
};
pub use events::{EventSink, Stage, StageStatus};
pub use pack::{Pack, PackError, PackLoader, PackStore, ARCH_TARGET, PACK_MAGIC, PACK_VERSION};
pub use runner::{
    FuncRunner, RunnerError, ToolInvocation, ToolRunner, WasmToolRunner,
};
pub use shim::{constants, FsShim, OutputSink, ShimError, StatInfo};
