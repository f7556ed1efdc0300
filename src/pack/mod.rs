//! The toolchain pack: a single binary archive carrying the foreign
//! compiler, the foreign linker, and the pre-built standard-library
//! archives, plus the persistent store and loader that get it into memory.

mod format;
mod loader;
mod store;

pub use format::{Pack, ARCH_TARGET, PACK_MAGIC, PACK_VERSION};
pub use loader::PackLoader;
pub use store::PackStore;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// The VFS directory the standard-library archives are loaded into, the
/// same place the foreign linker is pointed at with `-L`.
pub fn package_dir() -> String {
    format!("/pkg/{}", ARCH_TARGET)
}

/// Failures while obtaining or parsing a pack.
///
/// Format violations are fatal for the load; store problems never reach
/// this type (the store degrades to a miss and logs instead).
#[derive(Debug, Error)]
pub enum PackError {
    #[error("Format error: bad pack magic")]
    BadMagic,

    #[error("Format error: unsupported pack version {0} (expected {PACK_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Format error: {0} overruns the pack")]
    Truncated(&'static str),

    #[error("Format error: package {0:?} lies outside the pack")]
    PackageOutOfRange(String),

    #[error("Format error: package name section is not a JSON string array")]
    BadPackageNames(#[source] serde_json::Error),

    #[error("Network error: HTTP {status} fetching pack from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Network error: fetching pack from {url}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not read pack file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
