//! Optional project configuration read from `goscript.toml`.
//!
//! Every field is optional; CLI flags take precedence over the file, and
//! the file over built-in defaults. A missing or unparsable file is not
//! an error — the CLI works out of the box with no configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use memvfs::IoResultExt;
use serde::Deserialize;

use crate::driver::{DriverOptions, DEFAULT_PACK_URL};

pub const CONFIG_FILE_NAME: &str = "goscript.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Where to fetch the toolchain pack: an HTTP URL or a local file
    /// path.
    pub pack_url: Option<String>,

    /// Root directory for the persistent pack and artifact caches.
    pub cache_dir: Option<PathBuf>,

    /// Emit extra stage diagnostics.
    pub debug: Option<bool>,

    /// Upper bound, in seconds, on a single compiler or linker
    /// invocation.
    pub tool_timeout_secs: Option<u64>,
}

impl Config {
    /// Reads `goscript.toml` from the given directory. Returns the
    /// default (empty) configuration when the file is absent; a present
    /// but invalid file logs a warning and is treated as absent.
    pub fn load(dir: &Path) -> Config {
        let path = dir.join(CONFIG_FILE_NAME);

        let contents = match fs_err::read_to_string(&path).with_not_found() {
            Ok(Some(contents)) => contents,
            Ok(None) => return Config::default(),
            Err(err) => {
                log::warn!("could not read {}: {}", path.display(), err);
                return Config::default();
            }
        };

        match toml::from_str(&contents) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("ignoring invalid {}: {}", path.display(), err);
                Config::default()
            }
        }
    }

    /// Merges this configuration under explicit overrides into driver
    /// options. `None` overrides fall back to the file, then to the
    /// defaults.
    pub fn into_driver_options(
        self,
        pack_url: Option<String>,
        cache_dir: Option<PathBuf>,
        tool_timeout: Option<Duration>,
    ) -> DriverOptions {
        DriverOptions {
            pack_url: pack_url
                .or(self.pack_url)
                .unwrap_or_else(|| DEFAULT_PACK_URL.to_owned()),
            cache_dir: cache_dir.or(self.cache_dir),
            debug: self.debug.unwrap_or(false),
            tool_timeout: tool_timeout.or(self.tool_timeout_secs.map(Duration::from_secs)),
        }
    }
}
