//! Fetching and caching the toolchain pack.
//!
//! The loader consults the persistent store first, falls back to the
//! network (or the local filesystem for non-HTTP locations), writes the
//! fetched bytes back best-effort, and parses the result exactly once.

use std::path::PathBuf;

use bytes::Bytes;

use super::{Pack, PackError, PackStore};

pub struct PackLoader {
    url: String,
    store: PackStore,
}

impl PackLoader {
    pub fn new(url: impl Into<String>, store: PackStore) -> Self {
        Self {
            url: url.into(),
            store,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Loads and parses the pack. Store hits skip the fetch entirely;
    /// fetched bytes are written back to the store before parsing so a
    /// later run can start offline.
    pub fn load(&self) -> Result<Pack, PackError> {
        let bytes = match self.store.get(&self.url) {
            Some(bytes) => bytes,
            None => {
                let bytes = self.fetch()?;
                self.store.put(&self.url, &bytes);
                bytes
            }
        };

        Pack::parse(bytes)
    }

    fn fetch(&self) -> Result<Bytes, PackError> {
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            self.fetch_http()
        } else {
            self.read_local()
        }
    }

    fn fetch_http(&self) -> Result<Bytes, PackError> {
        log::info!("fetching toolchain pack from {}", self.url);

        let response = reqwest::blocking::get(&self.url).map_err(|source| PackError::Network {
            url: self.url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PackError::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        response.bytes().map_err(|source| PackError::Network {
            url: self.url.clone(),
            source,
        })
    }

    fn read_local(&self) -> Result<Bytes, PackError> {
        let path = PathBuf::from(&self.url);
        log::info!("reading toolchain pack from {}", path.display());

        fs_err::read(&path)
            .map(Bytes::from)
            .map_err(|source| PackError::Io { path, source })
    }
}
