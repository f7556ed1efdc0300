//! On-disk cache of raw pack bytes, keyed by pack URL.
//!
//! One record per URL, stored as a file named after the blake3 hash of
//! the URL. The store is strictly best-effort: a missing directory, a
//! failed read, or a failed write degrades to a cache miss with a logged
//! warning, never a hard error.

use std::path::PathBuf;

use bytes::Bytes;
use memvfs::IoResultExt;

pub struct PackStore {
    dir: PathBuf,
}

impl PackStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn record_path(&self, url: &str) -> PathBuf {
        let digest = blake3::hash(url.as_bytes());
        let name = data_encoding::HEXLOWER.encode(digest.as_bytes());
        self.dir.join(format!("{}.pack", name))
    }

    /// Returns the cached bytes for a URL, or `None` on a miss (including
    /// any read failure).
    pub fn get(&self, url: &str) -> Option<Bytes> {
        let path = self.record_path(url);

        match fs_err::read(&path).with_not_found() {
            Ok(Some(bytes)) => {
                log::debug!("pack store hit for {} ({} bytes)", url, bytes.len());
                Some(Bytes::from(bytes))
            }
            Ok(None) => None,
            Err(err) => {
                log::warn!("pack store read failed for {}: {}", url, err);
                None
            }
        }
    }

    /// Stores the bytes for a URL, replacing any previous record.
    pub fn put(&self, url: &str, bytes: &[u8]) {
        if let Err(err) = fs_err::create_dir_all(&self.dir) {
            log::warn!("pack store unavailable: {}", err);
            return;
        }

        let path = self.record_path(url);
        if let Err(err) = fs_err::write(&path, bytes) {
            log::warn!("pack store write failed for {}: {}", url, err);
        }
    }

    /// Removes every record. Best-effort.
    pub fn clear(&self) {
        let entries = match fs_err::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "pack") {
                if let Err(err) = fs_err::remove_file(&path) {
                    log::warn!("pack store clear failed for {}: {}", path.display(), err);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PackStore::new(dir.path().to_path_buf());

        assert!(store.get("https://example.test/pack").is_none());

        store.put("https://example.test/pack", b"pack-bytes");
        assert_eq!(
            store.get("https://example.test/pack").unwrap().as_ref(),
            b"pack-bytes"
        );
    }

    #[test]
    fn records_are_keyed_per_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = PackStore::new(dir.path().to_path_buf());

        store.put("url-a", b"a");
        store.put("url-b", b"b");

        assert_eq!(store.get("url-a").unwrap().as_ref(), b"a");
        assert_eq!(store.get("url-b").unwrap().as_ref(), b"b");
    }

    #[test]
    fn put_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = PackStore::new(dir.path().to_path_buf());

        store.put("url", b"old");
        store.put("url", b"new");
        assert_eq!(store.get("url").unwrap().as_ref(), b"new");
    }

    #[test]
    fn clear_empties_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = PackStore::new(dir.path().to_path_buf());

        store.put("url", b"bytes");
        store.clear();
        assert!(store.get("url").is_none());
    }

    #[test]
    fn unwritable_store_degrades_to_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        fs_err::write(&blocker, b"not a directory").unwrap();

        let store = PackStore::new(blocker);
        store.put("url", b"bytes");
        assert!(store.get("url").is_none());
    }
}
