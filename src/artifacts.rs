//! Persistent cache of produced binaries, keyed by a hash of the inputs.
//!
//! The hash is computed over a canonical form of the input set: paths
//! sorted, each record length-prefixed, so that insertion order and map
//! iteration order can never change the key. Identical inputs then
//! short-circuit the whole build. Store failures are never fatal; they
//! log and behave as a miss.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memvfs::IoResultExt;
use serde::{Deserialize, Serialize};

/// Metadata stored beside each cached binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    /// Unix seconds at publish time.
    pub produced_at: u64,
    pub input_size: usize,
    pub output_size: usize,
    pub optimizations: String,
    pub target: String,
}

/// A cached build output.
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub bytes: Vec<u8>,
    pub metadata: ArtifactMetadata,
}

/// Computes the deterministic hash of an input set.
///
/// Canonical form: for each file in path order, the u64 LE path length,
/// the path bytes, the u64 LE content length, the content bytes. The
/// digest is rendered as lowercase hex and used directly as the cache
/// key.
pub fn source_hash<'a, I>(files: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let sorted: BTreeMap<&str, &[u8]> = files.into_iter().collect();

    let mut hasher = blake3::Hasher::new();
    for (path, content) in sorted {
        hasher.update(&(path.len() as u64).to_le_bytes());
        hasher.update(path.as_bytes());
        hasher.update(&(content.len() as u64).to_le_bytes());
        hasher.update(content);
    }

    data_encoding::HEXLOWER.encode(hasher.finalize().as_bytes())
}

/// On-disk artifact store: `<hash>.wasm` beside `<hash>.json`.
pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn binary_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{}.wasm", hash))
    }

    fn metadata_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hash))
    }

    /// Fetches a record, or `None` on a miss. A binary without readable
    /// metadata (or the reverse) counts as a miss.
    pub fn get(&self, hash: &str) -> Option<ArtifactRecord> {
        let bytes = match fs_err::read(self.binary_path(hash)).with_not_found() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("artifact cache read failed for {}: {}", hash, err);
                return None;
            }
        };

        let metadata = fs_err::read(self.metadata_path(hash))
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok());

        match metadata {
            Some(metadata) => Some(ArtifactRecord { bytes, metadata }),
            None => {
                log::warn!("artifact cache metadata missing for {}", hash);
                None
            }
        }
    }

    /// Stores a record, replacing any previous one for the same hash.
    pub fn put(&self, hash: &str, bytes: &[u8], metadata: &ArtifactMetadata) {
        if let Err(err) = fs_err::create_dir_all(&self.dir) {
            log::warn!("artifact cache unavailable: {}", err);
            return;
        }

        let result = fs_err::write(self.binary_path(hash), bytes).and_then(|_| {
            let raw = serde_json::to_vec_pretty(metadata).expect("metadata serializes");
            fs_err::write(self.metadata_path(hash), raw)
        });

        if let Err(err) = result {
            log::warn!("artifact cache write failed for {}: {}", hash, err);
        }
    }

    /// Number of records currently on disk.
    pub fn len(&self) -> usize {
        self.hashes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes().is_empty()
    }

    /// Removes every record. Best-effort.
    pub fn clear(&self) {
        for hash in self.hashes() {
            self.remove(&hash);
        }
    }

    /// Removes records whose metadata timestamp is older than `age`.
    /// Returns the number of records swept.
    pub fn sweep_older_than(&self, age: Duration) -> usize {
        let cutoff = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .saturating_sub(age.as_secs());

        let mut swept = 0;
        for hash in self.hashes() {
            let stale = match self.get(&hash) {
                Some(record) => record.metadata.produced_at < cutoff,
                // Unreadable records are swept too.
                None => true,
            };

            if stale {
                self.remove(&hash);
                swept += 1;
            }
        }
        swept
    }

    fn remove(&self, hash: &str) {
        let _ = fs_err::remove_file(self.binary_path(hash));
        let _ = fs_err::remove_file(self.metadata_path(hash));
    }

    fn hashes(&self) -> Vec<String> {
        let entries = match fs_err::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut hashes = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "wasm") {
                if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                    hashes.push(stem.to_owned());
                }
            }
        }
        hashes
    }
}

pub fn metadata_now(input_size: usize, output_size: usize, target: &str) -> ArtifactMetadata {
    ArtifactMetadata {
        produced_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        input_size,
        output_size,
        optimizations: "default".to_owned(),
        target: target.to_owned(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_is_insertion_order_independent() {
        let forward = source_hash(vec![
            ("/a.go", b"alpha".as_ref()),
            ("/b.go", b"beta".as_ref()),
        ]);
        let reverse = source_hash(vec![
            ("/b.go", b"beta".as_ref()),
            ("/a.go", b"alpha".as_ref()),
        ]);

        assert_eq!(forward, reverse);
    }

    #[test]
    fn hash_distinguishes_path_and_content_splits() {
        // Length prefixes keep (path, content) boundaries unambiguous.
        let a = source_hash(vec![("/ab", b"c".as_ref())]);
        let b = source_hash(vec![("/a", b"bc".as_ref())]);
        assert_ne!(a, b);

        let c = source_hash(vec![("/a.go", b"x".as_ref())]);
        let d = source_hash(vec![("/a.go", b"y".as_ref())]);
        assert_ne!(c, d);
    }

    #[test]
    fn hash_is_lowercase_hex() {
        let hash = source_hash(vec![("/m.go", b"package main".as_ref())]);
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().to_path_buf());

        assert!(cache.get("abc").is_none());

        cache.put("abc", b"\0asm", &metadata_now(10, 4, "js_wasm"));
        let record = cache.get("abc").unwrap();
        assert_eq!(record.bytes, b"\0asm");
        assert_eq!(record.metadata.output_size, 4);
        assert_eq!(record.metadata.target, "js_wasm");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn put_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().to_path_buf());

        cache.put("h", b"old", &metadata_now(1, 3, "js_wasm"));
        cache.put("h", b"newer", &metadata_now(1, 5, "js_wasm"));

        let record = cache.get("h").unwrap();
        assert_eq!(record.bytes, b"newer");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn binary_without_metadata_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().to_path_buf());

        fs_err::write(dir.path().join("h.wasm"), b"bytes").unwrap();
        assert!(cache.get("h").is_none());
    }

    #[test]
    fn sweep_removes_only_old_records() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().to_path_buf());

        let mut old = metadata_now(1, 1, "js_wasm");
        old.produced_at = 1_000;
        cache.put("old", b"o", &old);
        cache.put("new", b"n", &metadata_now(1, 1, "js_wasm"));

        let swept = cache.sweep_older_than(Duration::from_secs(3600));
        assert_eq!(swept, 1);
        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn unwritable_cache_degrades_to_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        fs_err::write(&blocker, b"file in the way").unwrap();

        let cache = ArtifactCache::new(blocker);
        cache.put("h", b"bytes", &metadata_now(1, 5, "js_wasm"));
        assert!(cache.get("h").is_none());
        assert!(cache.is_empty());
    }
}
