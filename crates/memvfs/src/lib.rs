/*!
Implementation of a purely in-memory virtual filesystem.

memvfs backs the GoScript toolchain host: the foreign compiler and linker
modules read and write files exclusively through this store. There is no
on-disk backend and no I/O; the entire filesystem is a mapping from
normalized absolute paths to contents, a set of directories, and a current
working directory.

## Current Features
* API similar to `std::fs`, reporting failures through `io::Result`
* File contents stored as text or bytes, always readable as bytes
* Relative paths resolved against a mutable working directory
*/

pub mod path;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use serde::Serialize;

/// Extension trait collapsing `io::Result<T>` into `io::Result<Option<T>>`.
///
/// A `NotFound` error becomes `Ok(None)`. The persistent stores and the
/// filesystem shim treat a missing file as an ordinary outcome, while any
/// other I/O failure stays an error worth reporting.
pub trait IoResultExt<T> {
    fn with_not_found(self) -> io::Result<Option<T>>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn with_not_found(self) -> io::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(err) => {
                if err.kind() == io::ErrorKind::NotFound {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Contents of a file in the VFS.
///
/// Files keep whatever representation they were written with. Text written
/// by the host stays a string; object files and archives written by the
/// foreign modules stay bytes. `as_bytes` converts on demand.
#[derive(Debug, Clone)]
pub enum Contents {
    Text(String),
    Binary(Bytes),
}

impl Contents {
    /// The contents as raw bytes. Text converts at the call site; binary
    /// contents are returned as a cheap clone of the underlying buffer.
    pub fn as_bytes(&self) -> Bytes {
        match self {
            Contents::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Contents::Binary(bytes) => bytes.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Contents::Text(text) => text.len(),
            Contents::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Contents {
    fn from(value: String) -> Self {
        Contents::Text(value)
    }
}

impl From<&str> for Contents {
    fn from(value: &str) -> Self {
        Contents::Text(value.to_owned())
    }
}

impl From<Vec<u8>> for Contents {
    fn from(value: Vec<u8>) -> Self {
        Contents::Binary(Bytes::from(value))
    }
}

impl From<Bytes> for Contents {
    fn from(value: Bytes) -> Self {
        Contents::Binary(value)
    }
}

impl From<&[u8]> for Contents {
    fn from(value: &[u8]) -> Self {
        Contents::Binary(Bytes::copy_from_slice(value))
    }
}

/// Aggregate counters over the current state of the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VfsStats {
    pub file_count: usize,
    pub dir_count: usize,
    pub go_file_count: usize,
    pub total_bytes: usize,
}

/// Contains implementation details of the Vfs, wrapped by `Vfs`, the public
/// interface to this type.
struct VfsInner {
    files: BTreeMap<String, Contents>,
    dirs: BTreeSet<String>,
    cwd: String,
}

impl VfsInner {
    fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert("/".to_owned());

        Self {
            files: BTreeMap::new(),
            dirs,
            cwd: "/".to_owned(),
        }
    }

    fn resolve(&self, input: &str) -> String {
        path::resolve(&self.cwd, input)
    }

    fn ensure_ancestors(&mut self, normalized: &str) {
        for ancestor in path::ancestors(normalized) {
            if !self.dirs.insert(ancestor.to_owned()) {
                break;
            }
        }
    }

    fn write_file(&mut self, input: &str, contents: Contents) {
        let resolved = self.resolve(input);
        self.ensure_ancestors(&resolved);
        self.files.insert(resolved, contents);
    }

    fn read_file(&self, input: &str) -> io::Result<Bytes> {
        let resolved = self.resolve(input);
        self.files
            .get(&resolved)
            .map(Contents::as_bytes)
            .ok_or_else(|| not_found(&resolved))
    }

    fn read_to_string(&self, input: &str) -> io::Result<String> {
        let resolved = self.resolve(input);
        let contents = self.files.get(&resolved).ok_or_else(|| not_found(&resolved))?;

        match contents {
            Contents::Text(text) => Ok(text.clone()),
            Contents::Binary(bytes) => String::from_utf8(bytes.to_vec()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("File was not valid UTF-8: {}", resolved),
                )
            }),
        }
    }

    fn exists(&self, input: &str) -> bool {
        let resolved = self.resolve(input);
        self.files.contains_key(&resolved) || self.dirs.contains(&resolved)
    }

    fn is_file(&self, input: &str) -> bool {
        let resolved = self.resolve(input);
        self.files.contains_key(&resolved)
    }

    fn is_directory(&self, input: &str) -> bool {
        let resolved = self.resolve(input);
        self.dirs.contains(&resolved)
    }

    fn mkdir(&mut self, input: &str) {
        let resolved = self.resolve(input);
        self.ensure_ancestors(&resolved);
        self.dirs.insert(resolved);
    }

    fn list_dir(&self, input: &str) -> Vec<String> {
        let resolved = self.resolve(input);
        let prefix = if resolved == "/" {
            "/".to_owned()
        } else {
            format!("{}/", resolved)
        };

        let mut children = BTreeSet::new();

        for key in self
            .files
            .range(prefix.clone()..)
            .map(|(k, _)| k)
            .chain(self.dirs.range(prefix.clone()..))
        {
            if !key.starts_with(&prefix) {
                // BTree ranges are ordered, but files and dirs are chained,
                // so keep scanning until both run past the prefix.
                continue;
            }

            let rest = &key[prefix.len()..];
            if rest.is_empty() {
                continue;
            }

            let first = match rest.find('/') {
                Some(index) => &rest[..index],
                None => rest,
            };
            children.insert(first.to_owned());
        }

        children.into_iter().collect()
    }

    fn remove_file(&mut self, input: &str) -> io::Result<()> {
        let resolved = self.resolve(input);
        self.files
            .remove(&resolved)
            .map(|_| ())
            .ok_or_else(|| not_found(&resolved))
    }

    fn remove_dir(&mut self, input: &str) -> io::Result<()> {
        let resolved = self.resolve(input);

        if resolved == "/" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot remove the root directory",
            ));
        }

        if !self.dirs.contains(&resolved) {
            return Err(not_found(&resolved));
        }

        if !self.list_dir(&resolved).is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::DirectoryNotEmpty,
                format!("directory not empty: {}", resolved),
            ));
        }

        self.dirs.remove(&resolved);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> io::Result<()> {
        let from = self.resolve(from);
        let to = self.resolve(to);

        let contents = self.files.remove(&from).ok_or_else(|| not_found(&from))?;
        self.ensure_ancestors(&to);
        self.files.insert(to, contents);
        Ok(())
    }

    fn clear(&mut self) {
        self.files.clear();
        self.dirs.clear();
        self.dirs.insert("/".to_owned());
        self.cwd = "/".to_owned();
    }

    fn stats(&self) -> VfsStats {
        let go_file_count = self
            .files
            .keys()
            .filter(|path| path.ends_with(".go"))
            .count();
        let total_bytes = self.files.values().map(Contents::len).sum();

        VfsStats {
            file_count: self.files.len(),
            dir_count: self.dirs.len(),
            go_file_count,
            total_bytes,
        }
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", path))
}

/// A purely in-memory filesystem.
///
/// All operations take a lock on the internal state, so a `Vfs` can be
/// shared freely between the driver and the filesystem shim.
pub struct Vfs {
    inner: Mutex<VfsInner>,
}

impl Vfs {
    /// Creates an empty filesystem containing only the root directory, with
    /// the working directory set to `/`.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VfsInner::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VfsInner> {
        self.inner.lock().unwrap()
    }

    /// The current working directory. Always normalized and absolute.
    pub fn cwd(&self) -> String {
        self.lock().cwd.clone()
    }

    /// Replaces the working directory. The path is resolved against the
    /// current working directory and normalized; it is not required to
    /// exist. Callers that need POSIX `chdir` semantics check existence
    /// themselves.
    pub fn set_cwd(&self, path: &str) {
        let mut inner = self.lock();
        inner.cwd = inner.resolve(path);
    }

    /// Resolves a possibly-relative path against the working directory and
    /// normalizes it. This is the canonical form used as a storage key, so
    /// callers outside the VFS agree with it on path identity.
    pub fn resolve(&self, path: &str) -> String {
        self.lock().resolve(path)
    }

    /// Writes a file, replacing previous contents and implicitly creating
    /// every ancestor directory. Succeeds unconditionally.
    pub fn write_file<C: Into<Contents>>(&self, path: &str, contents: C) {
        self.lock().write_file(path, contents.into());
    }

    /// Reads a file's contents as bytes.
    ///
    /// Fails with `io::ErrorKind::NotFound` when the path is not a file.
    pub fn read_file(&self, path: &str) -> io::Result<Bytes> {
        self.lock().read_file(path)
    }

    /// Reads a file's contents as a UTF-8 string.
    pub fn read_to_string(&self, path: &str) -> io::Result<String> {
        self.lock().read_to_string(path)
    }

    /// Returns whether the path names a file or a directory.
    pub fn exists(&self, path: &str) -> bool {
        self.lock().exists(path)
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.lock().is_file(path)
    }

    pub fn is_directory(&self, path: &str) -> bool {
        self.lock().is_directory(path)
    }

    /// Adds a directory, implicitly creating ancestors. Idempotent.
    pub fn mkdir(&self, path: &str) {
        self.lock().mkdir(path);
    }

    /// The sorted, unique immediate children of a directory: the first
    /// component of every file or directory path underneath it. A path with
    /// no children (including one that does not exist) yields an empty list.
    pub fn list_dir(&self, path: &str) -> Vec<String> {
        self.lock().list_dir(path)
    }

    /// Removes a file. Parent directories are left in place.
    pub fn remove_file(&self, path: &str) -> io::Result<()> {
        self.lock().remove_file(path)
    }

    /// Removes an empty directory.
    pub fn remove_dir(&self, path: &str) -> io::Result<()> {
        self.lock().remove_dir(path)
    }

    /// Moves a file to a new path, implicitly creating the destination's
    /// ancestor directories.
    pub fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        self.lock().rename(from, to)
    }

    /// Empties the filesystem, re-adding `/` and resetting the working
    /// directory.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Counters over the current state. O(files).
    pub fn stats(&self) -> VfsStats {
        self.lock().stats()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io;

    #[test]
    fn write_then_read_round_trips() {
        let vfs = Vfs::new();
        vfs.write_file("/main.go", "package main");

        assert_eq!(vfs.read_file("/main.go").unwrap().as_ref(), b"package main");
        assert_eq!(vfs.read_to_string("/main.go").unwrap(), "package main");
    }

    #[test]
    fn equivalent_spellings_share_one_file() {
        let vfs = Vfs::new();
        vfs.write_file("/a//b/./c", "one");

        assert_eq!(vfs.read_file("/a/b/c").unwrap().as_ref(), b"one");
        assert_eq!(vfs.read_file("/a/b/../b/c").unwrap().as_ref(), b"one");
        assert_eq!(vfs.stats().file_count, 1);
    }

    #[test]
    fn read_missing_is_not_found() {
        let vfs = Vfs::new();
        let err = vfs.read_file("/nope").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn write_creates_ancestor_directories() {
        let vfs = Vfs::new();
        vfs.write_file("/a/b/c", "x");

        assert!(vfs.is_directory("/a"));
        assert!(vfs.is_directory("/a/b"));
        assert_eq!(vfs.list_dir("/"), vec!["a"]);
        assert_eq!(vfs.list_dir("/a"), vec!["b"]);
        assert_eq!(vfs.list_dir("/a/b"), vec!["c"]);
    }

    #[test]
    fn list_dir_is_sorted_and_unique() {
        let vfs = Vfs::new();
        vfs.write_file("/src/zeta.go", "");
        vfs.write_file("/src/alpha.go", "");
        vfs.write_file("/src/nested/inner.go", "");
        vfs.mkdir("/src/nested");

        assert_eq!(vfs.list_dir("/src"), vec!["alpha.go", "nested", "zeta.go"]);
    }

    #[test]
    fn list_dir_missing_is_empty() {
        let vfs = Vfs::new();
        assert!(vfs.list_dir("/nowhere").is_empty());
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let vfs = Vfs::new();
        vfs.mkdir("/tmp/work");
        vfs.set_cwd("/tmp/work");

        vfs.write_file("main.go", "package main");
        assert_eq!(
            vfs.read_file("/tmp/work/main.go").unwrap().as_ref(),
            b"package main"
        );
        assert_eq!(vfs.cwd(), "/tmp/work");
    }

    #[test]
    fn removing_files_keeps_parent_directories() {
        let vfs = Vfs::new();
        vfs.write_file("/a/b", "x");
        vfs.remove_file("/a/b").unwrap();

        assert!(!vfs.exists("/a/b"));
        assert!(vfs.is_directory("/a"));
    }

    #[test]
    fn remove_dir_refuses_non_empty() {
        let vfs = Vfs::new();
        vfs.write_file("/a/b", "x");

        let err = vfs.remove_dir("/a").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::DirectoryNotEmpty);

        vfs.remove_file("/a/b").unwrap();
        vfs.remove_dir("/a").unwrap();
        assert!(!vfs.is_directory("/a"));
    }

    #[test]
    fn rename_moves_contents() {
        let vfs = Vfs::new();
        vfs.write_file("/from", "data");
        vfs.rename("/from", "/to/dest").unwrap();

        assert!(!vfs.exists("/from"));
        assert_eq!(vfs.read_file("/to/dest").unwrap().as_ref(), b"data");
        assert!(vfs.is_directory("/to"));
    }

    #[test]
    fn rename_missing_source_is_not_found() {
        let vfs = Vfs::new();
        let err = vfs.rename("/from", "/to").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn clear_resets_to_root() {
        let vfs = Vfs::new();
        vfs.write_file("/a/b", "x");
        vfs.set_cwd("/a");
        vfs.clear();

        assert!(!vfs.exists("/a/b"));
        assert!(vfs.is_directory("/"));
        assert_eq!(vfs.cwd(), "/");
        assert_eq!(vfs.stats().file_count, 0);
        assert_eq!(vfs.stats().dir_count, 1);
    }

    #[test]
    fn stats_count_go_files_and_bytes() {
        let vfs = Vfs::new();
        vfs.write_file("/src/main.go", "12345");
        vfs.write_file("/src/lib.go", "123");
        vfs.write_file("/pkg/js_wasm/fmt.a", vec![0u8; 16]);

        let stats = vfs.stats();
        assert_eq!(stats.file_count, 3);
        assert_eq!(stats.go_file_count, 2);
        assert_eq!(stats.total_bytes, 24);
    }

    #[test]
    fn binary_contents_expose_bytes() {
        let vfs = Vfs::new();
        vfs.write_file("/bin", Bytes::from_static(&[0, 0x61, 0x73, 0x6d]));

        assert_eq!(vfs.read_file("/bin").unwrap().as_ref(), &[0, 0x61, 0x73, 0x6d]);
        let err = vfs.read_to_string("/bin").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn with_not_found_flattens_missing_files() {
        let vfs = Vfs::new();
        assert_eq!(vfs.read_file("/nope").with_not_found().unwrap(), None);

        vfs.write_file("/yes", "y");
        assert!(vfs.read_file("/yes").with_not_found().unwrap().is_some());
    }
}
