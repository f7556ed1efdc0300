//! POSIX-shaped filesystem surface for the foreign toolchain modules.
//!
//! The compiler and linker binaries perform all of their I/O through a
//! small set of Node-flavored filesystem calls. This module implements
//! that surface over the in-memory VFS: a file-descriptor table, the
//! open/read/write/close/stat family, and the `fs.constants` values the
//! foreign binaries read directly. The runner's host-object layer adapts
//! these synchronous operations back into the callback style the modules
//! expect.
//!
//! One `FsShim` is shared by the compiler and linker invocations of a
//! build, so descriptors and the working directory behave like
//! process-wide state, exactly as the foreign binaries assume.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use memvfs::{IoResultExt, Vfs};
use thiserror::Error;

/// Open flag values published as `fs.constants`.
///
/// These numbers are read directly by the foreign binaries and must match
/// byte-for-byte; they are a wire contract, not a style choice.
pub mod constants {
    pub const O_WRONLY: i32 = 1;
    pub const O_RDWR: i32 = 2;
    pub const O_CREAT: i32 = 64;
    pub const O_EXCL: i32 = 128;
    pub const O_TRUNC: i32 = 512;
    pub const O_APPEND: i32 = 1024;
    pub const O_DIRECTORY: i32 = 65536;

    /// The full published constant set, in the order it is exposed.
    pub fn all() -> &'static [(&'static str, i32)] {
        &[
            ("O_WRONLY", O_WRONLY),
            ("O_RDWR", O_RDWR),
            ("O_CREAT", O_CREAT),
            ("O_TRUNC", O_TRUNC),
            ("O_APPEND", O_APPEND),
            ("O_EXCL", O_EXCL),
            ("O_DIRECTORY", O_DIRECTORY),
        ]
    }
}

/// File descriptors for real files start here; 0/1/2 are reserved for the
/// standard streams and are never allocated.
const FD_FLOOR: i32 = 100;

/// Sink for text written to the standard streams by a foreign module.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Errors from shim operations. Each carries the POSIX code string the
/// foreign binaries switch on.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("bad file descriptor: {0}")]
    BadFd(i32),
    #[error("file exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ShimError {
    pub fn code(&self) -> &'static str {
        match self {
            ShimError::NotFound(_) => "ENOENT",
            ShimError::BadFd(_) => "EBADF",
            ShimError::AlreadyExists(_) => "EEXIST",
            ShimError::NotADirectory(_) => "ENOTDIR",
            ShimError::IsADirectory(_) => "EISDIR",
            ShimError::NotEmpty(_) => "ENOTEMPTY",
            ShimError::InvalidArgument(_) => "EINVAL",
        }
    }
}

/// Metadata reported by stat/lstat/fstat.
///
/// Only the type bit and size are real; the remaining numeric attributes
/// the foreign binaries read are fixed plausible values supplied at the
/// host-object layer.
#[derive(Debug, Clone, Copy)]
pub struct StatInfo {
    pub is_dir: bool,
    pub size: u64,
    pub mtime_ms: i64,
}

impl StatInfo {
    /// POSIX mode word: `0o40777` for directories, `0o666` for files.
    pub fn mode(&self) -> i32 {
        if self.is_dir {
            0o40777
        } else {
            0o666
        }
    }
}

/// One entry in the descriptor table.
///
/// The content snapshot is taken at open time. Writes mutate the snapshot
/// and flush through to the VFS; the snapshot stays attached so later
/// positional reads and writes see a consistent image even if the path is
/// replaced underneath the descriptor.
struct FdEntry {
    path: String,
    content: Vec<u8>,
    position: u64,
    append: bool,
    dir: bool,
}

/// The filesystem shim: descriptor table plus the operation set the
/// foreign modules require, backed by a shared VFS.
pub struct FsShim {
    vfs: Arc<Vfs>,
    fds: HashMap<i32, FdEntry>,
    next_fd: i32,
    output: OutputSink,
}

impl FsShim {
    pub fn new(vfs: Arc<Vfs>) -> Self {
        Self {
            vfs,
            fds: HashMap::new(),
            next_fd: FD_FLOOR,
            output: Arc::new(|text| log::debug!(target: "goscript::output", "{}", text)),
        }
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    /// Swaps the output sink, returning the previous one. Callers restore
    /// the old sink when their invocation ends so output from different
    /// runs does not mix.
    pub fn set_output(&mut self, sink: OutputSink) -> OutputSink {
        std::mem::replace(&mut self.output, sink)
    }

    /// `process.cwd()`.
    pub fn cwd(&self) -> String {
        self.vfs.cwd()
    }

    /// `process.chdir(path)`. Unlike the raw VFS working directory, this
    /// requires the target to be an existing directory.
    pub fn chdir(&mut self, path: &str) -> Result<(), ShimError> {
        let resolved = self.vfs.resolve(path);
        if self.vfs.is_directory(&resolved) {
            self.vfs.set_cwd(&resolved);
            Ok(())
        } else if self.vfs.is_file(&resolved) {
            Err(ShimError::NotADirectory(resolved))
        } else {
            Err(ShimError::NotFound(resolved))
        }
    }

    /// Opens a path and allocates a fresh descriptor.
    pub fn open(&mut self, path: &str, flags: i32) -> Result<i32, ShimError> {
        use constants::*;

        let resolved = self.vfs.resolve(path);
        let is_dir = self.vfs.is_directory(&resolved);

        if flags & O_DIRECTORY != 0 && !is_dir {
            return if self.vfs.is_file(&resolved) {
                Err(ShimError::NotADirectory(resolved))
            } else {
                Err(ShimError::NotFound(resolved))
            };
        }

        let (content, dir) = if is_dir {
            (Vec::new(), true)
        } else {
            match self.vfs.read_file(&resolved) {
                Ok(existing) => {
                    if flags & O_CREAT != 0 && flags & O_EXCL != 0 {
                        return Err(ShimError::AlreadyExists(resolved));
                    }
                    if flags & O_TRUNC != 0 {
                        self.vfs.write_file(&resolved, Vec::new());
                        (Vec::new(), false)
                    } else {
                        (existing.to_vec(), false)
                    }
                }
                Err(_) => {
                    if flags & O_CREAT == 0 {
                        return Err(ShimError::NotFound(resolved));
                    }
                    self.vfs.write_file(&resolved, Vec::new());
                    (Vec::new(), false)
                }
            }
        };

        let append = flags & O_APPEND != 0;
        let position = if append { content.len() as u64 } else { 0 };

        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(
            fd,
            FdEntry {
                path: resolved,
                content,
                position,
                append,
                dir,
            },
        );

        Ok(fd)
    }

    /// Reads up to `len` bytes. An explicit position reads at that offset
    /// without moving the cursor; otherwise the cursor advances. Returns
    /// an empty buffer at EOF and never blocks.
    pub fn read(&mut self, fd: i32, len: usize, pos: Option<u64>) -> Result<Vec<u8>, ShimError> {
        let entry = self.fds.get_mut(&fd).ok_or(ShimError::BadFd(fd))?;

        let start = pos.unwrap_or(entry.position) as usize;
        let available = entry.content.len().saturating_sub(start);
        let count = available.min(len);
        let data = entry.content[start..start + count].to_vec();

        if pos.is_none() {
            entry.position = (start + count) as u64;
        }

        Ok(data)
    }

    /// Writes bytes at an explicit position (no cursor movement) or at the
    /// cursor (advancing it). Writing past EOF extends the file; the gap
    /// is zero-filled. Every write flushes through to the VFS.
    pub fn write(&mut self, fd: i32, data: &[u8], pos: Option<u64>) -> Result<usize, ShimError> {
        let entry = self.fds.get_mut(&fd).ok_or(ShimError::BadFd(fd))?;
        if entry.dir {
            return Err(ShimError::IsADirectory(entry.path.clone()));
        }

        let start = match pos {
            Some(p) => p as usize,
            None if entry.append => entry.content.len(),
            None => entry.position as usize,
        };

        let end = start + data.len();
        if end > entry.content.len() {
            entry.content.resize(end, 0);
        }
        entry.content[start..end].copy_from_slice(data);

        if pos.is_none() {
            entry.position = end as u64;
        }

        self.vfs.write_file(&entry.path, entry.content.clone());

        Ok(data.len())
    }

    /// Synchronous write. Descriptors 1 and 2 deliver decoded text to the
    /// output sink and never touch the VFS; any other known descriptor
    /// behaves like a cursor write.
    pub fn write_sync(&mut self, fd: i32, data: &[u8]) -> Result<usize, ShimError> {
        if fd == 1 || fd == 2 {
            let text = String::from_utf8_lossy(data);
            (self.output)(&text);
            return Ok(data.len());
        }

        if !self.fds.contains_key(&fd) {
            return Err(ShimError::BadFd(fd));
        }

        self.write(fd, data, None)
    }

    /// Removes a descriptor. Succeeds whether or not it was present.
    pub fn close(&mut self, fd: i32) {
        self.fds.remove(&fd);
    }

    /// Drops every open descriptor and restarts fd allocation. Used by a
    /// full driver reset.
    pub fn reset(&mut self) {
        self.fds.clear();
        self.next_fd = FD_FLOOR;
    }

    pub fn stat(&self, path: &str) -> Result<StatInfo, ShimError> {
        let resolved = self.vfs.resolve(path);

        if self.vfs.is_file(&resolved) {
            let size = self
                .vfs
                .read_file(&resolved)
                .map(|bytes| bytes.len() as u64)
                .unwrap_or(0);
            Ok(StatInfo {
                is_dir: false,
                size,
                mtime_ms: now_ms(),
            })
        } else if self.vfs.is_directory(&resolved) {
            Ok(StatInfo {
                is_dir: true,
                size: 0,
                mtime_ms: now_ms(),
            })
        } else {
            Err(ShimError::NotFound(resolved))
        }
    }

    /// There are no symlinks, so lstat and stat agree.
    pub fn lstat(&self, path: &str) -> Result<StatInfo, ShimError> {
        self.stat(path)
    }

    /// Stat keyed by a descriptor's snapshot.
    pub fn fstat(&self, fd: i32) -> Result<StatInfo, ShimError> {
        let entry = self.fds.get(&fd).ok_or(ShimError::BadFd(fd))?;
        Ok(StatInfo {
            is_dir: entry.dir,
            size: entry.content.len() as u64,
            mtime_ms: now_ms(),
        })
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), ShimError> {
        self.vfs.mkdir(path);
        Ok(())
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<String>, ShimError> {
        let resolved = self.vfs.resolve(path);

        if self.vfs.is_directory(&resolved) {
            Ok(self.vfs.list_dir(&resolved))
        } else if self.vfs.is_file(&resolved) {
            Err(ShimError::NotADirectory(resolved))
        } else {
            Err(ShimError::NotFound(resolved))
        }
    }

    pub fn unlink(&mut self, path: &str) -> Result<(), ShimError> {
        let resolved = self.vfs.resolve(path);

        if self.vfs.is_directory(&resolved) {
            return Err(ShimError::IsADirectory(resolved));
        }

        self.vfs
            .remove_file(&resolved)
            .map_err(|_| ShimError::NotFound(resolved))
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), ShimError> {
        let from = self.vfs.resolve(from);
        let to = self.vfs.resolve(to);

        if self.vfs.is_directory(&from) {
            return Err(ShimError::InvalidArgument(format!(
                "directory rename is not supported: {}",
                from
            )));
        }

        self.vfs
            .rename(&from, &to)
            .map_err(|_| ShimError::NotFound(from))
    }

    pub fn truncate(&mut self, path: &str, len: u64) -> Result<(), ShimError> {
        let resolved = self.vfs.resolve(path);

        let mut content = self
            .vfs
            .read_file(&resolved)
            .map_err(|_| ShimError::NotFound(resolved.clone()))?
            .to_vec();
        content.resize(len as usize, 0);
        self.vfs.write_file(&resolved, content);
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> Result<(), ShimError> {
        let resolved = self.vfs.resolve(path);

        if self.vfs.is_file(&resolved) {
            return Err(ShimError::NotADirectory(resolved));
        }

        match self.vfs.remove_dir(&resolved).with_not_found() {
            Ok(Some(())) => Ok(()),
            Ok(None) => Err(ShimError::NotFound(resolved)),
            Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => {
                Err(ShimError::NotEmpty(resolved))
            }
            Err(_) => Err(ShimError::InvalidArgument(resolved)),
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
