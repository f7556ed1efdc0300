//! Binary layout of the toolchain pack.
//!
//! The pack is a small hand-rolled TLV container: an 8-byte magic, a
//! little-endian u32 version, three length-prefixed sections (compiler
//! bytes, linker bytes, a JSON array of package names), a package count,
//! an absolute index offset, the package data region, and finally the
//! index entries describing where each standard-library archive lives
//! inside the data region. All multi-byte integers are little-endian.
//!
//! Parsing walks a single sequential cursor and validates every declared
//! length against the remaining buffer before slicing. Section contents
//! are zero-copy views of the pack buffer; they stay valid for as long as
//! the `Pack` is alive and are only materialized into the VFS when the
//! foreign linker needs them as files.

use std::collections::HashMap;

use bytes::Bytes;
use memvfs::Vfs;

use super::{package_dir, PackError};

pub const PACK_MAGIC: &[u8; 8] = b"GOSCRIPT";
pub const PACK_VERSION: u32 = 2;

/// Architecture/target tag used in the standard-library path layout.
pub const ARCH_TARGET: &str = "js_wasm";

struct Cursor {
    buf: Bytes,
    pos: usize,
}

impl Cursor {
    fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<Bytes, PackError> {
        if len > self.remaining() {
            return Err(PackError::Truncated(what));
        }
        let slice = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(slice)
    }

    fn u16_le(&mut self, what: &'static str) -> Result<u16, PackError> {
        let raw = self.take(2, what)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32_le(&mut self, what: &'static str) -> Result<u32, PackError> {
        let raw = self.take(4, what)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64_le(&mut self, what: &'static str) -> Result<u64, PackError> {
        let raw = self.take(8, what)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw);
        Ok(u64::from_le_bytes(bytes))
    }
}

/// A parsed toolchain pack.
///
/// Parsed exactly once per load; every accessor hands out views into the
/// original buffer.
pub struct Pack {
    bytes: Bytes,
    compiler: Bytes,
    linker: Bytes,
    package_names: Vec<String>,
    index: HashMap<String, (usize, usize)>,
}

impl Pack {
    pub fn parse(bytes: Bytes) -> Result<Self, PackError> {
        let mut cursor = Cursor::new(bytes.clone());

        let magic = cursor.take(PACK_MAGIC.len(), "magic")?;
        if magic.as_ref() != PACK_MAGIC {
            return Err(PackError::BadMagic);
        }

        let version = cursor.u32_le("version")?;
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }

        let compiler_len = cursor.u32_le("compiler length")? as usize;
        let compiler = cursor.take(compiler_len, "compiler section")?;

        let linker_len = cursor.u32_le("linker length")? as usize;
        let linker = cursor.take(linker_len, "linker section")?;

        let names_len = cursor.u32_le("package name length")? as usize;
        let names_raw = cursor.take(names_len, "package name section")?;
        let package_names: Vec<String> = if names_raw.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&names_raw).map_err(PackError::BadPackageNames)?
        };

        let package_count = cursor.u32_le("package count")? as usize;

        let mut index = HashMap::with_capacity(package_count);

        if package_count > 0 {
            let index_offset = cursor.u64_le("index offset")? as usize;
            let data_start = cursor.pos;

            if index_offset > bytes.len() {
                return Err(PackError::Truncated("package index"));
            }

            let mut entries = Cursor::new(bytes.clone());
            entries.pos = index_offset;

            for _ in 0..package_count {
                let name_len = entries.u16_le("index entry name length")? as usize;
                let name_raw = entries.take(name_len, "index entry name")?;
                let name = String::from_utf8_lossy(&name_raw).into_owned();

                let data_offset = entries.u64_le("index entry offset")? as usize;
                let data_size = entries.u32_le("index entry size")? as usize;

                let absolute = data_start
                    .checked_add(data_offset)
                    .ok_or_else(|| PackError::PackageOutOfRange(name.clone()))?;
                let end = absolute
                    .checked_add(data_size)
                    .ok_or_else(|| PackError::PackageOutOfRange(name.clone()))?;
                if end > bytes.len() {
                    return Err(PackError::PackageOutOfRange(name));
                }

                index.insert(name, (absolute, data_size));
            }
        } else if cursor.remaining() >= 8 {
            // A pack with no packages may still carry the index offset
            // field; skip it so trailing bytes are accounted for.
            cursor.u64_le("index offset")?;
        }

        Ok(Self {
            bytes,
            compiler,
            linker,
            package_names,
            index,
        })
    }

    pub fn compiler_bytes(&self) -> Bytes {
        self.compiler.clone()
    }

    pub fn linker_bytes(&self) -> Bytes {
        self.linker.clone()
    }

    pub fn package_names(&self) -> &[String] {
        &self.package_names
    }

    pub fn package_count(&self) -> usize {
        self.index.len()
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// The archive blob for one standard-library package, as a view into
    /// the pack buffer.
    pub fn package(&self, name: &str) -> Option<Bytes> {
        let &(offset, size) = self.index.get(name)?;
        Some(self.bytes.slice(offset..offset + size))
    }

    /// Writes every archive into the VFS at `/pkg/<arch-target>/<name>.a`,
    /// where the foreign compiler (`-I`) and linker (`-L`) look for them.
    /// The writes hand the zero-copy views over by reference.
    pub fn load_all_into_vfs(&self, vfs: &Vfs) {
        let dir = package_dir();
        vfs.mkdir(&dir);

        for (name, &(offset, size)) in &self.index {
            let blob = self.bytes.slice(offset..offset + size);
            vfs.write_file(&format!("{}/{}.a", dir, name), blob);
        }

        log::debug!(
            "loaded {} standard-library archives into {}",
            self.index.len(),
            dir
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Builds a syntactically valid pack from parts, mirroring the writer
    /// used by the packaging pipeline.
    pub(crate) fn build_pack(
        compiler: &[u8],
        linker: &[u8],
        packages: &[(&str, &[u8])],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(PACK_MAGIC);
        out.extend_from_slice(&PACK_VERSION.to_le_bytes());

        out.extend_from_slice(&(compiler.len() as u32).to_le_bytes());
        out.extend_from_slice(compiler);
        out.extend_from_slice(&(linker.len() as u32).to_le_bytes());
        out.extend_from_slice(linker);

        let names: Vec<&str> = packages.iter().map(|(name, _)| *name).collect();
        let names_json = serde_json::to_vec(&names).unwrap();
        out.extend_from_slice(&(names_json.len() as u32).to_le_bytes());
        out.extend_from_slice(&names_json);

        out.extend_from_slice(&(packages.len() as u32).to_le_bytes());

        let mut data = Vec::new();
        let mut entries = Vec::new();
        for (name, blob) in packages {
            let offset = data.len() as u64;
            data.extend_from_slice(blob);

            entries.extend_from_slice(&(name.len() as u16).to_le_bytes());
            entries.extend_from_slice(name.as_bytes());
            entries.extend_from_slice(&offset.to_le_bytes());
            entries.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        }

        let data_start = out.len() + 8;
        let index_offset = (data_start + data.len()) as u64;
        out.extend_from_slice(&index_offset.to_le_bytes());
        out.extend_from_slice(&data);
        out.extend_from_slice(&entries);

        out
    }

    #[test]
    fn round_trips_sections_byte_for_byte() {
        let raw = build_pack(
            b"compiler-wasm",
            b"linker-wasm",
            &[("fmt", b"fmt-archive".as_ref()), ("os", b"os-archive".as_ref())],
        );
        let pack = Pack::parse(Bytes::from(raw)).unwrap();

        assert_eq!(pack.compiler_bytes().as_ref(), b"compiler-wasm");
        assert_eq!(pack.linker_bytes().as_ref(), b"linker-wasm");
        assert_eq!(pack.package_names(), &["fmt", "os"]);
        assert_eq!(pack.package("fmt").unwrap().as_ref(), b"fmt-archive");
        assert_eq!(pack.package("os").unwrap().as_ref(), b"os-archive");
        assert!(pack.package("net").is_none());
    }

    #[test]
    fn minimal_pack_parses_empty() {
        // Magic, version 2, four zero-length fields: no compiler, no
        // linker, no names, zero packages.
        let mut raw = Vec::new();
        raw.extend_from_slice(PACK_MAGIC);
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 16]);

        let pack = Pack::parse(Bytes::from(raw)).unwrap();
        assert!(pack.package_names().is_empty());
        assert_eq!(pack.compiler_bytes().len(), 0);
        assert_eq!(pack.linker_bytes().len(), 0);
        assert_eq!(pack.package_count(), 0);
    }

    #[test]
    fn any_altered_magic_byte_is_rejected() {
        let good = build_pack(b"c", b"l", &[]);

        for i in 0..8 {
            let mut bad = good.clone();
            bad[i] ^= 0x01;
            match Pack::parse(Bytes::from(bad)) {
                Err(PackError::BadMagic) => {}
                other => panic!("byte {}: expected BadMagic, got {:?}", i, other.err()),
            }
        }
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut raw = build_pack(b"c", b"l", &[]);
        raw[8..12].copy_from_slice(&3u32.to_le_bytes());

        match Pack::parse(Bytes::from(raw)) {
            Err(PackError::UnsupportedVersion(3)) => {}
            other => panic!("expected UnsupportedVersion, got {:?}", other.err()),
        }
    }

    #[test]
    fn section_overrun_is_rejected() {
        let mut raw = build_pack(b"compiler", b"l", &[]);
        // Declare a compiler section longer than the whole pack.
        raw[12..16].copy_from_slice(&(u32::MAX).to_le_bytes());

        match Pack::parse(Bytes::from(raw)) {
            Err(PackError::Truncated(_)) => {}
            other => panic!("expected Truncated, got {:?}", other.err()),
        }
    }

    #[test]
    fn package_extent_outside_pack_is_rejected() {
        let raw = build_pack(b"c", b"l", &[("fmt", b"data".as_ref())]);
        let len = raw.len();
        let mut bad = raw;
        // The entry's u32 size is the last 4 bytes of the index.
        bad[len - 4..].copy_from_slice(&(u32::MAX / 2).to_le_bytes());

        match Pack::parse(Bytes::from(bad)) {
            Err(PackError::PackageOutOfRange(name)) => assert_eq!(name, "fmt"),
            other => panic!("expected PackageOutOfRange, got {:?}", other.err()),
        }
    }

    #[test]
    fn truncated_index_is_rejected() {
        let raw = build_pack(b"c", b"l", &[("fmt", b"data".as_ref())]);
        let bad = raw[..raw.len() - 2].to_vec();

        assert!(Pack::parse(Bytes::from(bad)).is_err());
    }

    #[test]
    fn archives_land_in_the_package_dir() {
        let raw = build_pack(b"c", b"l", &[("fmt", b"A".as_ref()), ("os", b"B".as_ref())]);
        let pack = Pack::parse(Bytes::from(raw)).unwrap();

        let vfs = Vfs::new();
        pack.load_all_into_vfs(&vfs);

        assert_eq!(vfs.read_file("/pkg/js_wasm/fmt.a").unwrap().as_ref(), b"A");
        assert_eq!(vfs.read_file("/pkg/js_wasm/os.a").unwrap().as_ref(), b"B");
        assert_eq!(vfs.list_dir("/pkg/js_wasm"), vec!["fmt.a", "os.a"]);
    }
}
