//! Shared helpers for the integration tests: a pack builder matching the
//! packaging pipeline's writer, scripted stand-ins for the foreign
//! compiler and linker, and driver construction over temporary stores.

#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use libgoscript::{
    Driver, DriverOptions, EventSink, RunnerError, ToolInvocation, ToolRunner, PACK_MAGIC,
    PACK_VERSION,
};
use tempfile::TempDir;

/// Valid WebAssembly header followed by filler, usable as a fake linker
/// product.
pub const FAKE_WASM: &[u8] = &[
    0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef,
];

/// Serializes a pack in the toolchain's binary layout.
pub fn build_pack(compiler: &[u8], linker: &[u8], packages: &[(&str, &[u8])]) -> Vec<u8> {
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

/// A minimal valid pack: empty compiler, empty linker, no packages.
pub fn empty_pack() -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(PACK_MAGIC);
    raw.extend_from_slice(&PACK_VERSION.to_le_bytes());
    raw.extend_from_slice(&[0u8; 16]);
    raw
}

/// Writes pack bytes to disk and returns driver options pointing the
/// pack URL at that file, with all persistent stores under the temp dir.
pub fn options_for_pack(dir: &TempDir, pack: &[u8]) -> DriverOptions {
    let pack_path = dir.path().join("toolchain.bin");
    fs_err::write(&pack_path, pack).unwrap();
    options_for_pack_path(dir, &pack_path)
}

pub fn options_for_pack_path(dir: &TempDir, pack_path: &Path) -> DriverOptions {
    DriverOptions {
        pack_url: pack_path.to_str().unwrap().to_owned(),
        cache_dir: Some(dir.path().join("cache")),
        debug: false,
        tool_timeout: None,
    }
}

type Behavior = dyn Fn(&[u8], &ToolInvocation) -> Result<i32, RunnerError> + Send + Sync;

/// A scripted stand-in for the foreign modules. Records every argv it is
/// invoked with, then runs the supplied behavior.
pub struct StubRunner {
    invocations: Arc<Mutex<Vec<Vec<String>>>>,
    behavior: Box<Behavior>,
}

impl StubRunner {
    pub fn new(
        behavior: impl Fn(&[u8], &ToolInvocation) -> Result<i32, RunnerError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            invocations: Arc::new(Mutex::new(Vec::new())),
            behavior: Box::new(behavior),
        }
    }

    /// A spy handle that stays valid after the runner moves into a
    /// driver.
    pub fn spy(&self) -> Spy {
        Spy {
            invocations: Arc::clone(&self.invocations),
        }
    }
}

impl ToolRunner for StubRunner {
    fn run_tool(&self, module: &[u8], invocation: ToolInvocation) -> Result<i32, RunnerError> {
        self.invocations
            .lock()
            .unwrap()
            .push(invocation.argv.clone());
        (self.behavior)(module, &invocation)
    }
}

#[derive(Clone)]
pub struct Spy {
    invocations: Arc<Mutex<Vec<Vec<String>>>>,
}

impl Spy {
    pub fn total(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    /// Number of invocations whose argv[0] matches.
    pub fn count_of(&self, tool: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|argv| argv.first().map(String::as_str) == Some(tool))
            .count()
    }

    pub fn argv_of(&self, index: usize) -> Vec<String> {
        self.invocations.lock().unwrap()[index].clone()
    }
}

/// Extracts the value following `-o` in an argument vector.
pub fn output_flag(invocation: &ToolInvocation) -> Option<String> {
    invocation
        .argv
        .windows(2)
        .find(|pair| pair[0] == "-o")
        .map(|pair| pair[1].clone())
}

/// A behavior that acts like a working toolchain: `compile` writes an
/// object file, `link` writes `wasm` at the declared output, and any
/// other invocation is treated as a program run that prints `stdout` and
/// exits 0.
pub fn working_toolchain(
    wasm: Vec<u8>,
    stdout: &'static str,
) -> impl Fn(&[u8], &ToolInvocation) -> Result<i32, RunnerError> + Send + Sync + 'static {
    move |_module, invocation| {
        let vfs = Arc::clone(invocation.shim.lock().unwrap().vfs());

        match invocation.argv.first().map(String::as_str) {
            Some("compile") => {
                let out = output_flag(invocation).expect("compile has -o");
                vfs.write_file(&out, b"object-code".as_ref());
                Ok(0)
            }
            Some("link") => {
                let out = output_flag(invocation).expect("link has -o");
                vfs.write_file(&out, wasm.clone());
                Ok(0)
            }
            _ => {
                (invocation.output)(stdout);
                Ok(0)
            }
        }
    }
}

/// Builds a driver over a working stub toolchain, returning the spy.
pub fn stub_driver(dir: &TempDir) -> (Driver, Spy) {
    let runner = StubRunner::new(working_toolchain(FAKE_WASM.to_vec(), "hello from wasm\n"));
    let spy = runner.spy();

    let pack = build_pack(b"compiler", b"linker", &[("fmt", b"fmt-archive".as_ref())]);
    let driver = Driver::with_runner(
        options_for_pack(dir, &pack),
        EventSink::default(),
        Box::new(runner),
    );
    (driver, spy)
}
