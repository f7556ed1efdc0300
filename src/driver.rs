//! The build driver: orchestrates the pipeline from source bytes to a
//! runnable WebAssembly binary.
//!
//! A `Driver` owns the VFS, the filesystem shim shared by both foreign
//! tools, the persistent pack and artifact stores, and a `ToolRunner`
//! that actually executes the foreign modules. One compilation runs at a
//! time; a second `compile` while one is in flight is rejected rather
//! than queued, because the shim's descriptor table and working
//! directory are shared state the foreign binaries assume they own.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use memvfs::{Vfs, VfsStats};
use serde::Serialize;
use thiserror::Error;

use crate::artifacts::{metadata_now, source_hash, ArtifactCache, ArtifactRecord};
use crate::events::{EventSink, Stage, StageStatus};
use crate::pack::{package_dir, Pack, PackError, PackLoader, PackStore, ARCH_TARGET};
use crate::runner::{RunnerError, ToolInvocation, ToolRunner, WasmToolRunner};
use crate::shim::{FsShim, OutputSink};

/// Where the pack is fetched from when the caller does not say.
pub const DEFAULT_PACK_URL: &str = "https://goscript.dev/toolchain/goscript-pack-v2.bin";

/// First eight bytes of every valid WebAssembly binary.
const WASM_MAGIC: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

const OBJECT_PATH: &str = "/build/main.o";
const OUTPUT_PATH: &str = "/build/main.wasm";
const PUBLISH_PATH: &str = "/output/main.wasm";

/// Source files keyed by (possibly relative) path.
pub type SourceSet = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub pack_url: String,
    /// Root for the persistent stores. Defaults to the user cache
    /// directory.
    pub cache_dir: Option<PathBuf>,
    pub debug: bool,
    /// Optional wall-clock bound per foreign-module invocation.
    pub tool_timeout: Option<Duration>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            pack_url: DEFAULT_PACK_URL.to_owned(),
            cache_dir: None,
            debug: false,
            tool_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DriverState {
    Idle,
    Compiling,
    Complete,
    Error,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Busy: a compilation is already in progress")]
    Busy,

    #[error("Cancelled before completion")]
    Cancelled,

    #[error(transparent)]
    Pack(#[from] PackError),

    #[error("Compile failed: {0}")]
    Compile(String),

    #[error("Link failed: {0}")]
    Link(String),

    #[error("Format error: produced binary is not a WebAssembly module")]
    BadOutput,

    #[error("{0}")]
    Timeout(String),
}

impl DriverError {
    fn from_tool(err: RunnerError, stage: Stage) -> Self {
        match err {
            RunnerError::Timeout(_) => DriverError::Timeout(err.to_string()),
            other => match stage {
                Stage::Link => DriverError::Link(other.to_string()),
                _ => DriverError::Compile(other.to_string()),
            },
        }
    }
}

/// Result surface of `compile`. Failures are reported in-band; see the
/// error string and the driver state rather than a `Result`.
#[derive(Debug)]
pub struct CompileOutcome {
    pub success: bool,
    pub wasm: Option<Vec<u8>>,
    pub error: Option<String>,
    pub metadata: CompileMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct CompileMetadata {
    pub compile_time: Duration,
    pub wasm_size: usize,
    pub source_files: Vec<String>,
    /// True when the result came from the artifact cache without running
    /// the foreign tools.
    pub cached: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverStats {
    pub state: DriverState,
    pub vfs: VfsStats,
    pub pack_loaded: bool,
    pub package_count: usize,
    pub artifact_count: usize,
}

pub struct Driver {
    options: DriverOptions,
    events: EventSink,
    vfs: Arc<Vfs>,
    shim: Arc<Mutex<FsShim>>,
    cache_root: PathBuf,
    artifacts: ArtifactCache,
    pack: Mutex<Option<Pack>>,
    state: Mutex<DriverState>,
    cancelled: AtomicBool,
    runner: Box<dyn ToolRunner>,
}

impl Driver {
    pub fn new(options: DriverOptions) -> Self {
        Self::with_events(options, EventSink::default())
    }

    pub fn with_events(options: DriverOptions, events: EventSink) -> Self {
        let vfs = Arc::new(Vfs::new());
        let shim = Arc::new(Mutex::new(FsShim::new(Arc::clone(&vfs))));
        Self::assemble(options, events, vfs, shim, Box::new(WasmToolRunner::new()))
    }

    /// Builds a driver around a caller-supplied tool runner. This is the
    /// seam test suites use to substitute stub tools for the foreign
    /// modules.
    pub fn with_runner(
        options: DriverOptions,
        events: EventSink,
        runner: Box<dyn ToolRunner>,
    ) -> Self {
        let vfs = Arc::new(Vfs::new());
        let shim = Arc::new(Mutex::new(FsShim::new(Arc::clone(&vfs))));
        Self::assemble(options, events, vfs, shim, runner)
    }

    fn assemble(
        options: DriverOptions,
        events: EventSink,
        vfs: Arc<Vfs>,
        shim: Arc<Mutex<FsShim>>,
        runner: Box<dyn ToolRunner>,
    ) -> Self {
        let cache_root = options.cache_dir.clone().unwrap_or_else(default_cache_dir);

        Self {
            options,
            events,
            vfs,
            shim,
            artifacts: ArtifactCache::new(cache_root.join("artifacts")),
            cache_root,
            pack: Mutex::new(None),
            state: Mutex::new(DriverState::Idle),
            cancelled: AtomicBool::new(false),
            runner,
        }
    }

    /// Loads the toolchain pack if it is not already loaded. Idempotent;
    /// later calls return immediately.
    pub fn init(&self) -> Result<(), DriverError> {
        self.ensure_toolchain()
    }

    pub fn state(&self) -> DriverState {
        *self.state.lock().unwrap()
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    pub fn stats(&self) -> DriverStats {
        let pack = self.pack.lock().unwrap();
        DriverStats {
            state: self.state(),
            vfs: self.vfs.stats(),
            pack_loaded: pack.is_some(),
            package_count: pack.as_ref().map(Pack::package_count).unwrap_or(0),
            artifact_count: self.artifacts.len(),
        }
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.pack
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|pack| pack.has_package(name))
    }

    pub fn packages(&self) -> Vec<String> {
        self.pack
            .lock()
            .unwrap()
            .as_ref()
            .map(|pack| pack.package_names().to_vec())
            .unwrap_or_default()
    }

    pub fn artifact_cache(&self) -> &ArtifactCache {
        &self.artifacts
    }

    pub fn pack_store(&self) -> PackStore {
        PackStore::new(self.cache_root.join("packs"))
    }

    /// Requests cancellation. Takes effect at the next stage boundary;
    /// an in-flight foreign module is not unwound and finishes its stage
    /// first.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears the VFS back to the loaded-toolchain baseline and returns
    /// the driver to `Idle`. The parsed pack survives a reset; its
    /// archives are re-staged immediately.
    pub fn reset(&self) {
        self.vfs.clear();
        self.shim.lock().unwrap().reset();
        if let Some(pack) = self.pack.lock().unwrap().as_ref() {
            pack.load_all_into_vfs(&self.vfs);
        }
        *self.state.lock().unwrap() = DriverState::Idle;
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Compiles a single-file program. Equivalent to `compile` with one
    /// `main.go` entry.
    pub fn compile_source(&self, source: &str) -> CompileOutcome {
        let mut files = SourceSet::new();
        files.insert("main.go".to_owned(), source.as_bytes().to_vec());
        self.compile(&files)
    }

    /// Runs the full pipeline over the given sources.
    pub fn compile(&self, files: &SourceSet) -> CompileOutcome {
        {
            let mut state = self.state.lock().unwrap();
            if *state == DriverState::Compiling {
                let err = DriverError::Busy;
                self.events.error(&err.to_string());
                return failure_outcome(err, files);
            }
            *state = DriverState::Compiling;
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let started = Instant::now();
        let result = self.pipeline(files);

        match result {
            Ok((bytes, mut metadata)) => {
                metadata.compile_time = started.elapsed();
                *self.state.lock().unwrap() = DriverState::Complete;
                CompileOutcome {
                    success: true,
                    wasm: Some(bytes),
                    error: None,
                    metadata,
                }
            }
            Err(err) => {
                let next = match err {
                    DriverError::Cancelled => DriverState::Cancelled,
                    _ => DriverState::Error,
                };
                *self.state.lock().unwrap() = next;
                self.events.error(&err.to_string());
                failure_outcome(err, files)
            }
        }
    }

    fn pipeline(
        &self,
        files: &SourceSet,
    ) -> Result<(Vec<u8>, CompileMetadata), DriverError> {
        self.run_stage(Stage::LoadToolchain, || self.ensure_toolchain())?;

        let hash = source_hash(
            files
                .iter()
                .map(|(path, content)| (path.as_str(), content.as_slice())),
        );

        let cached = self.run_stage(Stage::CacheCheck, || Ok(self.cache_lookup(&hash)))?;
        if let Some(record) = cached {
            log::info!("artifact cache hit for {}", &hash[..12]);
            self.events.progress(100, "cached artifact");
            self.events.complete(&record.bytes, &record.metadata);
            let metadata = CompileMetadata {
                compile_time: Duration::ZERO,
                wasm_size: record.bytes.len(),
                source_files: files.keys().cloned().collect(),
                cached: true,
            };
            return Ok((record.bytes, metadata));
        }

        let input_paths = self.run_stage(Stage::StageSources, || {
            let work_dir = format!("/tmp/{}", &hash[..12]);
            self.vfs.mkdir(&work_dir);

            let mut staged = Vec::with_capacity(files.len());
            for (path, content) in files {
                let staged_path = format!("{}/{}", work_dir, path.trim_start_matches('/'));
                self.vfs.write_file(&staged_path, content.clone());
                staged.push(staged_path);
            }
            Ok(staged)
        })?;

        self.run_stage(Stage::PrepareBuild, || {
            self.vfs.mkdir("/tmp");
            self.vfs.mkdir("/build");
            self.vfs.mkdir("/output");

            let info = serde_json::json!({
                "sourceFiles": input_paths,
                "target": ARCH_TARGET,
                "packages": self.packages().len(),
            });
            self.vfs
                .write_file("/build/build-info.json", info.to_string());
            Ok(())
        })?;

        self.run_stage(Stage::Compile, || {
            let mut argv = vec![
                "compile".to_owned(),
                "-o".to_owned(),
                OBJECT_PATH.to_owned(),
                "-p".to_owned(),
                "main".to_owned(),
                "-I".to_owned(),
                package_dir(),
            ];
            argv.extend(input_paths.iter().cloned());

            let (sink, diagnostics) = self.tool_sink();
            let compiler = self.compiler_bytes()?;
            let code = self
                .runner
                .run_tool(&compiler, self.invocation(argv, sink))
                .map_err(|err| DriverError::from_tool(err, Stage::Compile))?;

            if code != 0 {
                return Err(DriverError::Compile(tool_failure(code, &diagnostics)));
            }
            if !self.vfs.is_file(OBJECT_PATH) {
                return Err(DriverError::Compile(format!(
                    "compiler exited cleanly but produced no object file at {}",
                    OBJECT_PATH
                )));
            }
            Ok(())
        })?;

        let bytes = self.run_stage(Stage::Link, || {
            let argv = vec![
                "link".to_owned(),
                "-o".to_owned(),
                OUTPUT_PATH.to_owned(),
                "-L".to_owned(),
                package_dir(),
                OBJECT_PATH.to_owned(),
            ];

            let (sink, diagnostics) = self.tool_sink();
            let linker = self.linker_bytes()?;
            let code = self
                .runner
                .run_tool(&linker, self.invocation(argv, sink))
                .map_err(|err| DriverError::from_tool(err, Stage::Link))?;

            if code != 0 {
                return Err(DriverError::Link(tool_failure(code, &diagnostics)));
            }

            let bytes = self
                .vfs
                .read_file(OUTPUT_PATH)
                .map_err(|_| {
                    DriverError::Link(format!(
                        "linker exited cleanly but produced no binary at {}",
                        OUTPUT_PATH
                    ))
                })?
                .to_vec();

            if !is_wasm(&bytes) {
                return Err(DriverError::BadOutput);
            }
            Ok(bytes)
        })?;

        self.run_stage(Stage::Publish, || {
            let input_size: usize = files.values().map(Vec::len).sum();
            let metadata = metadata_now(input_size, bytes.len(), ARCH_TARGET);
            self.artifacts.put(&hash, &bytes, &metadata);
            self.vfs.write_file(PUBLISH_PATH, bytes.clone());

            self.events.progress(100, "complete");
            self.events.complete(&bytes, &metadata);
            Ok(())
        })?;

        let metadata = CompileMetadata {
            compile_time: Duration::ZERO,
            wasm_size: bytes.len(),
            source_files: files.keys().cloned().collect(),
            cached: false,
        };
        Ok((bytes, metadata))
    }

    /// Executes a compiled binary with captured output. This path never
    /// touches the artifact cache; callers pass the bytes back in.
    pub fn run(&self, wasm: &[u8], options: RunOptions) -> RunOutcome {
        let captured = Arc::new(Mutex::new(String::new()));
        let sink: OutputSink = {
            let captured = Arc::clone(&captured);
            let forward = self.events.output_handler();
            Arc::new(move |text: &str| {
                captured.lock().unwrap().push_str(text);
                if let Some(forward) = &forward {
                    forward(text);
                }
            })
        };

        let mut argv = vec!["main".to_owned()];
        argv.extend(options.args);

        let mut env = default_env();
        env.extend(options.env);

        let invocation = ToolInvocation {
            argv,
            env,
            shim: Arc::clone(&self.shim),
            output: sink,
            timeout: options.timeout.or(self.options.tool_timeout),
        };

        match self.runner.run_tool(wasm, invocation) {
            Ok(code) => {
                let output = captured.lock().unwrap().clone();
                RunOutcome {
                    success: code == 0,
                    output,
                    error: (code != 0).then(|| format!("program exited with code {}", code)),
                    exit_code: code,
                }
            }
            Err(err) => {
                let output = captured.lock().unwrap().clone();
                self.events.error(&err.to_string());
                RunOutcome {
                    success: false,
                    output,
                    error: Some(err.to_string()),
                    exit_code: -1,
                }
            }
        }
    }

    fn run_stage<T>(
        &self,
        stage: Stage,
        body: impl FnOnce() -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(DriverError::Cancelled);
        }

        self.events.stage(stage, StageStatus::Started);
        self.events.progress(stage.progress(), stage.name());
        if self.options.debug {
            log::debug!("stage start: {}", stage.name());
        }

        let result = body()?;

        self.events.stage(stage, StageStatus::Finished);
        Ok(result)
    }

    fn ensure_toolchain(&self) -> Result<(), DriverError> {
        let mut pack = self.pack.lock().unwrap();
        if pack.is_some() {
            return Ok(());
        }

        let loader = PackLoader::new(self.options.pack_url.clone(), self.pack_store());
        let loaded = loader.load()?;
        loaded.load_all_into_vfs(&self.vfs);

        log::info!(
            "toolchain ready: {} standard-library packages",
            loaded.package_count()
        );
        *pack = Some(loaded);
        Ok(())
    }

    /// Looks up a cached artifact, discarding records that fail the
    /// WebAssembly magic check. A mispredicted hash hit therefore falls
    /// through to a real build instead of returning garbage.
    fn cache_lookup(&self, hash: &str) -> Option<ArtifactRecord> {
        let record = self.artifacts.get(hash)?;
        if is_wasm(&record.bytes) {
            Some(record)
        } else {
            log::warn!("discarding cached artifact with bad magic for {}", hash);
            None
        }
    }

    fn compiler_bytes(&self) -> Result<Vec<u8>, DriverError> {
        let pack = self.pack.lock().unwrap();
        let pack = pack
            .as_ref()
            .ok_or_else(|| DriverError::Compile("toolchain is not loaded".to_owned()))?;
        Ok(pack.compiler_bytes().to_vec())
    }

    fn linker_bytes(&self) -> Result<Vec<u8>, DriverError> {
        let pack = self.pack.lock().unwrap();
        let pack = pack
            .as_ref()
            .ok_or_else(|| DriverError::Link("toolchain is not loaded".to_owned()))?;
        Ok(pack.linker_bytes().to_vec())
    }

    fn invocation(&self, argv: Vec<String>, output: OutputSink) -> ToolInvocation {
        ToolInvocation {
            argv,
            env: default_env(),
            shim: Arc::clone(&self.shim),
            output,
            timeout: self.options.tool_timeout,
        }
    }

    /// Builds a sink that accumulates tool diagnostics and forwards them
    /// to the output callback.
    fn tool_sink(&self) -> (OutputSink, Arc<Mutex<String>>) {
        let diagnostics = Arc::new(Mutex::new(String::new()));
        let forward = self.events.output_handler();
        let writer = Arc::clone(&diagnostics);

        let sink: OutputSink = Arc::new(move |text: &str| {
            writer.lock().unwrap().push_str(text);
            if let Some(forward) = &forward {
                forward(text);
            }
        });
        (sink, diagnostics)
    }
}

fn default_env() -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("GOOS".to_owned(), "js".to_owned());
    env.insert("GOARCH".to_owned(), "wasm".to_owned());
    env.insert("GOROOT".to_owned(), "/".to_owned());
    env
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("goscript")
}

fn is_wasm(bytes: &[u8]) -> bool {
    bytes.len() >= 8 && bytes[..8] == WASM_MAGIC
}

fn tool_failure(code: i32, diagnostics: &Arc<Mutex<String>>) -> String {
    let output = diagnostics.lock().unwrap();
    let output = output.trim();
    if output.is_empty() {
        format!("tool exited with code {}", code)
    } else {
        format!("tool exited with code {}: {}", code, output)
    }
}

fn failure_outcome(err: DriverError, files: &SourceSet) -> CompileOutcome {
    CompileOutcome {
        success: false,
        wasm: None,
        error: Some(err.to_string()),
        metadata: CompileMetadata {
            source_files: files.keys().cloned().collect(),
            ..CompileMetadata::default()
        },
    }
}
