//! Instantiates and drives one foreign toolchain module to completion.
//!
//! The compiler and linker ship as WebAssembly modules compiled against a
//! cooperative host embedding: the host supplies an argument vector and
//! environment in linear memory, calls the `run` export, and then keeps
//! the module alive by firing its `resume` export whenever a queued
//! callback or scheduled timer is due, until the module reports its exit
//! code through the `wasmExit` import. The import surface itself lives in
//! [`imports`]; the value encoding in [`values`]; the host object graph
//! in [`objects`].

mod imports;
mod objects;
mod state;
mod values;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use wasmtime::{Engine, Linker, Memory, Module, Store};

use crate::shim::{FsShim, OutputSink};

use state::HostState;

/// Strings for argv and the environment are laid down starting here.
const ARGS_BASE: usize = 4096;

/// The module reserves only this much memory for its argument block.
const ARGS_LIMIT: usize = 12288;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("module bytes did not validate")]
    Module(#[source] wasmtime::Error),

    #[error("host import setup failed")]
    Setup(#[source] wasmtime::Error),

    #[error("module instantiation failed")]
    Instantiate(#[source] wasmtime::Error),

    #[error("module is missing the `{0}` export")]
    MissingExport(&'static str),

    #[error("module trapped")]
    Trap(#[source] wasmtime::Error),

    #[error("argv and environment exceed the module's argument region")]
    ArgsTooLarge,

    #[error("Timeout: module execution exceeded {0:?}")]
    Timeout(Duration),

    #[error("module went idle without exiting")]
    Deadlock,
}

/// One foreign-module invocation: argument vector, environment, output
/// sink, and an optional wall-clock bound.
pub struct FuncRunner {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    shim: Arc<Mutex<FsShim>>,
    output: OutputSink,
}

impl FuncRunner {
    pub fn new(shim: Arc<Mutex<FsShim>>, output: OutputSink) -> Self {
        Self {
            argv: Vec::new(),
            env: BTreeMap::new(),
            timeout: None,
            shim,
            output,
        }
    }

    /// Runs the module to exit and returns its exit code.
    ///
    /// The shim's output sink is swapped to this invocation's sink for
    /// the duration of the run and restored afterwards, so output from a
    /// compile never bleeds into a later program run.
    pub fn run(&self, module_bytes: &[u8]) -> Result<i32, RunnerError> {
        let previous = self
            .shim
            .lock()
            .unwrap()
            .set_output(Arc::clone(&self.output));

        let result = self.run_inner(module_bytes);

        self.shim.lock().unwrap().set_output(previous);
        result
    }

    fn run_inner(&self, module_bytes: &[u8]) -> Result<i32, RunnerError> {
        let engine = Engine::default();
        let module = Module::from_binary(&engine, module_bytes).map_err(RunnerError::Module)?;

        let mut store = Store::new(&engine, HostState::new(Arc::clone(&self.shim)));
        let mut linker = Linker::new(&engine);
        imports::register(&mut linker).map_err(RunnerError::Setup)?;
        linker
            .define_unknown_imports_as_traps(&module)
            .map_err(RunnerError::Setup)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(RunnerError::Instantiate)?;

        let memory = instance
            .get_memory(&mut store, "mem")
            .ok_or(RunnerError::MissingExport("mem"))?;
        let run = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "run")
            .map_err(|_| RunnerError::MissingExport("run"))?;
        let resume = instance
            .get_typed_func::<(), ()>(&mut store, "resume")
            .map_err(|_| RunnerError::MissingExport("resume"))?;

        let (argc, argv_ptr) = write_args(&mut store, &memory, &self.argv, &self.env)?;

        let deadline = self.timeout.map(|bound| Instant::now() + bound);

        log::debug!("running module with argv {:?}", self.argv);
        run.call(&mut store, (argc, argv_ptr))
            .map_err(RunnerError::Trap)?;

        // Cooperative loop: the module has yielded back to us. Deliver
        // queued callbacks and fire due timers through `resume` until the
        // module exits.
        loop {
            if let Some(code) = store.data().exit_code {
                return Ok(code);
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(RunnerError::Timeout(self.timeout.unwrap_or_default()));
                }
            }

            if store.data_mut().promote_next_event() {
                resume.call(&mut store, ()).map_err(RunnerError::Trap)?;
                continue;
            }

            if let Some((id, due)) = store.data().next_timeout() {
                let now = Instant::now();
                if due > now {
                    let mut wait = due - now;
                    if let Some(deadline) = deadline {
                        wait = wait.min(deadline.saturating_duration_since(now));
                    }
                    thread::sleep(wait);
                    continue;
                }
                store.data_mut().clear_timeout(id);
                resume.call(&mut store, ()).map_err(RunnerError::Trap)?;
                continue;
            }

            return Err(RunnerError::Deadlock);
        }
    }
}

/// Writes argv and the environment into the module's argument region in
/// the layout its startup code expects: NUL-terminated strings starting
/// at `ARGS_BASE`, each pointer 8-byte aligned, then a packed vector of
/// i64 pointers (argv entries, 0, environment `key=value` entries, 0).
fn write_args(
    store: &mut Store<HostState>,
    memory: &Memory,
    argv: &[String],
    env: &BTreeMap<String, String>,
) -> Result<(i32, i32), RunnerError> {
    let data = memory.data_mut(&mut *store);
    let mut offset = ARGS_BASE;

    let mut pointers = Vec::with_capacity(argv.len() + env.len() + 2);
    for arg in argv {
        pointers.push(push_string(data, &mut offset, arg)?);
    }
    pointers.push(0);
    for (key, value) in env {
        pointers.push(push_string(data, &mut offset, &format!("{}={}", key, value))?);
    }
    pointers.push(0);

    let argv_ptr = offset;
    for pointer in &pointers {
        let end = offset + 8;
        if end > ARGS_LIMIT || end > data.len() {
            return Err(RunnerError::ArgsTooLarge);
        }
        data[offset..end].copy_from_slice(&(*pointer as i64).to_le_bytes());
        offset = end;
    }

    Ok((argv.len() as i32, argv_ptr as i32))
}

fn push_string(data: &mut [u8], offset: &mut usize, text: &str) -> Result<usize, RunnerError> {
    let bytes = text.as_bytes();
    let end = *offset + bytes.len() + 1;
    if end > ARGS_LIMIT || end > data.len() {
        return Err(RunnerError::ArgsTooLarge);
    }

    data[*offset..*offset + bytes.len()].copy_from_slice(bytes);
    data[*offset + bytes.len()] = 0;

    let pointer = *offset;
    *offset = (end + 7) & !7;
    Ok(pointer)
}

/// Seam between the driver and the foreign modules, so pipelines can be
/// exercised with stub tools in tests.
pub trait ToolRunner: Send + Sync {
    fn run_tool(&self, module: &[u8], invocation: ToolInvocation) -> Result<i32, RunnerError>;
}

/// Everything one tool invocation needs: arguments, environment, the
/// shared filesystem shim, an output sink, and an optional bound.
pub struct ToolInvocation {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub shim: Arc<Mutex<FsShim>>,
    pub output: OutputSink,
    pub timeout: Option<Duration>,
}

/// The production runner: every tool invocation instantiates the module
/// against the invocation's shim.
#[derive(Default)]
pub struct WasmToolRunner;

impl WasmToolRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ToolRunner for WasmToolRunner {
    fn run_tool(&self, module: &[u8], invocation: ToolInvocation) -> Result<i32, RunnerError> {
        let mut runner = FuncRunner::new(invocation.shim, invocation.output);
        runner.argv = invocation.argv;
        runner.env = invocation.env;
        runner.timeout = invocation.timeout;
        runner.run(module)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use memvfs::Vfs;

    fn test_shim() -> Arc<Mutex<FsShim>> {
        Arc::new(Mutex::new(FsShim::new(Arc::new(Vfs::new()))))
    }

    fn quiet_sink() -> OutputSink {
        Arc::new(|_: &str| {})
    }

    fn capture_sink() -> (OutputSink, Arc<Mutex<String>>) {
        let buffer = Arc::new(Mutex::new(String::new()));
        let writer = Arc::clone(&buffer);
        let sink: OutputSink = Arc::new(move |text: &str| {
            writer.lock().unwrap().push_str(text);
        });
        (sink, buffer)
    }

    /// A module that reports exit code 7 through the wasmExit import.
    const EXITS_SEVEN: &str = r#"
        (module
          (import "go" "runtime.wasmExit" (func $exit (param i32)))
          (memory (export "mem") 2)
          (func (export "run") (param i32 i32)
            (i32.store (i32.const 108) (i32.const 7))
            (call $exit (i32.const 100)))
          (func (export "resume"))
          (func (export "getsp") (result i32) (i32.const 0)))
    "#;

    /// A module that writes "hi\n" to fd 1, then exits 0.
    const WRITES_THEN_EXITS: &str = r#"
        (module
          (import "go" "runtime.wasmWrite" (func $write (param i32)))
          (import "go" "runtime.wasmExit" (func $exit (param i32)))
          (memory (export "mem") 2)
          (data (i32.const 200) "hi\n")
          (func (export "run") (param i32 i32)
            (i64.store (i32.const 108) (i64.const 1))
            (i64.store (i32.const 116) (i64.const 200))
            (i32.store (i32.const 124) (i32.const 3))
            (call $write (i32.const 100))
            (i32.store (i32.const 108) (i32.const 0))
            (call $exit (i32.const 100)))
          (func (export "resume"))
          (func (export "getsp") (result i32) (i32.const 0)))
    "#;

    /// A module that yields forever without exiting.
    const NEVER_EXITS: &str = r#"
        (module
          (memory (export "mem") 2)
          (func (export "run") (param i32 i32))
          (func (export "resume"))
          (func (export "getsp") (result i32) (i32.const 0)))
    "#;

    /// A module that schedules a far-future timer and yields.
    const SLEEPS_FOREVER: &str = r#"
        (module
          (import "go" "runtime.scheduleTimeoutEvent" (func $sched (param i32)))
          (memory (export "mem") 2)
          (func (export "run") (param i32 i32)
            (i64.store (i32.const 108) (i64.const 600000))
            (call $sched (i32.const 100)))
          (func (export "resume"))
          (func (export "getsp") (result i32) (i32.const 0)))
    "#;

    #[test]
    fn exit_code_is_propagated() {
        let runner = FuncRunner::new(test_shim(), quiet_sink());
        let code = runner.run(wat::parse_str(EXITS_SEVEN).unwrap().as_slice());
        let code = code.unwrap();
        assert_eq!(code, 7);
    }

    #[test]
    fn wasm_write_reaches_the_output_sink() {
        let (sink, buffer) = capture_sink();
        let runner = FuncRunner::new(test_shim(), sink);

        let code = runner
            .run(wat::parse_str(WRITES_THEN_EXITS).unwrap().as_slice())
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(buffer.lock().unwrap().as_str(), "hi\n");
    }

    #[test]
    fn the_shim_sink_is_restored_after_a_run() {
        let shim = test_shim();
        let (probe, before) = capture_sink();
        shim.lock().unwrap().set_output(probe);

        let runner = FuncRunner::new(Arc::clone(&shim), quiet_sink());
        runner
            .run(wat::parse_str(WRITES_THEN_EXITS).unwrap().as_slice())
            .unwrap();

        // The run's own sink swallowed the module output...
        assert_eq!(before.lock().unwrap().as_str(), "");
        // ...and the original sink is back in place afterwards.
        shim.lock().unwrap().write_sync(1, b"after").unwrap();
        assert_eq!(before.lock().unwrap().as_str(), "after");
    }

    #[test]
    fn idle_module_is_a_deadlock() {
        let runner = FuncRunner::new(test_shim(), quiet_sink());
        let result = runner.run(wat::parse_str(NEVER_EXITS).unwrap().as_slice());
        assert!(matches!(result, Err(RunnerError::Deadlock)));
    }

    #[test]
    fn slow_module_times_out() {
        let mut runner = FuncRunner::new(test_shim(), quiet_sink());
        runner.timeout = Some(Duration::from_millis(50));

        let result = runner.run(wat::parse_str(SLEEPS_FOREVER).unwrap().as_slice());
        match result {
            Err(RunnerError::Timeout(_)) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[test]
    fn garbage_bytes_are_a_module_error() {
        let runner = FuncRunner::new(test_shim(), quiet_sink());
        let result = runner.run(b"not wasm at all");
        assert!(matches!(result, Err(RunnerError::Module(_))));
    }

    #[test]
    fn args_are_laid_out_for_the_module() {
        let engine = Engine::default();
        let module = Module::new(&engine, "(module (memory (export \"mem\") 2))").unwrap();
        let mut store = Store::new(&engine, HostState::new(test_shim()));
        let linker: Linker<HostState> = Linker::new(&engine);
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let memory = instance.get_memory(&mut store, "mem").unwrap();

        let argv = vec!["compile".to_owned(), "-o".to_owned()];
        let mut env = BTreeMap::new();
        env.insert("GOOS".to_owned(), "js".to_owned());

        let (argc, argv_ptr) = write_args(&mut store, &memory, &argv, &env).unwrap();
        assert_eq!(argc, 2);

        let data = memory.data(&store);
        assert_eq!(&data[4096..4104], b"compile\0");
        assert_eq!(&data[4104..4107], b"-o\0");
        assert_eq!(&data[4112..4120], b"GOOS=js\0");

        let argv_ptr = argv_ptr as usize;
        let read_i64 = |addr: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[addr..addr + 8]);
            i64::from_le_bytes(raw)
        };
        assert_eq!(read_i64(argv_ptr), 4096);
        assert_eq!(read_i64(argv_ptr + 8), 4104);
        assert_eq!(read_i64(argv_ptr + 16), 0, "argv vector is 0-terminated");
        assert_eq!(read_i64(argv_ptr + 24), 4112);
        assert_eq!(read_i64(argv_ptr + 32), 0, "environment is 0-terminated");
    }

    #[test]
    fn oversized_args_are_rejected() {
        let engine = Engine::default();
        let module = Module::new(&engine, "(module (memory (export \"mem\") 2))").unwrap();
        let mut store = Store::new(&engine, HostState::new(test_shim()));
        let linker: Linker<HostState> = Linker::new(&engine);
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let memory = instance.get_memory(&mut store, "mem").unwrap();

        let argv = vec!["x".repeat(16 * 1024)];
        let result = write_args(&mut store, &memory, &argv, &BTreeMap::new());
        assert!(matches!(result, Err(RunnerError::ArgsTooLarge)));
    }
}
