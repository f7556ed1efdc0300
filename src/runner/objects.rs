//! Property and method dispatch over the emulated host object graph.
//!
//! The foreign modules see the host through reflective operations
//! (`valueGet`, `valueCall`, `valueNew`, ...). This module routes those
//! operations to concrete behavior: filesystem methods go through the
//! shim, `process` exposes the working directory, and the handful of
//! constructors the modules instantiate (`Uint8Array`, `Object`,
//! `Array`, `Date`, `Error`) build host objects. Anything outside the
//! surface the binaries actually use resolves to `undefined` rather
//! than trapping, the same forgiving behavior a real host gives them.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::shim::{constants, ShimError, StatInfo};

use super::state::HostState;
use super::values::{HostObject, JsValue, Ref, Value};

/// Lightweight classification of a table slot, so dispatch can branch
/// without holding a borrow of the table.
#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Global,
    Go,
    Fs,
    FsConstants,
    Process,
    Crypto,
    Performance,
    Console,
    ObjectCtor,
    ArrayCtor,
    Uint8ArrayCtor,
    DateCtor,
    ErrorCtor,
    Date,
    Bytes,
    Array,
    Dict,
    Stat,
    Error,
    GoFunc,
    Event,
    String,
    Other,
}

fn kind_of(state: &HostState, value: JsValue) -> Kind {
    let JsValue::Ref(id) = value else {
        return Kind::Other;
    };

    match state.values.get(id) {
        Some(Value::String(_)) => Kind::String,
        Some(Value::Object(object)) => match object {
            HostObject::Global => Kind::Global,
            HostObject::Go => Kind::Go,
            HostObject::Fs => Kind::Fs,
            HostObject::FsConstants => Kind::FsConstants,
            HostObject::Process => Kind::Process,
            HostObject::Crypto => Kind::Crypto,
            HostObject::Performance => Kind::Performance,
            HostObject::Console => Kind::Console,
            HostObject::ObjectCtor => Kind::ObjectCtor,
            HostObject::ArrayCtor => Kind::ArrayCtor,
            HostObject::Uint8ArrayCtor => Kind::Uint8ArrayCtor,
            HostObject::DateCtor => Kind::DateCtor,
            HostObject::ErrorCtor => Kind::ErrorCtor,
            HostObject::Date => Kind::Date,
            HostObject::Bytes(_) => Kind::Bytes,
            HostObject::Array(_) => Kind::Array,
            HostObject::Dict(_) => Kind::Dict,
            HostObject::Stat { .. } => Kind::Stat,
            HostObject::Error { .. } => Kind::Error,
            HostObject::GoFunc { .. } => Kind::GoFunc,
            HostObject::Event { .. } => Kind::Event,
        },
        _ => Kind::Other,
    }
}

fn ref_of(value: JsValue) -> Option<Ref> {
    match value {
        JsValue::Ref(id) => Some(id),
        _ => None,
    }
}

/// `Reflect.get(target, prop)`.
pub fn value_get(state: &mut HostState, target: JsValue, prop: &str) -> JsValue {
    match kind_of(state, target) {
        Kind::Global => global_get(state, prop),
        Kind::Go => match prop {
            "_pendingEvent" => state
                .current_event()
                .map(JsValue::Ref)
                .unwrap_or(JsValue::Null),
            _ => JsValue::Undefined,
        },
        Kind::Fs => match prop {
            "constants" => JsValue::Ref(
                state
                    .values
                    .singleton("fs.constants", || Value::Object(HostObject::FsConstants)),
            ),
            _ => JsValue::Undefined,
        },
        Kind::FsConstants => constants::all()
            .iter()
            .find(|(name, _)| *name == prop)
            .map(|&(_, value)| JsValue::Number(value as f64))
            .unwrap_or(JsValue::Number(-1.0)),
        Kind::Process => match prop {
            "pid" | "ppid" => JsValue::Number(-1.0),
            _ => JsValue::Undefined,
        },
        Kind::Performance => match prop {
            "timeOrigin" => JsValue::Number(0.0),
            _ => JsValue::Undefined,
        },
        Kind::Dict => {
            let id = ref_of(target).expect("dict is a ref");
            match state.values.get(id) {
                Some(Value::Object(HostObject::Dict(map))) => {
                    map.get(prop).copied().unwrap_or(JsValue::Undefined)
                }
                _ => JsValue::Undefined,
            }
        }
        Kind::Stat => {
            let id = ref_of(target).expect("stat is a ref");
            let Some(Value::Object(HostObject::Stat {
                is_dir,
                size,
                mtime_ms,
            })) = state.values.get(id)
            else {
                return JsValue::Undefined;
            };
            stat_field(prop, *is_dir, *size, *mtime_ms)
        }
        Kind::Error => {
            let id = ref_of(target).expect("error is a ref");
            let (message, code) = match state.values.get(id) {
                Some(Value::Object(HostObject::Error { message, code })) => {
                    (message.clone(), code.clone())
                }
                _ => return JsValue::Undefined,
            };
            match prop {
                "message" | "stack" => state.values.string(message),
                "code" => state.values.string(code),
                _ => JsValue::Undefined,
            }
        }
        Kind::Event => {
            let id = ref_of(target).expect("event is a ref");
            let Some(Value::Object(HostObject::Event {
                id: event_id,
                func,
                args,
                result,
            })) = state.values.get(id)
            else {
                return JsValue::Undefined;
            };
            match prop {
                "id" => JsValue::Number(*event_id as f64),
                "this" => JsValue::Ref(*func),
                "args" => JsValue::Ref(*args),
                "result" => *result,
                _ => JsValue::Undefined,
            }
        }
        _ => JsValue::Undefined,
    }
}

fn global_get(state: &mut HostState, prop: &str) -> JsValue {
    let id = match prop {
        "fs" => state.values.singleton("fs", || Value::Object(HostObject::Fs)),
        "process" => state
            .values
            .singleton("process", || Value::Object(HostObject::Process)),
        "crypto" => state
            .values
            .singleton("crypto", || Value::Object(HostObject::Crypto)),
        "performance" => state
            .values
            .singleton("performance", || Value::Object(HostObject::Performance)),
        "console" => state
            .values
            .singleton("console", || Value::Object(HostObject::Console)),
        "Object" => state
            .values
            .singleton("Object", || Value::Object(HostObject::ObjectCtor)),
        "Array" => state
            .values
            .singleton("Array", || Value::Object(HostObject::ArrayCtor)),
        "Uint8Array" => state
            .values
            .singleton("Uint8Array", || Value::Object(HostObject::Uint8ArrayCtor)),
        "Date" => state
            .values
            .singleton("Date", || Value::Object(HostObject::DateCtor)),
        "Error" => state
            .values
            .singleton("Error", || Value::Object(HostObject::ErrorCtor)),
        _ => return JsValue::Undefined,
    };
    JsValue::Ref(id)
}

fn stat_field(prop: &str, is_dir: bool, size: u64, mtime_ms: i64) -> JsValue {
    let info = StatInfo {
        is_dir,
        size,
        mtime_ms,
    };
    match prop {
        "mode" => JsValue::Number(info.mode() as f64),
        "size" => JsValue::Number(size as f64),
        "atimeMs" | "mtimeMs" | "ctimeMs" => JsValue::Number(mtime_ms as f64),
        "dev" | "ino" | "uid" | "gid" | "rdev" => JsValue::Number(0.0),
        "nlink" => JsValue::Number(1.0),
        "blksize" => JsValue::Number(4096.0),
        "blocks" => JsValue::Number(size.div_ceil(512) as f64),
        _ => JsValue::Undefined,
    }
}

/// `Reflect.set(target, prop, value)`.
pub fn value_set(state: &mut HostState, target: JsValue, prop: &str, value: JsValue) {
    match kind_of(state, target) {
        Kind::Go => {
            if prop == "_pendingEvent" {
                match value {
                    JsValue::Ref(id) => {
                        state.values.retain(id);
                        state.set_current_event(Some(id));
                    }
                    _ => state.set_current_event(None),
                }
            }
        }
        Kind::Dict => {
            let id = ref_of(target).expect("dict is a ref");
            if let JsValue::Ref(child) = value {
                state.values.retain(child);
            }
            let previous = match state.values.get_mut(id) {
                Some(Value::Object(HostObject::Dict(map))) => map.insert(prop.to_owned(), value),
                _ => None,
            };
            if let Some(JsValue::Ref(old)) = previous {
                state.values.release(old);
            }
        }
        Kind::Event => {
            if prop == "result" {
                let id = ref_of(target).expect("event is a ref");
                if let JsValue::Ref(child) = value {
                    state.values.retain(child);
                }
                let previous = match state.values.get_mut(id) {
                    Some(Value::Object(HostObject::Event { result, .. })) => {
                        std::mem::replace(result, value)
                    }
                    _ => JsValue::Undefined,
                };
                if let JsValue::Ref(old) = previous {
                    state.values.release(old);
                }
            }
        }
        _ => {}
    }
}

/// `Reflect.deleteProperty(target, prop)`.
pub fn value_delete(state: &mut HostState, target: JsValue, prop: &str) {
    if kind_of(state, target) == Kind::Dict {
        let id = ref_of(target).expect("dict is a ref");
        let removed = match state.values.get_mut(id) {
            Some(Value::Object(HostObject::Dict(map))) => map.remove(prop),
            _ => None,
        };
        if let Some(JsValue::Ref(old)) = removed {
            state.values.release(old);
        }
    }
}

/// `Reflect.get(target, index)`.
pub fn value_index(state: &HostState, target: JsValue, index: usize) -> JsValue {
    let Some(id) = ref_of(target) else {
        return JsValue::Undefined;
    };
    match state.values.get(id) {
        Some(Value::Object(HostObject::Array(items))) => {
            items.get(index).copied().unwrap_or(JsValue::Undefined)
        }
        Some(Value::Object(HostObject::Bytes(bytes))) => bytes
            .get(index)
            .map(|byte| JsValue::Number(*byte as f64))
            .unwrap_or(JsValue::Undefined),
        _ => JsValue::Undefined,
    }
}

/// `Reflect.set(target, index, value)`.
pub fn value_set_index(state: &mut HostState, target: JsValue, index: usize, value: JsValue) {
    let Some(id) = ref_of(target) else {
        return;
    };

    match kind_of(state, target) {
        Kind::Array => {
            if let JsValue::Ref(child) = value {
                state.values.retain(child);
            }
            let previous = match state.values.get_mut(id) {
                Some(Value::Object(HostObject::Array(items))) => {
                    if index >= items.len() {
                        items.resize(index + 1, JsValue::Undefined);
                    }
                    std::mem::replace(&mut items[index], value)
                }
                _ => JsValue::Undefined,
            };
            if let JsValue::Ref(old) = previous {
                state.values.release(old);
            }
        }
        Kind::Bytes => {
            let byte = state.values.as_number(value).unwrap_or(0.0) as u8;
            if let Some(Value::Object(HostObject::Bytes(bytes))) = state.values.get_mut(id) {
                if index < bytes.len() {
                    bytes[index] = byte;
                }
            }
        }
        _ => {}
    }
}

/// `target.length`.
pub fn value_length(state: &HostState, target: JsValue) -> i64 {
    let Some(id) = ref_of(target) else {
        return 0;
    };
    match state.values.get(id) {
        Some(Value::Object(HostObject::Array(items))) => items.len() as i64,
        Some(Value::Object(HostObject::Bytes(bytes))) => bytes.len() as i64,
        Some(Value::String(text)) => text.encode_utf16().count() as i64,
        _ => 0,
    }
}

/// `value instanceof ctor`.
pub fn instance_of(state: &HostState, value: JsValue, ctor: JsValue) -> bool {
    matches!(
        (kind_of(state, value), kind_of(state, ctor)),
        (Kind::Error, Kind::ErrorCtor) | (Kind::Bytes, Kind::Uint8ArrayCtor)
    )
}

/// `Reflect.construct(ctor, args)`.
pub fn value_new(
    state: &mut HostState,
    ctor: JsValue,
    args: Vec<JsValue>,
) -> Result<JsValue, JsValue> {
    match kind_of(state, ctor) {
        Kind::ObjectCtor => Ok(state.values.object(HostObject::Dict(Default::default()))),
        Kind::ArrayCtor => {
            if let Some(len) = args.first().and_then(|arg| state.values.as_number(*arg)) {
                if args.len() == 1 {
                    return Ok(state
                        .values
                        .object(HostObject::Array(vec![JsValue::Undefined; len as usize])));
                }
            }
            for arg in &args {
                if let JsValue::Ref(child) = arg {
                    state.values.retain(*child);
                }
            }
            Ok(state.values.object(HostObject::Array(args)))
        }
        Kind::Uint8ArrayCtor => {
            let len = args
                .first()
                .and_then(|arg| state.values.as_number(*arg))
                .unwrap_or(0.0) as usize;
            Ok(state.values.object(HostObject::Bytes(vec![0; len])))
        }
        Kind::DateCtor => Ok(state.values.object(HostObject::Date)),
        Kind::ErrorCtor => {
            let message = args
                .first()
                .and_then(|arg| state.values.as_string(*arg))
                .unwrap_or_default();
            Ok(state.values.object(HostObject::Error {
                message,
                code: String::new(),
            }))
        }
        _ => Err(thrown(state, "value is not a constructor")),
    }
}

/// `Reflect.apply(target[method], target, args)`.
pub fn value_call(
    state: &mut HostState,
    target: JsValue,
    method: &str,
    args: Vec<JsValue>,
) -> Result<JsValue, JsValue> {
    match kind_of(state, target) {
        Kind::Fs => fs_call(state, method, args),
        Kind::Process => process_call(state, method, args),
        Kind::Go => match method {
            "_makeFuncWrapper" => {
                let id = args
                    .first()
                    .and_then(|arg| state.values.as_number(*arg))
                    .unwrap_or(0.0) as u32;
                Ok(state.values.object(HostObject::GoFunc { id }))
            }
            _ => Err(thrown(state, &format!("go.{} is not a function", method))),
        },
        Kind::Console => {
            let line = args
                .iter()
                .map(|arg| display(state, *arg))
                .collect::<Vec<_>>()
                .join(" ");
            log::info!(target: "goscript::foreign", "{}", line);
            Ok(JsValue::Undefined)
        }
        Kind::Crypto => match method {
            "getRandomValues" => {
                let target = args.first().copied().unwrap_or(JsValue::Undefined);
                let Some(id) = ref_of(target) else {
                    return Err(thrown(state, "getRandomValues needs a typed array"));
                };
                if let Some(Value::Object(HostObject::Bytes(bytes))) = state.values.get_mut(id) {
                    use rand::RngCore;
                    rand::rng().fill_bytes(bytes);
                }
                Ok(target)
            }
            _ => Err(thrown(state, &format!("crypto.{} is not a function", method))),
        },
        Kind::Performance => match method {
            "now" => Ok(JsValue::Number(
                state.epoch.elapsed().as_secs_f64() * 1000.0,
            )),
            _ => Err(thrown(state, &format!("performance.{} is not a function", method))),
        },
        Kind::Date => match method {
            "getTimezoneOffset" => Ok(JsValue::Number(0.0)),
            "getTime" => Ok(JsValue::Number(unix_ms())),
            _ => Err(thrown(state, &format!("Date.{} is not a function", method))),
        },
        Kind::DateCtor => match method {
            "now" => Ok(JsValue::Number(unix_ms())),
            _ => Err(thrown(state, &format!("Date.{} is not a function", method))),
        },
        Kind::Stat => {
            let id = ref_of(target).expect("stat is a ref");
            let Some(Value::Object(HostObject::Stat { is_dir, .. })) = state.values.get(id) else {
                return Err(thrown(state, "stat receiver is gone"));
            };
            let is_dir = *is_dir;
            match method {
                "isFile" => Ok(JsValue::Bool(!is_dir)),
                "isDirectory" => Ok(JsValue::Bool(is_dir)),
                _ => Err(thrown(state, &format!("Stats.{} is not a function", method))),
            }
        }
        _ => Err(thrown(state, &format!("{} is not a function", method))),
    }
}

/// `Reflect.apply(func, undefined, args)`. The only callable values the
/// module ever invokes directly are its own function wrappers, which
/// complete by queueing an event, so invoke just schedules delivery.
pub fn value_invoke(
    state: &mut HostState,
    func: JsValue,
    args: Vec<JsValue>,
) -> Result<JsValue, JsValue> {
    if kind_of(state, func) == Kind::GoFunc {
        state.queue_callback(func, args);
        Ok(JsValue::Undefined)
    } else {
        Err(thrown(state, "value is not a function"))
    }
}

fn process_call(
    state: &mut HostState,
    method: &str,
    args: Vec<JsValue>,
) -> Result<JsValue, JsValue> {
    let shim = Arc::clone(&state.shim);
    let mut shim = shim.lock().unwrap();

    match method {
        "cwd" => {
            let cwd = shim.cwd();
            Ok(state.values.string(cwd))
        }
        "chdir" => {
            let path = args
                .first()
                .and_then(|arg| state.values.as_string(*arg))
                .ok_or_else(|| thrown(state, "chdir needs a path"))?;
            match shim.chdir(&path) {
                Ok(()) => Ok(JsValue::Undefined),
                Err(err) => Err(shim_error(state, &err)),
            }
        }
        "getuid" | "getgid" | "geteuid" | "getegid" => Ok(JsValue::Number(-1.0)),
        "umask" => Ok(JsValue::Number(0.0)),
        other => Err(thrown(state, &format!("process.{} is not a function", other))),
    }
}

fn fs_call(state: &mut HostState, method: &str, args: Vec<JsValue>) -> Result<JsValue, JsValue> {
    match method {
        "writeSync" => {
            let fd = int_arg(state, &args, 0);
            let data = bytes_arg(state, &args, 1).unwrap_or_default();
            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().write_sync(fd, &data);
            match result {
                Ok(n) => Ok(JsValue::Number(n as f64)),
                Err(err) => Err(shim_error(state, &err)),
            }
        }
        "write" => {
            // write(fd, buf, offset, length, position, cb)
            let fd = int_arg(state, &args, 0);
            let buffer = bytes_arg(state, &args, 1).unwrap_or_default();
            let offset = int_arg(state, &args, 2) as usize;
            let length = int_arg(state, &args, 3) as usize;
            let position = position_arg(state, &args, 4);

            let end = (offset + length).min(buffer.len());
            let data = buffer.get(offset..end).unwrap_or_default().to_vec();

            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().write(fd, &data, position);
            complete(state, &args, result.map(|n| vec![JsValue::Number(n as f64)]));
            Ok(JsValue::Undefined)
        }
        "read" => {
            // read(fd, buffer, offset, length, position, cb)
            let fd = int_arg(state, &args, 0);
            let offset = int_arg(state, &args, 2) as usize;
            let length = int_arg(state, &args, 3) as usize;
            let position = position_arg(state, &args, 4);

            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().read(fd, length, position);

            let result = result.map(|data| {
                let n = data.len();
                if let Some(JsValue::Ref(buffer)) = args.get(1) {
                    if let Some(Value::Object(HostObject::Bytes(bytes))) =
                        state.values.get_mut(*buffer)
                    {
                        if offset < bytes.len() {
                            let end = (offset + n).min(bytes.len());
                            bytes[offset..end].copy_from_slice(&data[..end - offset]);
                        }
                    }
                }
                vec![JsValue::Number(n as f64)]
            });
            complete(state, &args, result);
            Ok(JsValue::Undefined)
        }
        "open" => {
            let path = str_arg(state, &args, 0)?;
            let flags = int_arg(state, &args, 1);
            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().open(&path, flags);
            complete(state, &args, result.map(|fd| vec![JsValue::Number(fd as f64)]));
            Ok(JsValue::Undefined)
        }
        "close" => {
            let fd = int_arg(state, &args, 0);
            let shim = Arc::clone(&state.shim);
            shim.lock().unwrap().close(fd);
            complete(state, &args, Ok(Vec::new()));
            Ok(JsValue::Undefined)
        }
        "stat" | "lstat" => {
            let path = str_arg(state, &args, 0)?;
            let shim = Arc::clone(&state.shim);
            let result = if method == "stat" {
                shim.lock().unwrap().stat(&path)
            } else {
                shim.lock().unwrap().lstat(&path)
            };
            let result = result.map(|info| vec![stat_object(state, info)]);
            complete(state, &args, result);
            Ok(JsValue::Undefined)
        }
        "fstat" => {
            let fd = int_arg(state, &args, 0);
            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().fstat(fd);
            let result = result.map(|info| vec![stat_object(state, info)]);
            complete(state, &args, result);
            Ok(JsValue::Undefined)
        }
        "mkdir" => {
            let path = str_arg(state, &args, 0)?;
            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().mkdir(&path);
            complete(state, &args, result.map(|_| Vec::new()));
            Ok(JsValue::Undefined)
        }
        "readdir" => {
            let path = str_arg(state, &args, 0)?;
            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().readdir(&path);
            let result = result.map(|names| {
                let items: Vec<JsValue> = names
                    .into_iter()
                    .map(|name| {
                        let value = state.values.string(name);
                        if let JsValue::Ref(id) = value {
                            state.values.retain(id);
                        }
                        value
                    })
                    .collect();
                vec![state.values.object(HostObject::Array(items))]
            });
            complete(state, &args, result);
            Ok(JsValue::Undefined)
        }
        "unlink" => {
            let path = str_arg(state, &args, 0)?;
            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().unlink(&path);
            complete(state, &args, result.map(|_| Vec::new()));
            Ok(JsValue::Undefined)
        }
        "rmdir" => {
            let path = str_arg(state, &args, 0)?;
            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().rmdir(&path);
            complete(state, &args, result.map(|_| Vec::new()));
            Ok(JsValue::Undefined)
        }
        "rename" => {
            let from = str_arg(state, &args, 0)?;
            let to = str_arg(state, &args, 1)?;
            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().rename(&from, &to);
            complete(state, &args, result.map(|_| Vec::new()));
            Ok(JsValue::Undefined)
        }
        "truncate" => {
            let path = str_arg(state, &args, 0)?;
            let len = int_arg(state, &args, 1) as u64;
            let shim = Arc::clone(&state.shim);
            let result = shim.lock().unwrap().truncate(&path, len);
            complete(state, &args, result.map(|_| Vec::new()));
            Ok(JsValue::Undefined)
        }
        // Permission and timestamp changes have no meaning in the VFS;
        // report success so the toolchain keeps going.
        "fsync" | "chmod" | "fchmod" | "chown" | "fchown" | "lchown" | "utimes" => {
            complete(state, &args, Ok(Vec::new()));
            Ok(JsValue::Undefined)
        }
        other => Err(thrown(state, &format!("fs.{} is not a function", other))),
    }
}

/// Queues the trailing callback with `(null, results...)` on success or
/// `(error)` on failure.
fn complete(state: &mut HostState, args: &[JsValue], result: Result<Vec<JsValue>, ShimError>) {
    let Some(callback) = args.last().copied() else {
        return;
    };

    let call_args = match result {
        Ok(values) => {
            let mut call_args = vec![JsValue::Null];
            call_args.extend(values);
            call_args
        }
        Err(err) => vec![shim_error(state, &err)],
    };

    state.queue_callback(callback, call_args);
}

fn stat_object(state: &mut HostState, info: StatInfo) -> JsValue {
    state.values.object(HostObject::Stat {
        is_dir: info.is_dir,
        size: info.size,
        mtime_ms: info.mtime_ms,
    })
}

fn shim_error(state: &mut HostState, err: &ShimError) -> JsValue {
    state.values.object(HostObject::Error {
        message: err.to_string(),
        code: err.code().to_owned(),
    })
}

fn thrown(state: &mut HostState, message: &str) -> JsValue {
    state.values.object(HostObject::Error {
        message: message.to_owned(),
        code: String::new(),
    })
}

fn display(state: &HostState, value: JsValue) -> String {
    match value {
        JsValue::Undefined => "undefined".to_owned(),
        JsValue::Null => "null".to_owned(),
        JsValue::Bool(b) => b.to_string(),
        JsValue::Number(n) => n.to_string(),
        JsValue::Ref(id) => match state.values.get(id) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            Some(Value::Null) => "null".to_owned(),
            Some(Value::Object(HostObject::Error { message, .. })) => message.clone(),
            Some(Value::Object(_)) => "[object]".to_owned(),
            None => "undefined".to_owned(),
        },
    }
}

fn str_arg(state: &mut HostState, args: &[JsValue], index: usize) -> Result<String, JsValue> {
    args.get(index)
        .and_then(|arg| state.values.as_string(*arg))
        .ok_or_else(|| thrown(state, "expected a string argument"))
}

fn int_arg(state: &HostState, args: &[JsValue], index: usize) -> i32 {
    args.get(index)
        .and_then(|arg| state.values.as_number(*arg))
        .unwrap_or(0.0) as i32
}

fn bytes_arg(state: &HostState, args: &[JsValue], index: usize) -> Option<Vec<u8>> {
    let id = ref_of(*args.get(index)?)?;
    match state.values.get(id) {
        Some(Value::Object(HostObject::Bytes(bytes))) => Some(bytes.clone()),
        _ => None,
    }
}

fn position_arg(state: &HostState, args: &[JsValue], index: usize) -> Option<u64> {
    let arg = args.get(index)?;
    if arg.is_null_or_undefined() {
        return None;
    }
    state.values.as_number(*arg).map(|n| n as u64)
}

fn unix_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shim::FsShim;
    use memvfs::Vfs;
    use std::sync::Mutex;

    fn state() -> HostState {
        let shim = FsShim::new(Arc::new(Vfs::new()));
        HostState::new(Arc::new(Mutex::new(shim)))
    }

    fn global(state: &mut HostState, name: &str) -> JsValue {
        value_get(state, JsValue::Ref(super::super::values::REF_GLOBAL), name)
    }

    fn wrapper(state: &mut HostState, id: u32) -> JsValue {
        value_call(
            state,
            JsValue::Ref(super::super::values::REF_GO),
            "_makeFuncWrapper",
            vec![JsValue::Number(id as f64)],
        )
        .unwrap()
    }

    /// Pops the next queued callback event and returns `(wrapper id,
    /// callback args)`.
    fn next_delivery(state: &mut HostState) -> (u32, Vec<JsValue>) {
        assert!(state.promote_next_event(), "no callback was queued");
        let event = JsValue::Ref(state.current_event().unwrap());

        let id_value = value_get(state, event, "id");
        let id = state.values.as_number(id_value).unwrap() as u32;
        let args = value_get(state, event, "args");
        let len = value_length(state, args);
        let args = (0..len as usize)
            .map(|i| value_index(state, args, i))
            .collect();
        (id, args)
    }

    #[test]
    fn global_lookups_are_stable() {
        let mut state = state();
        assert_eq!(global(&mut state, "fs"), global(&mut state, "fs"));
        assert_eq!(global(&mut state, "unknownThing"), JsValue::Undefined);
    }

    #[test]
    fn fs_constants_match_the_contract() {
        let mut state = state();
        let fs = global(&mut state, "fs");
        let constants = value_get(&mut state, fs, "constants");

        for (name, expected) in [
            ("O_WRONLY", 1.0),
            ("O_RDWR", 2.0),
            ("O_CREAT", 64.0),
            ("O_TRUNC", 512.0),
            ("O_APPEND", 1024.0),
            ("O_EXCL", 128.0),
            ("O_DIRECTORY", 65536.0),
        ] {
            assert_eq!(
                value_get(&mut state, constants, name),
                JsValue::Number(expected),
                "{}",
                name
            );
        }
    }

    #[test]
    fn open_missing_file_calls_back_with_enoent() {
        let mut state = state();
        let fs = global(&mut state, "fs");
        let cb = wrapper(&mut state, 7);

        let path = state.values.string("/missing.go");
        value_call(
            &mut state,
            fs,
            "open",
            vec![path, JsValue::Number(0.0), JsValue::Number(0.0), cb],
        )
        .unwrap();

        let (id, args) = next_delivery(&mut state);
        assert_eq!(id, 7);
        assert_eq!(args.len(), 1);
        let code = value_get(&mut state, args[0], "code");
        assert_eq!(state.values.as_string(code).unwrap(), "ENOENT");
    }

    #[test]
    fn open_write_close_lands_in_the_vfs() {
        let mut state = state();
        let fs = global(&mut state, "fs");
        let constants = value_get(&mut state, fs, "constants");
        let creat_value = value_get(&mut state, constants, "O_CREAT");
        let creat = state.values.as_number(creat_value).unwrap();
        let wronly_value = value_get(&mut state, constants, "O_WRONLY");
        let wronly = state.values.as_number(wronly_value).unwrap();

        let cb = wrapper(&mut state, 1);
        let path = state.values.string("/build/out.o");
        value_call(
            &mut state,
            fs,
            "open",
            vec![
                path,
                JsValue::Number(creat + wronly),
                JsValue::Number(0o666 as f64),
                cb,
            ],
        )
        .unwrap();

        let (_, open_args) = next_delivery(&mut state);
        assert_eq!(open_args[0], JsValue::Null);
        let fd = open_args[1];

        // Build a Uint8Array with the payload and write it out.
        let u8ctor = global(&mut state, "Uint8Array");
        let buffer = value_new(&mut state, u8ctor, vec![JsValue::Number(3.0)]).unwrap();
        for (i, byte) in b"obj".iter().enumerate() {
            value_set_index(&mut state, buffer, i, JsValue::Number(*byte as f64));
        }

        let cb = wrapper(&mut state, 2);
        value_call(
            &mut state,
            fs,
            "write",
            vec![
                fd,
                buffer,
                JsValue::Number(0.0),
                JsValue::Number(3.0),
                JsValue::Null,
                cb,
            ],
        )
        .unwrap();

        let (_, write_args) = next_delivery(&mut state);
        assert_eq!(write_args[0], JsValue::Null);
        assert_eq!(write_args[1], JsValue::Number(3.0));

        let vfs = Arc::clone(state.shim.lock().unwrap().vfs());
        assert_eq!(vfs.read_file("/build/out.o").unwrap().as_ref(), b"obj");
    }

    #[test]
    fn read_fills_the_provided_buffer() {
        let mut state = state();
        state
            .shim
            .lock()
            .unwrap()
            .vfs()
            .write_file("/input.go", "package main");

        let fs = global(&mut state, "fs");
        let cb = wrapper(&mut state, 1);
        let path = state.values.string("/input.go");
        value_call(
            &mut state,
            fs,
            "open",
            vec![path, JsValue::Number(0.0), JsValue::Number(0.0), cb],
        )
        .unwrap();
        let (_, open_args) = next_delivery(&mut state);
        let fd = open_args[1];

        let u8ctor = global(&mut state, "Uint8Array");
        let buffer = value_new(&mut state, u8ctor, vec![JsValue::Number(7.0)]).unwrap();

        let cb = wrapper(&mut state, 2);
        value_call(
            &mut state,
            fs,
            "read",
            vec![
                fd,
                buffer,
                JsValue::Number(0.0),
                JsValue::Number(7.0),
                JsValue::Null,
                cb,
            ],
        )
        .unwrap();

        let (_, read_args) = next_delivery(&mut state);
        assert_eq!(read_args[1], JsValue::Number(7.0));

        let JsValue::Ref(buffer_id) = buffer else { panic!() };
        match state.values.get(buffer_id) {
            Some(Value::Object(HostObject::Bytes(bytes))) => {
                assert_eq!(bytes.as_slice(), b"package");
            }
            other => panic!("buffer is {:?}", other),
        }
    }

    #[test]
    fn stat_objects_answer_mode_and_kind() {
        let mut state = state();
        state.shim.lock().unwrap().vfs().write_file("/f", "1234");

        let fs = global(&mut state, "fs");
        let cb = wrapper(&mut state, 3);
        let path = state.values.string("/f");
        value_call(&mut state, fs, "stat", vec![path, cb]).unwrap();

        let (_, args) = next_delivery(&mut state);
        let stat = args[1];

        assert_eq!(value_get(&mut state, stat, "mode"), JsValue::Number(0o666 as f64));
        assert_eq!(value_get(&mut state, stat, "size"), JsValue::Number(4.0));
        assert_eq!(
            value_call(&mut state, stat, "isFile", Vec::new()).unwrap(),
            JsValue::Bool(true)
        );
        assert_eq!(
            value_call(&mut state, stat, "isDirectory", Vec::new()).unwrap(),
            JsValue::Bool(false)
        );
    }

    #[test]
    fn readdir_returns_a_name_array() {
        let mut state = state();
        {
            let shim = state.shim.lock().unwrap();
            shim.vfs().write_file("/pkg/b.a", "");
            shim.vfs().write_file("/pkg/a.a", "");
        }

        let fs = global(&mut state, "fs");
        let cb = wrapper(&mut state, 4);
        let path = state.values.string("/pkg");
        value_call(&mut state, fs, "readdir", vec![path, cb]).unwrap();

        let (_, args) = next_delivery(&mut state);
        let names = args[1];
        assert_eq!(value_length(&mut state, names), 2);
        let first = value_index(&mut state, names, 0);
        assert_eq!(state.values.as_string(first).unwrap(), "a.a");
    }

    #[test]
    fn write_sync_is_synchronous_and_throws_on_bad_fd() {
        let mut state = state();
        let fs = global(&mut state, "fs");

        let u8ctor = global(&mut state, "Uint8Array");
        let buffer = value_new(&mut state, u8ctor, vec![JsValue::Number(2.0)]).unwrap();

        let result = value_call(
            &mut state,
            fs,
            "writeSync",
            vec![JsValue::Number(1.0), buffer],
        )
        .unwrap();
        assert_eq!(result, JsValue::Number(2.0));

        let err = value_call(
            &mut state,
            fs,
            "writeSync",
            vec![JsValue::Number(55.0), buffer],
        )
        .unwrap_err();
        let code = value_get(&mut state, err, "code");
        assert_eq!(state.values.as_string(code).unwrap(), "EBADF");
    }

    #[test]
    fn process_cwd_and_chdir_round_trip() {
        let mut state = state();
        state.shim.lock().unwrap().vfs().mkdir("/tmp/work");

        let process = global(&mut state, "process");
        let cwd = value_call(&mut state, process, "cwd", Vec::new()).unwrap();
        assert_eq!(state.values.as_string(cwd).unwrap(), "/");

        let path = state.values.string("/tmp/work");
        value_call(&mut state, process, "chdir", vec![path]).unwrap();

        let cwd = value_call(&mut state, process, "cwd", Vec::new()).unwrap();
        assert_eq!(state.values.as_string(cwd).unwrap(), "/tmp/work");
    }

    #[test]
    fn pending_event_is_cleared_by_assigning_null() {
        let mut state = state();
        let cb = wrapper(&mut state, 9);
        state.queue_callback(cb, vec![JsValue::Null]);
        assert!(state.promote_next_event());

        let go = JsValue::Ref(super::super::values::REF_GO);
        let event = value_get(&mut state, go, "_pendingEvent");
        assert!(matches!(event, JsValue::Ref(_)));

        value_set(&mut state, go, "_pendingEvent", JsValue::Null);
        assert_eq!(value_get(&mut state, go, "_pendingEvent"), JsValue::Null);
    }

    #[test]
    fn dict_objects_support_get_set_delete() {
        let mut state = state();
        let object_ctor = global(&mut state, "Object");
        let dict = value_new(&mut state, object_ctor, Vec::new()).unwrap();

        value_set(&mut state, dict, "answer", JsValue::Number(42.0));
        assert_eq!(value_get(&mut state, dict, "answer"), JsValue::Number(42.0));

        value_delete(&mut state, dict, "answer");
        assert_eq!(value_get(&mut state, dict, "answer"), JsValue::Undefined);
    }

    #[test]
    fn date_reports_utc() {
        let mut state = state();
        let date_ctor = global(&mut state, "Date");
        let date = value_new(&mut state, date_ctor, Vec::new()).unwrap();

        assert_eq!(
            value_call(&mut state, date, "getTimezoneOffset", Vec::new()).unwrap(),
            JsValue::Number(0.0)
        );
    }
}
