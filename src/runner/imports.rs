//! Host import functions registered under the `"go"` module.
//!
//! Every import receives a single stack-pointer argument and reads its
//! real arguments from linear memory at fixed offsets; results are
//! written back the same way. The offsets, the NaN-boxed value encoding,
//! and the import names themselves are dictated by the foreign binaries
//! and must not drift.
//!
//! Callback-style operations never re-enter the module: completions are
//! queued on the host state and delivered between calls through the
//! `resume` export, so the stack pointer stays valid for the duration of
//! each import.

use wasmtime::{Caller, Extern, Linker};

use super::objects;
use super::state::HostState;
use super::values::JsValue;

fn oob() -> wasmtime::Error {
    wasmtime::Error::msg("module pointed the host outside its own memory")
}

/// Little-endian accessors over the module's linear memory.
struct Mem<'a> {
    data: &'a mut [u8],
}

impl Mem<'_> {
    fn get(&self, addr: usize, len: usize) -> wasmtime::Result<&[u8]> {
        self.data.get(addr..addr + len).ok_or_else(oob)
    }

    fn get_mut(&mut self, addr: usize, len: usize) -> wasmtime::Result<&mut [u8]> {
        self.data.get_mut(addr..addr + len).ok_or_else(oob)
    }

    fn set_u8(&mut self, addr: usize, value: u8) -> wasmtime::Result<()> {
        self.get_mut(addr, 1)?[0] = value;
        Ok(())
    }

    fn get_i32(&self, addr: usize) -> wasmtime::Result<i32> {
        let raw = self.get(addr, 4)?;
        Ok(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn set_i32(&mut self, addr: usize, value: i32) -> wasmtime::Result<()> {
        self.get_mut(addr, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn get_i64(&self, addr: usize) -> wasmtime::Result<i64> {
        let raw = self.get(addr, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(i64::from_le_bytes(bytes))
    }

    fn set_i64(&mut self, addr: usize, value: i64) -> wasmtime::Result<()> {
        self.get_mut(addr, 8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn get_u64(&self, addr: usize) -> wasmtime::Result<u64> {
        Ok(self.get_i64(addr)? as u64)
    }

    fn set_u64(&mut self, addr: usize, value: u64) -> wasmtime::Result<()> {
        self.set_i64(addr, value as i64)
    }

    /// Reads a `(ptr: i64, len: i64)` pair describing a byte slice.
    fn slice_spec(&self, addr: usize) -> wasmtime::Result<(usize, usize)> {
        let ptr = self.get_i64(addr)? as usize;
        let len = self.get_i64(addr + 8)? as usize;
        Ok((ptr, len))
    }

    /// Reads a Go string passed as a `(ptr, len)` pair.
    fn load_string(&self, addr: usize) -> wasmtime::Result<String> {
        let (ptr, len) = self.slice_spec(addr)?;
        let raw = self.get(ptr, len)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}

fn mem_and_state<'a>(
    caller: &'a mut Caller<'_, HostState>,
) -> wasmtime::Result<(Mem<'a>, &'a mut HostState)> {
    let memory = caller
        .get_export("mem")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("module does not export `mem`"))?;
    let (data, state) = memory.data_and_store_mut(&mut *caller);
    Ok((Mem { data }, state))
}

fn decode_at(mem: &Mem<'_>, state: &HostState, addr: usize) -> wasmtime::Result<JsValue> {
    Ok(state.values.decode(mem.get_u64(addr)?))
}

fn store_at(
    mem: &mut Mem<'_>,
    state: &mut HostState,
    addr: usize,
    value: JsValue,
) -> wasmtime::Result<()> {
    let bits = state.values.encode(value);
    mem.set_u64(addr, bits)
}

/// Reads a `[]js.Value` argument vector: a `(ptr, len)` pair over packed
/// 64-bit boxed words.
fn decode_values(
    mem: &Mem<'_>,
    state: &HostState,
    addr: usize,
) -> wasmtime::Result<Vec<JsValue>> {
    let (ptr, len) = mem.slice_spec(addr)?;
    let mut values = Vec::with_capacity(len);
    for index in 0..len {
        values.push(decode_at(mem, state, ptr + index * 8)?);
    }
    Ok(values)
}

/// Registers the full `"go"` import module.
pub fn register(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        "go",
        "runtime.wasmExit",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mem, state) = mem_and_state(&mut caller)?;
            state.exit_code = Some(mem.get_i32(sp + 8)?);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "go",
        "runtime.wasmWrite",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mem, state) = mem_and_state(&mut caller)?;
            let fd = mem.get_i64(sp + 8)? as i32;
            let ptr = mem.get_i64(sp + 16)? as usize;
            let len = mem.get_i32(sp + 24)? as usize;
            let data = mem.get(ptr, len)?.to_vec();

            let shim = std::sync::Arc::clone(&state.shim);
            if let Err(err) = shim.lock().unwrap().write_sync(fd, &data) {
                log::warn!("wasmWrite to fd {} failed: {}", fd, err);
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        "go",
        "runtime.resetMemoryDataView",
        |_caller: Caller<'_, HostState>, _sp: i32| {
            // Memory views are re-derived on every host call, so growth
            // needs no bookkeeping here.
        },
    )?;

    linker.func_wrap(
        "go",
        "runtime.nanotime1",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let nanos = state.epoch.elapsed().as_nanos() as i64;
            mem.set_i64(sp + 8, nanos)
        },
    )?;

    linker.func_wrap(
        "go",
        "runtime.walltime",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, _) = mem_and_state(&mut caller)?;
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            mem.set_i64(sp + 8, now.as_secs() as i64)?;
            mem.set_i32(sp + 16, now.subsec_nanos() as i32)
        },
    )?;

    linker.func_wrap(
        "go",
        "runtime.scheduleTimeoutEvent",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let millis = mem.get_i64(sp + 8)?.max(0) as u64;
            let due = std::time::Instant::now() + std::time::Duration::from_millis(millis);
            let id = state.schedule_timeout(due);
            mem.set_i32(sp + 16, id as i32)
        },
    )?;

    linker.func_wrap(
        "go",
        "runtime.clearTimeoutEvent",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mem, state) = mem_and_state(&mut caller)?;
            let id = mem.get_i32(sp + 8)? as u32;
            state.clear_timeout(id);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "go",
        "runtime.getRandomData",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            use rand::RngCore;

            let sp = sp as u32 as usize;
            let (mut mem, _) = mem_and_state(&mut caller)?;
            let (ptr, len) = mem.slice_spec(sp + 8)?;
            rand::rng().fill_bytes(mem.get_mut(ptr, len)?);
            Ok(())
        },
    )?;

    linker.func_wrap("go", "debug", |_caller: Caller<'_, HostState>, value: i32| {
        log::debug!(target: "goscript::foreign", "debug: {}", value);
    })?;

    linker.func_wrap(
        "go",
        "syscall/js.finalizeRef",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mem, state) = mem_and_state(&mut caller)?;
            let id = mem.get_i32(sp + 8)? as u32;
            state.values.release(id);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.stringVal",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let text = mem.load_string(sp + 8)?;
            let value = state.values.string(text);
            store_at(&mut mem, state, sp + 24, value)
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueGet",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let target = decode_at(&mem, state, sp + 8)?;
            let prop = mem.load_string(sp + 16)?;
            let result = objects::value_get(state, target, &prop);
            store_at(&mut mem, state, sp + 32, result)
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueSet",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mem, state) = mem_and_state(&mut caller)?;
            let target = decode_at(&mem, state, sp + 8)?;
            let prop = mem.load_string(sp + 16)?;
            let value = decode_at(&mem, state, sp + 32)?;
            objects::value_set(state, target, &prop, value);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueDelete",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mem, state) = mem_and_state(&mut caller)?;
            let target = decode_at(&mem, state, sp + 8)?;
            let prop = mem.load_string(sp + 16)?;
            objects::value_delete(state, target, &prop);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueIndex",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let target = decode_at(&mem, state, sp + 8)?;
            let index = mem.get_i64(sp + 16)?.max(0) as usize;
            let result = objects::value_index(state, target, index);
            store_at(&mut mem, state, sp + 24, result)
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueSetIndex",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mem, state) = mem_and_state(&mut caller)?;
            let target = decode_at(&mem, state, sp + 8)?;
            let index = mem.get_i64(sp + 16)?.max(0) as usize;
            let value = decode_at(&mem, state, sp + 24)?;
            objects::value_set_index(state, target, index, value);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueCall",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let target = decode_at(&mem, state, sp + 8)?;
            let method = mem.load_string(sp + 16)?;
            let args = decode_values(&mem, state, sp + 32)?;

            match objects::value_call(state, target, &method, args) {
                Ok(result) => {
                    store_at(&mut mem, state, sp + 56, result)?;
                    mem.set_u8(sp + 64, 1)
                }
                Err(thrown) => {
                    store_at(&mut mem, state, sp + 56, thrown)?;
                    mem.set_u8(sp + 64, 0)
                }
            }
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueInvoke",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let func = decode_at(&mem, state, sp + 8)?;
            let args = decode_values(&mem, state, sp + 16)?;

            match objects::value_invoke(state, func, args) {
                Ok(result) => {
                    store_at(&mut mem, state, sp + 40, result)?;
                    mem.set_u8(sp + 48, 1)
                }
                Err(thrown) => {
                    store_at(&mut mem, state, sp + 40, thrown)?;
                    mem.set_u8(sp + 48, 0)
                }
            }
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueNew",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let ctor = decode_at(&mem, state, sp + 8)?;
            let args = decode_values(&mem, state, sp + 16)?;

            match objects::value_new(state, ctor, args) {
                Ok(result) => {
                    store_at(&mut mem, state, sp + 40, result)?;
                    mem.set_u8(sp + 48, 1)
                }
                Err(thrown) => {
                    store_at(&mut mem, state, sp + 40, thrown)?;
                    mem.set_u8(sp + 48, 0)
                }
            }
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueLength",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let target = decode_at(&mem, state, sp + 8)?;
            let length = objects::value_length(state, target);
            mem.set_i64(sp + 16, length)
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valuePrepareString",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let value = decode_at(&mem, state, sp + 8)?;

            let text = state.values.as_string(value).unwrap_or_default();
            let encoded = text.into_bytes();
            let length = encoded.len() as i64;
            let bytes = state
                .values
                .object(super::values::HostObject::Bytes(encoded));

            store_at(&mut mem, state, sp + 16, bytes)?;
            mem.set_i64(sp + 24, length)
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueLoadString",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let value = decode_at(&mem, state, sp + 8)?;
            let (ptr, len) = mem.slice_spec(sp + 16)?;

            let source = match value {
                JsValue::Ref(id) => match state.values.get(id) {
                    Some(super::values::Value::Object(super::values::HostObject::Bytes(
                        bytes,
                    ))) => bytes.clone(),
                    Some(super::values::Value::String(text)) => text.clone().into_bytes(),
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };

            let count = source.len().min(len);
            mem.get_mut(ptr, count)?.copy_from_slice(&source[..count]);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.valueInstanceOf",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let value = decode_at(&mem, state, sp + 8)?;
            let ctor = decode_at(&mem, state, sp + 16)?;
            let result = objects::instance_of(state, value, ctor);
            mem.set_u8(sp + 24, result as u8)
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.copyBytesToGo",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let (dst_ptr, dst_len) = mem.slice_spec(sp + 8)?;
            let source = decode_at(&mem, state, sp + 32)?;

            let bytes = match source {
                JsValue::Ref(id) => match state.values.get(id) {
                    Some(super::values::Value::Object(super::values::HostObject::Bytes(
                        bytes,
                    ))) => Some(bytes.clone()),
                    _ => None,
                },
                _ => None,
            };

            match bytes {
                Some(bytes) => {
                    let count = bytes.len().min(dst_len);
                    mem.get_mut(dst_ptr, count)?.copy_from_slice(&bytes[..count]);
                    mem.set_i64(sp + 40, count as i64)?;
                    mem.set_u8(sp + 48, 1)
                }
                None => mem.set_u8(sp + 48, 0),
            }
        },
    )?;

    linker.func_wrap(
        "go",
        "syscall/js.copyBytesToJS",
        |mut caller: Caller<'_, HostState>, sp: i32| -> wasmtime::Result<()> {
            let sp = sp as u32 as usize;
            let (mut mem, state) = mem_and_state(&mut caller)?;
            let target = decode_at(&mem, state, sp + 8)?;
            let (src_ptr, src_len) = mem.slice_spec(sp + 16)?;
            let source = mem.get(src_ptr, src_len)?.to_vec();

            let copied = match target {
                JsValue::Ref(id) => match state.values.get_mut(id) {
                    Some(super::values::Value::Object(super::values::HostObject::Bytes(
                        bytes,
                    ))) => {
                        let count = bytes.len().min(source.len());
                        bytes[..count].copy_from_slice(&source[..count]);
                        Some(count)
                    }
                    _ => None,
                },
                _ => None,
            };

            match copied {
                Some(count) => {
                    mem.set_i64(sp + 40, count as i64)?;
                    mem.set_u8(sp + 48, 1)
                }
                None => mem.set_u8(sp + 48, 0),
            }
        },
    )?;

    Ok(())
}
