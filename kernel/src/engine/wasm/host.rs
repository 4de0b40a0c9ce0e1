//! Store state and the `env` imports offered to the engine module.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::{RngCore, rng};
use tracing::{debug, info, warn};
use wasmtime::{AsContextMut, Caller, Extern, Linker, Memory, StoreContextMut, TypedFunc};

use super::libc;
use crate::engine::EngineError;
use crate::infrastructure::config::{BufferLimits, DebugSettings};
use crate::message::Id;
use crate::protocol::{decode_frame, encode_frame};
use crate::worker::CommandIssuer;

/// Where the exchange buffer currently lives in linear memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(super) struct BufferState {
    pub ptr: usize,
    pub size: usize,
}

/// Exports needed to find and grow the exchange buffer.
#[derive(Clone)]
pub(super) struct BufferExports {
    pub buffer: TypedFunc<(), i32>,
    pub resize: Option<TypedFunc<i32, i32>>,
}

/// Data carried by the store of one engine instance.
pub struct HostState {
    pub(super) commands: CommandIssuer,
    pub(super) buffer: BufferState,
    pub(super) limits: BufferLimits,
    pub(super) exports: Option<BufferExports>,
    pub(super) debug: DebugSettings,
}

impl HostState {
    pub(super) fn new(commands: CommandIssuer, limits: BufferLimits, debug: DebugSettings) -> Self {
        Self {
            commands,
            buffer: BufferState::default(),
            limits,
            exports: None,
            debug,
        }
    }

    pub(super) fn worker(&self) -> Id {
        self.commands.id()
    }
}

/// Converts a wasm `i32` length or address into a host offset.
pub(super) fn offset(raw: i32) -> Result<usize, EngineError> {
    usize::try_from(raw).map_err(|_| EngineError::MemoryAccess)
}

/// Converts a host length into a wasm `i32`.
pub(super) fn wasm_len(len: usize) -> Result<i32, EngineError> {
    i32::try_from(len).map_err(|_| EngineError::MessageTooLarge {
        needed: len,
        max: i32::MAX as usize,
    })
}

fn buffer_exports(store: &StoreContextMut<'_, HostState>) -> Result<BufferExports, EngineError> {
    store
        .data()
        .exports
        .clone()
        .ok_or(EngineError::MissingExport("xsnap_buffer"))
}

/// Re-reads the buffer address. The engine may move the buffer during any
/// call into it.
pub(super) async fn refresh_pointer(
    mut store: StoreContextMut<'_, HostState>,
) -> Result<usize, EngineError> {
    let exports = buffer_exports(&store)?;
    let ptr = offset(exports.buffer.call_async(&mut store, ()).await?)?;
    store.data_mut().buffer.ptr = ptr;
    Ok(ptr)
}

/// Grows the buffer until it holds `needed` bytes.
///
/// Requests above the configured ceiling fail without touching the engine.
/// Modules that cannot resize report their current size as the ceiling.
pub(super) async fn ensure_capacity(
    mut store: StoreContextMut<'_, HostState>,
    needed: usize,
) -> Result<(), EngineError> {
    let BufferState { size, .. } = store.data().buffer;
    let max = store.data().limits.max;
    if needed <= size {
        return Ok(());
    }
    if needed > max {
        return Err(EngineError::MessageTooLarge { needed, max });
    }
    let exports = buffer_exports(&store)?;
    let Some(resize) = exports.resize else {
        return Err(EngineError::MessageTooLarge { needed, max: size });
    };

    let granted = resize.call_async(&mut store, wasm_len(needed)?).await?;
    let granted = usize::try_from(granted).unwrap_or(0);
    if granted < needed {
        return Err(EngineError::ResizeFailed { needed, granted });
    }
    let ptr = offset(exports.buffer.call_async(&mut store, ()).await?)?;
    store.data_mut().buffer = BufferState { ptr, size: granted };
    debug!(worker = %store.data().worker(), size = granted, "Grew engine buffer");
    Ok(())
}

fn exported_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory, EngineError> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or(EngineError::MissingExport("memory"))
}

async fn read_buffer(caller: &mut Caller<'_, HostState>, len: i32) -> Result<Vec<u8>, EngineError> {
    let memory = exported_memory(caller)?;
    let ptr = refresh_pointer(caller.as_context_mut()).await?;
    let mut bytes = vec![0; offset(len)?];
    memory
        .read(&*caller, ptr, &mut bytes)
        .map_err(|_| EngineError::MemoryAccess)?;
    Ok(bytes)
}

/// Services a command the engine raised mid-call.
///
/// The request frame sits in the buffer; the reply frame is written back
/// over it. Returns the reply length, or 0 when the command could not be
/// completed. The engine must re-read the buffer address afterwards.
async fn issue_command(mut caller: Caller<'_, HostState>, len: i32) -> wasmtime::Result<i32> {
    let worker = caller.data().worker();
    let raw = read_buffer(&mut caller, len).await?;
    let request = match decode_frame(Bytes::from(raw)) {
        Ok(request) => request,
        Err(e) => {
            warn!(worker = %worker, error = %e, "Malformed engine command");
            return Ok(0);
        }
    };
    if caller.data().debug.trace_engine {
        info!(
            worker = %worker,
            kind = %request.headers.kind,
            to = %request.headers.to,
            "Engine issued command"
        );
    }

    let commands = caller.data().commands.clone();
    let reply = match commands.issue(request).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!(worker = %worker, error = %e, "Engine command abandoned");
            return Ok(0);
        }
    };

    let frame = encode_frame(&reply).map_err(EngineError::from)?;
    match ensure_capacity(caller.as_context_mut(), frame.len()).await {
        Ok(()) => {}
        Err(e @ (EngineError::MessageTooLarge { .. } | EngineError::ResizeFailed { .. })) => {
            warn!(worker = %worker, error = %e, "Command reply does not fit the engine buffer");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    }

    let memory = exported_memory(&mut caller)?;
    let ptr = caller.data().buffer.ptr;
    memory
        .write(&mut caller, ptr, &frame)
        .map_err(|_| EngineError::MemoryAccess)?;
    Ok(wasm_len(frame.len())?)
}

async fn console_log(mut caller: Caller<'_, HostState>, len: i32) -> wasmtime::Result<()> {
    let text = read_buffer(&mut caller, len).await?;
    info!(
        target: "vatvisor::console",
        worker = %caller.data().worker(),
        "{}",
        String::from_utf8_lossy(&text)
    );
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[allow(clippy::cast_possible_wrap)]
fn pseudo_random() -> i32 {
    // C `rand` never returns a negative value.
    (rng().next_u32() >> 1) as i32
}

fn fmod(x: f64, y: f64) -> f64 {
    x % y
}

type Unary = fn(f64) -> f64;
type Binary = fn(f64, f64) -> f64;

const UNARY_MATH: &[(&str, Unary)] = &[
    ("trunc", f64::trunc),
    ("log", f64::ln),
    ("ceil", f64::ceil),
    ("floor", f64::floor),
    ("fabs", f64::abs),
    ("round", f64::round),
    ("nearbyint", f64::round_ties_even),
    ("acos", f64::acos),
    ("acosh", f64::acosh),
    ("asin", f64::asin),
    ("asinh", f64::asinh),
    ("atan", f64::atan),
    ("atanh", f64::atanh),
    ("cbrt", f64::cbrt),
    ("cos", f64::cos),
    ("cosh", f64::cosh),
    ("exp", f64::exp),
    ("expm1", f64::exp_m1),
    ("sqrt", f64::sqrt),
    ("log1p", f64::ln_1p),
    ("log10", f64::log10),
    ("log2", f64::log2),
    ("sin", f64::sin),
    ("sinh", f64::sinh),
    ("tan", f64::tan),
    ("tanh", f64::tanh),
];

const BINARY_MATH: &[(&str, Binary)] = &[
    ("fmod", fmod),
    ("atan2", f64::atan2),
    ("hypot", f64::hypot),
    ("pow", f64::powf),
];

/// Registers every host import under the `env` module.
pub(super) fn add_to_linker(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    linker.func_wrap_async(
        "env",
        "wasm_issue_command",
        |caller: Caller<'_, HostState>, (len,): (i32,)| Box::new(issue_command(caller, len)),
    )?;
    linker.func_wrap_async(
        "env",
        "wasm_console_log",
        |caller: Caller<'_, HostState>, (len,): (i32,)| Box::new(console_log(caller, len)),
    )?;
    linker.func_wrap("env", "wasm_time_now_ms", now_ms)?;
    linker.func_wrap("env", "rand", pseudo_random)?;

    // The engine manages its own heap; these exist only to satisfy imports.
    linker.func_wrap("env", "wasm_alloc", |_size: i32| 0i32)?;
    linker.func_wrap("env", "wasm_free", |_ptr: i32| {})?;
    linker.func_wrap("env", "setjmp", |_env: i32| 0i32)?;
    linker.func_wrap(
        "env",
        "longjmp",
        |_env: i32, _value: i32| -> wasmtime::Result<()> {
            Err(wasmtime::Error::msg("engine raised an uncaught exception"))
        },
    )?;

    for &(name, f) in UNARY_MATH {
        linker.func_wrap("env", name, f)?;
    }
    for &(name, f) in BINARY_MATH {
        linker.func_wrap("env", name, f)?;
    }

    libc::add_to_linker(linker)?;
    Ok(())
}
