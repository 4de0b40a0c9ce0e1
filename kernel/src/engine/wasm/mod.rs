//! Engine embedded as a WebAssembly module.
//!
//! The module keeps one exchange buffer in its linear memory. Every call
//! writes its payload into that buffer, invokes an export with the payload
//! length and reads the reply back from the same place. A negative result
//! means the buffer now holds error text of that length.
//!
//! The engine owns the buffer and may move it whenever it runs, so its
//! address is re-read after each call.

mod host;
pub mod libc;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};
use wasmtime::{
    AsContextMut, Config, Engine, Instance, Linker, Memory, Module, Store, TypedFunc, WasmParams,
    WasmResults,
};

use self::host::{
    ensure_capacity, offset, refresh_pointer, wasm_len, BufferExports, BufferState, HostState,
};
use super::{EngineAdapter, EngineError};
use crate::infrastructure::config::{BufferLimits, DebugSettings, DEFAULT_INITIAL_BUFFER_SIZE};
use crate::protocol::Record;
use crate::worker::CommandIssuer;

/// Creates the wasmtime configuration used for engine modules.
///
/// Host imports suspend while the worker waits for command replies, so the
/// engine runs on its own fiber stack.
#[must_use]
pub fn create_engine_config() -> Config {
    let mut config = Config::new();
    config.async_support(true);
    config.max_wasm_stack(4 * 1024 * 1024);
    config.async_stack_size(8 * 1024 * 1024);
    config
}

/// A compiled engine module, ready to be instantiated once per worker.
#[derive(Clone)]
pub struct WasmModule {
    engine: Engine,
    module: Module,
    linker: Arc<Linker<HostState>>,
}

impl fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmModule")
            .field("name", &self.module.name())
            .finish_non_exhaustive()
    }
}

impl WasmModule {
    /// Compiles the module at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is not a valid module.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let engine = Engine::new(&create_engine_config())?;
        let module = Module::from_file(&engine, path)?;
        Self::link(engine, module)
    }

    /// Compiles a module from binary or text format.
    ///
    /// # Errors
    ///
    /// Fails if the bytes are not a valid module.
    pub fn from_binary(bytes: &[u8]) -> Result<Self, EngineError> {
        let engine = Engine::new(&create_engine_config())?;
        let module = Module::new(&engine, bytes)?;
        Self::link(engine, module)
    }

    fn link(engine: Engine, module: Module) -> Result<Self, EngineError> {
        let mut linker = Linker::new(&engine);
        host::add_to_linker(&mut linker)?;
        // Engine builds import more of libc than they ever call.
        linker.define_unknown_imports_as_traps(&module)?;
        Ok(Self {
            engine,
            module,
            linker: Arc::new(linker),
        })
    }

    /// Instantiates the module, sizes its buffer and creates the engine
    /// machine.
    ///
    /// # Errors
    ///
    /// Fails if a required export is missing, the buffer cannot be
    /// allocated or the machine reports a nonzero creation code.
    pub async fn instantiate(
        &self,
        commands: CommandIssuer,
        limits: BufferLimits,
        debug: DebugSettings,
    ) -> Result<WasmEngine, EngineError> {
        let worker = commands.id();
        let mut store = Store::new(&self.engine, HostState::new(commands, limits, debug));
        let instance = self.linker.instantiate_async(&mut store, &self.module).await?;
        let exports = Exports::resolve(&instance, &mut store)?;
        store.data_mut().exports = Some(BufferExports {
            buffer: exports.buffer.clone(),
            resize: exports.resize.clone(),
        });

        let mut engine = WasmEngine { store, exports };
        engine.initialize().await?;
        if debug.track_handles {
            info!(worker = %worker, size = engine.buffer().size, "+1 wasm engine");
        }
        Ok(engine)
    }
}

fn required<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &'static str,
) -> Result<TypedFunc<P, R>, EngineError>
where
    P: WasmParams,
    R: WasmResults,
{
    optional(instance, store, name)?.ok_or(EngineError::MissingExport(name))
}

fn optional<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<Option<TypedFunc<P, R>>, EngineError>
where
    P: WasmParams,
    R: WasmResults,
{
    match instance.get_func(&mut *store, name) {
        Some(func) => Ok(Some(func.typed::<P, R>(&*store)?)),
        None => Ok(None),
    }
}

struct Exports {
    memory: Memory,
    buffer: TypedFunc<(), i32>,
    resize: Option<TypedFunc<i32, i32>>,
    buffer_size: Option<TypedFunc<(), i32>>,
    create: TypedFunc<(), i32>,
    evaluate: TypedFunc<i32, i32>,
    command: Option<TypedFunc<i32, i32>>,
    destroy: Option<TypedFunc<(), ()>>,
    load_snapshot: Option<TypedFunc<i32, i32>>,
    write_snapshot: Option<TypedFunc<(), i32>>,
}

impl Exports {
    fn resolve(instance: &Instance, store: &mut Store<HostState>) -> Result<Self, EngineError> {
        Ok(Self {
            memory: instance
                .get_memory(&mut *store, "memory")
                .ok_or(EngineError::MissingExport("memory"))?,
            buffer: required(instance, store, "xsnap_buffer")?,
            resize: optional(instance, store, "xsnap_resize_buffer")?,
            buffer_size: optional(instance, store, "xsnap_buffer_size")?,
            create: required(instance, store, "xsnap_create")?,
            evaluate: required(instance, store, "xsnap_evaluate")?,
            command: optional(instance, store, "xsnap_command")?,
            destroy: optional(instance, store, "xsnap_destroy")?,
            load_snapshot: optional(instance, store, "xsnap_load_snapshot")?,
            write_snapshot: optional(instance, store, "xsnap_write_snapshot")?,
        })
    }
}

/// A live engine instance with its own store and exchange buffer.
pub struct WasmEngine {
    store: Store<HostState>,
    exports: Exports,
}

impl fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmEngine")
            .field("worker", &self.store.data().worker())
            .field("buffer", &self.buffer())
            .finish_non_exhaustive()
    }
}

impl WasmEngine {
    /// Current size of the exchange buffer in bytes.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer().size
    }

    fn buffer(&self) -> BufferState {
        self.store.data().buffer
    }

    async fn initialize(&mut self) -> Result<(), EngineError> {
        let limits = self.store.data().limits;
        let size = if let Some(resize) = &self.exports.resize {
            // A zero request asks for the default allocation.
            let granted = usize::try_from(resize.call_async(&mut self.store, 0).await?).unwrap_or(0);
            if granted == 0 {
                return Err(EngineError::ResizeFailed {
                    needed: limits.initial,
                    granted,
                });
            }
            granted
        } else if let Some(buffer_size) = &self.exports.buffer_size {
            offset(buffer_size.call_async(&mut self.store, ()).await?)?
        } else {
            DEFAULT_INITIAL_BUFFER_SIZE
        };
        self.store.data_mut().buffer.size = size;
        refresh_pointer(self.store.as_context_mut()).await?;
        if limits.initial > size && self.exports.resize.is_some() {
            ensure_capacity(self.store.as_context_mut(), limits.initial).await?;
        }

        let code = self.exports.create.call_async(&mut self.store, ()).await?;
        if code != 0 {
            return Err(EngineError::CreateFailed(code));
        }
        debug!(
            worker = %self.store.data().worker(),
            size = self.buffer().size,
            "Engine machine created"
        );
        Ok(())
    }

    fn write_buffer(&mut self, payload: &[u8]) -> Result<(), EngineError> {
        let ptr = self.buffer().ptr;
        self.exports
            .memory
            .write(&mut self.store, ptr, payload)
            .map_err(|_| EngineError::MemoryAccess)
    }

    fn read_buffer(&self, len: usize) -> Result<Bytes, EngineError> {
        let ptr = self.buffer().ptr;
        let mut bytes = vec![0; len];
        self.exports
            .memory
            .read(&self.store, ptr, &mut bytes)
            .map_err(|_| EngineError::MemoryAccess)?;
        Ok(Bytes::from(bytes))
    }

    /// Turns a call result into the reply it describes. Negative values
    /// carry error text, non-negative ones the reply length.
    async fn collect(&mut self, result: i32) -> Result<Bytes, EngineError> {
        refresh_pointer(self.store.as_context_mut()).await?;
        let len = usize::try_from(result.unsigned_abs()).map_err(|_| EngineError::MemoryAccess)?;
        let bytes = self.read_buffer(len)?;
        if result < 0 {
            return Err(EngineError::Script(
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        Ok(bytes)
    }

    async fn exchange(
        &mut self,
        func: TypedFunc<i32, i32>,
        payload: &[u8],
    ) -> Result<Bytes, EngineError> {
        ensure_capacity(self.store.as_context_mut(), payload.len()).await?;
        self.write_buffer(payload)?;
        let result = func
            .call_async(&mut self.store, wasm_len(payload.len())?)
            .await?;
        self.collect(result).await
    }
}

#[async_trait]
impl EngineAdapter for WasmEngine {
    async fn evaluate(&mut self, source: &[u8]) -> Result<(), EngineError> {
        let evaluate = self.exports.evaluate.clone();
        self.exchange(evaluate, source).await?;
        Ok(())
    }

    async fn command(&mut self, frame: Bytes) -> Result<Bytes, EngineError> {
        let command = self
            .exports
            .command
            .clone()
            .ok_or(EngineError::MissingExport("xsnap_command"))?;
        self.exchange(command, &Record::Command(frame).to_bytes())
            .await
    }

    async fn write_snapshot(&mut self) -> Result<Bytes, EngineError> {
        let write = self
            .exports
            .write_snapshot
            .clone()
            .ok_or(EngineError::Unsupported("snapshots"))?;
        let size = write.call_async(&mut self.store, ()).await?;
        if size <= 0 {
            return Err(EngineError::Script(format!(
                "snapshot write failed with code {size}"
            )));
        }
        self.collect(size).await
    }

    async fn load_snapshot(&mut self, snapshot: &[u8]) -> Result<(), EngineError> {
        let load = self
            .exports
            .load_snapshot
            .clone()
            .ok_or(EngineError::Unsupported("snapshots"))?;
        ensure_capacity(self.store.as_context_mut(), snapshot.len()).await?;
        self.write_buffer(snapshot)?;
        let result = load
            .call_async(&mut self.store, wasm_len(snapshot.len())?)
            .await?;
        if result < 0 {
            self.collect(result).await?;
        }
        if result != 0 {
            return Err(EngineError::Script(format!(
                "snapshot load failed with code {result}"
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        if let Some(destroy) = self.exports.destroy.clone() {
            destroy.call_async(&mut self.store, ()).await?;
        }
        if self.store.data().debug.track_handles {
            info!(worker = %self.store.data().worker(), "-1 wasm engine");
        }
        Ok(())
    }
}
