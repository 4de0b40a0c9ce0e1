//! Script engine adapters.
//!
//! An engine is an opaque interpreter that evaluates source text and answers
//! framed commands. [`EngineAdapter`] is the capability interface shared by
//! the two transports: [`subprocess`] talks to an external process over a
//! pair of pipes and [`wasm`] calls into a WebAssembly module embedded in
//! this process. Either one becomes a worker through [`run_engine_worker`],
//! which routes inbound messages with [`handle_inbound_message`].
//!
//! While answering a command an engine may issue commands of its own. Both
//! adapters service those through the worker's
//! [`CommandIssuer`](crate::worker::CommandIssuer) before the outer command
//! completes.

pub mod subprocess;
pub mod wasm;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::infrastructure::config::{BufferLimits, EngineKind, Settings};
use crate::message::{Message, MessageType};
use crate::protocol::{decode_frame, decode_metered_frame, encode_frame, ProtocolError};
use crate::worker::{WorkerContext, WorkerError};

pub use subprocess::{SubprocessConfig, SubprocessEngine};
pub use wasm::{WasmEngine, WasmModule};

/// Errors raised by engine adapters.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Framing failure on the engine transport.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The engine rejected the evaluation or command; carries its error text.
    #[error("{0}")]
    Script(String),

    /// The exchange does not fit under the buffer ceiling.
    #[error("message exceeds buffer size: need {needed} bytes (max {max})")]
    MessageTooLarge {
        /// Bytes the exchange needs.
        needed: usize,
        /// Largest buffer available.
        max: usize,
    },

    /// The engine granted less buffer space than requested.
    #[error("buffer resize returned {granted}, need {needed}")]
    ResizeFailed {
        /// Bytes requested.
        needed: usize,
        /// Bytes granted.
        granted: usize,
    },

    /// A required export is missing from the engine module.
    #[error("missing required WASM export {0}")]
    MissingExport(&'static str),

    /// A trap or instantiation failure inside the WebAssembly runtime.
    #[error("wasm runtime error: {0:#}")]
    Wasm(#[from] wasmtime::Error),

    /// A buffer offset or length falls outside linear memory.
    #[error("buffer access outside linear memory")]
    MemoryAccess,

    /// The engine machine could not be created.
    #[error("engine machine creation failed with code {0}")]
    CreateFailed(i32),

    /// Process or pipe failure.
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker was cancelled while waiting on the engine.
    #[error("engine call cancelled")]
    Cancelled,

    /// The engine closed its side of the transport.
    #[error("engine closed its output")]
    EndOfStream,

    /// The adapter does not offer this operation.
    #[error("{0} not supported by this engine")]
    Unsupported(&'static str),

    /// The engine cannot be launched with the current settings.
    #[error("invalid engine configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Whether the error ends the worker normally.
    ///
    /// Oversized exchanges count as a request for graceful shutdown rather
    /// than a fault.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::EndOfStream | Self::MessageTooLarge { .. }
        )
    }
}

/// Capability interface implemented by every engine transport.
///
/// Calls on one adapter are serialized by `&mut self`, so an engine never
/// sees two exchanges at once. Reentrant commands raised by the engine
/// during a call are serviced inside that same call.
#[async_trait]
pub trait EngineAdapter: Send {
    /// Loads and runs top-level source text.
    async fn evaluate(&mut self, source: &[u8]) -> Result<(), EngineError>;

    /// Hands one `headers-JSON 0x01 body` frame to the engine and returns
    /// its raw reply, which may be empty.
    async fn command(&mut self, frame: Bytes) -> Result<Bytes, EngineError>;

    /// Whether replies carry a metering block ahead of the frame.
    fn metered_replies(&self) -> bool {
        false
    }

    /// Serializes the interpreter state.
    async fn write_snapshot(&mut self) -> Result<Bytes, EngineError> {
        Err(EngineError::Unsupported("snapshots"))
    }

    /// Replaces the interpreter state with a snapshot.
    async fn load_snapshot(&mut self, _snapshot: &[u8]) -> Result<(), EngineError> {
        Err(EngineError::Unsupported("snapshots"))
    }

    /// Releases the engine.
    async fn close(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Routes one supervisor-delivered message into the engine and answers it.
///
/// `terminate` cancels the worker. A reply to a request with an armed
/// reply channel is readdressed to the requester; an empty reply still
/// resolves the caller with `ok`. A non-empty reply to a fire-and-forget
/// message is delivered back to its sender as a new message.
///
/// # Errors
///
/// Fails on transport errors and on oversized exchanges, after answering
/// the caller in the latter case.
pub async fn handle_inbound_message<E>(
    engine: &mut E,
    ctx: &WorkerContext,
    mut request: Message,
) -> Result<(), WorkerError>
where
    E: EngineAdapter + ?Sized,
{
    if request.headers.kind == MessageType::Terminate {
        ctx.terminate();
        return Ok(());
    }

    let frame = encode_frame(&request)?.freeze();
    if ctx.debug().trace_engine {
        info!(
            worker = %ctx.id(),
            kind = %request.headers.kind,
            from = %request.headers.from,
            len = frame.len(),
            "Engine command"
        );
    }

    let raw = match engine.command(frame).await {
        Ok(raw) => raw,
        Err(EngineError::Script(text)) => {
            if !request.respond_error(text.clone()) {
                warn!(worker = %ctx.id(), error = %text, "Engine rejected message");
            }
            return Ok(());
        }
        Err(e @ EngineError::MessageTooLarge { .. }) => {
            request.respond_error(e.to_string());
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    if raw.is_empty() {
        request.respond_with(MessageType::Ok);
        return Ok(());
    }

    let decoded = if engine.metered_replies() {
        decode_metered_frame(raw)
    } else {
        decode_frame(raw)
    };
    let mut reply = match decoded {
        Ok(reply) => reply,
        Err(e) => {
            warn!(worker = %ctx.id(), error = %e, "Malformed engine reply");
            request.respond_error(e.to_string());
            return Ok(());
        }
    };

    if request.expects_reply() {
        reply.headers.to = request.headers.from;
        reply.headers.from = request.headers.to;
        reply.headers.port = request.headers.port;
        request.respond(reply);
    } else if !reply.body.is_empty() {
        reply.headers.to = request.headers.from;
        reply.headers.from = ctx.id();
        ctx.deliver(reply)?;
    }
    Ok(())
}

/// Worker body for an engine: evaluates `runtime` if given, then serves
/// inbound messages until cancelled. The engine is closed on the way out.
///
/// # Errors
///
/// Returns the error that stopped the worker; cancellation is reported as
/// a shutdown error.
pub async fn run_engine_worker<E>(
    ctx: WorkerContext,
    mut engine: E,
    runtime: Option<Bytes>,
) -> Result<(), WorkerError>
where
    E: EngineAdapter,
{
    let outcome = serve(&ctx, &mut engine, runtime).await;
    if let Err(e) = engine.close().await {
        warn!(worker = %ctx.id(), error = %e, "Failed to close engine");
    }
    outcome
}

async fn serve<E>(
    ctx: &WorkerContext,
    engine: &mut E,
    runtime: Option<Bytes>,
) -> Result<(), WorkerError>
where
    E: EngineAdapter,
{
    if let Some(source) = runtime {
        engine.evaluate(&source).await?;
        debug!(worker = %ctx.id(), "Runtime evaluated");
    }
    loop {
        for message in ctx.fetch().await? {
            handle_inbound_message(engine, ctx, message).await?;
        }
    }
}

/// Starts engine workers of the configured kind.
///
/// Built once from [`Settings`]; the WebAssembly module is compiled here so
/// each worker only instantiates it.
#[derive(Debug, Clone)]
pub enum EngineLauncher {
    /// External engine processes.
    Subprocess {
        /// Launch settings.
        config: SubprocessConfig,
        /// Script evaluated first in every engine.
        runtime: Option<Bytes>,
    },
    /// Embedded WebAssembly engines.
    Wasm {
        /// Compiled engine module.
        module: WasmModule,
        /// Buffer limits for every instance.
        limits: BufferLimits,
        /// Script evaluated first in every engine.
        runtime: Option<Bytes>,
    },
}

impl EngineLauncher {
    /// Prepares a launcher from settings.
    ///
    /// # Errors
    ///
    /// Fails if the selected engine is not configured or its files cannot
    /// be read or compiled.
    pub fn from_settings(settings: &Settings) -> Result<Self, EngineError> {
        let runtime = settings
            .engine
            .runtime
            .as_deref()
            .map(std::fs::read)
            .transpose()?
            .map(Bytes::from);

        match settings.engine.kind {
            EngineKind::Subprocess => {
                let program = settings
                    .engine
                    .command
                    .clone()
                    .ok_or_else(|| EngineError::Config("engine.command is not set".into()))?;
                Ok(Self::Subprocess {
                    config: SubprocessConfig {
                        program,
                        args: settings.engine.args.clone(),
                        exit_grace: Duration::from_millis(settings.engine.exit_grace_ms),
                    },
                    runtime,
                })
            }
            EngineKind::Wasm => {
                let path: &PathBuf = settings
                    .engine
                    .module
                    .as_ref()
                    .ok_or_else(|| EngineError::Config("engine.module is not set".into()))?;
                Ok(Self::Wasm {
                    module: WasmModule::from_file(path)?,
                    limits: BufferLimits::from_settings(&settings.buffer),
                    runtime,
                })
            }
        }
    }

    /// Worker entry point running one engine instance.
    ///
    /// # Errors
    ///
    /// Fails if the engine cannot be started, or with whatever stopped it.
    pub async fn run(self, ctx: WorkerContext) -> Result<(), WorkerError> {
        match self {
            Self::Subprocess { config, runtime } => {
                let engine = SubprocessEngine::spawn(&config, ctx.commands(), ctx.debug())?;
                run_engine_worker(ctx, engine, runtime).await
            }
            Self::Wasm {
                module,
                limits,
                runtime,
            } => {
                let engine = module
                    .instantiate(ctx.commands(), limits, ctx.debug())
                    .await?;
                run_engine_worker(ctx, engine, runtime).await
            }
        }
    }
}
