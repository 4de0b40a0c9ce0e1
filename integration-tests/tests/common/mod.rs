//! Shared test utilities for integration tests.
//!
//! Provides a started supervision tree with a driver, engine workers backed
//! by the test WebAssembly engine, and small scripted workers.

#![allow(dead_code)]

use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use vatvisor_kernel::bindings::run_bindings_worker;
use vatvisor_kernel::driver::Driver;
use vatvisor_kernel::engine::{EngineLauncher, WasmModule};
use vatvisor_kernel::infrastructure::config::{BufferLimits, DebugSettings};
use vatvisor_kernel::message::{Id, Message, MessageType};
use vatvisor_kernel::supervisor::Supervisor;
use vatvisor_kernel::worker::{CommandIssuer, WorkerContext, WorkerError};

/// Upper bound on any single wait in these tests.
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Engine module answering every command, with one reentrant command.
pub const VAT_ENGINE: &str = include_str!("../fixtures/vat_engine.wat");

/// Compiles the test engine.
pub fn engine_module() -> Result<WasmModule> {
    Ok(WasmModule::from_binary(VAT_ENGINE.as_bytes())?)
}

/// A started tree plus the driver that owns it.
pub struct TestTree {
    /// The tree's supervisor.
    pub supervisor: Supervisor,
    /// Top-level caller.
    pub driver: Driver,
    module: WasmModule,
}

impl TestTree {
    /// Starts an empty tree.
    pub fn start() -> Result<Self> {
        Self::with_debug(DebugSettings::default())
    }

    /// Starts an empty tree with debug toggles.
    pub fn with_debug(debug: DebugSettings) -> Result<Self> {
        let supervisor = Supervisor::new(debug);
        supervisor.start();
        Ok(Self {
            driver: Driver::new(supervisor.clone()),
            supervisor,
            module: engine_module()?,
        })
    }

    /// Spawns a test engine worker under `parent`.
    pub fn spawn_engine(&self, parent: Id) -> Id {
        let launcher = EngineLauncher::Wasm {
            module: self.module.clone(),
            limits: BufferLimits::default(),
            runtime: None,
        };
        self.supervisor.spawn(parent, move |ctx| launcher.run(ctx))
    }

    /// Spawns the bindings worker under `parent`.
    pub fn spawn_bindings(&self, parent: Id) -> Id {
        self.supervisor.spawn(parent, run_bindings_worker)
    }

    /// Spawns a worker answering every request with `from <id>` and
    /// reporting everything it receives on the returned channel.
    pub fn spawn_recorder(&self, parent: Id) -> (Id, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.supervisor.spawn(parent, move |ctx| record(ctx, tx));
        (id, rx)
    }

    /// Spawns an idle worker and returns its command issuer.
    pub async fn spawn_issuer(&self, parent: Id) -> Result<CommandIssuer> {
        let (tx, rx) = oneshot::channel();
        self.supervisor.spawn(parent, move |ctx| async move {
            let _ = tx.send(ctx.commands());
            ctx.cancellation().cancelled().await;
            Ok::<(), WorkerError>(())
        });
        Ok(timeout(PATIENCE, rx).await??)
    }

    /// Stops the tree and waits for every task to exit.
    pub async fn stop(self) -> Result<()> {
        self.supervisor.stop();
        timeout(PATIENCE, self.supervisor.wait()).await?;
        Ok(())
    }
}

async fn record(
    ctx: WorkerContext,
    seen: mpsc::UnboundedSender<Message>,
) -> Result<(), WorkerError> {
    loop {
        for mut message in ctx.fetch().await? {
            let reply = Message::new(message.headers.reply(MessageType::Ok))
                .with_body(format!("from {}", ctx.id()));
            message.respond(reply);
            let _ = seen.send(message);
        }
    }
}
