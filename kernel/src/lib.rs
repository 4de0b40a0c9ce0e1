//! Vatvisor kernel - supervision and message routing for isolated script
//! engines.
//!
//! A [`supervisor::Supervisor`] owns a tree of workers ("vats"). Each
//! worker reads batches from its own [`mailbox::Mailbox`] and writes into a
//! shared outbox that a single routing task drains. Engine workers wrap an
//! [`engine::EngineAdapter`], either an external process or an embedded
//! WebAssembly module. The [`driver::Driver`] is the top-level caller.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Built-in worker servicing host binding calls.
pub mod bindings;
/// Top-level caller operations.
pub mod driver;
/// Engine adapters and the engine worker loop.
pub mod engine;
/// Infrastructure components (config, telemetry).
pub mod infrastructure;
/// Two-slot batching mailbox.
pub mod mailbox;
/// Message, header and id types.
pub mod message;
/// Frame and netstring record codecs.
pub mod protocol;
/// Worker registry, port table and routing loop.
pub mod supervisor;
/// Worker context and reentrant command issuing.
pub mod worker;
