//! Configuration management for vatvisor.
//!
//! Settings are built once at process start from defaults plus environment
//! variables prefixed with `VATVISOR` and separated by `__`, for example
//! `VATVISOR__BUFFER__INITIAL_SIZE=131072` or
//! `VATVISOR__DEBUG__TRACE_MESSAGES=true`.
//!
//! # Example
//!
//! ```
//! use vatvisor_kernel::infrastructure::config::Settings;
//!
//! let settings = Settings::new().expect("Failed to load configuration");
//! assert!(settings.buffer.max_size > 0);
//! ```

pub mod buffer;
pub mod debug;
pub mod engine;
pub mod telemetry;

pub use buffer::{BufferLimits, BufferSettings, DEFAULT_INITIAL_BUFFER_SIZE, DEFAULT_MAX_BUFFER_SIZE};
pub use debug::DebugSettings;
pub use engine::{EngineKind, EngineSettings};
pub use telemetry::TelemetrySettings;

use std::collections::HashMap;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Which engine workers run and how to launch it.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Linear-memory buffer limits of the in-process engine.
    #[serde(default)]
    pub buffer: BufferSettings,
    /// Logging output.
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    /// Extra diagnostic records.
    #[serde(default)]
    pub debug: DebugSettings,
}

impl Settings {
    /// Creates a new settings instance from environment variables and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn new() -> Result<Self, ConfigError> {
        Self::build(None)
    }

    /// Builds settings from an explicit variable map instead of the process
    /// environment. Keys use the same `VATVISOR__SECTION__KEY` spelling.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::build(Some(vars))
    }

    fn build(vars: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("engine.kind", "wasm")?
            .set_default("engine.exit_grace_ms", engine::DEFAULT_EXIT_GRACE_MS)?
            .set_default("buffer.max_size", DEFAULT_MAX_BUFFER_SIZE as u64)?
            .set_default("telemetry.log_level", "info")?
            .add_source(
                Environment::with_prefix("VATVISOR")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("engine.args")
                    .source(vars),
            )
            .build()?;

        s.try_deserialize()
    }
}
