//! Engine selection and launch settings.

use std::path::PathBuf;

use serde::Deserialize;

pub(super) const DEFAULT_EXIT_GRACE_MS: u64 = 5000;

/// Which engine adapter workers use.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// An external engine process spoken to over pipes.
    Subprocess,
    /// A WebAssembly engine embedded in this process.
    #[default]
    Wasm,
}

/// Engine launch settings.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    /// Adapter to use.
    #[serde(default)]
    pub kind: EngineKind,
    /// Engine executable for the subprocess adapter.
    #[serde(default)]
    pub command: Option<PathBuf>,
    /// Arguments passed to the engine executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// WebAssembly module for the in-process adapter.
    #[serde(default)]
    pub module: Option<PathBuf>,
    /// Script evaluated in every engine before it serves messages.
    #[serde(default)]
    pub runtime: Option<PathBuf>,
    /// How long a subprocess engine may take to exit once its input closes.
    #[serde(default = "default_exit_grace_ms")]
    pub exit_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            command: None,
            args: Vec::new(),
            module: None,
            runtime: None,
            exit_grace_ms: DEFAULT_EXIT_GRACE_MS,
        }
    }
}

fn default_exit_grace_ms() -> u64 {
    DEFAULT_EXIT_GRACE_MS
}
