//! Diagnostic toggles.
//!
//! Built once with the rest of [`Settings`](super::Settings) and handed to
//! the supervisor and every engine adapter.

use serde::Deserialize;

/// Switches for extra `info` records.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugSettings {
    /// Log headers and body of every routed message.
    #[serde(default)]
    pub trace_messages: bool,
    /// Log worker, port and supervisor task creation and exit.
    #[serde(default)]
    pub track_handles: bool,
    /// Log each call into an engine.
    #[serde(default)]
    pub trace_engine: bool,
}
