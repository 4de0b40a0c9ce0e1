//! Linear-memory buffer limits for the in-process engine.

use serde::Deserialize;

/// Buffer size used when no initial size is configured.
pub const DEFAULT_INITIAL_BUFFER_SIZE: usize = 64 * 1024;
/// Hard ceiling on the exchange buffer.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Raw buffer settings as they appear in the environment.
#[derive(Debug, Deserialize, Clone)]
pub struct BufferSettings {
    /// Requested initial size, kept as text so malformed values can fall
    /// back to the default instead of failing startup.
    #[serde(default)]
    pub initial_size: Option<String>,
    /// Maximum size the buffer may grow to.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            initial_size: None,
            max_size: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

fn default_max_size() -> usize {
    DEFAULT_MAX_BUFFER_SIZE
}

/// Effective, validated buffer limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    /// Size the buffer is grown to when an engine starts.
    pub initial: usize,
    /// Size above which an exchange fails as too large.
    pub max: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BUFFER_SIZE,
            max: DEFAULT_MAX_BUFFER_SIZE,
        }
    }
}

impl BufferLimits {
    /// Resolves the configured values into usable limits.
    ///
    /// A zero maximum is treated as unset. The initial size is clamped to
    /// the maximum.
    #[must_use]
    pub fn from_settings(settings: &BufferSettings) -> Self {
        let max = if settings.max_size == 0 {
            DEFAULT_MAX_BUFFER_SIZE
        } else {
            settings.max_size
        };
        Self {
            initial: parse_initial_size(settings.initial_size.as_deref(), max),
            max,
        }
    }
}

/// Interprets a raw initial size.
///
/// Unset, non-numeric and zero values yield the default; anything above
/// `max` yields `max`.
#[must_use]
pub fn parse_initial_size(raw: Option<&str>, max: usize) -> usize {
    let requested = raw
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_INITIAL_BUFFER_SIZE);
    requested.min(max)
}
