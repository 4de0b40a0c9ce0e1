//! Identifiers for workers and the supervisor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a worker, the supervisor (`0`), or an unsupervised caller (`< 0`).
///
/// Worker ids are allocated by the supervisor starting at 1 and are never
/// reused within a process lifetime.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Id(i64);

impl Id {
    /// The supervisor itself. Also the root of the spawn tree.
    pub const SUPERVISOR: Id = Id(0);
    /// The top-level driver, which is not a registered worker.
    pub const DRIVER: Id = Id(-1);

    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Returns `true` for the supervisor address.
    #[must_use]
    pub const fn is_supervisor(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` for an allocatable worker identity.
    #[must_use]
    pub const fn is_worker(self) -> bool {
        self.0 > 0
    }

    /// Returns `true` for callers outside the spawn tree, such as the driver.
    #[must_use]
    pub const fn is_unsupervised(self) -> bool {
        self.0 < 0
    }

    pub(crate) const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<i64> for Id {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
