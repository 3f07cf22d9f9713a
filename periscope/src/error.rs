//! Typed errors for configuration and artifact faults.
//!
//! Engine-boundary failures are deliberately not represented here: they are
//! logged at the [`Backend`](crate::Backend) boundary and surfaced as
//! `false`/`None` sentinels instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The active sampling engine cannot be replaced mid-session.
    #[error("cannot change sampling engine while a profiling session is running")]
    EngineRunning,

    /// The engine handed back a payload that does not look like a profile.
    #[error("invalid profile payload: {0}")]
    InvalidProfile(String),

    /// A computed artifact file name contained characters outside the
    /// `[0-9A-Za-z._-]` allow-list.
    #[error("unsafe profile file name {0:?}")]
    UnsafeFileName(String),
}
