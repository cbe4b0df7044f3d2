//! Library error types.

use thiserror::Error;

/// Result alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by listener management.
///
/// Accept-path failures never show up here: they degrade to
/// close-and-count. Only construction-time configuration problems
/// propagate to the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("listener tag {0} is already in use")]
    DuplicateListener(u64),

    #[error("internal listener id {0:?} is already registered")]
    InternalListenerIdInUse(String),

    #[error("listener {0:?} does not support in-place replacement")]
    UnsupportedReplacement(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
