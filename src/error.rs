//! Error types for duofs

use thiserror::Error;

/// Result type alias using duofs Error
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the resolution engine
#[derive(Debug, Error)]
pub enum Error {
    /// No branch holds the object and there was no create intent
    #[error("object not found in any branch")]
    NotFound,

    /// Malformed or missing mount options
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A resolved backing object belongs to an unexpected filesystem instance
    #[error("backing object crossed a branch mount boundary")]
    CrossBranchMount,

    /// Private-data or object allocation failure
    #[error("out of memory")]
    OutOfMemory,

    /// The operation could block and the caller disallowed blocking;
    /// re-invoke in a context where blocking is permitted
    #[error("operation would block; retry with blocking allowed")]
    RetryBlocking,

    /// Opaque fault propagated from a branch filesystem (anything other
    /// than not-found)
    #[error("branch filesystem fault: {0}")]
    Branch(std::io::Error),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True if this error maps to "no such object" rather than a fault
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}
