//! duofs - two-branch union filesystem resolution engine
//!
//! This library merges exactly two underlying directory trees into one
//! logical namespace. Branch 0 (left) takes priority over branch 1
//! (right); per-name whiteout markers mask lower-priority content. The
//! engine covers the read side only: ordered-branch name lookup,
//! whiteout masking, per-entry caching of resolved backing locations,
//! synthesis of a unified object from up to two backing objects and
//! lazy revalidation of cached resolutions.

pub mod branch;
pub mod entry;
pub mod error;
pub mod interpose;
pub mod mount;
pub mod resolve;
pub mod revalidate;
pub mod whiteout;

#[cfg(test)]
pub(crate) mod testfs;

pub use error::{Error, Result};
pub use mount::Superblock;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::branch::{BackingHandle, BranchFilesystem, BranchIndex, DirBranch};
    pub use crate::entry::Entry;
    pub use crate::error::{Error, Result};
    pub use crate::interpose::UnifiedObject;
    pub use crate::mount::Superblock;
    pub use crate::resolve::Outcome;
    pub use crate::revalidate::{PathContext, Validity};
}
