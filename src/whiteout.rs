//! Whiteout masking
//!
//! A whiteout is a reserved-name sibling of a real name inside a branch
//! directory, signaling that the name is logically deleted at lower
//! priority. A marker only masks when it resolves to a real backing
//! object; a mere cache miss is not masking, and any lookup fault other
//! than not-found propagates so masking stays certain.

use crate::branch::{BackingHandle, BranchFilesystem};
use crate::error::Result;

/// Reserved prefix for whiteout marker names
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Outcome of a masking query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Masking {
    NotMasked,
    Masked,
}

/// Determines whether a name is masked in one branch directory
pub struct WhiteoutOracle;

impl WhiteoutOracle {
    /// Marker name colocated with `name`
    pub fn marker_name(name: &str) -> String {
        format!("{}{}", WHITEOUT_PREFIX, name)
    }

    /// Whether a marker name itself, which merged views never expose
    pub fn is_marker(name: &str) -> bool {
        name.starts_with(WHITEOUT_PREFIX)
    }

    /// Query masking of `name` inside `dir` on one branch
    ///
    /// Faults from the marker lookup abort the caller's whole name
    /// resolution; they are never treated as "not masked".
    pub fn is_masked(
        fs: &dyn BranchFilesystem,
        dir: &BackingHandle,
        name: &str,
    ) -> Result<Masking> {
        let marker = Self::marker_name(name);
        match fs.lookup(dir, &marker)? {
            Some(object) => {
                // The marker's own reference is not kept
                fs.release(&object);
                Ok(Masking::Masked)
            }
            None => Ok(Masking::NotMasked),
        }
    }
}
