//! Lazy revalidation of cached resolutions
//!
//! Before trusting a cached entry, callers re-check each present path
//! cache slot against current branch state. Branch revalidation runs
//! with the caller-visible path context substituted for the backing
//! location, restored regardless of outcome.

use crate::branch::{BranchIndex, Retained};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::mount::BranchMount;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Validity of a cached resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Invalid,
}

/// Caller-visible path context for a traversal in progress
#[derive(Debug, Clone)]
pub struct PathContext {
    path: PathBuf,
}

impl PathContext {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Scoped substitution of a path context
///
/// Swaps the caller's path for a backing location and restores the
/// original when dropped, on every exit path.
struct ScopedPath<'a> {
    ctx: &'a mut PathContext,
    saved: PathBuf,
}

impl<'a> ScopedPath<'a> {
    fn substitute(ctx: &'a mut PathContext, path: PathBuf) -> Self {
        let saved = std::mem::replace(&mut ctx.path, path);
        Self { ctx, saved }
    }

    fn ctx(&self) -> &PathContext {
        self.ctx
    }
}

impl Drop for ScopedPath<'_> {
    fn drop(&mut self) {
        std::mem::swap(&mut self.ctx.path, &mut self.saved);
    }
}

/// Re-validates cached entries against current branch state
pub struct RevalidationEngine;

impl RevalidationEngine {
    /// Check every present slot of `entry`, in priority order
    ///
    /// The first slot reporting `Invalid` makes the whole entry invalid
    /// and stops further checking. Slots whose branch has no
    /// revalidation concept count as valid. With `blocking_allowed`
    /// false, a slot whose branch revalidation could block returns
    /// `RetryBlocking` before that slot sees any side effect.
    pub fn revalidate(
        branches: &[BranchMount; 2],
        entry: &Entry,
        ctx: &mut PathContext,
        blocking_allowed: bool,
    ) -> Result<Validity> {
        debug!("revalidate(name={:?})", entry.name());

        for branch in BranchIndex::ALL {
            let bm = &branches[branch.slot()];
            let fs = bm.fs.as_ref();

            let Some(path) = entry.cache().get(branch, fs) else {
                continue;
            };
            let object = Retained::new(fs, path.object);

            if !fs.supports_revalidation() {
                continue;
            }
            if !blocking_allowed && fs.revalidate_may_block() {
                return Err(Error::RetryBlocking);
            }

            let result = {
                let scoped = ScopedPath::substitute(ctx, object.path.clone());
                fs.revalidate(&object, scoped.ctx())
            };

            match result? {
                Validity::Valid => {}
                Validity::Invalid => {
                    debug!(
                        "revalidate: {:?} stale at branch {}",
                        entry.name(),
                        branch
                    );
                    return Ok(Validity::Invalid);
                }
            }
        }

        Ok(Validity::Valid)
    }
}
