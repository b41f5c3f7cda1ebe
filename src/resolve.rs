//! Name resolution across ordered branches
//!
//! The resolver scans the two branches in priority order, consults the
//! whiteout oracle before each native lookup, stores hits into the
//! entry's path cache and hands positive results to the interposer.

use crate::branch::{BranchIndex, Retained};
use crate::entry::{BranchPath, Entry};
use crate::error::{Error, Result};
use crate::interpose::{ObjectInterposer, UnifiedObject};
use crate::mount::BranchMount;
use crate::whiteout::{Masking, WhiteoutOracle};
use std::sync::Arc;
use tracing::{debug, error};

/// Result of a name resolution
#[derive(Clone, Debug)]
pub enum Outcome {
    /// At least one branch holds the name; the unified object is bound
    Positive(Arc<UnifiedObject>),
    /// No branch holds the name (or it is masked)
    ///
    /// `creatable` tells the caller whether a subsequent create may
    /// proceed through this entry.
    Negative { creatable: bool },
}

impl Outcome {
    pub fn is_positive(&self) -> bool {
        matches!(self, Outcome::Positive(_))
    }
}

/// Orchestrates per-branch scanning and outcome construction
pub struct LookupResolver;

impl LookupResolver {
    /// Resolve `entry.name()` under `parent`, filling `entry`'s cache
    ///
    /// Branches are visited 0 then 1. A whiteout marker with a real
    /// backing object stops the scan over all remaining branches. Any
    /// branch fault other than not-found aborts the whole resolution
    /// and is not retried against the other branch.
    pub fn resolve(
        branches: &[BranchMount; 2],
        parent: &Entry,
        entry: &Entry,
        create_intent: bool,
        blocking_allowed: bool,
    ) -> Result<Outcome> {
        let name = entry.name();
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidArgument(format!("bad entry name {:?}", name)));
        }

        // Non-blocking traversal bails out before any side effect
        if !blocking_allowed && branches.iter().any(|bm| bm.fs.lookup_may_block()) {
            return Err(Error::RetryBlocking);
        }

        debug!(
            "resolve(parent={:?}, name={:?}, create_intent={})",
            parent.name(),
            name,
            create_intent
        );

        let mut hits = 0usize;
        let mut masked = false;

        'scan: for branch in BranchIndex::ALL {
            let bm = &branches[branch.slot()];
            let fs = bm.fs.as_ref();

            // A branch lacking the parent directory is not an error
            let Some(parent_path) = parent.cache().get(branch, fs) else {
                continue;
            };
            let parent_dir = Retained::new(fs, parent_path.object);

            // Masking must be certain: oracle faults abort the whole name
            match WhiteoutOracle::is_masked(fs, &parent_dir, name)? {
                Masking::Masked => {
                    debug!("resolve: {:?} masked at branch {}", name, branch);
                    masked = true;
                    break 'scan;
                }
                Masking::NotMasked => {}
            }

            match fs.lookup(&parent_dir, name) {
                Ok(Some(object)) => {
                    if fs.owning_instance(&object) != fs.instance() {
                        error!(
                            "resolve: {:?} crossed a mount boundary at branch {}",
                            name, branch
                        );
                        fs.release(&object);
                        return Err(Error::CrossBranchMount);
                    }
                    debug!("resolve: hit for {:?} at branch {}", name, branch);
                    let displaced = entry.cache().set(
                        branch,
                        Some(BranchPath {
                            branch,
                            object,
                            mount: fs.instance(),
                        }),
                    );
                    if let Some(old) = displaced {
                        fs.release(&old.object);
                    }
                    hits += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("resolve: branch {} fault for {:?}: {}", branch, name, e);
                    return Err(e);
                }
            }
        }

        if hits > 0 {
            let object = ObjectInterposer::attach(branches, entry)?;
            refresh_parent_atime(branches, parent);
            return Ok(Outcome::Positive(object));
        }

        if masked {
            // A masked name is always absent, but creation may proceed
            // through it
            return Ok(Outcome::Negative {
                creatable: create_intent,
            });
        }

        // Record the branch-0 creation anchor: the parent's left
        // directory, where a later create would materialize the object
        let left = &branches[BranchIndex::Left.slot()];
        let mut anchored = false;
        if let Some(anchor) = parent.cache().get(BranchIndex::Left, left.fs.as_ref()) {
            let displaced = entry.cache().set(BranchIndex::Left, Some(anchor));
            if let Some(old) = displaced {
                left.fs.release(&old.object);
            }
            anchored = true;
        }

        Ok(Outcome::Negative {
            creatable: create_intent && anchored,
        })
    }
}

/// Refresh the parent's access time from its representative branch
fn refresh_parent_atime(branches: &[BranchMount; 2], parent: &Entry) {
    let Some(object) = parent.object() else { return };
    let Some((branch, _)) = object.representative() else { return };
    let bm = &branches[branch.slot()];
    let Some(path) = parent.cache().get(branch, bm.fs.as_ref()) else {
        return;
    };
    let retained = Retained::new(bm.fs.as_ref(), path.object);
    if let Ok(attrs) = bm.fs.attributes(&retained) {
        object.set_atime(attrs.atime);
    }
}
