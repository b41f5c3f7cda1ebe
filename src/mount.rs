//! Mount composition
//!
//! Binds two branch roots into one merged superblock. Branch owning
//! filesystems are pinned for the mount's lifetime; any failure after
//! pinning unwinds exactly the pins already taken.

use crate::branch::{BackingHandle, BranchFilesystem, BranchIndex, DirBranch};
use crate::entry::{BranchPath, Entry};
use crate::error::{Error, Result};
use crate::interpose::{release_object, ObjectInterposer};
use crate::resolve::{LookupResolver, Outcome};
use crate::revalidate::{PathContext, RevalidationEngine, Validity};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// One branch as recorded at mount time
pub struct BranchMount {
    /// The branch's native filesystem, pinned while mounted
    pub fs: Arc<dyn BranchFilesystem>,
    /// Resolved branch root
    pub root: BackingHandle,
}

impl std::fmt::Debug for BranchMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchMount")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Parsed mount option string
///
/// Exactly two keys are recognized, `ldir` and `rdir`, both mandatory
/// absolute paths. Other keys are ignored.
#[derive(Debug, PartialEq, Eq)]
struct MountOptions {
    ldir: PathBuf,
    rdir: PathBuf,
}

impl MountOptions {
    fn parse(options: &str) -> Result<Self> {
        let mut ldir = None;
        let mut rdir = None;

        for token in options.split(',') {
            if token.is_empty() {
                return Err(Error::InvalidArgument("empty mount option".into()));
            }
            if let Some(value) = token.strip_prefix("ldir=") {
                ldir = Some(PathBuf::from(value));
            } else if let Some(value) = token.strip_prefix("rdir=") {
                rdir = Some(PathBuf::from(value));
            }
            // No other keys are recognized
        }

        let ldir = ldir.ok_or_else(|| Error::InvalidArgument("missing ldir option".into()))?;
        let rdir = rdir.ok_or_else(|| Error::InvalidArgument("missing rdir option".into()))?;
        for (key, path) in [("ldir", &ldir), ("rdir", &rdir)] {
            if !path.is_absolute() {
                return Err(Error::InvalidArgument(format!(
                    "{} must be an absolute path, got {:?}",
                    key, path
                )));
            }
        }

        Ok(Self { ldir, rdir })
    }
}

/// The merged superblock: two pinned branches plus the merged root entry
#[derive(Debug)]
pub struct Superblock {
    branches: [BranchMount; 2],
    root: Arc<Entry>,
}

impl Superblock {
    /// Mount from an option string of the form `ldir=<abs>,rdir=<abs>`
    ///
    /// Both paths must name existing directories; validation happens
    /// before any filesystem is pinned.
    pub fn mount(options: &str) -> Result<Self> {
        let opts = MountOptions::parse(options)?;
        let left = DirBranch::new(&opts.ldir)?;
        let right = DirBranch::new(&opts.rdir)?;
        let sb = Self::compose(Arc::new(left), Arc::new(right))?;
        info!(
            "duofs: mounted over {:?} (left) and {:?} (right)",
            opts.ldir, opts.rdir
        );
        Ok(sb)
    }

    /// Compose a merged superblock from two branch filesystems
    ///
    /// Root resolution happens before pinning; a failure while building
    /// the merged root unpins both branches again and releases every
    /// reference taken, so partial pin state never leaks.
    pub fn compose(
        left: Arc<dyn BranchFilesystem>,
        right: Arc<dyn BranchFilesystem>,
    ) -> Result<Self> {
        // Resolve both roots first; nothing is pinned on failure here
        let left_root = left.root()?;
        let right_root = match right.root() {
            Ok(root) => root,
            Err(e) => {
                left.release(&left_root);
                return Err(e);
            }
        };

        left.pin();
        right.pin();

        let branches = [
            BranchMount {
                fs: left,
                root: left_root,
            },
            BranchMount {
                fs: right,
                root: right_root,
            },
        ];

        // Seed the merged root entry with both branch roots
        let root = Arc::new(Entry::new(""));
        for branch in BranchIndex::ALL {
            let bm = &branches[branch.slot()];
            bm.fs.acquire(&bm.root);
            let displaced = root.cache().set(
                branch,
                Some(BranchPath {
                    branch,
                    object: bm.root.clone(),
                    mount: bm.fs.instance(),
                }),
            );
            debug_assert!(displaced.is_none());
        }

        // The root bypasses the resolver: it has no name or parent
        match ObjectInterposer::attach_root(&branches, &root) {
            Ok(_) => {
                debug!("compose: merged root attached");
                Ok(Self { branches, root })
            }
            Err(e) => {
                release_entry(&branches, &root);
                for bm in branches.iter().rev() {
                    bm.fs.release(&bm.root);
                    bm.fs.unpin();
                }
                Err(e)
            }
        }
    }

    /// The merged root entry
    pub fn root(&self) -> &Arc<Entry> {
        &self.root
    }

    /// Mount record for one branch
    pub fn branch(&self, branch: BranchIndex) -> &BranchMount {
        &self.branches[branch.slot()]
    }

    pub(crate) fn branches(&self) -> &[BranchMount; 2] {
        &self.branches
    }

    /// Resolve `name` under `parent`, returning the new entry and its
    /// outcome
    ///
    /// The caller owns the entry and must release it exactly once.
    pub fn resolve(
        &self,
        parent: &Entry,
        name: &str,
        create_intent: bool,
        blocking_allowed: bool,
    ) -> Result<(Arc<Entry>, Outcome)> {
        let entry = Arc::new(Entry::new(name));
        match LookupResolver::resolve(&self.branches, parent, &entry, create_intent, blocking_allowed)
        {
            Ok(outcome) => Ok((entry, outcome)),
            Err(e) => {
                // A partial scan may have populated slots already
                release_entry(&self.branches, &entry);
                Err(e)
            }
        }
    }

    /// Re-validate a cached entry against current branch state
    pub fn revalidate(
        &self,
        entry: &Entry,
        ctx: &mut PathContext,
        blocking_allowed: bool,
    ) -> Result<Validity> {
        RevalidationEngine::revalidate(&self.branches, entry, ctx, blocking_allowed)
    }

    /// Dispose of an entry, dropping every backing reference it holds
    ///
    /// Idempotent: only the first call tears anything down.
    pub fn release(&self, entry: &Entry) {
        release_entry(&self.branches, entry);
    }
}

impl Drop for Superblock {
    fn drop(&mut self) {
        release_entry(&self.branches, &self.root);
        for bm in self.branches.iter().rev() {
            bm.fs.release(&bm.root);
            bm.fs.unpin();
        }
    }
}

/// Tear down an entry's cached state exactly once
///
/// Captures both slots under the entry lock, then releases the captured
/// references and the bound unified object outside it.
pub(crate) fn release_entry(branches: &[BranchMount; 2], entry: &Entry) {
    if !entry.begin_release() {
        return;
    }
    let captured = entry.cache().clear_all();
    for path in captured.into_iter().flatten() {
        branches[path.branch.slot()].fs.release(&path.object);
    }
    if let Some(object) = entry.unbind() {
        release_object(branches, &object);
    }
}
