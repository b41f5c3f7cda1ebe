//! Object interposition
//!
//! Interposition binds a logical entry to its resolved backing
//! counterparts: a [`UnifiedObject`] aggregating up to two independently
//! retained backing handles, one per branch, with derived attributes
//! copied from the representative (the highest-priority present slot).

use crate::branch::{BackingHandle, BranchIndex, ObjectAttributes, ObjectKind};
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::mount::BranchMount;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::SystemTime;

/// The logical object exposed to callers
///
/// Holds one reference on each present backing object; those references
/// are dropped when the owning entry is disposed.
#[derive(Debug)]
pub struct UnifiedObject {
    slots: [Option<BackingHandle>; 2],
    attrs: Mutex<ObjectAttributes>,
}

impl UnifiedObject {
    /// Backing handle for one branch, if present
    pub fn slot(&self, branch: BranchIndex) -> Option<&BackingHandle> {
        self.slots[branch.slot()].as_ref()
    }

    /// First present slot in priority order
    pub fn representative(&self) -> Option<(BranchIndex, &BackingHandle)> {
        BranchIndex::ALL
            .into_iter()
            .find_map(|b| self.slots[b.slot()].as_ref().map(|h| (b, h)))
    }

    /// Copy of the derived attributes
    pub fn attributes(&self) -> ObjectAttributes {
        self.attrs.lock().clone()
    }

    pub fn kind(&self) -> ObjectKind {
        self.attrs.lock().kind
    }

    /// Refresh access time from the representative backing object
    pub(crate) fn set_atime(&self, atime: SystemTime) {
        self.attrs.lock().atime = atime;
    }
}

/// Release every backing reference a unified object holds
pub(crate) fn release_object(branches: &[BranchMount; 2], object: &UnifiedObject) {
    for branch in BranchIndex::ALL {
        if let Some(handle) = object.slot(branch) {
            branches[branch.slot()].fs.release(handle);
        }
    }
}

/// Synthesizes and attaches unified objects from resolved branch hits
pub struct ObjectInterposer;

impl ObjectInterposer {
    /// Build a unified object from the entry's populated slots and bind it
    ///
    /// Fails with `CrossBranchMount` if any slot's owning instance does
    /// not match the branch's recorded mount. An entry with no populated
    /// slot is negative and cannot be attached.
    pub fn attach(branches: &[BranchMount; 2], entry: &Entry) -> Result<Arc<UnifiedObject>> {
        Self::build(branches, entry, false)
    }

    /// Root variant: synthesized directly from the configured branch
    /// roots at mount time, with no name or parent to resolve
    pub(crate) fn attach_root(
        branches: &[BranchMount; 2],
        entry: &Entry,
    ) -> Result<Arc<UnifiedObject>> {
        Self::build(branches, entry, true)
    }

    fn build(
        branches: &[BranchMount; 2],
        entry: &Entry,
        root: bool,
    ) -> Result<Arc<UnifiedObject>> {
        let mut slots: [Option<BackingHandle>; 2] = [None, None];
        let mut attrs: Option<ObjectAttributes> = None;
        let mut fault: Option<Error> = None;

        for branch in BranchIndex::ALL {
            let bm = &branches[branch.slot()];
            let Some(path) = entry.cache().get(branch, bm.fs.as_ref()) else {
                continue;
            };

            if path.mount != bm.fs.instance()
                || bm.fs.owning_instance(&path.object) != bm.fs.instance()
            {
                bm.fs.release(&path.object);
                fault = Some(Error::CrossBranchMount);
                break;
            }

            // Representative attributes come from the first present slot
            if attrs.is_none() {
                match bm.fs.attributes(&path.object) {
                    Ok(a) => attrs = Some(a),
                    Err(e) => {
                        bm.fs.release(&path.object);
                        fault = Some(e);
                        break;
                    }
                }
            }

            slots[branch.slot()] = Some(path.object);
        }

        if let Some(e) = fault {
            for branch in BranchIndex::ALL {
                if let Some(handle) = slots[branch.slot()].take() {
                    branches[branch.slot()].fs.release(&handle);
                }
            }
            return Err(e);
        }

        let Some(mut attrs) = attrs else {
            return Err(Error::NotFound);
        };

        if root && attrs.kind != ObjectKind::Directory {
            attrs.kind = ObjectKind::Directory;
            attrs.perm = 0o755;
        }

        // Device metadata only carries over for special objects
        if !matches!(attrs.kind, ObjectKind::BlockDevice | ObjectKind::CharDevice) {
            attrs.rdev = 0;
        }

        let object = Arc::new(UnifiedObject {
            slots,
            attrs: Mutex::new(attrs),
        });

        if let Some(old) = entry.bind(object.clone()) {
            release_object(branches, &old);
        }

        Ok(object)
    }
}
