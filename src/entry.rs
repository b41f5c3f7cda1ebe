//! Logical entries and their per-branch path cache
//!
//! An [`Entry`] is one name binding in the merged namespace. It owns a
//! [`PathCache`] with one optional [`BranchPath`] slot per branch, all
//! guarded by a single mutex. The rule everywhere is copy-under-lock,
//! act-outside-lock: slot contents are captured or swapped while holding
//! the lock, and any reference release happens after it is dropped.

use crate::branch::{BackingHandle, BranchFilesystem, BranchIndex, FilesystemId};
use crate::interpose::UnifiedObject;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Resolved backing location for one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPath {
    /// Branch this path belongs to
    pub branch: BranchIndex,
    /// Backing object, one reference owned by whoever holds this value
    pub object: BackingHandle,
    /// Filesystem instance recorded for the branch at mount time
    pub mount: FilesystemId,
}

/// Two optional branch slots behind one lock
#[derive(Debug)]
pub struct PathCache {
    slots: Mutex<[Option<BranchPath>; 2]>,
}

impl PathCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new([None, None]),
        }
    }

    /// Retained copy of one slot
    ///
    /// The copy carries its own reference; acquire is contractually
    /// non-blocking, so it runs under the lock. The caller owns the
    /// release.
    pub fn get(&self, branch: BranchIndex, fs: &dyn BranchFilesystem) -> Option<BranchPath> {
        let slots = self.slots.lock();
        let path = slots[branch.slot()].clone()?;
        fs.acquire(&path.object);
        Some(path)
    }

    /// Whether a slot is populated
    pub fn is_set(&self, branch: BranchIndex) -> bool {
        self.slots.lock()[branch.slot()].is_some()
    }

    /// Object identity stored in a slot, if any
    pub fn slot_id(&self, branch: BranchIndex) -> Option<u64> {
        self.slots.lock()[branch.slot()].as_ref().map(|p| p.object.id)
    }

    /// Replace one slot, transferring ownership of `path`'s reference in
    ///
    /// Returns the displaced path; the caller must release it outside
    /// the lock (which this method has already dropped).
    #[must_use = "the displaced path still holds a reference that must be released"]
    pub fn set(&self, branch: BranchIndex, path: Option<BranchPath>) -> Option<BranchPath> {
        let mut slots = self.slots.lock();
        std::mem::replace(&mut slots[branch.slot()], path)
    }

    /// Capture and clear both slots atomically
    ///
    /// Returns the captured paths for the caller to release.
    #[must_use = "captured paths still hold references that must be released"]
    pub fn clear_all(&self) -> [Option<BranchPath>; 2] {
        let mut slots = self.slots.lock();
        std::mem::replace(&mut *slots, [None, None])
    }
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A logical name binding within the merged namespace
///
/// Created on first resolution attempt for a name; its cached state is
/// torn down exactly once, on disposal through the superblock.
#[derive(Debug)]
pub struct Entry {
    name: String,
    cache: PathCache,
    object: Mutex<Option<Arc<UnifiedObject>>>,
    released: AtomicBool,
}

impl Entry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cache: PathCache::new(),
            object: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache(&self) -> &PathCache {
        &self.cache
    }

    /// Bound unified object, if the entry is positive
    pub fn object(&self) -> Option<Arc<UnifiedObject>> {
        self.object.lock().clone()
    }

    /// Whether the entry currently resolves positively
    pub fn is_positive(&self) -> bool {
        self.object.lock().is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Bind a unified object, returning the displaced one
    ///
    /// The displaced object's backing references belong to the caller.
    #[must_use = "the displaced object still holds backing references"]
    pub(crate) fn bind(&self, object: Arc<UnifiedObject>) -> Option<Arc<UnifiedObject>> {
        self.object.lock().replace(object)
    }

    /// Detach the bound object, if any
    #[must_use = "the detached object still holds backing references"]
    pub(crate) fn unbind(&self) -> Option<Arc<UnifiedObject>> {
        self.object.lock().take()
    }

    /// First call wins; later calls observe an already-released entry
    pub(crate) fn begin_release(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }
}
