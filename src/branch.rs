//! Branch filesystem contract
//!
//! A branch is one of the two ordered directory trees merged into the
//! logical namespace. The engine talks to each branch through the
//! [`BranchFilesystem`] trait and never owns backing objects itself: it
//! only acquires and releases references the branch hands out.

use crate::error::{Error, Result};
use crate::revalidate::{PathContext, Validity};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Index of a branch within the merged view
///
/// Branch 0 (left) takes priority over branch 1 (right): it supplies the
/// representative attributes and is the default creation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchIndex {
    Left,
    Right,
}

impl BranchIndex {
    /// Both branches, in priority order
    pub const ALL: [BranchIndex; 2] = [BranchIndex::Left, BranchIndex::Right];

    /// Slot position in per-entry two-element arrays
    pub fn slot(self) -> usize {
        match self {
            BranchIndex::Left => 0,
            BranchIndex::Right => 1,
        }
    }
}

impl fmt::Display for BranchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slot())
    }
}

/// Identity of a branch filesystem instance
///
/// Used to detect backing objects that crossed a mount boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilesystemId(pub u64);

impl fmt::Display for FilesystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fs#{}", self.0)
    }
}

/// Object type within a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

/// Attributes of a backing object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectAttributes {
    pub kind: ObjectKind,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Device number, meaningful for block/char device objects
    pub rdev: u64,
}

impl Default for ObjectAttributes {
    fn default() -> Self {
        let now = SystemTime::now();
        Self {
            kind: ObjectKind::RegularFile,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            perm: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
        }
    }
}

impl ObjectAttributes {
    #[cfg(unix)]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::fs::MetadataExt;

        let ft = meta.file_type();
        let kind = if ft.is_dir() {
            ObjectKind::Directory
        } else if ft.is_symlink() {
            ObjectKind::Symlink
        } else if ft.is_block_device() {
            ObjectKind::BlockDevice
        } else if ft.is_char_device() {
            ObjectKind::CharDevice
        } else if ft.is_fifo() {
            ObjectKind::Fifo
        } else if ft.is_socket() {
            ObjectKind::Socket
        } else {
            ObjectKind::RegularFile
        };

        Self {
            kind,
            size: meta.len(),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: SystemTime::UNIX_EPOCH
                + std::time::Duration::from_secs(meta.ctime().max(0) as u64),
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &fs::Metadata) -> Self {
        let ft = meta.file_type();
        let kind = if ft.is_dir() {
            ObjectKind::Directory
        } else if ft.is_symlink() {
            ObjectKind::Symlink
        } else {
            ObjectKind::RegularFile
        };

        Self {
            kind,
            size: meta.len(),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            perm: if ft.is_dir() { 0o755 } else { 0o644 },
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
        }
    }
}

/// Refcounted handle into one branch's native filesystem
///
/// The handle itself is a plain value; the reference it stands for is
/// owned by the branch filesystem. Holding a `BackingHandle` without a
/// matching acquire is a bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingHandle {
    /// Owning filesystem instance
    pub instance: FilesystemId,
    /// Object identity within the instance
    pub id: u64,
    /// Branch-local location, used for scoped path-context substitution
    pub path: PathBuf,
}

/// Contract between the engine and one branch's native filesystem
///
/// Reference ownership: `root` and a successful `lookup` return a handle
/// already carrying one reference owned by the caller. `acquire` adds a
/// reference and must not block (it may be called under an entry lock);
/// `release` drops one and may deallocate, so it must never be called
/// under a lock.
pub trait BranchFilesystem: Send + Sync {
    /// Identity of this filesystem instance
    fn instance(&self) -> FilesystemId;

    /// Resolve the branch root directory
    fn root(&self) -> Result<BackingHandle>;

    /// Native lookup of `name` inside `dir`
    ///
    /// `Ok(None)` means not found; `Err` is a fault and aborts the
    /// caller's whole resolution.
    fn lookup(&self, dir: &BackingHandle, name: &str) -> Result<Option<BackingHandle>>;

    /// Attributes of a backing object
    fn attributes(&self, object: &BackingHandle) -> Result<ObjectAttributes>;

    /// Instance that actually owns `object`
    ///
    /// Differs from [`instance`](Self::instance) only when the object
    /// crossed a mount boundary inside the branch.
    fn owning_instance(&self, object: &BackingHandle) -> FilesystemId {
        object.instance
    }

    /// Take one additional reference on `object` (non-blocking)
    fn acquire(&self, object: &BackingHandle);

    /// Drop one reference on `object` (may deallocate)
    fn release(&self, object: &BackingHandle);

    /// Whether this branch has a revalidation concept
    fn supports_revalidation(&self) -> bool {
        false
    }

    /// Whether a native lookup could block on I/O
    fn lookup_may_block(&self) -> bool {
        false
    }

    /// Whether a native revalidation could block on I/O
    fn revalidate_may_block(&self) -> bool {
        false
    }

    /// Re-check that `object` still matches branch state
    ///
    /// Called with the caller-visible path context substituted to this
    /// object's branch-local location.
    fn revalidate(&self, object: &BackingHandle, ctx: &PathContext) -> Result<Validity> {
        let _ = (object, ctx);
        Ok(Validity::Valid)
    }

    /// Pin this instance for the lifetime of a mount
    fn pin(&self);

    /// Drop one mount pin
    fn unpin(&self);
}

/// Scope guard holding one reference to a backing object
///
/// Releases the reference on drop, outside any lock the caller takes.
pub struct Retained<'a> {
    fs: &'a dyn BranchFilesystem,
    object: BackingHandle,
}

impl<'a> Retained<'a> {
    /// Take ownership of one already-held reference
    pub fn new(fs: &'a dyn BranchFilesystem, object: BackingHandle) -> Self {
        Self { fs, object }
    }

    pub fn object(&self) -> &BackingHandle {
        &self.object
    }
}

impl Drop for Retained<'_> {
    fn drop(&mut self) {
        self.fs.release(&self.object);
    }
}

impl std::ops::Deref for Retained<'_> {
    type Target = BackingHandle;

    fn deref(&self) -> &BackingHandle {
        &self.object
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Branch backed by a local directory tree
///
/// Handles are plain paths, so acquire/release have nothing to count;
/// the pin counter is kept so mount unwind stays observable.
pub struct DirBranch {
    root: PathBuf,
    instance: FilesystemId,
    pins: AtomicU64,
}

impl DirBranch {
    /// Open a branch rooted at `root`
    ///
    /// The path must name an existing directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = fs::symlink_metadata(&root)
            .map_err(|_| Error::InvalidArgument(format!("unresolvable branch root {:?}", root)))?;
        if !meta.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "branch root {:?} is not a directory",
                root
            )));
        }
        Ok(Self {
            root,
            instance: FilesystemId(NEXT_INSTANCE.fetch_add(1, Ordering::SeqCst)),
            pins: AtomicU64::new(0),
        })
    }

    /// Root path of this branch
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// Current mount pin count
    pub fn pin_count(&self) -> u64 {
        self.pins.load(Ordering::SeqCst)
    }

    fn resolve(&self, branch_local: &Path) -> PathBuf {
        self.root.join(branch_local)
    }

    fn handle_for(&self, branch_local: PathBuf, meta: &fs::Metadata) -> BackingHandle {
        #[cfg(unix)]
        let id = {
            use std::os::unix::fs::MetadataExt;
            meta.ino()
        };
        #[cfg(not(unix))]
        let id = 0;
        let _ = meta;
        BackingHandle {
            instance: self.instance,
            id,
            path: branch_local,
        }
    }
}

impl BranchFilesystem for DirBranch {
    fn instance(&self) -> FilesystemId {
        self.instance
    }

    fn root(&self) -> Result<BackingHandle> {
        let meta = fs::symlink_metadata(&self.root).map_err(Error::Branch)?;
        Ok(self.handle_for(PathBuf::new(), &meta))
    }

    fn lookup(&self, dir: &BackingHandle, name: &str) -> Result<Option<BackingHandle>> {
        let branch_local = dir.path.join(name);
        let resolved = self.resolve(&branch_local);
        match fs::symlink_metadata(&resolved) {
            Ok(meta) => Ok(Some(self.handle_for(branch_local, &meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Branch(e)),
        }
    }

    fn attributes(&self, object: &BackingHandle) -> Result<ObjectAttributes> {
        let meta = fs::symlink_metadata(self.resolve(&object.path)).map_err(Error::Branch)?;
        Ok(ObjectAttributes::from_metadata(&meta))
    }

    fn acquire(&self, _object: &BackingHandle) {}

    fn release(&self, _object: &BackingHandle) {}

    fn supports_revalidation(&self) -> bool {
        true
    }

    fn revalidate(&self, object: &BackingHandle, _ctx: &PathContext) -> Result<Validity> {
        match fs::symlink_metadata(self.resolve(&object.path)) {
            Ok(meta) => {
                #[cfg(unix)]
                let same = {
                    use std::os::unix::fs::MetadataExt;
                    meta.ino() == object.id
                };
                #[cfg(not(unix))]
                let same = true;
                let _ = meta;
                Ok(if same { Validity::Valid } else { Validity::Invalid })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Validity::Invalid),
            Err(e) => Err(Error::Branch(e)),
        }
    }

    fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unpin without matching pin");
    }
}
