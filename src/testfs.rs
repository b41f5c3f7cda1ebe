//! Instrumented in-memory branch filesystem for tests
//!
//! Keeps a ledger of every reference the engine takes so tests can
//! assert exact refcounts, panics on any negative count or access to an
//! unknown object, and lets individual operations be made faulty or
//! blocking.

use crate::branch::{
    BackingHandle, BranchFilesystem, BranchIndex, FilesystemId, ObjectAttributes, ObjectKind,
};
use crate::entry::{BranchPath, Entry};
use crate::error::{Error, Result};
use crate::mount::BranchMount;
use crate::revalidate::{PathContext, Validity};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

static NEXT_FAKE_INSTANCE: AtomicU64 = AtomicU64::new(1000);

struct FakeObject {
    attrs: ObjectAttributes,
    children: HashMap<String, u64>,
    path: PathBuf,
    refs: i64,
}

pub struct FakeBranch {
    instance: FilesystemId,
    objects: Mutex<HashMap<u64, FakeObject>>,
    next_id: AtomicU64,
    pins: AtomicI64,
    supports_revalidation: AtomicBool,
    lookup_may_block: AtomicBool,
    revalidate_may_block: AtomicBool,
    fail_root: AtomicBool,
    fail_lookups: Mutex<HashSet<String>>,
    fail_attributes: Mutex<HashSet<u64>>,
    foreign: Mutex<HashSet<u64>>,
    invalid: Mutex<HashSet<u64>>,
    lookup_calls: AtomicUsize,
    revalidate_calls: AtomicUsize,
    last_revalidate_ctx: Mutex<Option<PathBuf>>,
}

impl FakeBranch {
    pub const ROOT: u64 = 1;

    pub fn new() -> Self {
        let mut objects = HashMap::new();
        objects.insert(
            Self::ROOT,
            FakeObject {
                attrs: ObjectAttributes {
                    kind: ObjectKind::Directory,
                    perm: 0o755,
                    ..Default::default()
                },
                children: HashMap::new(),
                path: PathBuf::new(),
                refs: 0,
            },
        );
        Self {
            instance: FilesystemId(NEXT_FAKE_INSTANCE.fetch_add(1, Ordering::SeqCst)),
            objects: Mutex::new(objects),
            next_id: AtomicU64::new(2),
            pins: AtomicI64::new(0),
            supports_revalidation: AtomicBool::new(true),
            lookup_may_block: AtomicBool::new(false),
            revalidate_may_block: AtomicBool::new(false),
            fail_root: AtomicBool::new(false),
            fail_lookups: Mutex::new(HashSet::new()),
            fail_attributes: Mutex::new(HashSet::new()),
            foreign: Mutex::new(HashSet::new()),
            invalid: Mutex::new(HashSet::new()),
            lookup_calls: AtomicUsize::new(0),
            revalidate_calls: AtomicUsize::new(0),
            last_revalidate_ctx: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> FilesystemId {
        self.instance
    }

    fn insert(&self, parent: u64, name: &str, attrs: ObjectAttributes) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock();
        let parent_path = objects
            .get(&parent)
            .unwrap_or_else(|| panic!("unknown parent object {}", parent))
            .path
            .clone();
        objects.insert(
            id,
            FakeObject {
                attrs,
                children: HashMap::new(),
                path: parent_path.join(name),
                refs: 0,
            },
        );
        objects
            .get_mut(&parent)
            .unwrap()
            .children
            .insert(name.to_string(), id);
        id
    }

    pub fn file(&self, parent: u64, name: &str, size: u64) -> u64 {
        self.insert(
            parent,
            name,
            ObjectAttributes {
                size,
                ..Default::default()
            },
        )
    }

    pub fn dir(&self, parent: u64, name: &str) -> u64 {
        self.insert(
            parent,
            name,
            ObjectAttributes {
                kind: ObjectKind::Directory,
                perm: 0o755,
                ..Default::default()
            },
        )
    }

    pub fn device(&self, parent: u64, name: &str, kind: ObjectKind, rdev: u64) -> u64 {
        self.insert(
            parent,
            name,
            ObjectAttributes {
                kind,
                rdev,
                ..Default::default()
            },
        )
    }

    pub fn whiteout(&self, parent: u64, name: &str) -> u64 {
        self.file(parent, &format!(".wh.{}", name), 0)
    }

    /// Construct a handle for `id`, taking one reference
    pub fn handle(&self, id: u64) -> BackingHandle {
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(&id)
            .unwrap_or_else(|| panic!("handle for unknown object {}", id));
        object.refs += 1;
        BackingHandle {
            instance: self.instance,
            id,
            path: object.path.clone(),
        }
    }

    pub fn root_handle(&self) -> BackingHandle {
        self.handle(Self::ROOT)
    }

    pub fn refcount(&self, id: u64) -> i64 {
        self.objects.lock().get(&id).map(|o| o.refs).unwrap_or(0)
    }

    /// Every non-root object must be back at zero references
    pub fn assert_balanced(&self) {
        let objects = self.objects.lock();
        for (id, object) in objects.iter() {
            if *id == Self::ROOT {
                continue;
            }
            assert_eq!(
                object.refs, 0,
                "object {} ({:?}) still holds {} reference(s)",
                id, object.path, object.refs
            );
        }
    }

    pub fn pin_count(&self) -> i64 {
        self.pins.load(Ordering::SeqCst)
    }

    pub fn fail_root(&self) {
        self.fail_root.store(true, Ordering::SeqCst);
    }

    pub fn fail_lookup_of(&self, name: &str) {
        self.fail_lookups.lock().insert(name.to_string());
    }

    pub fn fail_attributes_of(&self, id: u64) {
        self.fail_attributes.lock().insert(id);
    }

    pub fn mark_foreign(&self, id: u64) {
        self.foreign.lock().insert(id);
    }

    pub fn invalidate(&self, id: u64) {
        self.invalid.lock().insert(id);
    }

    pub fn set_supports_revalidation(&self, value: bool) {
        self.supports_revalidation.store(value, Ordering::SeqCst);
    }

    pub fn set_lookup_may_block(&self, value: bool) {
        self.lookup_may_block.store(value, Ordering::SeqCst);
    }

    pub fn set_revalidate_may_block(&self, value: bool) {
        self.revalidate_may_block.store(value, Ordering::SeqCst);
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    pub fn revalidate_calls(&self) -> usize {
        self.revalidate_calls.load(Ordering::SeqCst)
    }

    pub fn last_revalidate_ctx(&self) -> Option<PathBuf> {
        self.last_revalidate_ctx.lock().clone()
    }

    fn fault(message: &str) -> Error {
        Error::Branch(io::Error::new(io::ErrorKind::Other, message.to_string()))
    }
}

impl BranchFilesystem for FakeBranch {
    fn instance(&self) -> FilesystemId {
        self.instance
    }

    fn root(&self) -> Result<BackingHandle> {
        if self.fail_root.load(Ordering::SeqCst) {
            return Err(Self::fault("injected root fault"));
        }
        Ok(self.root_handle())
    }

    fn lookup(&self, dir: &BackingHandle, name: &str) -> Result<Option<BackingHandle>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.lock().contains(name) {
            return Err(Self::fault("injected lookup fault"));
        }
        let child = {
            let objects = self.objects.lock();
            let parent = objects
                .get(&dir.id)
                .unwrap_or_else(|| panic!("lookup in unknown directory {}", dir.id));
            parent.children.get(name).copied()
        };
        Ok(child.map(|id| self.handle(id)))
    }

    fn attributes(&self, object: &BackingHandle) -> Result<ObjectAttributes> {
        if self.fail_attributes.lock().contains(&object.id) {
            return Err(Self::fault("injected attribute fault"));
        }
        let objects = self.objects.lock();
        let obj = objects
            .get(&object.id)
            .unwrap_or_else(|| panic!("attributes of unknown object {}", object.id));
        Ok(obj.attrs.clone())
    }

    fn owning_instance(&self, object: &BackingHandle) -> FilesystemId {
        if self.foreign.lock().contains(&object.id) {
            FilesystemId(object.instance.0 + 0x10000)
        } else {
            object.instance
        }
    }

    fn acquire(&self, object: &BackingHandle) {
        let mut objects = self.objects.lock();
        let obj = objects
            .get_mut(&object.id)
            .unwrap_or_else(|| panic!("acquire of unknown object {}", object.id));
        obj.refs += 1;
    }

    fn release(&self, object: &BackingHandle) {
        let mut objects = self.objects.lock();
        let obj = objects
            .get_mut(&object.id)
            .unwrap_or_else(|| panic!("release of unknown object {}", object.id));
        obj.refs -= 1;
        assert!(
            obj.refs >= 0,
            "object {} refcount went negative",
            object.id
        );
    }

    fn supports_revalidation(&self) -> bool {
        self.supports_revalidation.load(Ordering::SeqCst)
    }

    fn lookup_may_block(&self) -> bool {
        self.lookup_may_block.load(Ordering::SeqCst)
    }

    fn revalidate_may_block(&self) -> bool {
        self.revalidate_may_block.load(Ordering::SeqCst)
    }

    fn revalidate(&self, object: &BackingHandle, ctx: &PathContext) -> Result<Validity> {
        self.revalidate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_revalidate_ctx.lock() = Some(ctx.path().to_path_buf());
        if self.invalid.lock().contains(&object.id) {
            return Ok(Validity::Invalid);
        }
        if self.objects.lock().contains_key(&object.id) {
            Ok(Validity::Valid)
        } else {
            Ok(Validity::Invalid)
        }
    }

    fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "unpin without matching pin");
    }
}

/// Two fake branches wrapped as mount records
pub fn fake_pair() -> (Arc<FakeBranch>, Arc<FakeBranch>, [BranchMount; 2]) {
    let left = Arc::new(FakeBranch::new());
    let right = Arc::new(FakeBranch::new());
    let branches = [
        BranchMount {
            fs: left.clone(),
            root: left.root_handle(),
        },
        BranchMount {
            fs: right.clone(),
            root: right.root_handle(),
        },
    ];
    (left, right, branches)
}

/// Fake pair plus a parent entry seeded with both branch roots
pub fn fake_union() -> (Arc<FakeBranch>, Arc<FakeBranch>, [BranchMount; 2], Entry) {
    let (left, right, branches) = fake_pair();
    let root = Entry::new("");
    for branch in BranchIndex::ALL {
        let bm = &branches[branch.slot()];
        let fake: &FakeBranch = if branch == BranchIndex::Left {
            &left
        } else {
            &right
        };
        let displaced = root.cache().set(
            branch,
            Some(BranchPath {
                branch,
                object: fake.root_handle(),
                mount: bm.fs.instance(),
            }),
        );
        assert!(displaced.is_none());
    }
    (left, right, branches, root)
}
