//! Framework-element tree: a hierarchical, multi-parent name tree with a
//! shared registry lock (component C).
//!
//! Ownership follows the spec literally: each element is owned by its
//! *primary* parent (a strong [`FrameworkElement`] in `children`), while the
//! reverse pointer is a `Weak` so the tree never cycles. Secondary links
//! (name-only, non-owning) are stored the same way, per the "Multi-parent
//! tree & secondary links" design note in spec §9: a small adjacency list on
//! each element plus reverse entries on its link targets.

use df_error::{CoreError, CoreResult};
use df_handle::{FrameworkElementRegister, Handle};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Bit 0-1 of the flags word hold the lifecycle state; bits above that are
/// free for generic role/policy markers (spec §3: "flags (bitfield covering
/// role, lifecycle, and policy bits)").
mod flags {
    pub const LIFECYCLE_MASK: u32 = 0b11;
    pub const LIFECYCLE_CONSTRUCTED: u32 = 0;
    pub const LIFECYCLE_INITIALIZING: u32 = 1;
    pub const LIFECYCLE_INITIALIZED: u32 = 2;
    pub const LIFECYCLE_PREPARED_FOR_DELETION: u32 = 3;
    // Deleted is tracked out-of-band (see `ElementInner::deleted`): the
    // lifecycle value space above only has room for four states and
    // PreparedForDeletion/Deleted must remain distinguishable mid-transition.

    /// Marks a finstructable group (spec §4.G: `GetParentWithFlags` walks up
    /// to find the enclosing group for outer-parameter attachment).
    pub const FINSTRUCTABLE_GROUP: u32 = 1 << 2;
}

/// Lifecycle states in strict, one-way order (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Constructed,
    Initializing,
    Initialized,
    PreparedForDeletion,
    Deleted,
}

struct ElementInner {
    /// Raw `Handle` bits. Atomic rather than plain `Handle` because the
    /// real handle is only known once this element has been registered —
    /// by then an `Arc` clone already lives inside the register, so it
    /// can no longer be mutated through `Arc::get_mut`.
    handle: AtomicU32,
    name: String,
    flags: AtomicU32,
    deleted: AtomicU32, // 0 = alive, 1 = fully deleted (separates PreparedForDeletion from Deleted)
    tree: Arc<TreeShared>,
    parent: RwLock<Option<Weak<ElementInner>>>,
    children: RwLock<Vec<FrameworkElement>>,
    link_parents: RwLock<Vec<Weak<ElementInner>>>,
    link_children: RwLock<Vec<Weak<ElementInner>>>,
    annotations: RwLock<Vec<Arc<dyn Any + Send + Sync>>>,
    delete_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    prepare_delete_listeners: Mutex<Vec<Arc<dyn TreeListener>>>,
}

/// Notified once, in `ManagedDelete`'s first invocation, before the subtree
/// is detached (spec §4.C: "publishes prepare-deletion to listeners").
pub trait TreeListener: Send + Sync {
    fn on_prepare_delete(&self, element: &FrameworkElement);
}

/// A node in the framework-element tree. Cheap to clone (an `Arc` bump);
/// this is the handle application code passes around.
#[derive(Clone)]
pub struct FrameworkElement(Arc<ElementInner>);

impl PartialEq for FrameworkElement {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for FrameworkElement {}

struct TreeShared {
    register: FrameworkElementRegister<FrameworkElement>,
    /// The single process-wide registry mutex (spec §5): guards register
    /// add/remove, edge mutation, port-creation-list reconciliation, and
    /// structure-parameter attachment. Re-exposed per element via
    /// [`FrameworkElement::registry_lock`] even though it is one shared
    /// lock underneath.
    lock: RwLock<()>,
}

/// The framework-element tree, rooted at a process-wide "runtime
/// environment" element that owns all orphans (spec §3).
#[derive(Clone)]
pub struct Tree {
    shared: Arc<TreeShared>,
    root: FrameworkElement,
}

impl Tree {
    pub fn new() -> Self {
        let shared = Arc::new(TreeShared {
            register: FrameworkElementRegister::new(),
            lock: RwLock::new(()),
        });
        let root = FrameworkElement::new_root(shared.clone());
        Tree { shared, root }
    }

    pub fn root(&self) -> &FrameworkElement {
        &self.root
    }

    /// Looks up a live element by handle. A stale handle (the slot has
    /// since been recycled) returns `None` — expected and safe (spec §4.B).
    pub fn get(&self, handle: Handle) -> Option<FrameworkElement> {
        self.shared.register.get(handle)
    }

    pub fn live_count(&self) -> usize {
        self.shared.register.live_count()
    }

    /// Creates a new element as a child of `parent`. `parent` must not be
    /// deleted or already past its own deletion preparation. The new
    /// element starts in [`Lifecycle::Constructed`].
    pub fn create_child(
        &self,
        parent: &FrameworkElement,
        name: impl Into<String>,
        is_port: bool,
    ) -> CoreResult<FrameworkElement> {
        FrameworkElement::create(self.shared.clone(), parent, name, is_port)
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameworkElement {
    fn new_root(shared: Arc<TreeShared>) -> Self {
        let inner = Arc::new(ElementInner {
            handle: AtomicU32::new(0),
            name: "RuntimeEnvironment".to_string(),
            flags: AtomicU32::new(flags::LIFECYCLE_INITIALIZED),
            deleted: AtomicU32::new(0),
            tree: shared,
            parent: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            link_parents: RwLock::new(Vec::new()),
            link_children: RwLock::new(Vec::new()),
            annotations: RwLock::new(Vec::new()),
            delete_hooks: Mutex::new(Vec::new()),
            prepare_delete_listeners: Mutex::new(Vec::new()),
        });
        FrameworkElement(inner)
    }

    fn create(
        shared: Arc<TreeShared>,
        parent: &FrameworkElement,
        name: impl Into<String>,
        is_port: bool,
    ) -> CoreResult<FrameworkElement> {
        let name = name.into();
        if parent.lifecycle() == Lifecycle::PreparedForDeletion
            || parent.lifecycle() == Lifecycle::Deleted
        {
            return Err(CoreError::policy_violation(
                "cannot add a child to an element that is being or has been deleted",
            )
            .with_context(parent.qualified_name()));
        }

        let inner = Arc::new(ElementInner {
            handle: AtomicU32::new(0), // replaced once registered below
            name,
            flags: AtomicU32::new(flags::LIFECYCLE_CONSTRUCTED),
            deleted: AtomicU32::new(0),
            tree: shared.clone(),
            parent: RwLock::new(Some(Arc::downgrade(&parent.0))),
            children: RwLock::new(Vec::new()),
            link_parents: RwLock::new(Vec::new()),
            link_children: RwLock::new(Vec::new()),
            annotations: RwLock::new(Vec::new()),
            delete_hooks: Mutex::new(Vec::new()),
            prepare_delete_listeners: Mutex::new(Vec::new()),
        });
        let element = FrameworkElement(inner);

        let _guard = shared.lock.write();
        let handle = shared.register.add(element.clone(), is_port)?;
        // The register now holds a clone of the same `Arc`, so storing the
        // handle through the atomic is visible through both.
        element.0.handle.store(handle.raw(), Ordering::Release);
        parent.0.children.write().push(element.clone());

        tracing::debug!(
            target: "df.tree",
            %handle,
            name = %element.0.name,
            is_port,
            "element created"
        );
        Ok(element)
    }

    pub fn handle(&self) -> Handle {
        Handle::from_raw(self.0.handle.load(Ordering::Acquire))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_port(&self) -> bool {
        self.handle().is_port()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.0.deleted.load(Ordering::Acquire) != 0 {
            return Lifecycle::Deleted;
        }
        match self.0.flags.load(Ordering::Acquire) & flags::LIFECYCLE_MASK {
            flags::LIFECYCLE_CONSTRUCTED => Lifecycle::Constructed,
            flags::LIFECYCLE_INITIALIZING => Lifecycle::Initializing,
            flags::LIFECYCLE_INITIALIZED => Lifecycle::Initialized,
            _ => Lifecycle::PreparedForDeletion,
        }
    }

    fn set_lifecycle_bits(&self, value: u32) {
        let mut word = self.0.flags.load(Ordering::Acquire);
        loop {
            let new_word = (word & !flags::LIFECYCLE_MASK) | value;
            match self.0.flags.compare_exchange_weak(
                word,
                new_word,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => word = observed,
            }
        }
    }

    pub fn is_finstructable_group(&self) -> bool {
        self.0.flags.load(Ordering::Acquire) & flags::FINSTRUCTABLE_GROUP != 0
    }

    pub fn mark_finstructable_group(&self) {
        self.0
            .flags
            .fetch_or(flags::FINSTRUCTABLE_GROUP, Ordering::AcqRel);
    }

    /// The tree-wide registry mutex, re-exposed per element (spec §4.C:
    /// "a per-element registry lock (actually the tree-wide lock
    /// re-exposed)").
    pub fn registry_lock(&self) -> &RwLock<()> {
        &self.0.tree.lock
    }

    pub fn parent(&self) -> Option<FrameworkElement> {
        self.0
            .parent
            .read()
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(FrameworkElement)
    }

    pub fn children(&self) -> Vec<FrameworkElement> {
        self.0.children.read().clone()
    }

    pub fn ports(&self) -> Vec<FrameworkElement> {
        self.children()
            .into_iter()
            .filter(|c| c.is_port())
            .collect()
    }

    /// Recursively visits every descendant (not including `self`).
    pub fn descendants(&self) -> Vec<FrameworkElement> {
        let mut out = Vec::new();
        let mut stack = self.children();
        while let Some(next) = stack.pop() {
            stack.extend(next.children());
            out.push(next);
        }
        out
    }

    pub fn is_child_of(&self, other: &FrameworkElement) -> bool {
        let mut cur = self.parent();
        while let Some(p) = cur {
            if p == *other {
                return true;
            }
            cur = p.parent();
        }
        false
    }

    /// Walks up the chain of finstructable-group-flagged ancestors and
    /// returns the nearest one, if any (spec §4.G "outer attachment").
    pub fn parent_finstructable_group(&self) -> Option<FrameworkElement> {
        let mut cur = self.parent();
        while let Some(p) = cur {
            if p.is_finstructable_group() {
                return Some(p);
            }
            cur = p.parent();
        }
        None
    }

    pub fn qualified_name(&self) -> String {
        let mut segments = vec![self.0.name.clone()];
        let mut cur = self.parent();
        while let Some(p) = cur {
            if p.parent().is_none() {
                break; // stop at (but don't include) the root
            }
            segments.push(p.0.name.clone());
            cur = p.parent();
        }
        segments.reverse();
        segments.join(".")
    }

    /// Adds a secondary (name-only, non-owning) link from `self` into
    /// `link_parent`'s subtree.
    pub fn add_link(&self, link_parent: &FrameworkElement) {
        self.0
            .link_parents
            .write()
            .push(Arc::downgrade(&link_parent.0));
        link_parent
            .0
            .link_children
            .write()
            .push(Arc::downgrade(&self.0));
    }

    pub fn qualified_link(&self) -> String {
        let link_parent = self
            .0
            .link_parents
            .read()
            .iter()
            .find_map(|w| w.upgrade())
            .map(FrameworkElement);
        match link_parent {
            Some(p) => format!("{}.{}", p.qualified_link(), self.0.name),
            None => self.qualified_name(),
        }
    }

    /// Attaches a typed, heterogeneous annotation (spec §3: "annotation
    /// chain"). Used e.g. by `df-structure` to stash a parameter list on a
    /// finstructable group.
    pub fn add_annotation<T: Any + Send + Sync>(&self, value: T) {
        self.0.annotations.write().push(Arc::new(value));
    }

    pub fn annotation<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0
            .annotations
            .read()
            .iter()
            .find_map(|a| a.clone().downcast::<T>().ok())
    }

    /// Returns the existing annotation of type `T`, or creates one with
    /// `make` and attaches it first.
    pub fn annotation_or_create<T: Any + Send + Sync>(&self, make: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.annotation::<T>() {
            return existing;
        }
        let created = Arc::new(make());
        self.0.annotations.write().push(created.clone());
        created
    }

    /// Registers subclass cleanup to run once, during the first
    /// `managed_delete` call, before the element is detached from the tree
    /// (spec §4.C: "invokes subclass cleanup").
    pub fn on_delete(&self, hook: impl FnOnce() + Send + 'static) {
        self.0.delete_hooks.lock().push(Box::new(hook));
    }

    pub fn add_prepare_delete_listener(&self, listener: Arc<dyn TreeListener>) {
        self.0.prepare_delete_listeners.lock().push(listener);
    }

    /// Drives `Constructed -> Initializing -> Initialized` through this
    /// element and every descendant. Re-entrant: already-initialized
    /// subtrees are skipped (spec §4.C: "re-entry is a no-op").
    pub fn init(&self) {
        if self.lifecycle() != Lifecycle::Constructed {
            return;
        }
        self.set_lifecycle_bits(flags::LIFECYCLE_INITIALIZING);
        self.set_lifecycle_bits(flags::LIFECYCLE_INITIALIZED);
        tracing::debug!(target: "df.tree", handle = %self.handle(), name = %self.0.name, "element initialized");
        for child in self.children() {
            child.init();
        }
    }

    /// Idempotent teardown: the first call publishes prepare-deletion to
    /// listeners, runs subclass cleanup, detaches from parents/links,
    /// recursively prepares the subtree, then removes this element from
    /// the register. A handle lookup that raced this call either observes
    /// the element (possibly already `PreparedForDeletion`) or gets
    /// not-found — never a half-torn element (spec §4.C contract).
    pub fn managed_delete(&self) {
        if self.lifecycle() == Lifecycle::PreparedForDeletion
            || self.lifecycle() == Lifecycle::Deleted
        {
            return;
        }
        self.set_lifecycle_bits(flags::LIFECYCLE_PREPARED_FOR_DELETION);

        for listener in self.0.prepare_delete_listeners.lock().drain(..) {
            listener.on_prepare_delete(self);
        }
        for hook in self.0.delete_hooks.lock().drain(..) {
            hook();
        }

        self.detach_from_tree();

        for child in self.children() {
            child.managed_delete();
        }

        let _guard = self.0.tree.lock.write();
        self.0.tree.register.remove(self.handle());
        self.0.deleted.store(1, Ordering::Release);
        tracing::debug!(target: "df.tree", handle = %self.handle(), name = %self.0.name, "element deleted");
    }

    fn detach_from_tree(&self) {
        if let Some(parent) = self.parent() {
            parent.0.children.write().retain(|c| c != self);
        }
        for link_parent in self.0.link_parents.write().drain(..).collect::<Vec<_>>() {
            if let Some(lp) = link_parent.upgrade() {
                lp.link_children.write().retain(|w| {
                    w.upgrade()
                        .map(|e| !Arc::ptr_eq(&e, &self.0))
                        .unwrap_or(false)
                });
            }
        }
        self.0.link_parents.write().clear();
    }
}

impl std::fmt::Debug for FrameworkElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameworkElement")
            .field("handle", &self.handle())
            .field("name", &self.0.name)
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
