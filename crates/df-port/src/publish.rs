//! Port publishing engine (component E): edges, push/pull strategy,
//! current-value installation, and queued delivery.
//!
//! Grounded in `tPortBase.cpp`'s `Publish`/`PullValueRawImpl`/
//! `InitialPushTo`/`NotifyDisconnect` — the pull-chain walk, the
//! initial-value handshake on connect, and revert-to-default on disconnect
//! all mirror that file's control flow. The original's `tPublishCache`
//! batches reference-count increments to avoid one atomic RMW per consumer;
//! `Arc::clone` already performs exactly that one atomic op per reference,
//! so [`PublishCache`] here is kept as lock-estimate bookkeeping for parity
//! with the protocol's shape rather than as a raw-pointer batching trick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use df_error::{CoreError, CoreResult};
use df_handle::Handle;
use df_tree::{FrameworkElement, Tree};
use df_types::TypeDescriptor;
use parking_lot::{Mutex, RwLock};

use crate::pool::{PooledValue, UniTypePool};

/// Process-wide counters, useful for tests and for anyone wiring up
/// observability on top of the engine.
pub mod telemetry {
    use super::AtomicU64;

    pub static PUBLISH_COUNT: AtomicU64 = AtomicU64::new(0);
    pub static PULL_COUNT: AtomicU64 = AtomicU64::new(0);
    pub static LOCK_ESTIMATE_MISSES: AtomicU64 = AtomicU64::new(0);
    pub static BUFFERS_RECYCLED: AtomicU64 = AtomicU64::new(0);
}

/// How a delivered value relates to what the receiver already held (spec
/// §4.E): steady-state changes are distinguished from the one-shot value a
/// port gets when an edge is first wired up, so listeners and queue
/// consumers can tell "this is new" from "this is just catching you up".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    None,
    Changed,
    ChangedInitial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Output,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Strategy {
    Push = 0,
    PullOnDemand = 1,
    None = 2,
}

impl Strategy {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Strategy::Push,
            1 => Strategy::PullOnDemand,
            _ => Strategy::None,
        }
    }
}

/// Port construction-time options (spec §4.E `PortCreateFlags`).
#[derive(Debug, Clone, Copy, Default)]
pub struct PortFlags {
    pub output: bool,
    pub has_queue: bool,
    pub default_on_disconnect: bool,
    /// Never pushes on publish; downstream must `pull` it.
    pub pull_only: bool,
}

/// Reacts to values landing on a port, after the port's own state has
/// already been updated.
pub trait PortListener: Send + Sync {
    fn on_port_change(&self, port: &AbstractPort, change: ChangeKind);
}

/// Answers a pull request for a port that has no incoming edge of its own —
/// e.g. a port computing its value on demand rather than storing one.
pub trait PullRequestHandler: Send + Sync {
    fn pull_request(&self, origin: &AbstractPort, intermediate_assign: bool)
        -> Option<Arc<PooledValue>>;
}

/// Bookkeeping mirroring `tPublishCache`'s reference protocol. `set_locks`
/// tracks how many `Arc` clones have actually been handed out against an
/// up-front `lock_estimate`; exceeding the estimate is recorded but never a
/// correctness problem since each clone is independently reference-counted.
struct PublishCache {
    lock_estimate: u32,
    set_locks: u32,
}

impl PublishCache {
    fn new(lock_estimate: u32) -> Self {
        Self {
            lock_estimate,
            set_locks: 0,
        }
    }

    fn add_lock(&mut self) {
        self.set_locks += 1;
        if self.set_locks > self.lock_estimate {
            telemetry::LOCK_ESTIMATE_MISSES.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct PortInner {
    tree: Tree,
    data_type: Arc<dyn TypeDescriptor>,
    direction: Direction,
    pull_only: bool,
    default_on_disconnect: AtomicBool,
    pool: Arc<UniTypePool>,
    current: ArcSwapOption<PooledValue>,
    default_value: Arc<PooledValue>,
    edges_out: RwLock<Vec<Handle>>,
    edges_in: RwLock<Vec<Handle>>,
    queue: Mutex<Option<VecDeque<Arc<PooledValue>>>>,
    max_queue_len: AtomicUsize,
    pull_request_handler: RwLock<Option<Arc<dyn PullRequestHandler>>>,
    listeners: RwLock<Vec<Arc<dyn PortListener>>>,
    strategy: AtomicU8,
}

/// A port: a [`df_tree::FrameworkElement`] (for tree membership, lifecycle,
/// and deletion) composed with publish/pull state attached as an
/// annotation. Composition, not a `FrameworkElement` subtype — mirrors the
/// "no open class hierarchy outside the user-visible interfaces" design
/// note (spec §9).
#[derive(Clone)]
pub struct AbstractPort {
    element: FrameworkElement,
    inner: Arc<PortInner>,
}

impl AbstractPort {
    /// Creates a new port as a child of `parent` and wires up its buffer
    /// pool and default value. The default value is whatever
    /// `data_type.create_default()` returns — held for the lifetime of the
    /// port so `notify_disconnect` has something to revert to.
    pub fn create(
        tree: &Tree,
        parent: &FrameworkElement,
        name: impl Into<String>,
        data_type: Arc<dyn TypeDescriptor>,
        flags: PortFlags,
    ) -> CoreResult<AbstractPort> {
        let element = tree.create_child(parent, name, true)?;
        let pool = UniTypePool::new();
        let default_value = {
            let dt = data_type.clone();
            pool.get_unused(move || dt.create_default())
        };
        let inner = Arc::new(PortInner {
            tree: tree.clone(),
            data_type,
            direction: if flags.output {
                Direction::Output
            } else {
                Direction::Input
            },
            pull_only: flags.pull_only,
            default_on_disconnect: AtomicBool::new(flags.default_on_disconnect),
            pool,
            current: ArcSwapOption::new(Some(default_value.clone())),
            default_value,
            edges_out: RwLock::new(Vec::new()),
            edges_in: RwLock::new(Vec::new()),
            queue: Mutex::new(flags.has_queue.then(VecDeque::new)),
            max_queue_len: AtomicUsize::new(if flags.has_queue { 16 } else { 0 }),
            pull_request_handler: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            strategy: AtomicU8::new(Strategy::None as u8),
        });
        element.add_annotation(inner.clone());

        let hook_element = element.clone();
        let hook_inner = inner.clone();
        element.on_delete(move || {
            let port = AbstractPort {
                element: hook_element,
                inner: hook_inner,
            };
            port.disconnect_all();
        });

        tracing::debug!(
            target: "df.port.publish",
            handle = %element.handle(),
            name = %element.name(),
            "port created"
        );
        Ok(AbstractPort { element, inner })
    }

    /// Recovers the `AbstractPort` view of a `FrameworkElement` previously
    /// created via [`AbstractPort::create`], or `None` if it isn't a port.
    pub fn from_element(element: FrameworkElement) -> Option<AbstractPort> {
        // `add_annotation` wraps its argument in its own `Arc`, so the
        // annotation's concrete type is `Arc<PortInner>` (what we stored),
        // not `PortInner` itself — downcast to that, then unwrap one layer.
        let boxed = element.annotation::<Arc<PortInner>>()?;
        let inner = (*boxed).clone();
        Some(AbstractPort { element, inner })
    }

    pub fn handle(&self) -> Handle {
        self.element.handle()
    }

    pub fn element(&self) -> &FrameworkElement {
        &self.element
    }

    pub fn data_type(&self) -> &Arc<dyn TypeDescriptor> {
        &self.inner.data_type
    }

    pub fn is_output(&self) -> bool {
        self.inner.direction == Direction::Output
    }

    pub fn strategy(&self) -> Strategy {
        Strategy::from_u8(self.inner.strategy.load(Ordering::Relaxed))
    }

    pub fn set_max_queue_length(&self, len: usize) {
        self.inner.max_queue_len.store(len.max(1), Ordering::Relaxed);
    }

    pub fn set_pull_request_handler(&self, handler: Arc<dyn PullRequestHandler>) {
        *self.inner.pull_request_handler.write() = Some(handler);
    }

    pub fn add_listener(&self, listener: Arc<dyn PortListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// A fresh buffer drawn from this port's pool, ready to be filled and
    /// handed to [`AbstractPort::publish`].
    pub fn get_unused_buffer(&self) -> Arc<PooledValue> {
        let dt = self.inner.data_type.clone();
        self.inner.pool.get_unused(move || dt.create_default())
    }

    /// The port's current value: whatever was last assigned, or the type's
    /// default if nothing ever was.
    pub fn current(&self) -> Arc<PooledValue> {
        self.inner
            .current
            .load_full()
            .unwrap_or_else(|| self.inner.default_value.clone())
    }

    fn resolve(&self, handle: Handle) -> Option<AbstractPort> {
        self.inner.tree.get(handle).and_then(AbstractPort::from_element)
    }

    /// The ports this port currently pushes to (spec §3 "Edge"). A stale
    /// edge handle (the target was deleted without going through
    /// `disconnect`) is silently skipped rather than surfaced — the same
    /// "resolve or treat as gone" contract `resolve` gives every other
    /// handle lookup in this engine.
    pub fn outgoing_edges(&self) -> Vec<AbstractPort> {
        self.inner
            .edges_out
            .read()
            .iter()
            .filter_map(|h| self.resolve(*h))
            .collect()
    }

    /// Wires `self -> other` (push direction). Rejects a type mismatch
    /// outright rather than leaving either side half-connected.
    pub fn connect(&self, other: &AbstractPort) -> CoreResult<()> {
        if self.inner.data_type.uid() != other.inner.data_type.uid() {
            return Err(CoreError::policy_violation(format!(
                "cannot connect port of type `{}` to port of type `{}`",
                self.inner.data_type.name(),
                other.inner.data_type.name()
            ))
            .with_context(self.element.qualified_name()));
        }
        {
            let _guard = self.element.registry_lock().write();
            self.inner.edges_out.write().push(other.handle());
            other.inner.edges_in.write().push(self.handle());
        }
        self.recompute_strategy();
        other.recompute_strategy();
        self.initial_push_to(other);
        tracing::debug!(
            target: "df.port.publish",
            from = %self.element.qualified_name(),
            to = %other.element.qualified_name(),
            "edge connected"
        );
        Ok(())
    }

    /// Removes the `self -> other` edge. `other` reverts to its default
    /// value if it was created with `default_on_disconnect`.
    pub fn disconnect(&self, other: &AbstractPort) {
        {
            let _guard = self.element.registry_lock().write();
            self.inner.edges_out.write().retain(|h| *h != other.handle());
            other.inner.edges_in.write().retain(|h| *h != self.handle());
        }
        self.recompute_strategy();
        other.recompute_strategy();
        other.notify_disconnect();
    }

    fn disconnect_all(&self) {
        let outs: Vec<Handle> = self.inner.edges_out.read().clone();
        for h in outs {
            if let Some(peer) = self.resolve(h) {
                self.disconnect(&peer);
            }
        }
        let ins: Vec<Handle> = self.inner.edges_in.read().clone();
        for h in ins {
            if let Some(peer) = self.resolve(h) {
                peer.disconnect(self);
            }
        }
    }

    fn notify_disconnect(&self) {
        if self.inner.default_on_disconnect.load(Ordering::Acquire) {
            let default = self.inner.default_value.clone();
            self.publish(default);
        }
    }

    /// Installs `value` as current and forwards it to every downstream edge
    /// (spec §4.E `Publish`). Edge fan-out is snapshotted up front — a
    /// concurrent connect/disconnect sees either the full old set or the
    /// full new one, never a half-updated one.
    pub fn publish(&self, value: Arc<PooledValue>) {
        self.assign(value.clone(), ChangeKind::Changed);
        let targets: Vec<Handle> = self.inner.edges_out.read().clone();
        let mut cache = PublishCache::new(targets.len() as u32);
        for handle in targets {
            if let Some(target) = self.resolve(handle) {
                cache.add_lock();
                target.receive(value.clone(), ChangeKind::Changed);
            }
        }
        telemetry::PUBLISH_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    fn receive(&self, value: Arc<PooledValue>, change: ChangeKind) {
        self.assign(value, change);
    }

    fn assign(&self, value: Arc<PooledValue>, change: ChangeKind) {
        self.inner.current.store(Some(value.clone()));
        if let Some(queue) = self.inner.queue.lock().as_mut() {
            queue.push_back(value);
            let max = self.inner.max_queue_len.load(Ordering::Relaxed).max(1);
            while queue.len() > max {
                queue.pop_front();
                telemetry::BUFFERS_RECYCLED.fetch_add(1, Ordering::Relaxed);
            }
        }
        if change != ChangeKind::None {
            for listener in self.inner.listeners.read().iter() {
                listener.on_port_change(self, change);
            }
        }
    }

    /// Delivers the current value to `target` once, tagged
    /// [`ChangeKind::ChangedInitial`] so it can tell a newly-wired edge's
    /// catch-up value apart from a genuine change (spec §4.E
    /// `InitialPushTo`).
    pub fn initial_push_to(&self, target: &AbstractPort) {
        let value = self.current();
        target.receive(value, ChangeKind::ChangedInitial);
    }

    /// Drains and returns everything queued since the last call. Ports
    /// without a queue always return an empty vec.
    pub fn dequeue_all(&self) -> Vec<Arc<PooledValue>> {
        match self.inner.queue.lock().as_mut() {
            Some(q) => q.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Walks back along the (single) incoming edge to find a value,
    /// consulting a [`PullRequestHandler`] first if one is set, adopting
    /// the value into every port walked through when `intermediate_assign`
    /// is set (spec §4.E `Pull`, grounded in `PullValueRawImpl`).
    pub fn pull(&self, intermediate_assign: bool) -> Arc<PooledValue> {
        telemetry::PULL_COUNT.fetch_add(1, Ordering::Relaxed);
        self.pull_impl(intermediate_assign, true)
    }

    fn pull_impl(&self, intermediate_assign: bool, first: bool) -> Arc<PooledValue> {
        if !first {
            let handler = self.inner.pull_request_handler.read().clone();
            if let Some(handler) = handler {
                if let Some(value) = handler.pull_request(self, intermediate_assign) {
                    self.assign(value.clone(), ChangeKind::Changed);
                    return value;
                }
            }
        }
        let sources: Vec<Handle> = self.inner.edges_in.read().clone();
        if let Some(source) = sources.first().and_then(|h| self.resolve(*h)) {
            let value = source.pull_impl(intermediate_assign, false);
            if first || intermediate_assign {
                self.assign(value.clone(), ChangeKind::Changed);
            }
            return value;
        }
        self.current()
    }

    /// Pulls from `self` and publishes the result to `other` — the
    /// one-shot "forward this value downstream" operation used by
    /// `df-structure` when reconciling port-creation lists.
    pub fn forward(&self, other: &AbstractPort) {
        let value = self.pull(false);
        other.publish(value);
    }

    fn recompute_strategy(&self) {
        let has_downstream = !self.inner.edges_out.read().is_empty();
        let strategy = if self.inner.pull_only {
            if has_downstream {
                Strategy::PullOnDemand
            } else {
                Strategy::None
            }
        } else if has_downstream {
            Strategy::Push
        } else {
            Strategy::None
        };
        self.inner.strategy.store(strategy as u8, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for AbstractPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbstractPort")
            .field("handle", &self.element.handle())
            .field("name", &self.element.name())
            .field("strategy", &self.strategy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct Counter {
        name: &'static str,
        uid: u64,
    }

    impl TypeDescriptor for Counter {
        fn name(&self) -> &str {
            self.name
        }
        fn uid(&self) -> u64 {
            self.uid
        }
        fn is_trivially_copyable(&self) -> bool {
            true
        }
        fn is_bit_stable(&self) -> bool {
            true
        }
        fn size_bytes(&self) -> usize {
            8
        }
        fn create_default(&self) -> Box<dyn Any + Send + Sync> {
            Box::new(0i64)
        }
    }

    fn make_port(tree: &Tree, name: &str, flags: PortFlags) -> AbstractPort {
        AbstractPort::create(
            tree,
            tree.root(),
            name,
            Arc::new(Counter {
                name: "Int",
                uid: 1,
            }),
            flags,
        )
        .unwrap()
    }

    fn port_value_buffer(_port: &AbstractPort, value: i64) -> Arc<PooledValue> {
        Arc::new(PooledValue::for_test(Box::new(value)))
    }

    struct RecordingListener {
        count: StdAtomicUsize,
    }

    impl PortListener for RecordingListener {
        fn on_port_change(&self, _port: &AbstractPort, _change: ChangeKind) {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn publish_fans_out_to_all_downstream_edges_s2() {
        let tree = Tree::new();
        let source = make_port(&tree, "source", PortFlags { output: true, ..Default::default() });
        let a = make_port(&tree, "a", PortFlags::default());
        let b = make_port(&tree, "b", PortFlags::default());
        source.connect(&a).unwrap();
        source.connect(&b).unwrap();

        source.publish(port_value_buffer(&source, 7));

        assert_eq!(a.current().downcast_ref::<i64>(), Some(&7));
        assert_eq!(b.current().downcast_ref::<i64>(), Some(&7));
    }

    #[test]
    fn queued_port_retains_values_up_to_its_limit_s3() {
        let tree = Tree::new();
        let source = make_port(&tree, "source", PortFlags { output: true, ..Default::default() });
        let sink = make_port(
            &tree,
            "sink",
            PortFlags {
                has_queue: true,
                ..Default::default()
            },
        );
        sink.set_max_queue_length(2);
        source.connect(&sink).unwrap();

        source.publish(port_value_buffer(&source, 1));
        source.publish(port_value_buffer(&source, 2));
        source.publish(port_value_buffer(&source, 3));

        let drained = sink.dequeue_all();
        let values: Vec<i64> = drained.iter().map(|v| *v.downcast_ref::<i64>().unwrap()).collect();
        assert_eq!(values, vec![2, 3]);
        assert!(sink.dequeue_all().is_empty());
    }

    #[test]
    fn pull_walks_chain_with_intermediate_assign_s4() {
        let tree = Tree::new();
        let a = make_port(&tree, "a", PortFlags { output: true, ..Default::default() });
        let b = make_port(&tree, "b", PortFlags::default());
        let c = make_port(&tree, "c", PortFlags::default());
        a.connect(&b).unwrap();
        b.connect(&c).unwrap();

        a.publish(port_value_buffer(&a, 9));
        // overwrite b's current value directly to confirm pull re-derives
        // from the chain rather than trusting the cached current value when
        // intermediate_assign forces a refresh
        let pulled = c.pull(true);
        assert_eq!(pulled.downcast_ref::<i64>(), Some(&9));
        assert_eq!(b.current().downcast_ref::<i64>(), Some(&9));
    }

    #[test]
    fn connecting_mismatched_types_is_rejected() {
        struct Other;
        impl TypeDescriptor for Other {
            fn name(&self) -> &str {
                "Other"
            }
            fn uid(&self) -> u64 {
                99
            }
            fn is_trivially_copyable(&self) -> bool {
                true
            }
            fn is_bit_stable(&self) -> bool {
                true
            }
            fn size_bytes(&self) -> usize {
                1
            }
            fn create_default(&self) -> Box<dyn Any + Send + Sync> {
                Box::new(0u8)
            }
        }
        let tree = Tree::new();
        let a = make_port(&tree, "a", PortFlags { output: true, ..Default::default() });
        let b = AbstractPort::create(&tree, tree.root(), "b", Arc::new(Other), PortFlags::default()).unwrap();
        let err = a.connect(&b).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn disconnect_reverts_default_on_disconnect_port() {
        let tree = Tree::new();
        let source = make_port(&tree, "source", PortFlags { output: true, ..Default::default() });
        let sink = make_port(
            &tree,
            "sink",
            PortFlags {
                default_on_disconnect: true,
                ..Default::default()
            },
        );
        source.connect(&sink).unwrap();
        source.publish(port_value_buffer(&source, 5));
        assert_eq!(sink.current().downcast_ref::<i64>(), Some(&5));

        source.disconnect(&sink);
        assert_eq!(sink.current().downcast_ref::<i64>(), Some(&0));
    }

    #[test]
    fn listener_fires_on_change_not_on_none() {
        let tree = Tree::new();
        let source = make_port(&tree, "source", PortFlags { output: true, ..Default::default() });
        let sink = make_port(&tree, "sink", PortFlags::default());
        source.connect(&sink).unwrap();
        let listener = Arc::new(RecordingListener {
            count: StdAtomicUsize::new(0),
        });
        sink.add_listener(listener.clone());

        source.publish(port_value_buffer(&source, 1));
        assert_eq!(listener.count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn strategy_reflects_edge_presence() {
        let tree = Tree::new();
        let source = make_port(&tree, "source", PortFlags { output: true, ..Default::default() });
        assert_eq!(source.strategy(), Strategy::None);
        let sink = make_port(&tree, "sink", PortFlags::default());
        source.connect(&sink).unwrap();
        assert_eq!(source.strategy(), Strategy::Push);
    }

    #[test]
    fn outgoing_edges_lists_connected_downstream_ports() {
        let tree = Tree::new();
        let source = make_port(&tree, "source", PortFlags { output: true, ..Default::default() });
        let a = make_port(&tree, "a", PortFlags::default());
        let b = make_port(&tree, "b", PortFlags::default());
        assert!(source.outgoing_edges().is_empty());

        source.connect(&a).unwrap();
        source.connect(&b).unwrap();
        let mut handles: Vec<Handle> = source.outgoing_edges().iter().map(|p| p.handle()).collect();
        handles.sort_by_key(|h| h.raw());
        let mut expected = vec![a.handle(), b.handle()];
        expected.sort_by_key(|h| h.raw());
        assert_eq!(handles, expected);

        source.disconnect(&a);
        assert_eq!(source.outgoing_edges().len(), 1);
    }

    #[test]
    fn pull_only_port_never_reports_push_strategy() {
        let tree = Tree::new();
        let source = make_port(
            &tree,
            "source",
            PortFlags {
                output: true,
                pull_only: true,
                ..Default::default()
            },
        );
        let sink = make_port(&tree, "sink", PortFlags::default());
        source.connect(&sink).unwrap();
        assert_eq!(source.strategy(), Strategy::PullOnDemand);
    }

    #[test]
    fn deleting_a_port_disconnects_its_edges() {
        let tree = Tree::new();
        let source = make_port(&tree, "source", PortFlags { output: true, ..Default::default() });
        let sink = make_port(&tree, "sink", PortFlags::default());
        source.connect(&sink).unwrap();
        let source_handle = source.handle();
        source.element().managed_delete();

        assert!(tree.get(source_handle).is_none());
        // sink's only incoming edge pointed at `source`; publishing a fresh
        // source at the same name must not silently reconnect the old edge
        let replacement = make_port(&tree, "source2", PortFlags { output: true, ..Default::default() });
        replacement.publish(port_value_buffer(&replacement, 42));
        assert_ne!(sink.current().downcast_ref::<i64>(), Some(&42));
    }

    #[test]
    fn from_element_recovers_the_same_port() {
        let tree = Tree::new();
        let port = make_port(&tree, "p", PortFlags::default());
        let recovered = AbstractPort::from_element(port.element().clone()).unwrap();
        assert_eq!(recovered.handle(), port.handle());
    }

    #[test]
    fn publish_cache_counts_fanout_past_estimate() {
        let before = telemetry::LOCK_ESTIMATE_MISSES.load(Ordering::Relaxed);
        let mut cache = PublishCache::new(1);
        cache.add_lock(); // matches the estimate, no miss
        cache.add_lock(); // exceeds it, one miss
        let after = telemetry::LOCK_ESTIMATE_MISSES.load(Ordering::Relaxed);
        assert_eq!(after - before, 1);
    }
}
