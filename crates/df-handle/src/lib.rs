//! Framework-element register: a wait-tolerant, constant-capacity handle
//! table with slot-reuse delay and stamped handles (component B).
//!
//! Chosen handle layout (spec §9 lists two variants seen in the source;
//! this is the one we commit to): a two-level chunked array rather than the
//! legacy 1-bit-sign/15-bit-stamp format. `index` is split into an 8-bit
//! primary chunk selector and an 8-bit in-chunk slot, `stamp` is 16 bits,
//! giving `handle = (index << STAMP_BITS) | stamp`. The high bit of `index`
//! distinguishes ports (`index >= FIRST_PORT_INDEX`) from non-ports.

use df_error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const INDEX_BITS: u32 = 16;
pub const STAMP_BITS: u32 = 16;
pub const CHUNK_BITS: u32 = 8;
pub const PRIMARY_BITS: u32 = INDEX_BITS - CHUNK_BITS;
pub const CHUNK_SIZE: usize = 1 << CHUNK_BITS;
pub const PRIMARY_COUNT: usize = 1 << PRIMARY_BITS;
pub const MAX_INDEX: u32 = 1 << INDEX_BITS;

/// First index handed out to ports; also the bit that marks a handle as a
/// port handle.
pub const FIRST_PORT_INDEX: u32 = 1 << (INDEX_BITS - 1);
pub const FIRST_NON_PORT_INDEX: u32 = 1;

/// Default delay before a freed slot may be reused. Production default;
/// tests construct a register with a much shorter duration so scenario S1
/// ("wait MIN_SLOT_REUSE_DURATION") does not take real wall-clock minutes.
pub const DEFAULT_MIN_SLOT_REUSE_DURATION: Duration = Duration::from_millis(500);

/// Opaque identifier of a framework element, stable across threads.
/// `index` addresses a slot; `stamp` detects stale references to a slot
/// that has since been recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn new(index: u32, stamp: u16) -> Self {
        debug_assert!(index < MAX_INDEX);
        Handle((index << STAMP_BITS) | stamp as u32)
    }

    pub fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> u32 {
        self.0 >> STAMP_BITS
    }

    pub fn stamp(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Ports occupy the upper half of the index space.
    pub fn is_port(self) -> bool {
        self.index() >= FIRST_PORT_INDEX
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

struct Slot<T> {
    element: Option<T>,
    stamp: u16,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot {
            element: None,
            stamp: 0,
        }
    }
}

struct Chunk<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Chunk<T> {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(CHUNK_SIZE);
        slots.resize_with(CHUNK_SIZE, Slot::default);
        Chunk { slots }
    }
}

struct Range {
    cursor: u32,
    bound: u32,
    free: VecDeque<(u32, Instant)>,
}

impl Range {
    fn new(start: u32, bound: u32) -> Self {
        Range {
            cursor: start,
            bound,
            free: VecDeque::new(),
        }
    }
}

struct Inner<T> {
    primary: Vec<Option<Box<Chunk<T>>>>,
    non_ports: Range,
    ports: Range,
    max_elements: u32,
    capacity_fixed: bool,
    live_count: usize,
}

impl<T> Inner<T> {
    fn chunk_mut(&mut self, index: u32) -> &mut Chunk<T> {
        let chunk_idx = (index >> CHUNK_BITS) as usize;
        self.primary[chunk_idx].get_or_insert_with(|| Box::new(Chunk::new()))
    }

    fn slot(&self, index: u32) -> Option<&Slot<T>> {
        let chunk_idx = (index >> CHUNK_BITS) as usize;
        let slot_idx = (index & (CHUNK_SIZE as u32 - 1)) as usize;
        self.primary[chunk_idx].as_ref().map(|c| &c.slots[slot_idx])
    }
}

/// A very efficient lookup table mapping stamped handles to elements.
/// Thread-safe: all mutating operations (`add`, `remove`,
/// `set_max_elements`) take the writer half of an internal `RwLock`;
/// `get` takes only the reader half, so concurrent lookups never block each
/// other and only contend with a concurrent add/remove.
pub struct FrameworkElementRegister<T: Clone + Send + Sync> {
    inner: RwLock<Inner<T>>,
    min_slot_reuse_duration: Duration,
}

impl<T: Clone + Send + Sync> Default for FrameworkElementRegister<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> FrameworkElementRegister<T> {
    pub fn new() -> Self {
        Self::with_min_slot_reuse_duration(DEFAULT_MIN_SLOT_REUSE_DURATION)
    }

    /// Construct with an explicit reuse delay. Production code should use
    /// [`FrameworkElementRegister::new`]; tests use this to shrink the
    /// delay so slot-reuse scenarios run in milliseconds.
    pub fn with_min_slot_reuse_duration(min_slot_reuse_duration: Duration) -> Self {
        let mut primary = Vec::with_capacity(PRIMARY_COUNT);
        primary.resize_with(PRIMARY_COUNT, || None);
        FrameworkElementRegister {
            inner: RwLock::new(Inner {
                primary,
                non_ports: Range::new(FIRST_NON_PORT_INDEX, FIRST_PORT_INDEX),
                ports: Range::new(FIRST_PORT_INDEX, MAX_INDEX),
                max_elements: MAX_INDEX,
                capacity_fixed: false,
                live_count: 0,
            }),
            min_slot_reuse_duration,
        }
    }

    /// The duration a slot must sit free before it can be handed back out.
    /// `HANDLE_UNIQUENESS_GUARANTEE_DURATION` (spec §3) is this value times
    /// `2^STAMP_BITS`, the number of times a slot's stamp would need to
    /// wrap before a stale handle could alias a live one.
    pub fn min_slot_reuse_duration(&self) -> Duration {
        self.min_slot_reuse_duration
    }

    pub fn handle_uniqueness_guarantee_duration(&self) -> Duration {
        self.min_slot_reuse_duration * (1u32 << STAMP_BITS)
    }

    /// Sets the maximum number of elements (ports and non-ports combined)
    /// this register will hand out. Only legal before the first `add`.
    pub fn set_max_elements(&self, max_elements: u32) -> CoreResult<()> {
        let mut inner = self.inner.write();
        if inner.capacity_fixed {
            return Err(CoreError::policy_violation(
                "register maximum element count can only be set before the first allocation",
            ));
        }
        inner.max_elements = max_elements.min(MAX_INDEX);
        Ok(())
    }

    /// Adds `element` to the register, returning its stable handle.
    /// Exhaustion is reported as [`CoreError::CapacityExceeded`], never
    /// silently wrapped.
    pub fn add(&self, element: T, is_port: bool) -> CoreResult<Handle> {
        let mut inner = self.inner.write();
        inner.capacity_fixed = true;
        let max_elements = inner.max_elements;

        let (index, from_free_list) = {
            let range = if is_port {
                &mut inner.ports
            } else {
                &mut inner.non_ports
            };
            let eligible = range
                .free
                .front()
                .is_some_and(|&(_, freed_at)| freed_at.elapsed() >= self.min_slot_reuse_duration);
            if eligible {
                let (index, _) = range.free.pop_front().unwrap();
                (index, true)
            } else {
                (Self::bump_cursor(range, max_elements, is_port)?, false)
            }
        };

        let slot_stamp = {
            let chunk = inner.chunk_mut(index);
            let slot_idx = (index & (CHUNK_SIZE as u32 - 1)) as usize;
            let slot = &mut chunk.slots[slot_idx];
            debug_assert!(
                slot.element.is_none(),
                "register slot already occupied"
            );
            if from_free_list {
                // Stamp rotates on each slot reuse (spec §3).
                slot.stamp = slot.stamp.wrapping_add(1);
            }
            slot.element = Some(element);
            slot.stamp
        };

        inner.live_count += 1;
        let handle = Handle::new(index, slot_stamp);
        tracing::trace!(target: "df.handle.register", %handle, is_port, "element added");
        Ok(handle)
    }

    fn bump_cursor(range: &mut Range, max_elements: u32, is_port: bool) -> CoreResult<u32> {
        if range.cursor >= range.bound || range.cursor >= max_elements {
            return Err(CoreError::capacity_exceeded(
                if is_port { "ports" } else { "non-port elements" },
                max_elements,
            ));
        }
        let index = range.cursor;
        range.cursor += 1;
        Ok(index)
    }

    /// Looks up an element by handle. A stamp mismatch — the slot has been
    /// recycled since this handle was issued — is expected and safe: it
    /// simply returns `None`.
    pub fn get(&self, handle: Handle) -> Option<T> {
        let inner = self.inner.read();
        let slot = inner.slot(handle.index())?;
        if slot.stamp == handle.stamp() {
            slot.element.clone()
        } else {
            None
        }
    }

    /// Removes the element at `handle`, enqueuing its slot for reuse after
    /// `min_slot_reuse_duration`. A stale handle (stamp mismatch) is a
    /// no-op and returns `false`.
    pub fn remove(&self, handle: Handle) -> bool {
        let mut inner = self.inner.write();
        let index = handle.index();
        let is_port = handle.is_port();
        let matched = {
            let chunk_idx = (index >> CHUNK_BITS) as usize;
            let slot_idx = (index & (CHUNK_SIZE as u32 - 1)) as usize;
            match inner.primary[chunk_idx].as_mut() {
                Some(chunk) => {
                    let slot = &mut chunk.slots[slot_idx];
                    if slot.stamp == handle.stamp() && slot.element.is_some() {
                        slot.element = None;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if matched {
            inner.live_count -= 1;
            let now = Instant::now();
            if is_port {
                inner.ports.free.push_back((index, now));
            } else {
                inner.non_ports.free.push_back((index, now));
            }
            tracing::trace!(target: "df.handle.register", %handle, "element removed");
        }
        matched
    }

    pub fn live_count(&self) -> usize {
        self.inner.read().live_count
    }

    /// Walks non-ports then ports in handle order, returning up to `max`
    /// elements starting strictly after `start_from`. Idiomatic rendering
    /// of `GetAllElements(buf, max, start_from_handle)` (spec §4.B): Rust
    /// return-by-value replaces the out-parameter buffer.
    pub fn get_all_elements(&self, max: usize, start_from: Option<Handle>) -> Vec<(Handle, T)> {
        let inner = self.inner.read();
        let start_index = start_from.map(|h| h.index() + 1).unwrap_or(0);
        let mut out = Vec::with_capacity(max.min(inner.live_count));

        let mut collect_range = |from: u32, to: u32, out: &mut Vec<(Handle, T)>| {
            let mut idx = from.max(start_index);
            while idx < to && out.len() < max {
                if let Some(slot) = inner.slot(idx) {
                    if let Some(elem) = &slot.element {
                        out.push((Handle::new(idx, slot.stamp), elem.clone()));
                    }
                }
                idx += 1;
            }
        };

        collect_range(FIRST_NON_PORT_INDEX, FIRST_PORT_INDEX, &mut out);
        if out.len() < max {
            collect_range(FIRST_PORT_INDEX, MAX_INDEX, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_register() -> FrameworkElementRegister<&'static str> {
        FrameworkElementRegister::with_min_slot_reuse_duration(Duration::from_millis(20))
    }

    #[test]
    fn handle_encodes_index_and_stamp() {
        let h = Handle::new(5, 1);
        assert_eq!(h.index(), 5);
        assert_eq!(h.stamp(), 1);
        assert!(!h.is_port());

        let p = Handle::new(FIRST_PORT_INDEX + 3, 0);
        assert!(p.is_port());
    }

    #[test]
    fn s1_register_churn_reuses_slot_with_bumped_stamp() {
        let reg = test_register();
        let mut handles = Vec::new();
        for i in 0..10 {
            let h = reg.add("elem", false).unwrap();
            assert_eq!(h.index(), (i + 1) as u32);
            assert_eq!(h.stamp(), 0);
            handles.push(h);
        }

        let fifth = handles[4];
        assert!(reg.remove(fifth));
        assert!(reg.get(fifth).is_none());

        std::thread::sleep(Duration::from_millis(25));

        let reused = reg.add("new-elem", false).unwrap();
        assert_eq!(reused.index(), 5);
        assert_eq!(reused.stamp(), 1);
        assert!(reg.get(fifth).is_none(), "stale handle must stay not-found");
        assert_eq!(reg.get(reused).unwrap(), "new-elem");
    }

    #[test]
    fn immediate_reuse_before_delay_falls_back_to_cursor() {
        let reg = FrameworkElementRegister::with_min_slot_reuse_duration(Duration::from_secs(60));
        let h1 = reg.add("a", false).unwrap();
        reg.remove(h1);
        let h2 = reg.add("b", false).unwrap();
        // slot 1 is not yet eligible for reuse, so a fresh index is used.
        assert_ne!(h1.index(), h2.index());
    }

    #[test]
    fn ports_and_non_ports_occupy_disjoint_ranges() {
        let reg = test_register();
        let np = reg.add("non-port", false).unwrap();
        let p = reg.add("port", true).unwrap();
        assert!(!np.is_port());
        assert!(p.is_port());
    }

    #[test]
    fn capacity_exhaustion_is_reported_not_wrapped() {
        let reg = test_register();
        reg.set_max_elements(FIRST_NON_PORT_INDEX + 2).unwrap();
        reg.add("a", false).unwrap();
        reg.add("b", false).unwrap();
        let err = reg.add("c", false).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn set_max_elements_after_first_add_is_rejected() {
        let reg = test_register();
        reg.add("a", false).unwrap();
        let err = reg.set_max_elements(10).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn get_all_elements_walks_non_ports_then_ports_in_order() {
        let reg = test_register();
        let a = reg.add("a", false).unwrap();
        let b = reg.add("b", false).unwrap();
        let p1 = reg.add("p1", true).unwrap();

        let all = reg.get_all_elements(10, None);
        let handles: Vec<Handle> = all.iter().map(|(h, _)| *h).collect();
        assert_eq!(handles, vec![a, b, p1]);

        let resumed = reg.get_all_elements(10, Some(a));
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].0, b);
    }

    #[test]
    fn removed_slot_excluded_from_get_all_elements() {
        let reg = test_register();
        let a = reg.add("a", false).unwrap();
        let b = reg.add("b", false).unwrap();
        reg.remove(a);
        let all = reg.get_all_elements(10, None);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, b);
    }
}
