//! Type registry and data-type classification (component A).
//!
//! Concrete data-type implementations are out of scope for the core (spec
//! §1): this crate only consumes a type-descriptor abstraction. Anything
//! else — plugin crates providing e.g. `Pose3D` or `LaserScan` types —
//! registers a [`TypeDescriptor`] here and never needs to know how ports or
//! the element tree work.

use df_error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Above this payload size a type is never classified as cheap-copy, no
/// matter how trivially copyable it is. Chosen to keep by-value transport
/// paths (registers, short-lived stack copies) cheap in practice.
pub const CHEAP_COPY_SIZE_THRESHOLD_BYTES: usize = 64;

/// Object-safe description of a data type that can flow through a port.
///
/// Implementors live in downstream "plugin" crates; this trait is the only
/// seam the core needs. `uid` must be stable for the lifetime of the
/// process (used as the registry's secondary lookup key).
pub trait TypeDescriptor: Send + Sync {
    fn name(&self) -> &str;
    fn uid(&self) -> u64;
    /// No heap allocation, no pointers, flat memory layout — required of
    /// any type the engine can legally copy byte-for-byte.
    fn is_trivially_copyable(&self) -> bool;
    /// Bit-stable: two instances with the same bytes always compare equal
    /// and neither contains process-local addresses.
    fn is_bit_stable(&self) -> bool;
    /// Size in bytes of one instance, used against
    /// [`CHEAP_COPY_SIZE_THRESHOLD_BYTES`].
    fn size_bytes(&self) -> usize;
    /// RPC (method-call) types are neither cheap-copy nor standard; the
    /// publishing engine never installs a "current value" for them. Out of
    /// scope beyond this classification bit (spec §1: RPC method machinery
    /// excluded).
    fn is_rpc(&self) -> bool {
        false
    }
    /// Allocates one new default-valued instance, type-erased. Used by port
    /// buffer pools when their free list is empty (spec §4.D `GetUnused`).
    fn create_default(&self) -> Box<dyn Any + Send + Sync>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCategory {
    /// Trivially copyable, bit-stable, and small: transported by value.
    CheapCopy,
    /// Everything else that isn't RPC: transported by reference-counted
    /// buffer.
    Standard,
    /// Method-call type; the publishing engine does not apply to these.
    Rpc,
}

/// Classification is a consequence of type traits (spec §4.A), not a flag
/// set by the registrant.
pub fn classify(descriptor: &dyn TypeDescriptor) -> TypeCategory {
    if descriptor.is_rpc() {
        return TypeCategory::Rpc;
    }
    if descriptor.is_trivially_copyable()
        && descriptor.is_bit_stable()
        && descriptor.size_bytes() <= CHEAP_COPY_SIZE_THRESHOLD_BYTES
    {
        return TypeCategory::CheapCopy;
    }
    TypeCategory::Standard
}

struct Inner {
    by_name: HashMap<String, Arc<dyn TypeDescriptor>>,
    by_uid: HashMap<u64, Arc<dyn TypeDescriptor>>,
    cc_index: HashMap<String, u32>,
}

/// Process-wide catalog of known data types.
///
/// `FindType`/`Get`/`IsCheapCopy`/`IsStandard` (spec §4.A) map directly onto
/// [`TypeRegistry::find_type`], [`TypeRegistry::get`],
/// [`TypeRegistry::is_cheap_copy`], [`TypeRegistry::is_standard`].
pub struct TypeRegistry {
    inner: RwLock<Inner>,
    next_cc_index: AtomicU32,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_name: HashMap::new(),
                by_uid: HashMap::new(),
                cc_index: HashMap::new(),
            }),
            next_cc_index: AtomicU32::new(0),
        }
    }

    /// Registers a type descriptor. Re-registering the same name with a
    /// descriptor of a different uid is a policy violation (it would make
    /// `find_type` ambiguous with respect to previously issued uids).
    pub fn register(&self, descriptor: Arc<dyn TypeDescriptor>) -> CoreResult<()> {
        let name = descriptor.name().to_string();
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_name.get(&name) {
            if existing.uid() != descriptor.uid() {
                return Err(CoreError::policy_violation(format!(
                    "type `{name}` already registered with a different uid"
                )));
            }
            return Ok(());
        }
        if classify(descriptor.as_ref()) == TypeCategory::CheapCopy
            && !inner.cc_index.contains_key(&name)
        {
            let idx = self.next_cc_index.fetch_add(1, Ordering::Relaxed);
            inner.cc_index.insert(name.clone(), idx);
        }
        tracing::debug!(target: "df.types", type_name = %name, uid = descriptor.uid(), "type registered");
        inner.by_uid.insert(descriptor.uid(), descriptor.clone());
        inner.by_name.insert(name, descriptor);
        Ok(())
    }

    pub fn find_type(&self, name: &str) -> Option<Arc<dyn TypeDescriptor>> {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn get(&self, uid: u64) -> Option<Arc<dyn TypeDescriptor>> {
        self.inner.read().by_uid.get(&uid).cloned()
    }

    pub fn is_cheap_copy(&self, descriptor: &dyn TypeDescriptor) -> bool {
        classify(descriptor) == TypeCategory::CheapCopy
    }

    pub fn is_standard(&self, descriptor: &dyn TypeDescriptor) -> bool {
        classify(descriptor) == TypeCategory::Standard
    }

    /// Contiguous index used by by-value transport paths (spec §4.A). Only
    /// assigned to cheap-copy types, at first registration.
    pub fn cc_index_of(&self, name: &str) -> Option<u32> {
        self.inner.read().cc_index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        uid: u64,
        size: usize,
    }

    impl TypeDescriptor for Fixed {
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
            self.size
        }
        fn create_default(&self) -> Box<dyn Any + Send + Sync> {
            Box::new(0u64)
        }
    }

    struct Big {
        name: &'static str,
        uid: u64,
    }

    impl TypeDescriptor for Big {
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
            4096
        }
        fn create_default(&self) -> Box<dyn Any + Send + Sync> {
            Box::new(vec![0u8; 4096])
        }
    }

    #[test]
    fn small_trivial_type_is_cheap_copy() {
        let d = Fixed {
            name: "Pose2D",
            uid: 1,
            size: 24,
        };
        assert_eq!(classify(&d), TypeCategory::CheapCopy);
    }

    #[test]
    fn oversized_trivial_type_is_standard() {
        let d = Big {
            name: "LaserScan",
            uid: 2,
        };
        assert_eq!(classify(&d), TypeCategory::Standard);
    }

    #[test]
    fn register_assigns_contiguous_cc_index() {
        let reg = TypeRegistry::new();
        reg.register(Arc::new(Fixed {
            name: "A",
            uid: 10,
            size: 8,
        }))
        .unwrap();
        reg.register(Arc::new(Fixed {
            name: "B",
            uid: 11,
            size: 8,
        }))
        .unwrap();
        assert_eq!(reg.cc_index_of("A"), Some(0));
        assert_eq!(reg.cc_index_of("B"), Some(1));
    }

    #[test]
    fn find_type_and_get_agree() {
        let reg = TypeRegistry::new();
        let d = Arc::new(Fixed {
            name: "Pose2D",
            uid: 42,
            size: 16,
        });
        reg.register(d.clone()).unwrap();
        assert_eq!(reg.find_type("Pose2D").unwrap().uid(), 42);
        assert_eq!(reg.get(42).unwrap().name(), "Pose2D");
        assert!(reg.find_type("missing").is_none());
    }

    #[test]
    fn re_registering_with_conflicting_uid_is_rejected() {
        let reg = TypeRegistry::new();
        reg.register(Arc::new(Fixed {
            name: "A",
            uid: 1,
            size: 8,
        }))
        .unwrap();
        let err = reg
            .register(Arc::new(Fixed {
                name: "A",
                uid: 2,
                size: 8,
            }))
            .unwrap_err();
        assert!(!err.is_fatal());
    }
}
