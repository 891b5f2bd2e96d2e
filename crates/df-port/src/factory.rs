//! Port factories (spec §4.A): pluggable `CreatePort`/`HandlesDataType`
//! implementations consulted in registration order, first match wins.
//!
//! Spec §4.A lists `GetPortFactory` as part of the type registry, but the
//! factory's `CreatePort` needs `Tree`/`FrameworkElement`/`AbstractPort` —
//! all downstream of `df-types` — so the registry itself lives here rather
//! than forcing a dependency cycle. `df-types::TypeRegistry` still owns
//! classification (`IsCheapCopy`/`IsStandard`); this module only adds the
//! "which factory builds a port of this type" lookup on top of it.

use std::sync::Arc;

use df_error::{CoreError, CoreResult};
use df_tree::{FrameworkElement, Tree};
use df_types::TypeDescriptor;
use parking_lot::RwLock;

use crate::publish::{AbstractPort, PortFlags};

/// A factory that knows how to build ports for some subset of data types.
pub trait PortFactory: Send + Sync {
    /// Whether this factory can build a port carrying `descriptor`'s type.
    fn handles_data_type(&self, descriptor: &dyn TypeDescriptor) -> bool;

    fn create_port(
        &self,
        tree: &Tree,
        parent: &FrameworkElement,
        name: String,
        data_type: Arc<dyn TypeDescriptor>,
        flags: PortFlags,
    ) -> CoreResult<AbstractPort>;
}

/// Handles every non-RPC type (spec §4.A: "A default factory handles
/// standard and cheap-copy data ports"). Registered as the fallback, not
/// competing for position in the ordered list: specialized factories
/// registered by plugin crates get first refusal, this one always matches
/// what's left.
pub struct DefaultPortFactory;

impl PortFactory for DefaultPortFactory {
    fn handles_data_type(&self, descriptor: &dyn TypeDescriptor) -> bool {
        !descriptor.is_rpc()
    }

    fn create_port(
        &self,
        tree: &Tree,
        parent: &FrameworkElement,
        name: String,
        data_type: Arc<dyn TypeDescriptor>,
        flags: PortFlags,
    ) -> CoreResult<AbstractPort> {
        AbstractPort::create(tree, parent, name, data_type, flags)
    }
}

/// Ordered list of factories (spec §4.A). `get_port_factory` tries each
/// registered factory in registration order and falls back to
/// [`DefaultPortFactory`] only once every specialized factory has declined.
pub struct PortFactoryRegistry {
    factories: RwLock<Vec<Arc<dyn PortFactory>>>,
    default: Arc<dyn PortFactory>,
}

impl Default for PortFactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PortFactoryRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(Vec::new()),
            default: Arc::new(DefaultPortFactory),
        }
    }

    /// Registers a factory. Plugin crates (out of scope per spec §1, only
    /// this registration seam is in core) call this to claim data types the
    /// default factory shouldn't handle itself (e.g. RPC method types).
    pub fn register(&self, factory: Arc<dyn PortFactory>) {
        self.factories.write().push(factory);
    }

    /// First factory (in registration order) that handles `descriptor`,
    /// falling back to the default factory for anything non-RPC. Returns
    /// `None` only for RPC types with no registered handler — RPC method
    /// machinery is out of scope for this core (spec §1).
    pub fn get_port_factory(
        &self,
        descriptor: &dyn TypeDescriptor,
    ) -> Option<Arc<dyn PortFactory>> {
        if let Some(found) = self
            .factories
            .read()
            .iter()
            .find(|f| f.handles_data_type(descriptor))
            .cloned()
        {
            return Some(found);
        }
        self.default
            .handles_data_type(descriptor)
            .then(|| self.default.clone())
    }

    pub fn create_port(
        &self,
        tree: &Tree,
        parent: &FrameworkElement,
        name: impl Into<String>,
        data_type: Arc<dyn TypeDescriptor>,
        flags: PortFlags,
    ) -> CoreResult<AbstractPort> {
        let name = name.into();
        let factory = self.get_port_factory(data_type.as_ref()).ok_or_else(|| {
            CoreError::policy_violation(format!(
                "no port factory handles data type `{}`",
                data_type.name()
            ))
        })?;
        factory.create_port(tree, parent, name, data_type, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

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

    struct RpcType;
    impl TypeDescriptor for RpcType {
        fn name(&self) -> &str {
            "Rpc"
        }
        fn uid(&self) -> u64 {
            99
        }
        fn is_trivially_copyable(&self) -> bool {
            false
        }
        fn is_bit_stable(&self) -> bool {
            false
        }
        fn size_bytes(&self) -> usize {
            0
        }
        fn is_rpc(&self) -> bool {
            true
        }
        fn create_default(&self) -> Box<dyn Any + Send + Sync> {
            Box::new(())
        }
    }

    struct RpcFactory;
    impl PortFactory for RpcFactory {
        fn handles_data_type(&self, descriptor: &dyn TypeDescriptor) -> bool {
            descriptor.is_rpc()
        }
        fn create_port(
            &self,
            tree: &Tree,
            parent: &FrameworkElement,
            name: String,
            data_type: Arc<dyn TypeDescriptor>,
            flags: PortFlags,
        ) -> CoreResult<AbstractPort> {
            AbstractPort::create(tree, parent, name, data_type, flags)
        }
    }

    #[test]
    fn default_factory_handles_standard_types() {
        let registry = PortFactoryRegistry::new();
        let d = Counter { name: "Int", uid: 1 };
        assert!(registry.get_port_factory(&d).is_some());
    }

    #[test]
    fn rpc_type_is_declined_without_a_registered_handler() {
        let registry = PortFactoryRegistry::new();
        assert!(registry.get_port_factory(&RpcType).is_none());
    }

    #[test]
    fn registered_factory_takes_priority_over_default() {
        let registry = PortFactoryRegistry::new();
        registry.register(Arc::new(RpcFactory));
        assert!(registry.get_port_factory(&RpcType).is_some());
    }

    #[test]
    fn create_port_via_registry_builds_a_real_port() {
        let registry = PortFactoryRegistry::new();
        let tree = Tree::new();
        let port = registry
            .create_port(
                &tree,
                tree.root(),
                "p",
                Arc::new(Counter { name: "Int", uid: 1 }),
                PortFlags::default(),
            )
            .unwrap();
        assert!(port.element().is_port());
    }
}
