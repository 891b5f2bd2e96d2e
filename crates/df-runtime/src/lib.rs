//! Process-wide runtime state (spec §6 "Process-wide state"): a singleton
//! owning the framework-element tree, the type registry, and the port
//! factory registry, with an explicit `instance()`/`shutdown()` pair rather
//! than ambient globals sprinkled through the crate graph.
//!
//! Grounded in `core-config`'s `load_from`/`discover` pair for the
//! CLI/config loading shape, and in `ox-bin`'s `AppStartup` for the
//! "one process-wide thing the binary drives through a handful of
//! lifecycle methods" pattern — `df-cli` is this crate's `ox-bin`.

use std::sync::OnceLock;

use df_error::CoreResult;
use df_finstruct::FinstructableGroup;
use df_port::PortFactoryRegistry;
use df_structure::{CommandLineValues, ConfigValues};
use df_tree::{FrameworkElement, Tree};
use df_types::TypeRegistry;
use parking_lot::RwLock;

/// The process-wide runtime environment (spec §6). Exactly one instance
/// exists per process, reached through [`RuntimeEnvironment::instance`].
pub struct RuntimeEnvironment {
    tree: Tree,
    types: TypeRegistry,
    port_factories: PortFactoryRegistry,
    cli: RwLock<CommandLineValues>,
    config: RwLock<ConfigValues>,
}

static INSTANCE: OnceLock<RuntimeEnvironment> = OnceLock::new();

impl RuntimeEnvironment {
    fn new() -> Self {
        Self {
            tree: Tree::new(),
            types: TypeRegistry::new(),
            port_factories: PortFactoryRegistry::new(),
            cli: RwLock::new(CommandLineValues::new()),
            config: RwLock::new(ConfigValues::new()),
        }
    }

    /// The process-wide instance, lazily created on first access.
    pub fn instance() -> &'static RuntimeEnvironment {
        INSTANCE.get_or_init(Self::new)
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn port_factories(&self) -> &PortFactoryRegistry {
        &self.port_factories
    }

    pub fn set_command_line_values(&self, cli: CommandLineValues) {
        *self.cli.write() = cli;
    }

    pub fn set_config_values(&self, config: ConfigValues) {
        *self.config.write() = config;
    }

    pub fn command_line_values(&self) -> CommandLineValues {
        self.cli.read().clone()
    }

    pub fn config_values(&self) -> ConfigValues {
        self.config.read().clone()
    }

    /// Instantiates `xml` as a top-level finstructable group under the
    /// runtime-environment root (spec §6 CLI: `--main`/positional files),
    /// using this instance's current CLI/config bindings.
    pub fn instantiate_main_group(&self, xml: &str) -> CoreResult<FinstructableGroup> {
        let cli = self.command_line_values();
        let config = self.config_values();
        FinstructableGroup::instantiate(&self.tree, self.tree.root(), &self.types, xml, &cli, &config)
    }

    /// Releases every element under the root, in reverse creation order
    /// (spec §6: "Teardown releases all elements in reverse initialization
    /// order"). Idempotent: a second call observes no children left and is
    /// a no-op.
    pub fn shutdown(&self) {
        let mut children: Vec<FrameworkElement> = self.tree.root().children();
        children.reverse();
        for child in children {
            child.managed_delete();
        }
        tracing::info!(target: "df.runtime", remaining = self.tree.live_count(), "runtime shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::Arc;

    struct Counter {
        name: &'static str,
        uid: u64,
    }

    impl df_types::TypeDescriptor for Counter {
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

    #[test]
    fn instance_is_a_single_shared_singleton() {
        let a = RuntimeEnvironment::instance();
        let b = RuntimeEnvironment::instance();
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    fn instantiate_main_group_wires_into_the_shared_tree() {
        let env = RuntimeEnvironment::instance();
        // Guard against other tests in this process having already
        // registered "Int"; registration of a duplicate uid/name is
        // rejected but harmless to ignore here.
        let _ = env.types().register(Arc::new(Counter {
            name: "RuntimeInt",
            uid: 0xD00D,
        }));

        let xml = r#"<FinstructableGroup defaultname="RuntimeGroup">
            <port name="out" type="RuntimeInt" output="true" />
        </FinstructableGroup>"#;
        let group = env.instantiate_main_group(xml).unwrap();
        assert!(env.tree().get(group.element().handle()).is_some());

        group.element().managed_delete();
        assert!(env.tree().get(group.element().handle()).is_none());
    }

    #[test]
    fn shutdown_removes_every_root_child_in_reverse_order() {
        let tree = Tree::new();
        let types = TypeRegistry::new();
        let port_factories = PortFactoryRegistry::new();
        let env = RuntimeEnvironment {
            tree,
            types,
            port_factories,
            cli: RwLock::new(CommandLineValues::new()),
            config: RwLock::new(ConfigValues::new()),
        };

        let first = env.tree().create_child(env.tree().root(), "first", false).unwrap();
        let second = env.tree().create_child(env.tree().root(), "second", false).unwrap();
        first.init();
        second.init();

        env.shutdown();
        assert_eq!(env.tree().root().children().len(), 0);
        assert_eq!(env.tree().live_count(), 0);
    }
}
