//! Port buffer pools and publishing engine (components D and E).
//!
//! A port is a [`df_tree::FrameworkElement`] with publish/pull state
//! attached as an annotation rather than a subtype of it — the element tree
//! stays ignorant of ports entirely (spec §9: "avoid open hierarchy except
//! for user-visible `PullRequestHandler`/listener interfaces").

pub mod factory;
pub mod pool;
pub mod publish;

pub use factory::{DefaultPortFactory, PortFactory, PortFactoryRegistry};
pub use pool::{MultiTypePool, PooledValue, UniTypePool};
pub use publish::{
    telemetry, AbstractPort, ChangeKind, Direction, PortFlags, PortListener, PullRequestHandler,
    Strategy,
};
