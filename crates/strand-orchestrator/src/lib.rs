//! Checkpointed router state machine for multi-agent conversations.
//!
//! The orchestrator advances one conversation thread at a time: it loads
//! the latest checkpoint, records a routing decision, invokes the chosen
//! worker, merges the returned delta under the channel ownership rules,
//! and commits a new checkpoint. Per-thread sequencing rests entirely on
//! the store's compare-and-swap; distinct threads never coordinate.

pub mod classify;
pub mod constants;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod routing;
pub mod stage;
pub mod subgraph;

pub use classify::GenaiClassifier;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorError};
pub use registry::{RegistryError, WorkerRegistry};
pub use router::{Router, RouterConfig};
pub use routing::{Decided, RouteError, RoutingTable, RuleOutcome};
pub use stage::Stage;
pub use subgraph::{Subgraph, SubgraphBuilder};
