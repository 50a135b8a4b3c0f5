//! # axon-flow
//!
//! The typed dataflow layer of the axon runtime:
//!
//! - `input` - bounded typed input ports with overflow policies
//! - `output` - fan-out of produced values to downstream inputs
//! - `node` - the trigger/execute node contract and its loop
//! - `engine` - node registry, graph validation and launch
//!
//! Nodes compose readiness out of the `axon-reactor` senders
//! (`schedule_after`, `await_one`, `when_all*`); the engine runs every
//! node's loop on one execution context.

pub mod engine;
pub mod input;
pub mod node;
pub mod output;

// Re-exports for convenience
pub use engine::{EngineConfig, GraphError, NodeEngine, NodeHandle};
pub use input::{Aggregate, AwaitOne, InputConfig, OverflowPolicy, PushResult, TypedInput};
pub use node::Node;
pub use output::{Output, PublishOutcome};

pub use axon_core::{Cancelled, CancellationToken};
pub use axon_reactor::{Context, ContextConfig};
