//! # axon
//!
//! Facade over the axon execution core. Most applications only need this
//! crate:
//!
//! ```no_run
//! use std::time::Duration;
//! use axon::{EngineConfig, NodeEngine};
//!
//! let engine = NodeEngine::new(EngineConfig::default()).unwrap();
//! // create nodes, connect ports ...
//! let stop = engine.stop_handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(Duration::from_secs(1));
//!     stop.request_stop();
//! });
//! engine.run().unwrap();
//! ```

pub use axon_core::{Cancelled, CancellationToken};
pub use axon_reactor::{
    repeat_until, when_all2, when_all3, when_all_range, Context, ContextConfig, OpHandle,
    Operation, Reactor, ReactorError, RingConfig, RingOperation, Sleep, StopHandle, TimedTask,
    TimerConfig, Yield,
};
pub use axon_flow::{
    EngineConfig, GraphError, InputConfig, Node, NodeEngine, NodeHandle, Output, OverflowPolicy,
    PublishOutcome, PushResult, TypedInput,
};

/// Low-level reactor building blocks for operation authors.
pub mod reactor {
    pub use axon_reactor::*;
}
