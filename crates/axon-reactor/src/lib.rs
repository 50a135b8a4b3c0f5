//! # axon-reactor
//!
//! The asynchronous execution core of the axon dataflow runtime:
//!
//! - `operation` - single-word tagged handles for in-flight ring operations
//! - `ring` - the single-threaded io_uring completion reactor
//! - `dispatch` - cross-ring submission and stop from foreign threads
//! - `timer` - deadline-ordered timed dispatch with a time-scale factor
//! - `executor` - the per-context task executor
//! - `context` - the facade joining reactor, timer and executor
//! - `futures` - readiness futures (`schedule`, `schedule_after`) and
//!   combinators (`when_all*`, `repeat_until`)
//!
//! Each reactor is single-threaded and cooperative: one OS thread executes
//! all completion callbacks, and foreign threads interact only through the
//! cross-ring dispatch protocol.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod context;
        pub mod futures;
        pub mod operation;
        pub mod ring;
        pub mod timer;
        mod dispatch;
        mod executor;
        mod sys;

        pub use context::{Context, ContextConfig, StopHandle};
        pub use futures::{
            repeat_until, when_all2, when_all3, when_all_range, Sleep, WhenAll2, WhenAll3,
            WhenAllRange, Yield,
        };
        pub use operation::{OpHandle, Operation, RingOperation};
        pub use ring::{Reactor, ReactorError, RingConfig, DEFAULT_ENTRY_COUNT};
        pub use timer::{TimedTask, TimerConfig, TimerDispatcher};
    } else {
        compile_error!("axon-reactor requires io_uring and only builds on Linux");
    }
}

// Re-exports for convenience
pub use axon_core::{Cancelled, CancellationToken};

/// Re-exported so downstream crates can implement [`RingOperation`] without
/// pinning their own copy of the ring crate.
#[cfg(target_os = "linux")]
pub use io_uring;
