//! Execution context: reactor + timed dispatch + task executor
//!
//! A [`Context`] owns one reactor, one timed dispatcher and a single-threaded
//! executor, and wires them together: the executor drains as the reactor's
//! progress hook, sleeps register with the dispatcher, and a stop request
//! from anywhere cancels queued timers and wakes every pending task exactly
//! once so it can resolve as cancelled.
//!
//! `Context` is cheaply clonable and confined to its owner thread; foreign
//! threads hold a [`StopHandle`] instead.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use axon_core::CancellationToken;

use crate::executor::Executor;
use crate::futures::{Sleep, Yield};
use crate::ring::{Reactor, ReactorError, RingConfig};
use crate::timer::{TimedTask, TimerConfig, TimerDispatcher};
use crate::operation::Operation;

/// Context construction parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextConfig {
    pub ring: RingConfig,
    pub timer: TimerConfig,
}

pub(crate) struct ContextInner {
    ring: Arc<Reactor>,
    timer: Operation<TimerDispatcher>,
    executor: Executor,
    stop_broadcast: Cell<bool>,
}

/// Single-threaded execution context. Clones share the same reactor.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Context {
    pub fn new(config: ContextConfig) -> Result<Self, ReactorError> {
        let ring = Arc::new(Reactor::new(config.ring)?);
        let timer = Operation::new(TimerDispatcher::new(config.timer)?);
        Ok(Self {
            inner: Rc::new(ContextInner {
                ring,
                timer,
                executor: Executor::new(),
                stop_broadcast: Cell::new(false),
            }),
        })
    }

    /// The underlying reactor.
    pub fn reactor(&self) -> &Reactor {
        &self.inner.ring
    }

    /// A sendable handle other threads can use to stop this context.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            ring: Arc::clone(&self.inner.ring),
        }
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.inner.ring.stop_token()
    }

    /// Request stop. Usable from tasks running on this context as well as
    /// from the constructing thread before or after `run`.
    pub fn request_stop(&self) {
        self.inner.ring.request_stop();
    }

    pub fn time_scale_factor(&self) -> f64 {
        self.inner.timer.time_scale_factor()
    }

    /// Queue a task onto this context's executor.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.inner.executor.spawn(future);
    }

    /// Readiness on the next event-loop iteration. No kernel entry.
    pub fn schedule(&self) -> Yield {
        Yield::new(self.stop_token())
    }

    /// Readiness once `after × time_scale_factor` has elapsed.
    pub fn schedule_after(&self, after: Duration) -> Sleep {
        Sleep::new(self.clone(), after)
    }

    pub(crate) fn register_timed(&self, task: Rc<dyn TimedTask>, after: Duration) {
        debug_assert!(
            self.inner.ring.is_current(),
            "timed registration off the reactor thread"
        );
        // Safety: the dispatcher operation is pinned inside `ContextInner`,
        // which outlives every in-flight timer entry.
        let handle = unsafe { self.inner.timer.handle() };
        self.inner
            .timer
            .schedule_after(handle, &self.inner.ring, task, after);
    }

    /// Drive the reactor on the calling thread until stop is requested and
    /// all tasks and in-flight operations have drained.
    pub fn run(&self) {
        let inner = &self.inner;
        let ring: &Reactor = &inner.ring;
        ring.run(
            || debug!("context loop started"),
            || {
                let more = inner.executor.poll_ready();
                if ring.stop_requested() && !inner.stop_broadcast.get() {
                    inner.stop_broadcast.set(true);
                    debug!("stop observed; cancelling timers and waking tasks");
                    // Safety: dispatcher pinned inside `ContextInner`.
                    let handle = unsafe { inner.timer.handle() };
                    inner.timer.request_stop(handle, ring);
                    inner.executor.wake_all();
                    return true;
                }
                more
            },
        );
    }
}

/// Sendable stop handle for a [`Context`] owned by another thread.
#[derive(Clone)]
pub struct StopHandle {
    ring: Arc<Reactor>,
}

impl StopHandle {
    /// Request the context to stop; routed through cross-ring dispatch when
    /// its loop is running.
    pub fn request_stop(&self) {
        self.ring.request_stop();
    }

    pub fn stop_requested(&self) -> bool {
        self.ring.stop_requested()
    }
}
