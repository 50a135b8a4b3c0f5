//! Typed bounded input ports
//!
//! Each node input is a fixed-capacity FIFO of `T` living on the node's
//! reactor thread. Producers push with [`TypedInput::set_value`] and learn
//! about backpressure through the return code; the owning node reads
//! non-blocking (`peek_now`, `take_now`) or awaits (`await_one`,
//! `aggregate`). At most one task awaits an input at a time, and a waiting
//! reader is woken by the next accepted value.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll, Waker};

use axon_core::{Cancelled, CancellationToken};
use axon_reactor::Context;

/// What a full input does with the next value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the new value and report [`PushResult::Overflow`].
    #[default]
    RejectNew,
    /// Evict the oldest queued value and accept the new one. The only case
    /// where consumers can observe dropped values.
    OverwriteOldest,
}

/// Outcome of [`TypedInput::set_value`], for the producer to act on.
/// Overflow is backpressure, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum PushResult {
    Accepted,
    Overflow,
}

/// Input port configuration.
#[derive(Debug, Clone, Copy)]
pub struct InputConfig {
    /// Queue capacity; must be at least 1.
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            policy: OverflowPolicy::RejectNew,
        }
    }
}

struct InputState<T> {
    queue: RefCell<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,

    /// The single waiting reader, if any.
    waiter: RefCell<Option<Waker>>,

    /// Whether an upstream output has claimed this input.
    bound: Cell<bool>,
}

/// Bounded lazy queue of `T` attached to a node.
///
/// Cloning yields another endpoint onto the same queue; clones are how
/// outputs hold their downstream references.
pub struct TypedInput<T> {
    state: Rc<InputState<T>>,
}

impl<T> Clone for TypedInput<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> Default for TypedInput<T> {
    fn default() -> Self {
        Self::new(InputConfig::default())
    }
}

impl<T> TypedInput<T> {
    pub fn new(config: InputConfig) -> Self {
        assert!(config.capacity >= 1, "input capacity must be at least 1");
        Self {
            state: Rc::new(InputState {
                queue: RefCell::new(VecDeque::with_capacity(config.capacity)),
                capacity: config.capacity,
                policy: config.policy,
                waiter: RefCell::new(None),
                bound: Cell::new(false),
            }),
        }
    }

    /// Shorthand for a `capacity`-deep FIFO with the default policy.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(InputConfig {
            capacity,
            ..Default::default()
        })
    }

    /// Push a value, applying the overflow policy when full, and wake a
    /// waiting reader on acceptance.
    pub fn set_value(&self, value: T) -> PushResult {
        {
            let mut queue = self.state.queue.borrow_mut();
            if queue.len() == self.state.capacity {
                match self.state.policy {
                    OverflowPolicy::RejectNew => return PushResult::Overflow,
                    OverflowPolicy::OverwriteOldest => {
                        queue.pop_front();
                    }
                }
            }
            queue.push_back(value);
        }
        if let Some(waker) = self.state.waiter.borrow_mut().take() {
            waker.wake();
        }
        PushResult::Accepted
    }

    /// Non-consuming readiness check.
    pub fn peek_now(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state.queue.borrow().front().cloned()
    }

    /// Non-blocking consume of the head value.
    pub fn take_now(&self) -> Option<T> {
        self.state.queue.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.queue.borrow().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.state.capacity
    }

    /// Readiness for the next value; resolves with it, or as cancelled.
    pub fn await_one(&self, ctx: &Context) -> AwaitOne<T> {
        AwaitOne {
            state: Rc::clone(&self.state),
            token: ctx.stop_token(),
        }
    }

    /// Readiness for `N` successive values, accumulated across waits.
    pub fn aggregate<const N: usize>(&self, ctx: &Context) -> Aggregate<T, N> {
        Aggregate {
            state: Rc::clone(&self.state),
            token: ctx.stop_token(),
            accumulated: Vec::with_capacity(N),
        }
    }

    /// Claim this input for an upstream output. An input accepts at most one
    /// binding; returns false if already claimed.
    pub(crate) fn mark_bound(&self) -> bool {
        !self.state.bound.replace(true)
    }
}

/// Future for one value from a [`TypedInput`].
pub struct AwaitOne<T> {
    state: Rc<InputState<T>>,
    token: CancellationToken,
}

impl<T> Future for AwaitOne<T> {
    type Output = Result<T, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        if let Some(value) = self.state.queue.borrow_mut().pop_front() {
            return Poll::Ready(Ok(value));
        }
        if self.token.stop_requested() {
            return Poll::Ready(Err(Cancelled));
        }
        *self.state.waiter.borrow_mut() = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Future for `N` successive values from a [`TypedInput`].
pub struct Aggregate<T, const N: usize> {
    state: Rc<InputState<T>>,
    token: CancellationToken,
    accumulated: Vec<T>,
}

impl<T: Unpin, const N: usize> Future for Aggregate<T, N> {
    type Output = Result<[T; N], Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        while this.accumulated.len() < N {
            match this.state.queue.borrow_mut().pop_front() {
                Some(value) => this.accumulated.push(value),
                None => {
                    if this.token.stop_requested() {
                        return Poll::Ready(Err(Cancelled));
                    }
                    *this.state.waiter.borrow_mut() = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        }
        match <[T; N]>::try_from(std::mem::take(&mut this.accumulated)) {
            Ok(values) => Poll::Ready(Ok(values)),
            Err(_) => unreachable!("accumulated exactly N values"),
        }
    }
}
