//! Lazy readiness futures and the combinators the node layer builds on
//!
//! Futures here hold no kernel resources until first polled, and every one
//! of them resolves with `Result<_, Cancelled>`: observing the stop token
//! completes them with `Err(Cancelled)` instead of a value. All of them are
//! `Unpin`, which keeps the combinators free of pin projection.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::Duration;

use axon_core::{Cancelled, CancellationToken};

use crate::context::Context;
use crate::timer::TimedTask;

/// Completes on the next iteration of the reactor's event loop.
///
/// Created by [`Context::schedule`].
pub struct Yield {
    token: CancellationToken,
    yielded: bool,
}

impl Yield {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            token,
            yielded: false,
        }
    }
}

impl Future for Yield {
    type Output = Result<(), Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        if self.token.stop_requested() {
            return Poll::Ready(Err(Cancelled));
        }
        if self.yielded {
            Poll::Ready(Ok(()))
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SleepPhase {
    Waiting,
    Elapsed,
    Cancelled,
}

pub(crate) struct SleepShared {
    phase: Cell<SleepPhase>,
    waker: RefCell<Option<Waker>>,
}

impl SleepShared {
    fn wake(&self) {
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

impl TimedTask for SleepShared {
    fn tick(&self) {
        if self.phase.get() == SleepPhase::Waiting {
            self.phase.set(SleepPhase::Elapsed);
        }
        self.wake();
    }

    fn request_stop(&self) {
        if self.phase.get() == SleepPhase::Waiting {
            self.phase.set(SleepPhase::Cancelled);
        }
        self.wake();
    }
}

/// Completes once the scaled duration has elapsed, never earlier.
///
/// Created by [`Context::schedule_after`]. Registration with the timed
/// dispatcher happens on first poll, on the reactor thread.
pub struct Sleep {
    ctx: Context,
    after: Duration,
    shared: Rc<SleepShared>,
    registered: bool,
}

impl Sleep {
    pub(crate) fn new(ctx: Context, after: Duration) -> Self {
        Self {
            ctx,
            after,
            shared: Rc::new(SleepShared {
                phase: Cell::new(SleepPhase::Waiting),
                waker: RefCell::new(None),
            }),
            registered: false,
        }
    }
}

impl Future for Sleep {
    type Output = Result<(), Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match self.shared.phase.get() {
            SleepPhase::Elapsed => Poll::Ready(Ok(())),
            SleepPhase::Cancelled => Poll::Ready(Err(Cancelled)),
            SleepPhase::Waiting => {
                if self.ctx.stop_token().stop_requested() {
                    return Poll::Ready(Err(Cancelled));
                }
                *self.shared.waker.borrow_mut() = Some(cx.waker().clone());
                if !self.registered {
                    self.registered = true;
                    let task: Rc<dyn TimedTask> = self.shared.clone();
                    self.ctx.register_timed(task, self.after);
                }
                Poll::Pending
            }
        }
    }
}

/// A child future and, once resolved, its output.
enum MaybeDone<F: Future> {
    Running(F),
    Done(Option<F::Output>),
}

impl<F: Future + Unpin> MaybeDone<F> {
    /// Poll if still running; report whether the child has resolved.
    fn poll_once(&mut self, cx: &mut TaskContext<'_>) -> bool {
        match self {
            MaybeDone::Running(f) => match Pin::new(f).poll(cx) {
                Poll::Ready(output) => {
                    *self = MaybeDone::Done(Some(output));
                    true
                }
                Poll::Pending => false,
            },
            MaybeDone::Done(_) => true,
        }
    }

    fn take(&mut self) -> F::Output {
        match self {
            MaybeDone::Done(output) => output.take().expect("output already taken"),
            MaybeDone::Running(_) => unreachable!("child future still running"),
        }
    }
}

/// Joins two readiness futures; completes when both have completed, with
/// cancellation winning over values.
pub struct WhenAll2<A: Future, B: Future> {
    a: MaybeDone<A>,
    b: MaybeDone<B>,
}

pub fn when_all2<A: Future, B: Future>(a: A, b: B) -> WhenAll2<A, B> {
    WhenAll2 {
        a: MaybeDone::Running(a),
        b: MaybeDone::Running(b),
    }
}

impl<Ta, Tb, A, B> Future for WhenAll2<A, B>
where
    A: Future<Output = Result<Ta, Cancelled>> + Unpin,
    B: Future<Output = Result<Tb, Cancelled>> + Unpin,
    Ta: Unpin,
    Tb: Unpin,
{
    type Output = Result<(Ta, Tb), Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let a_done = this.a.poll_once(cx);
        let b_done = this.b.poll_once(cx);
        if !(a_done && b_done) {
            return Poll::Pending;
        }
        match (this.a.take(), this.b.take()) {
            (Ok(a), Ok(b)) => Poll::Ready(Ok((a, b))),
            _ => Poll::Ready(Err(Cancelled)),
        }
    }
}

/// Three-way variant of [`when_all2`].
pub struct WhenAll3<A: Future, B: Future, C: Future> {
    a: MaybeDone<A>,
    b: MaybeDone<B>,
    c: MaybeDone<C>,
}

pub fn when_all3<A: Future, B: Future, C: Future>(a: A, b: B, c: C) -> WhenAll3<A, B, C> {
    WhenAll3 {
        a: MaybeDone::Running(a),
        b: MaybeDone::Running(b),
        c: MaybeDone::Running(c),
    }
}

impl<Ta, Tb, Tc, A, B, C> Future for WhenAll3<A, B, C>
where
    A: Future<Output = Result<Ta, Cancelled>> + Unpin,
    B: Future<Output = Result<Tb, Cancelled>> + Unpin,
    C: Future<Output = Result<Tc, Cancelled>> + Unpin,
    Ta: Unpin,
    Tb: Unpin,
    Tc: Unpin,
{
    type Output = Result<(Ta, Tb, Tc), Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut done = this.a.poll_once(cx);
        done &= this.b.poll_once(cx);
        done &= this.c.poll_once(cx);
        if !done {
            return Poll::Pending;
        }
        match (this.a.take(), this.b.take(), this.c.take()) {
            (Ok(a), Ok(b), Ok(c)) => Poll::Ready(Ok((a, b, c))),
            _ => Poll::Ready(Err(Cancelled)),
        }
    }
}

/// Joins a homogeneous range of readiness futures.
pub struct WhenAllRange<F: Future> {
    children: Vec<MaybeDone<F>>,
}

pub fn when_all_range<F: Future>(children: impl IntoIterator<Item = F>) -> WhenAllRange<F> {
    WhenAllRange {
        children: children.into_iter().map(MaybeDone::Running).collect(),
    }
}

impl<T, F> Future for WhenAllRange<F>
where
    F: Future<Output = Result<T, Cancelled>> + Unpin,
    T: Unpin,
{
    type Output = Result<Vec<T>, Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let mut done = true;
        for child in &mut self.children {
            if !child.poll_once(cx) {
                done = false;
            }
        }
        if !done {
            return Poll::Pending;
        }
        Poll::Ready(self.children.iter_mut().map(MaybeDone::take).collect())
    }
}

/// Re-invoke `factory` and await its future until `predicate` returns true
/// or stop cancels the current round.
pub async fn repeat_until<P, F, Fut, T>(mut predicate: P, mut factory: F) -> Result<(), Cancelled>
where
    P: FnMut() -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Cancelled>>,
{
    while !predicate() {
        factory().await?;
    }
    Ok(())
}
