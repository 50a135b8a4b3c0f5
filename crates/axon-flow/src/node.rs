//! The node contract and its execution loop
//!
//! A node alternates between `trigger` (a lazy readiness future) and
//! `execute` (a prompt computation over the values read). The loop below
//! drives that state machine on the node's host context until stop is
//! requested or the trigger resolves as cancelled; produced values fan out
//! through the node's output.
//!
//! `trigger` is the only readiness customisation point. The canonical
//! strategies:
//!
//! - periodic: `ctx.schedule_after(self.period)`
//! - data-driven: `when_all2(self.a.await_one(ctx), self.b.await_one(ctx))`
//! - polling: `ctx.schedule()` first, then `self.a.take_now()` in `execute`
//! - custom: any future resolving to `Result<Readiness, Cancelled>`

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use log::{debug, trace};

use axon_core::Cancelled;
use axon_reactor::Context;

use crate::output::Output;

/// A user-defined operator with inputs, an optional output and a
/// trigger/execute pair.
pub trait Node: 'static {
    /// Values delivered by one trigger completion: `()` for time-based
    /// readiness, or the tuple of values read from input ports.
    type Readiness;

    /// Value produced per execution; `()` for sinks and self-publishing
    /// nodes.
    type Value: Clone;

    fn name(&self) -> &str;

    /// Build the readiness future for the next execution.
    fn trigger(&mut self, ctx: &Context) -> impl Future<Output = Result<Self::Readiness, Cancelled>>;

    /// Consume one readiness worth of values. Must return promptly; blocking
    /// the reactor thread is forbidden, and a panic aborts the reactor.
    fn execute(&mut self, readiness: Self::Readiness) -> Self::Value;

    /// The output produced values fan out through, if any.
    fn output(&self) -> Option<&Output<Self::Value>> {
        None
    }
}

/// Drive `node` until stop: `trigger → execute → publish`, repeated.
pub(crate) async fn drive<N: Node>(node: Rc<RefCell<N>>, ctx: Context) {
    let name = node.borrow().name().to_string();
    debug!("node '{name}' started");
    let token = ctx.stop_token();
    loop {
        if token.stop_requested() {
            break;
        }
        // The loop is the only borrower while a node runs; ports are shared
        // through their own state, not through the node.
        let mut n = node.borrow_mut();
        let readiness = match n.trigger(&ctx).await {
            Ok(readiness) => readiness,
            Err(Cancelled) => break,
        };
        let value = n.execute(readiness);
        if let Some(output) = n.output() {
            let outcome = output.publish(value);
            if outcome.dropped > 0 {
                trace!("node '{name}' dropped {} deliveries", outcome.dropped);
            }
        }
    }
    debug!("node '{name}' stopped");
}
