//! Output fan-out to downstream inputs
//!
//! An output owns the list of downstream inputs wired at graph-construction
//! time. Publishing clones the value into each downstream in registration
//! order; overflow reports are aggregated into the returned outcome and never
//! abort the publishing node.

use std::cell::RefCell;

use log::debug;

use crate::input::{PushResult, TypedInput};

/// Per-publish delivery summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

/// A node output with zero or more downstream connections.
///
/// Edges are immutable once the graph has started; reconnection at runtime
/// is not supported.
pub struct Output<T> {
    connections: RefCell<Vec<TypedInput<T>>>,
}

impl<T> Default for Output<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Output<T> {
    pub fn new() -> Self {
        Self {
            connections: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn connect_to(&self, input: &TypedInput<T>) {
        self.connections.borrow_mut().push(input.clone());
    }

    /// Number of downstream inputs.
    pub fn fan_out(&self) -> usize {
        self.connections.borrow().len()
    }

    /// Deliver `value` to every downstream input in registration order.
    pub fn publish(&self, value: T) -> PublishOutcome
    where
        T: Clone,
    {
        let connections = self.connections.borrow();
        let mut outcome = PublishOutcome::default();
        for input in connections.iter() {
            match input.set_value(value.clone()) {
                PushResult::Accepted => outcome.delivered += 1,
                PushResult::Overflow => outcome.dropped += 1,
            }
        }
        if outcome.dropped > 0 {
            debug!(
                "publish dropped {} of {} downstream deliveries",
                outcome.dropped,
                connections.len()
            );
        }
        outcome
    }
}
