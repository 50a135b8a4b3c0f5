//! Deadline-ordered timed dispatch layered on the reactor
//!
//! The dispatcher keeps a min-heap of `(deadline, task)` entries and tracks
//! the earliest deadline with a single absolute kernel timeout. Inserting an
//! earlier deadline updates the armed timeout in place
//! (`IORING_OP_TIMEOUT_UPDATE`); stop aborts it (`IORING_OP_TIMEOUT_REMOVE`)
//! so shutdown never waits for a distant deadline. When the timeout fires,
//! every elapsed entry is drained in deadline order and ticked on the
//! reactor's owner thread.
//!
//! Durations are scaled by a configurable time-scale factor before the
//! deadline is computed. `0` fires on the next loop iteration, `1` is
//! real time; entries already queued keep their previously scaled deadline.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::Duration;

use io_uring::{cqueue, opcode, types};
use log::{trace, warn};

use crate::operation::{OpHandle, Operation, RingOperation};
use crate::ring::{with_current_ring, Reactor, ReactorError};

/// Timed dispatch configuration.
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    /// Multiplier applied to durations before deadline computation.
    /// Must be finite and non-negative.
    pub time_scale_factor: f64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            time_scale_factor: 1.0,
        }
    }
}

/// A task that can be woken by the dispatcher.
pub trait TimedTask {
    /// Invoked on the reactor thread once the task's deadline has elapsed.
    fn tick(&self);

    /// Invoked when the dispatcher is stopped with the task still queued.
    fn request_stop(&self);
}

struct TimerEntry {
    deadline_ns: u64,
    task: Rc<dyn TimedTask>,
}

// Reverse ordering for min-heap (earliest deadline first).
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline_ns.cmp(&self.deadline_ns)
    }
}

/// Discards acknowledgement completions for timeout update/remove entries.
/// `ENOENT`/`EALREADY` mean the timeout raced its own expiry; both benign.
struct ControlAck {
    what: &'static str,
}

impl RingOperation for ControlAck {
    const HAS_PREPARE: bool = false;

    fn handle_completion(&self, _handle: OpHandle, cqe: Option<&cqueue::Entry>) {
        if let Some(cqe) = cqe {
            let res = cqe.result();
            if res < 0 && res != -libc::ENOENT && res != -libc::EALREADY {
                warn!("{} failed: {}", self.what, res);
            }
        }
    }
}

/// Min-heap timer service driving [`TimedTask`] ticks from one kernel
/// timeout. Owned by the reactor thread; all methods assume they run there.
pub struct TimerDispatcher {
    time_scale_factor: f64,
    queue: RefCell<BinaryHeap<TimerEntry>>,

    /// Deadline of the in-flight kernel timeout, if armed.
    armed: Cell<Option<u64>>,

    // Timespec slots referenced by in-flight entries. `arm_ts` is rewritten
    // only when no timeout is armed; `update_ts` only ever converges to the
    // newest (earliest) deadline, so overlapping updates stay harmless.
    arm_ts: UnsafeCell<types::Timespec>,
    update_ts: UnsafeCell<types::Timespec>,

    update_ack: Operation<ControlAck>,
    remove_ack: Operation<ControlAck>,
}

impl TimerDispatcher {
    pub fn new(config: TimerConfig) -> Result<Self, ReactorError> {
        let scale = config.time_scale_factor;
        if !scale.is_finite() || scale < 0.0 {
            return Err(ReactorError::TimeScale(scale));
        }
        Ok(Self {
            time_scale_factor: scale,
            queue: RefCell::new(BinaryHeap::new()),
            armed: Cell::new(None),
            arm_ts: UnsafeCell::new(types::Timespec::new()),
            update_ts: UnsafeCell::new(types::Timespec::new()),
            update_ack: Operation::new(ControlAck {
                what: "timeout update",
            }),
            remove_ack: Operation::new(ControlAck {
                what: "timeout remove",
            }),
        })
    }

    pub fn time_scale_factor(&self) -> f64 {
        self.time_scale_factor
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }

    fn scaled_ns(&self, duration: Duration) -> u64 {
        let ns = duration.as_nanos() as f64 * self.time_scale_factor;
        // `as` saturates, which is the right behaviour for far deadlines.
        ns as u64
    }

    /// Register `task` to be ticked once, `after × time_scale_factor` from
    /// now. `self_handle` is the dispatcher's own operation handle.
    pub fn schedule_after(
        &self,
        self_handle: OpHandle,
        ring: &Reactor,
        task: Rc<dyn TimedTask>,
        after: Duration,
    ) {
        let deadline_ns = monotonic_now_ns().saturating_add(self.scaled_ns(after));
        self.queue.borrow_mut().push(TimerEntry { deadline_ns, task });
        self.arm_to_top(self_handle, ring);
    }

    /// Re-arm the kernel timeout if the heap's top is earlier than whatever
    /// is currently armed.
    fn arm_to_top(&self, self_handle: OpHandle, ring: &Reactor) {
        let Some(top) = self.queue.borrow().peek().map(|e| e.deadline_ns) else {
            return;
        };
        match self.armed.get() {
            None => {
                // Safety: no timeout is armed, so nothing references the slot.
                unsafe { *self.arm_ts.get() = timespec_from_ns(top) };
                let entry = opcode::Timeout::new(self.arm_ts.get() as *const types::Timespec)
                    .flags(types::TimeoutFlags::ABS)
                    .build();
                ring.push(entry, self_handle);
                self.armed.set(Some(top));
                trace!("timer armed for {top}ns");
            }
            Some(current) if top < current => {
                // Safety: see the field invariant on `update_ts`.
                unsafe { *self.update_ts.get() = timespec_from_ns(top) };
                let entry = opcode::TimeoutUpdate::new(
                    self_handle.user_data(),
                    self.update_ts.get() as *const types::Timespec,
                )
                .flags(types::TimeoutFlags::ABS)
                .build();
                // Safety: the ack operations live as long as the dispatcher.
                ring.push(entry, unsafe { self.update_ack.handle() });
                self.armed.set(Some(top));
                trace!("timer re-armed earlier, {current}ns -> {top}ns");
            }
            Some(_) => {}
        }
    }

    fn next_elapsed(&self, now_ns: u64) -> Option<Rc<dyn TimedTask>> {
        let mut queue = self.queue.borrow_mut();
        if queue.peek().map_or(false, |e| e.deadline_ns <= now_ns) {
            return queue.pop().map(|e| e.task);
        }
        None
    }

    /// Drain all queued entries, propagating stop to each task, and abort
    /// the armed kernel timeout. Late completions are discarded.
    pub fn request_stop(&self, self_handle: OpHandle, ring: &Reactor) {
        loop {
            let task = self.queue.borrow_mut().pop().map(|e| e.task);
            match task {
                Some(task) => task.request_stop(),
                None => break,
            }
        }
        if self.armed.take().is_some() {
            let entry = opcode::TimeoutRemove::new(self_handle.user_data()).build();
            // Safety: the ack operation lives as long as the dispatcher.
            ring.push(entry, unsafe { self.remove_ack.handle() });
        }
    }
}

impl RingOperation for TimerDispatcher {
    const HAS_PREPARE: bool = false;

    /// Kernel timeout fired (`ETIME`), was cancelled, or raced an update:
    /// either way drain whatever has elapsed and track the new top.
    fn handle_completion(&self, handle: OpHandle, cqe: Option<&cqueue::Entry>) {
        if let Some(cqe) = cqe {
            let res = cqe.result();
            if res < 0 && res != -libc::ETIME && res != -libc::ECANCELED {
                warn!("kernel timeout completed with {res}");
            }
        }
        self.armed.set(None);
        with_current_ring(|ring| {
            let Some(ring) = ring else { return };
            let now_ns = monotonic_now_ns();
            while let Some(task) = self.next_elapsed(now_ns) {
                task.tick();
            }
            self.arm_to_top(handle, ring);
        });
    }
}

fn monotonic_now_ns() -> u64 {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .expect("clock_gettime(CLOCK_MONOTONIC)");
    (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64
}

fn timespec_from_ns(ns: u64) -> types::Timespec {
    types::Timespec::new()
        .sec(ns / 1_000_000_000)
        .nsec((ns % 1_000_000_000) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        order: Rc<RefCell<Vec<u32>>>,
        id: u32,
    }

    impl TimedTask for Recorder {
        fn tick(&self) {
            self.order.borrow_mut().push(self.id);
        }

        fn request_stop(&self) {
            self.order.borrow_mut().push(1000 + self.id);
        }
    }

    fn dispatcher(scale: f64) -> TimerDispatcher {
        TimerDispatcher::new(TimerConfig {
            time_scale_factor: scale,
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_scale() {
        assert!(TimerDispatcher::new(TimerConfig {
            time_scale_factor: -1.0
        })
        .is_err());
        assert!(TimerDispatcher::new(TimerConfig {
            time_scale_factor: f64::NAN
        })
        .is_err());
        assert!(TimerDispatcher::new(TimerConfig {
            time_scale_factor: f64::INFINITY
        })
        .is_err());
    }

    #[test]
    fn test_scaling() {
        let half = dispatcher(0.5);
        assert_eq!(half.scaled_ns(Duration::from_millis(10)), 5_000_000);

        let double = dispatcher(2.0);
        assert_eq!(double.scaled_ns(Duration::from_millis(10)), 20_000_000);

        let zero = dispatcher(0.0);
        assert_eq!(zero.scaled_ns(Duration::from_secs(3600)), 0);
    }

    #[test]
    fn test_entries_drain_in_deadline_order() {
        let dispatcher = dispatcher(1.0);
        let order = Rc::new(RefCell::new(Vec::new()));
        let now = monotonic_now_ns();
        for (id, offset) in [(3u32, 30u64), (1, 10), (2, 20)] {
            dispatcher.queue.borrow_mut().push(TimerEntry {
                deadline_ns: now + offset,
                task: Rc::new(Recorder {
                    order: Rc::clone(&order),
                    id,
                }),
            });
        }

        while let Some(task) = dispatcher.next_elapsed(now + 100) {
            task.tick();
        }
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn test_next_elapsed_respects_deadline() {
        let dispatcher = dispatcher(1.0);
        let order = Rc::new(RefCell::new(Vec::new()));
        let now = monotonic_now_ns();
        dispatcher.queue.borrow_mut().push(TimerEntry {
            deadline_ns: now + 1_000_000,
            task: Rc::new(Recorder {
                order: Rc::clone(&order),
                id: 7,
            }),
        });

        assert!(dispatcher.next_elapsed(now).is_none());
        assert!(dispatcher.next_elapsed(now + 1_000_000).is_some());
    }

    #[test]
    fn test_request_stop_propagates_to_queued_tasks() {
        use crate::ring::RingConfig;

        let ring = Reactor::new(RingConfig::default()).unwrap();
        let op = Operation::new(dispatcher(1.0));
        let order = Rc::new(RefCell::new(Vec::new()));
        let now = monotonic_now_ns();
        for id in [1u32, 2] {
            op.get().queue.borrow_mut().push(TimerEntry {
                deadline_ns: now + id as u64 * 1_000_000_000,
                task: Rc::new(Recorder {
                    order: Rc::clone(&order),
                    id,
                }),
            });
        }

        let handle = unsafe { op.handle() };
        op.get().request_stop(handle, &ring);
        assert!(op.get().is_empty());
        assert_eq!(*order.borrow(), vec![1001, 1002]);
        // Nothing was armed, so nothing was pushed onto the ring.
        assert_eq!(ring.in_flight(), 0);
    }
}
