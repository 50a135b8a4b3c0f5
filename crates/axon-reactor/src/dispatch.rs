//! Cross-ring dispatch: foreign-thread submission and stop
//!
//! A thread that does not own a reactor cannot touch its queues. Instead it
//! lazily sets up a per-thread helper ring and sends the real operation's
//! handle to the destination ring as an `IORING_OP_MSG_RING` payload. The
//! destination's run loop receives the payload as an ordinary completion and
//! either re-submits the operation (prepare-capable) or fires it directly
//! (pure trigger), then releases the waiting sender through a futex flag.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use io_uring::{cqueue, opcode, squeue, types};
use log::{trace, warn};

use crate::operation::{OpHandle, Operation, RingOperation, WAKEUP_USER_DATA};
use crate::ring::{Reactor, RingConfig};

thread_local! {
    /// Helper ring for dispatching from this (non-owner) thread.
    static HELPER_RING: Reactor = Reactor::new(RingConfig::default())
        .unwrap_or_else(|e| panic!("dispatch helper ring init failed: {e}"));
}

/// One-shot flag released by the destination's owner thread while the
/// dispatching thread sleeps in the kernel.
struct FutexFlag {
    word: AtomicU32,
}

impl FutexFlag {
    fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    fn set(&self) {
        self.word.store(1, Ordering::Release);
        // Safety: plain futex wake on our own word.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.word.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                i32::MAX,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    fn wait(&self) {
        while self.word.load(Ordering::Acquire) == 0 {
            // Safety: sleeps only while the word still reads 0; spurious
            // wakeups re-check the flag.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.word.as_ptr(),
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    0u32,
                    std::ptr::null::<libc::timespec>(),
                    std::ptr::null::<u32>(),
                    0u32,
                );
            }
        }
    }
}

/// Carries one operation handle from the helper ring to the destination.
///
/// Its completion callback runs twice: once on the destination's owner
/// thread (msg-ring payload), once on the helper ring (acknowledgement of
/// the send itself).
struct DispatchOp<'a> {
    destination: &'a Reactor,
    payload: OpHandle,
    dispatch_done: AtomicBool,
    submit_done: FutexFlag,
}

impl RingOperation for DispatchOp<'_> {
    fn prepare(&self, handle: OpHandle) -> squeue::Entry {
        opcode::MsgRingData::new(
            types::Fd(self.destination.fd()),
            0,
            handle.as_remote().user_data(),
            None,
        )
        .build()
    }

    fn handle_completion(&self, _handle: OpHandle, cqe: Option<&cqueue::Entry>) {
        if self.destination.is_current() {
            // Payload delivery on the destination's owner thread. Operations
            // without a prepare step are plain triggers and skip the submit
            // phase entirely.
            if self.payload.has_prepare() {
                self.destination.submit(self.payload);
            } else {
                // Safety: the dispatching thread keeps the payload alive
                // until it has observed `submit_done`.
                unsafe { self.payload.complete(None) };
            }
            self.submit_done.set();
            return;
        }
        // Acknowledgement of the msg-ring send on the helper ring.
        let res = cqe.map_or(0, |c| c.result());
        if res < 0 {
            panic!(
                "cross-ring dispatch failed: {}",
                io::Error::from_raw_os_error(-res)
            );
        }
        self.dispatch_done.store(true, Ordering::Release);
    }
}

/// Route `payload` to `destination` from a foreign thread.
///
/// Blocks until the destination's owner thread has accepted the operation
/// (submitted it, or fired it if it is a pure trigger).
pub(crate) fn dispatch_to(destination: &Reactor, payload: OpHandle) {
    trace!("dispatching operation to reactor fd {}", destination.fd());
    let op = Operation::new(DispatchOp {
        destination,
        payload,
        dispatch_done: AtomicBool::new(false),
        submit_done: FutexFlag::new(),
    });
    // Safety: `op` stays on this stack frame until both completions have
    // been observed below.
    let handle = unsafe { op.handle() };
    HELPER_RING.with(|helper| {
        helper.submit_local(handle);
        while !op.get().dispatch_done.load(Ordering::Acquire) {
            helper.run_once(true);
        }
    });
    op.get().submit_done.wait();
}

/// Stop request processed on the destination's owner thread.
struct StopOp<'a> {
    destination: &'a Reactor,
    done: FutexFlag,
}

impl RingOperation for StopOp<'_> {
    const HAS_PREPARE: bool = false;

    fn handle_completion(&self, _handle: OpHandle, _cqe: Option<&cqueue::Entry>) {
        self.destination.stop_ref().request_stop();
        self.done.set();
    }
}

/// Request stop from a foreign thread through the dispatch path.
pub(crate) fn dispatch_stop(destination: &Reactor) {
    let op = Operation::new(StopOp {
        destination,
        done: FutexFlag::new(),
    });
    // Safety: `op` outlives the wait below, and the trigger fires before
    // `submit_done` is released.
    let handle = unsafe { op.handle() };
    dispatch_to(destination, handle);
    op.get().done.wait();
}

/// Fire-and-forget loop wakeup.
///
/// Posts the reserved wakeup word to the destination's completion queue so a
/// parked loop re-checks its exit condition. Used when a stop flag was set
/// directly while the loop was coming up; the completion carries no pointer,
/// so it is harmless if the loop has already exited.
struct WakeupOp {
    destination_fd: RawFd,
    sent: AtomicBool,
}

impl RingOperation for WakeupOp {
    fn prepare(&self, _handle: OpHandle) -> squeue::Entry {
        opcode::MsgRingData::new(types::Fd(self.destination_fd), 0, WAKEUP_USER_DATA, None).build()
    }

    fn handle_completion(&self, _handle: OpHandle, cqe: Option<&cqueue::Entry>) {
        let res = cqe.map_or(0, |c| c.result());
        if res < 0 {
            // Destination may be mid-teardown; the stop flag is already set.
            warn!(
                "reactor wakeup not delivered: {}",
                io::Error::from_raw_os_error(-res)
            );
        }
        self.sent.store(true, Ordering::Release);
    }
}

pub(crate) fn wakeup(destination: &Reactor) {
    let op = Operation::new(WakeupOp {
        destination_fd: destination.fd(),
        sent: AtomicBool::new(false),
    });
    // Safety: `op` outlives the helper-ring drain below.
    let handle = unsafe { op.handle() };
    HELPER_RING.with(|helper| {
        helper.submit_local(handle);
        while !op.get().sent.load(Ordering::Acquire) {
            helper.run_once(true);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_futex_flag_cross_thread() {
        let flag = Arc::new(FutexFlag::new());
        let waker = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                flag.set();
            })
        };
        flag.wait();
        waker.join().unwrap();
        assert_eq!(flag.word.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_futex_flag_set_before_wait() {
        let flag = FutexFlag::new();
        flag.set();
        flag.wait();
    }

    #[test]
    fn test_wakeup_word_ignored_by_loop() {
        // A wakeup posted to a reactor that is not running must simply sit
        // in the queue and be discarded by the next drain.
        let reactor = Reactor::new(RingConfig::default()).unwrap();
        let op = Operation::new(WakeupOp {
            destination_fd: reactor.fd(),
            sent: AtomicBool::new(false),
        });
        let handle = unsafe { op.handle() };
        HELPER_RING.with(|helper| {
            helper.submit_local(handle);
            while !op.get().sent.load(Ordering::Acquire) {
                helper.run_once(true);
            }
        });
        // Drain the destination: the wakeup must not be dispatched anywhere.
        reactor.run_once(false);
        assert_eq!(reactor.in_flight(), 0);
    }
}
