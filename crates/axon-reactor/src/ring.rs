//! Single-threaded completion reactor over a kernel submission ring
//!
//! One OS thread owns each [`Reactor`]: the thread executing [`Reactor::run`]
//! is the owner and the only one allowed to touch the ring's queues. Foreign
//! threads interact exclusively through the cross-ring dispatch protocol in
//! [`crate::dispatch`], which injects work as `MSG_RING` completions.
//!
//! The loop terminates only once stop has been requested, the progress
//! callback reports no pending work, and every locally submitted entry has
//! been reaped (`in_flight == 0`), so no user-data pointer outlives the loop.

use std::cell::Cell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use io_uring::{cqueue, squeue, IoUring};
use log::trace;
use thiserror::Error;

use axon_core::CancellationToken;

use crate::dispatch;
use crate::operation::{OpHandle, WAKEUP_USER_DATA};
use crate::sys;

/// Reactor construction parameters, passed through to ring setup.
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Number of submission queue entries. Rounded up by the kernel to a
    /// power of two.
    pub entries: u32,
}

pub const DEFAULT_ENTRY_COUNT: u32 = 256;

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            entries: DEFAULT_ENTRY_COUNT,
        }
    }
}

/// Reactor errors surfaced to callers. Everything past construction that the
/// kernel rejects for non-transient reasons is a panic, not an error.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The kernel rejected the ring configuration.
    #[error("kernel rejected ring configuration: {0}")]
    Config(#[source] io::Error),

    /// The timer configuration is out of range.
    #[error("invalid time scale factor: {0}")]
    TimeScale(f64),
}

thread_local! {
    /// The reactor currently running on this thread, if any. Set for the
    /// duration of one `run()` call.
    static CURRENT_RING: Cell<*const Reactor> = const { Cell::new(ptr::null()) };
}

/// Run `f` with the reactor owning the current thread, if one is running.
pub(crate) fn with_current_ring<R>(f: impl FnOnce(Option<&Reactor>) -> R) -> R {
    CURRENT_RING.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            f(None)
        } else {
            // Safety: the pointee is alive for the whole `run()` call that
            // installed it, and we are on its owner thread.
            f(Some(unsafe { &*ptr }))
        }
    })
}

/// Completion-based I/O reactor owning one kernel ring.
pub struct Reactor {
    ring: IoUring,

    /// Entries accepted into the ring but not yet finally completed.
    /// Mutated by the owner thread; readable from anywhere for diagnostics.
    in_flight: AtomicU64,

    running: AtomicBool,
    stop: CancellationToken,
}

impl Reactor {
    /// Initialise a kernel ring. Fails with [`ReactorError::Config`] if the
    /// kernel rejects the configuration.
    pub fn new(config: RingConfig) -> Result<Self, ReactorError> {
        let ring = IoUring::builder()
            .build(config.entries)
            .map_err(ReactorError::Config)?;
        Ok(Self {
            ring,
            in_flight: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stop: CancellationToken::new(),
        })
    }

    /// Shared stop token for this reactor.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub(crate) fn stop_ref(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.stop_requested()
    }

    /// Whether the calling thread is this reactor's owner thread.
    pub fn is_current(&self) -> bool {
        CURRENT_RING.with(|cell| ptr::eq(cell.get(), self))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Diagnostic count of accepted-but-unreaped entries.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    /// Request this reactor to stop.
    ///
    /// Safe to call from any thread. From a foreign thread while the loop is
    /// running, the request travels through the dispatch protocol so the
    /// owner processes it on its own thread; the reactor is fully stopped
    /// only once `run()` returns.
    pub fn request_stop(&self) {
        if !self.is_current() && self.is_running() {
            dispatch::dispatch_stop(self);
            return;
        }
        self.stop.request_stop();
        // The loop may have come up between the running check and the store,
        // in which case it could already be parked: kick it awake.
        if !self.is_current() && self.is_running() {
            dispatch::wakeup(self);
        }
    }

    /// Submit an operation.
    ///
    /// From the owner thread the operation's entry is pushed straight onto
    /// the ring; from any other thread it is transparently routed through
    /// the dispatch protocol and this call blocks until the owner has
    /// accepted it. The operation receives exactly one completion, which may
    /// report cancellation if the reactor is draining for shutdown.
    pub fn submit(&self, handle: OpHandle) {
        if !self.is_current() && self.is_running() {
            dispatch::dispatch_to(self, handle);
            return;
        }
        self.submit_local(handle);
    }

    pub(crate) fn submit_local(&self, handle: OpHandle) {
        if !handle.has_prepare() {
            // Pure trigger: no kernel entry to submit.
            // Safety: liveness guaranteed by the handle contract.
            unsafe { handle.complete(None) };
            return;
        }
        // Safety: same as above.
        let entry = unsafe { handle.prepare() };
        self.push(entry, handle);
    }

    /// Push a pre-built entry attributed to `handle` onto the ring,
    /// flushing to the kernel as needed until the queue accepts it.
    pub(crate) fn push(&self, entry: squeue::Entry, handle: OpHandle) {
        let entry = entry.user_data(handle.user_data());
        loop {
            if self.stop.stop_requested() && self.in_flight.load(Ordering::Acquire) == 0 {
                // Draining for shutdown: abandon the submission and report
                // cancellation instead.
                // Safety: liveness guaranteed by the handle contract.
                unsafe { handle.complete(None) };
                return;
            }
            // Safety: the submission queue is touched by the owner thread
            // only (`submit` routes foreign callers through dispatch).
            let accepted = unsafe { self.ring.submission_shared().push(&entry).is_ok() };
            if accepted {
                self.in_flight.fetch_add(1, Ordering::Release);
                return;
            }
            match self.ring.submitter().submit() {
                Ok(_) => {}
                Err(ref e) if is_transient(e) => {}
                Err(e) => panic!("io_uring submit failed: {e}"),
            }
        }
    }

    /// One iteration of the loop: flush submissions, optionally park until a
    /// completion is ready, then drain every ready completion.
    ///
    /// Owner thread only; `run` calls this repeatedly and is what almost all
    /// callers want.
    pub fn run_once(&self, block: bool) {
        let res = if block {
            self.ring.submitter().submit_and_wait(1)
        } else {
            self.ring.submitter().submit()
        };
        match res {
            Ok(_) => {}
            Err(ref e) if is_transient(e) => {}
            Err(e) => panic!("io_uring enter failed: {e}"),
        }

        loop {
            let cqe = {
                // Safety: completion queue accessed from the owner thread
                // only; dropping the queue view commits the consumed head.
                let mut cq = unsafe { self.ring.completion_shared() };
                cq.next()
            };
            let Some(cqe) = cqe else { break };
            if cqe.user_data() == WAKEUP_USER_DATA {
                continue;
            }
            let handle = OpHandle::from_user_data(cqe.user_data());
            // Safety: in-flight operations are pinned until this callback.
            unsafe { handle.complete(Some(&cqe)) };
            // Remote completions were never accepted into this ring and do
            // not participate in the in-flight count.
            if !cqueue::more(cqe.flags()) && !handle.is_remote() {
                self.in_flight.fetch_sub(1, Ordering::Release);
            }
        }
    }

    /// Drive the reactor on the calling thread until stopped and drained.
    ///
    /// `on_started` runs once the thread has become the owner;
    /// `on_progress` runs after every iteration and reports whether local
    /// work is still pending (in which case the next iteration does not
    /// park).
    ///
    /// Panics if the calling thread already hosts a running reactor.
    pub fn run(&self, on_started: impl FnOnce(), mut on_progress: impl FnMut() -> bool) {
        CURRENT_RING.with(|cell| {
            assert!(
                cell.get().is_null(),
                "cannot run reactor: another reactor is already active on this thread"
            );
            cell.set(self);
        });

        let registered = match sys::register_ring_fd(self.fd()) {
            Ok(offset) => offset,
            Err(e) => panic!("io_uring ring fd registration failed: {e}"),
        };
        trace!("reactor loop starting (fd {})", self.fd());

        self.running.store(true, Ordering::Release);
        on_started();
        let mut more_work = on_progress();
        while more_work || !self.stop.stop_requested() || self.in_flight.load(Ordering::Acquire) > 0
        {
            self.run_once(!more_work);
            more_work = on_progress();
        }
        self.running.store(false, Ordering::Release);

        if let Err(e) = sys::unregister_ring_fd(self.fd(), registered) {
            panic!("io_uring ring fd unregistration failed: {e}");
        }
        CURRENT_RING.with(|cell| cell.set(ptr::null()));
        trace!("reactor loop exited (fd {})", self.fd());
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EINTR))
}
