//! Cross-thread reactor scenarios: foreign submit, foreign stop, drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use axon_reactor::io_uring::{cqueue, opcode, squeue};
use axon_reactor::{OpHandle, Operation, Reactor, RingConfig, RingOperation};

struct FlagNop {
    completed: Arc<AtomicBool>,
}

impl RingOperation for FlagNop {
    fn prepare(&self, _handle: OpHandle) -> squeue::Entry {
        opcode::Nop::new().build()
    }

    fn handle_completion(&self, _handle: OpHandle, cqe: Option<&cqueue::Entry>) {
        if let Some(cqe) = cqe {
            assert!(cqe.result() >= 0, "nop failed: {}", cqe.result());
        }
        self.completed.store(true, Ordering::Release);
    }
}

fn start_reactor() -> (Arc<Reactor>, thread::JoinHandle<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let reactor = Arc::new(Reactor::new(RingConfig::default()).unwrap());
    let handle = {
        let reactor = Arc::clone(&reactor);
        thread::spawn(move || reactor.run(|| {}, || false))
    };
    let started = Instant::now();
    while !reactor.is_running() {
        assert!(started.elapsed() < Duration::from_secs(5), "reactor never came up");
        thread::yield_now();
    }
    (reactor, handle)
}

fn wait_for(what: &str, deadline: Duration, mut check: impl FnMut() -> bool) {
    let started = Instant::now();
    while !check() {
        assert!(started.elapsed() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn foreign_submit_completes_on_owner() {
    let (reactor, join) = start_reactor();

    let completed = Arc::new(AtomicBool::new(false));
    let op = Operation::new(FlagNop {
        completed: Arc::clone(&completed),
    });
    // Safety: `op` stays on this stack frame until after the reactor joins.
    let handle = unsafe { op.handle() };
    reactor.submit(handle);

    wait_for("foreign nop completion", Duration::from_millis(100), || {
        completed.load(Ordering::Acquire)
    });

    reactor.request_stop();
    join.join().unwrap();
    assert_eq!(reactor.in_flight(), 0);
}

#[test]
fn foreign_stop_returns_promptly() {
    let (reactor, join) = start_reactor();

    let stopped_at = Instant::now();
    reactor.request_stop();
    join.join().unwrap();
    assert!(
        stopped_at.elapsed() < Duration::from_millis(100),
        "stop took {:?}",
        stopped_at.elapsed()
    );
    assert_eq!(reactor.in_flight(), 0);
    assert!(!reactor.is_running());
}

#[test]
fn request_stop_is_idempotent() {
    let (reactor, join) = start_reactor();

    reactor.request_stop();
    reactor.request_stop();
    join.join().unwrap();

    // And again after the loop has exited.
    reactor.request_stop();
    assert!(reactor.stop_requested());
    assert_eq!(reactor.in_flight(), 0);
}

#[test]
fn many_foreign_submitters() {
    let (reactor, join) = start_reactor();

    let flags: Vec<Arc<AtomicBool>> = (0..8).map(|_| Arc::new(AtomicBool::new(false))).collect();
    let submitters: Vec<_> = flags
        .iter()
        .map(|flag| {
            let reactor = Arc::clone(&reactor);
            let completed = Arc::clone(flag);
            thread::spawn(move || {
                let op = Operation::new(FlagNop { completed });
                // Safety: the submitting thread blocks below until the
                // completion has been observed.
                let handle = unsafe { op.handle() };
                reactor.submit(handle);
                while !op.get().completed.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();

    for submitter in submitters {
        submitter.join().unwrap();
    }
    assert!(flags.iter().all(|f| f.load(Ordering::Acquire)));

    reactor.request_stop();
    join.join().unwrap();
    assert_eq!(reactor.in_flight(), 0);
}

#[test]
fn reactor_reusable_after_clean_exit() {
    // Ring fd registration is undone on exit, so a second transient reactor
    // on the same thread must come up cleanly.
    for _ in 0..3 {
        let reactor = Reactor::new(RingConfig::default()).unwrap();
        reactor.request_stop();
        reactor.run(|| {}, || false);
        assert_eq!(reactor.in_flight(), 0);
    }
}
