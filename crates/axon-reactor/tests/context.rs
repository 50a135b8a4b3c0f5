//! Context-level scenarios: owner-thread delivery, timer scaling, foreign
//! stop during an await.

use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use axon_reactor::{
    repeat_until, when_all_range, Context, ContextConfig, StopHandle, TimerConfig,
};

/// Run `f` on a fresh context thread; returns the thread's id, a stop handle
/// and the join handle. `f` spawns whatever tasks the test needs.
fn run_on_context_thread<T: Send + 'static>(
    config: ContextConfig,
    f: impl FnOnce(&Context, mpsc::Sender<T>) + Send + 'static,
) -> (mpsc::Receiver<T>, StopHandle, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let (stop_tx, stop_rx) = mpsc::channel();
    let join = thread::spawn(move || {
        let ctx = Context::new(config).expect("context init");
        stop_tx.send(ctx.stop_handle()).unwrap();
        f(&ctx, tx);
        ctx.run();
    });
    let stop = stop_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    (rx, stop, join)
}

#[test]
fn schedule_completes_on_owner_thread() {
    let (rx, _stop, join) = run_on_context_thread(ContextConfig::default(), |ctx, tx| {
        let inner = ctx.clone();
        ctx.spawn(async move {
            inner.schedule().await.unwrap();
            tx.send(thread::current().id()).unwrap();
            inner.request_stop();
        });
    });

    let observed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let reactor_thread = join.thread().id();
    assert_eq!(observed, reactor_thread);
    assert_ne!(observed, thread::current().id());
    join.join().unwrap();
}

fn timed_parallel_sleeps(scale: f64, sleep_ms: u64) -> Duration {
    let config = ContextConfig {
        timer: TimerConfig {
            time_scale_factor: scale,
        },
        ..Default::default()
    };
    let (rx, _stop, join) = run_on_context_thread(config, move |ctx, tx| {
        let inner = ctx.clone();
        ctx.spawn(async move {
            let started = Instant::now();
            let sleeps =
                (0..10).map(|_| inner.schedule_after(Duration::from_millis(sleep_ms)));
            when_all_range(sleeps).await.unwrap();
            tx.send(started.elapsed()).unwrap();
            inner.request_stop();
        });
    });
    let elapsed = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    join.join().unwrap();
    elapsed
}

#[test]
fn timer_scaling_compresses_and_stretches() {
    // 10 timers of 10ms at factor 0.5 fire after ~5ms of wall clock.
    let compressed = timed_parallel_sleeps(0.5, 10);
    assert!(compressed >= Duration::from_millis(4), "fired early: {compressed:?}");
    assert!(compressed < Duration::from_millis(200), "fired late: {compressed:?}");

    // Factor 2.0 stretches the same request to ~20ms.
    let stretched = timed_parallel_sleeps(2.0, 10);
    assert!(stretched >= Duration::from_millis(19), "fired early: {stretched:?}");
    assert!(stretched < Duration::from_millis(500), "fired late: {stretched:?}");
}

#[test]
fn timer_never_fires_early() {
    for _ in 0..5 {
        let (rx, _stop, join) =
            run_on_context_thread(ContextConfig::default(), |ctx, tx| {
                let inner = ctx.clone();
                ctx.spawn(async move {
                    let started = Instant::now();
                    inner.schedule_after(Duration::from_millis(5)).await.unwrap();
                    tx.send(started.elapsed()).unwrap();
                    inner.request_stop();
                });
            });
        let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        join.join().unwrap();
        assert!(elapsed >= Duration::from_millis(5), "fired early: {elapsed:?}");
    }
}

#[test]
fn repeat_until_runs_factory_until_predicate() {
    let (rx, _stop, join) = run_on_context_thread(ContextConfig::default(), |ctx, tx| {
        let inner = ctx.clone();
        ctx.spawn(async move {
            let count = Rc::new(std::cell::Cell::new(0u32));
            let seen = Rc::clone(&count);
            let sched = inner.clone();
            repeat_until(
                move || seen.get() >= 5,
                move || {
                    count.set(count.get() + 1);
                    sched.schedule()
                },
            )
            .await
            .unwrap();
            tx.send(()).unwrap();
            inner.request_stop();
        });
    });

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    join.join().unwrap();
}

#[test]
fn foreign_stop_cancels_pending_sleep() {
    let (rx, stop, join) = run_on_context_thread(ContextConfig::default(), |ctx, tx| {
        let inner = ctx.clone();
        ctx.spawn(async move {
            let res = inner.schedule_after(Duration::from_secs(3600)).await;
            tx.send(res).unwrap();
        });
    });

    // Let the sleep get registered, then stop from this thread.
    thread::sleep(Duration::from_millis(20));
    let stopped_at = Instant::now();
    stop.request_stop();

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(outcome.is_err(), "sleep should have been cancelled");
    join.join().unwrap();
    assert!(
        stopped_at.elapsed() < Duration::from_secs(5),
        "stop took {:?}",
        stopped_at.elapsed()
    );
}
