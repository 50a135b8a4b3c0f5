//! Single-threaded task executor driven by the reactor's progress hook
//!
//! Tasks are reference-counted futures living on the reactor's owner thread.
//! Wakers push their task onto a ready queue; the reactor's `on_progress`
//! callback drains one snapshot of that queue per loop iteration, so a task
//! that re-wakes itself (yield) runs again on the *next* iteration rather
//! than starving I/O.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::mem::ManuallyDrop;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub(crate) struct Executor {
    shared: Rc<ExecShared>,

    /// Every spawned task, for stop broadcast. Compacted opportunistically.
    tasks: RefCell<Vec<Weak<Task>>>,
}

struct ExecShared {
    ready: RefCell<VecDeque<Rc<Task>>>,
}

struct Task {
    /// `None` once the future has completed; the slot is also emptied while
    /// the future is being polled.
    future: RefCell<Option<Pin<Box<dyn Future<Output = ()>>>>>,
    queued: Cell<bool>,
    shared: Rc<ExecShared>,
}

impl Task {
    fn schedule(self: &Rc<Self>) {
        if self.queued.replace(true) {
            return;
        }
        self.shared.ready.borrow_mut().push_back(Rc::clone(self));
    }
}

impl Executor {
    pub(crate) fn new() -> Self {
        Self {
            shared: Rc::new(ExecShared {
                ready: RefCell::new(VecDeque::new()),
            }),
            tasks: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        let task = Rc::new(Task {
            future: RefCell::new(Some(Box::pin(future))),
            queued: Cell::new(false),
            shared: Rc::clone(&self.shared),
        });
        self.tasks.borrow_mut().push(Rc::downgrade(&task));
        task.schedule();
    }

    /// Poll everything currently ready. Returns whether tasks were woken
    /// while polling and are waiting for the next iteration.
    pub(crate) fn poll_ready(&self) -> bool {
        let mut batch = std::mem::take(&mut *self.shared.ready.borrow_mut());
        for task in batch.drain(..) {
            task.queued.set(false);
            let Some(mut future) = task.future.borrow_mut().take() else {
                continue;
            };
            let waker = task_waker(&task);
            let mut cx = Context::from_waker(&waker);
            match future.as_mut().poll(&mut cx) {
                // Dropping the completed future here releases whatever it
                // captured (ports, wakers), breaking reference cycles.
                Poll::Ready(()) => {}
                Poll::Pending => {
                    *task.future.borrow_mut() = Some(future);
                }
            }
        }
        !self.shared.ready.borrow().is_empty()
    }

    /// Wake every live task once, so each pending future re-checks the stop
    /// token and resolves as cancelled.
    pub(crate) fn wake_all(&self) {
        for weak in self.tasks.borrow().iter() {
            if let Some(task) = weak.upgrade() {
                task.schedule();
            }
        }
        self.tasks.borrow_mut().retain(|w| w.strong_count() > 0);
    }
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_raw, wake_raw, wake_by_ref_raw, drop_raw);

fn task_waker(task: &Rc<Task>) -> Waker {
    let ptr = Rc::into_raw(Rc::clone(task)) as *const ();
    // Safety: the vtable functions uphold the Rc contract below.
    unsafe { Waker::from_raw(RawWaker::new(ptr, &VTABLE)) }
}

unsafe fn clone_raw(ptr: *const ()) -> RawWaker {
    Rc::increment_strong_count(ptr as *const Task);
    RawWaker::new(ptr, &VTABLE)
}

unsafe fn wake_raw(ptr: *const ()) {
    let task = Rc::from_raw(ptr as *const Task);
    task.schedule();
}

unsafe fn wake_by_ref_raw(ptr: *const ()) {
    let task = ManuallyDrop::new(Rc::from_raw(ptr as *const Task));
    task.schedule();
}

unsafe fn drop_raw(ptr: *const ()) {
    drop(Rc::from_raw(ptr as *const Task));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawned_task_runs() {
        let executor = Executor::new();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        executor.spawn(async move {
            flag.set(true);
        });

        executor.poll_ready();
        assert!(ran.get());
    }

    #[test]
    fn test_yield_defers_to_next_round() {
        struct YieldOnce(bool);
        impl Future for YieldOnce {
            type Output = ();
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                if self.0 {
                    Poll::Ready(())
                } else {
                    self.0 = true;
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            }
        }

        let executor = Executor::new();
        let done = Rc::new(Cell::new(false));
        let flag = Rc::clone(&done);
        executor.spawn(async move {
            YieldOnce(false).await;
            flag.set(true);
        });

        // First round: the task yields and re-queues itself.
        assert!(executor.poll_ready());
        assert!(!done.get());

        // Second round: it completes.
        assert!(!executor.poll_ready());
        assert!(done.get());
    }

    #[test]
    fn test_wake_all_reaches_pending_tasks() {
        struct WaitForFlag(Rc<Cell<bool>>);
        impl Future for WaitForFlag {
            type Output = ();
            fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
                if self.0.get() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
        }

        let executor = Executor::new();
        let flag = Rc::new(Cell::new(false));
        let done = Rc::new(Cell::new(false));
        {
            let flag = Rc::clone(&flag);
            let done = Rc::clone(&done);
            executor.spawn(async move {
                WaitForFlag(flag).await;
                done.set(true);
            });
        }

        assert!(!executor.poll_ready());
        assert!(!done.get());

        flag.set(true);
        executor.wake_all();
        executor.poll_ready();
        assert!(done.get());
    }

    #[test]
    fn test_completed_task_ignores_stale_wake() {
        let executor = Executor::new();
        executor.spawn(async {});
        executor.poll_ready();

        executor.wake_all();
        assert!(!executor.poll_ready());
    }
}
