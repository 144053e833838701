//! Tracks whether a set of monitored threads are all idle (§3.3, §4.3).
//!
//! The busy-count is incremented when a monitored thread leaves
//! `SLEEPING` and decremented when it enters `SLEEPING`
//! (`Thread::sleep`/`Thread::wake` call `enter_running`/`leave_running`
//! on the waiter they are registered with). When the count reaches zero
//! the waiter-owning (main) thread is woken, implementing the `flush()`
//! drain pattern: `while (!waiter.is_idle()) { try_poll(); thread_wait(); }`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::thread::Thread;

pub struct IdleWaiter {
    busy: AtomicUsize,
    owner: Mutex<Option<Arc<Thread>>>,
    monitored: Mutex<Vec<Arc<Thread>>>,
}

impl IdleWaiter {
    pub fn new(owner: Arc<Thread>) -> Arc<Self> {
        Arc::new(IdleWaiter {
            busy: AtomicUsize::new(0),
            owner: Mutex::new(Some(owner)),
            monitored: Mutex::new(Vec::new()),
        })
    }

    /// §4.3 `monitor`. Binds the waiter to a running thread, incrementing
    /// the busy count iff that thread is not already sleeping.
    pub fn monitor(self: &Arc<Self>, thread: Arc<Thread>) {
        use crate::thread::ThreadState;
        if thread.state() == ThreadState::Running {
            self.busy.fetch_add(1, Ordering::SeqCst);
        }
        thread.set_idle_waiter(Some(Arc::clone(self)));
        self.monitored.lock().unwrap().push(thread);
    }

    /// Called by a monitored thread when it leaves `SLEEPING`.
    pub(crate) fn enter_running(&self) {
        self.busy.fetch_add(1, Ordering::SeqCst);
    }

    /// Called by a monitored thread when it enters `SLEEPING`. Wakes the
    /// owner if the count reaches zero.
    pub(crate) fn leave_running(&self) {
        let previous = self.busy.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            if let Some(owner) = self.owner.lock().unwrap().as_ref() {
                owner.wake();
            }
        }
    }

    /// §4.3 `is_idle`.
    pub fn is_idle(&self) -> bool {
        self.busy.load(Ordering::SeqCst) == 0
    }
}

impl Drop for IdleWaiter {
    fn drop(&mut self) {
        for thread in self.monitored.lock().unwrap().drain(..) {
            thread.set_idle_waiter(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshly_monitored_running_thread_counts_as_busy() {
        let owner = Thread::new("owner");
        let worker = Thread::new("worker");
        let ctx = crate::context::Context::new("c");
        worker.start(ctx, || std::thread::sleep(std::time::Duration::from_millis(50)));
        let waiter = IdleWaiter::new(owner);
        waiter.monitor(Arc::clone(&worker));
        assert!(!waiter.is_idle());
        worker.stop();
    }
}
