//! Cooperative task bound to one OS thread: sleep, wake, timers, stop
//! (§3.2, §4.2).
//!
//! The three-state wake machine (`RUNNING`/`SLEEPING`/`WAKE`) and the
//! lifecycle state (`INIT`/`RUNNING`/`STOP_REQ`/`STOPPED`) share the one
//! mutex/condvar pair the spec calls for, mirroring
//! `nanotube_thread.cpp`'s single `pthread_mutex_t`/`pthread_cond_t` guarding
//! both. `std::sync::{Mutex, Condvar}` is the direct idiomatic replacement
//! for that pair; there is no separate park/unpark primitive in std that
//! also carries a one-shot "already woken" latch, so the latch is kept as
//! explicit state exactly as the original models it (§9 calls the
//! condvar+mutex approach out explicitly and asks only that the
//! three-state machine be preserved, not the primitive).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::context::Context;
use crate::fatal;
use crate::idle::IdleWaiter;
use crate::Errno;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Init,
    Running,
    StopReq,
    Stopped,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum WakeState {
    Running,
    Sleeping,
    Wake,
}

struct Inner {
    lifecycle: ThreadState,
    wake: WakeState,
    /// Next scheduled wake-up, if a timer is armed (§4.2 `init_timer`).
    wake_time: Option<Instant>,
}

/// A cooperatively scheduled stage bound to one OS thread.
pub struct Thread {
    name: String,
    inner: Mutex<Inner>,
    condvar: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
    context: Mutex<Option<Arc<Context>>>,
    idle_waiter: Mutex<Option<Arc<IdleWaiter>>>,
    /// Cached "now", invalidated on every wake-up (§3.2, §4.2).
    now_cache: Mutex<Option<Instant>>,
    current_flag: AtomicBool,
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<Thread>>> = std::cell::RefCell::new(None);
}

impl Thread {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Thread {
            name: name.into(),
            inner: Mutex::new(Inner {
                lifecycle: ThreadState::Init,
                wake: WakeState::Running,
                wake_time: None,
            }),
            condvar: Condvar::new(),
            handle: Mutex::new(None),
            context: Mutex::new(None),
            idle_waiter: Mutex::new(None),
            now_cache: Mutex::new(None),
            current_flag: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_idle_waiter(&self, waiter: Option<Arc<IdleWaiter>>) {
        *self.idle_waiter.lock().unwrap() = waiter;
    }

    /// §4.2 `start`. `body` is called repeatedly by the spawned OS
    /// thread until a stop is requested (`INIT -> RUNNING`).
    pub fn start(self: &Arc<Self>, context: Arc<Context>, mut body: impl FnMut() + Send + 'static) {
        let mut handle_slot = self.handle.lock().unwrap();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.lifecycle != ThreadState::Init {
                fatal!("thread '{}': start() called while not INIT", self.name);
            }
            inner.lifecycle = ThreadState::Running;
        }
        context.bind_thread(Arc::clone(self));
        *self.context.lock().unwrap() = Some(Arc::clone(&context));

        let this = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(&this)));
                loop {
                    if this.stop_requested() {
                        break;
                    }
                    body();
                    if this.stop_requested() {
                        break;
                    }
                }
                context.unbind_thread(&this);
                {
                    let mut inner = this.inner.lock().unwrap();
                    inner.lifecycle = ThreadState::Stopped;
                }
                CURRENT.with(|c| *c.borrow_mut() = None);
            })
            // §7 closing sentence: "Panics from the OS (pthread call
            // failures) are fatal with the underlying errno reported."
            // `std::thread::Builder::spawn` is this crate's equivalent of
            // `pthread_create`; report its errno the same way a raw
            // `pthread_create` failure would be reported.
            .unwrap_or_else(|err| match err.raw_os_error() {
                Some(code) => fatal!("thread '{}': spawn failed: {}", self.name, Errno::from_raw_os_error(code)),
                None => fatal!("thread '{}': spawn failed: {}", self.name, err),
            });
        *handle_slot = Some(spawned);
    }

    fn stop_requested(&self) -> bool {
        self.inner.lock().unwrap().lifecycle == ThreadState::StopReq
    }

    /// §4.2 `stop`. Called from the main thread: requests a stop, wakes
    /// the target, joins, then resets to `INIT`.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.lifecycle {
                ThreadState::Running => inner.lifecycle = ThreadState::StopReq,
                ThreadState::Init | ThreadState::Stopped => return,
                ThreadState::StopReq => {}
            }
        }
        self.wake();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.join().expect("thread panicked");
        }
        let mut inner = self.inner.lock().unwrap();
        inner.lifecycle = ThreadState::Init;
        inner.wake = WakeState::Running;
        inner.wake_time = None;
    }

    pub fn state(&self) -> ThreadState {
        self.inner.lock().unwrap().lifecycle
    }

    pub fn is_stopped(&self) -> bool {
        !matches!(self.state(), ThreadState::Running)
    }

    /// Whether the calling OS thread is the one bound to this `Thread`.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .map(|t| std::ptr::eq(t.as_ref(), self))
                .unwrap_or(false)
        })
    }

    /// §4.4 `check_thread`/§4.2 "Only the thread itself may call sleep,
    /// init_timer, check_timer, check_current." Fatal on violation.
    pub fn check_current(&self) {
        if !self.is_current() {
            fatal!("thread '{}': called from the wrong OS thread", self.name);
        }
    }

    /// §4.2 `sleep`. Must be called by the thread itself.
    pub fn sleep(&self) {
        self.check_current();
        let mut inner = self.inner.lock().unwrap();
        if inner.wake == WakeState::Wake {
            // One-shot: consume the pending wake and return immediately.
            inner.wake = WakeState::Running;
            return;
        }
        if inner.lifecycle == ThreadState::StopReq {
            return;
        }
        inner.wake = WakeState::Sleeping;
        drop(inner);
        self.idle_dec();

        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.wake_time {
                Some(until) => {
                    let now = Instant::now();
                    if now >= until {
                        break;
                    }
                    let (guard, timeout) = self
                        .condvar
                        .wait_timeout(inner, until - now)
                        .expect("condvar wait poisoned");
                    inner = guard;
                    if timeout.timed_out() || inner.wake != WakeState::Sleeping {
                        break;
                    }
                }
                None => {
                    inner = self.condvar.wait(inner).expect("condvar wait poisoned");
                    if inner.wake != WakeState::Sleeping {
                        break;
                    }
                }
            }
        }
        // `wake()` already bumped the busy count when it moved us out of
        // `SLEEPING` into `WAKE` (§4.3: "incremented when a monitored
        // thread leaves SLEEPING"); only a timer firing with no
        // intervening `wake()` leaves us here still `SLEEPING`, and in
        // that case nobody has incremented yet, so we must.
        let woken_by_timeout = inner.wake == WakeState::Sleeping;
        inner.wake = WakeState::Running;
        inner.wake_time = None;
        drop(inner);

        if woken_by_timeout {
            self.idle_inc();
        }
        *self.now_cache.lock().unwrap() = None;
    }

    fn idle_dec(&self) {
        if let Some(w) = self.idle_waiter.lock().unwrap().as_ref() {
            w.leave_running();
        }
    }

    fn idle_inc(&self) {
        if let Some(w) = self.idle_waiter.lock().unwrap().as_ref() {
            w.enter_running();
        }
    }

    /// §4.2 `wake`. Safe to call from any thread.
    pub fn wake(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.wake {
            WakeState::Running => inner.wake = WakeState::Wake,
            WakeState::Wake => {}
            WakeState::Sleeping => {
                inner.wake = WakeState::Wake;
                drop(inner);
                self.condvar.notify_all();
                self.idle_inc();
                return;
            }
        }
    }

    /// §4.2 `init_timer`. Records a duration-from-now as the armed
    /// wake-time, taking the minimum over any timer already pending.
    pub fn init_timer(&self, delay: Duration) -> Instant {
        self.check_current();
        let at = self.cached_now() + delay;
        let mut inner = self.inner.lock().unwrap();
        inner.wake_time = Some(match inner.wake_time {
            Some(existing) => existing.min(at),
            None => at,
        });
        at
    }

    /// §4.2 `check_timer`. Returns whether `at` has passed using the
    /// cached "now"; as a side effect records `at` as the next wake-time
    /// if it has not passed yet (so a subsequent `sleep()` wakes no
    /// later than `at`).
    pub fn check_timer(&self, at: Instant) -> bool {
        self.check_current();
        if self.cached_now() >= at {
            return true;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.wake_time = Some(match inner.wake_time {
            Some(existing) => existing.min(at),
            None => at,
        });
        false
    }

    fn cached_now(&self) -> Instant {
        let mut cache = self.now_cache.lock().unwrap();
        *cache.get_or_insert_with(Instant::now)
    }

    pub fn bound_context(&self) -> Option<Arc<Context>> {
        self.context.lock().unwrap().clone()
    }

    /// Test-only: marks `self` as the "current" thread for `is_current`/
    /// `check_current` without spawning an OS thread, so unit tests
    /// outside this module can exercise fatal-on-wrong-thread checks from
    /// the test harness thread itself.
    #[cfg(test)]
    pub(crate) fn bind_current_for_test(self: &Arc<Self>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(self)));
    }
}

/// Weak handle used by objects (channels, timers) that must be able to
/// wake a thread without extending its lifetime.
pub type ThreadHandle = Weak<Thread>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn wake_before_sleep_is_one_shot() {
        let t = Thread::new("t");
        // Bind a fake "current thread" by running the check inline: we
        // can't call sleep() off-thread (it asserts is_current()), so
        // this test exercises the state machine directly via wake().
        t.wake();
        let inner = t.inner.lock().unwrap();
        assert_eq!(inner.wake, WakeState::Wake);
    }

    #[test]
    fn stop_joins_and_resets_to_init() {
        let ctx = Context::new("main");
        let t = Thread::new("worker");
        let counter = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&counter);
        t.start(ctx, move || {
            c2.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
        });
        std::thread::sleep(Duration::from_millis(20));
        t.stop();
        assert_eq!(t.state(), ThreadState::Init);
        assert!(counter.load(Ordering::SeqCst) > 0);
    }
}
