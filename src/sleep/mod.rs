//! Sleep/wake primitives and deferred work (§4.6). Legal only from
//! orphan-VCPU (thread) context, §5 lists `waitqueue_sleep`,
//! `waitqueue_sleep_timeout`, `semaphore_down` among the suspension
//! points that may never be called with a spinlock held.

pub mod workqueue;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::HvResult;
use crate::sync::SpinLock;
use crate::timer::{TimerEvent, TimerSubsystem};

/// `(lock, list of sleeping VCPUs, priv)`, §3. The `sleepers` list is
/// the bookkeeping `park`/`wake`/`remove` share with [`Semaphore`]; the
/// condvar pair alongside it exists only so a real blocking caller
/// (`waitqueue_sleep_timeout`, run from orphan-VCPU thread context) can
/// wait for a `park`ed id to be taken off the list instead of polling.
pub struct WaitQueue {
    sleepers: SpinLock<Vec<usize>>,
    signal: (Mutex<()>, Condvar),
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            sleepers: SpinLock::new(Vec::new()),
            signal: (Mutex::new(()), Condvar::new()),
        }
    }

    /// Record `vcpu_id` as sleeping. The actual transition to a sleeping
    /// state and the yield into the scheduler are the caller's
    /// responsibility (manager + scheduler own VCPU state), this is the
    /// waitqueue's own bookkeeping half of `sleep(wq)`.
    pub fn park(&self, vcpu_id: usize) {
        self.sleepers.lock().push(vcpu_id);
    }

    /// Pop up to `n` sleepers for the caller to transition back to
    /// `READY` (§4.6 `wake`).
    pub fn wake(&self, n: usize) -> Vec<usize> {
        let woken = {
            let mut sleepers = self.sleepers.lock();
            let take = n.min(sleepers.len());
            sleepers.drain(..take).collect::<Vec<_>>()
        };
        if !woken.is_empty() {
            self.notify();
        }
        woken
    }

    pub fn remove(&self, vcpu_id: usize) -> bool {
        let removed = {
            let mut sleepers = self.sleepers.lock();
            let before = sleepers.len();
            sleepers.retain(|&id| id != vcpu_id);
            sleepers.len() != before
        };
        if removed {
            self.notify();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sleepers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, vcpu_id: usize) -> bool {
        self.sleepers.lock().contains(&vcpu_id)
    }

    fn notify(&self) {
        let _guard = self.signal.0.lock().unwrap();
        self.signal.1.notify_all();
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// `(limit, atomic count, waitqueue)`, §3. `down` attempts a CAS
/// decrement before sleeping; `up` CAS-increments and wakes every
/// sleeper from inside the same critical section to avoid a lost
/// wakeup (§9).
pub struct Semaphore {
    limit: usize,
    count: AtomicUsize,
    waiters: WaitQueue,
}

impl Semaphore {
    pub const fn new(initial: usize, limit: usize) -> Self {
        Self {
            limit,
            count: AtomicUsize::new(initial),
            waiters: WaitQueue::new(),
        }
    }

    /// Returns `true` if the permit was acquired without parking,
    /// `false` if `vcpu_id` was parked on the waitqueue and must be
    /// resumed (by the caller's scheduler loop) once woken.
    pub fn down(&self, vcpu_id: usize) -> bool {
        loop {
            let cur = self.count.load(Ordering::Acquire);
            if cur == 0 {
                self.waiters.park(vcpu_id);
                return false;
            }
            if self
                .count
                .compare_exchange(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release a permit and wake every waiter; returns the VCPUs to
    /// transition back to `READY`.
    pub fn up(&self) -> Vec<usize> {
        loop {
            let cur = self.count.load(Ordering::Acquire);
            if cur >= self.limit {
                return Vec::new();
            }
            if self
                .count
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return self.waiters.wake(usize::MAX);
            }
        }
    }
}

/// Marker distinguishing a normal wake from a timeout firing
/// (`sleep_timeout`, §4.6/§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Woken,
    TimedOut,
}

pub type SleepResult = HvResult<WakeReason>;

/// Suspension point (§4.6 `sleep_timeout`, §5): park on `wq`, arm a
/// timer event for `duration_ns` on `cpu`, and block the calling
/// orphan-VCPU thread until either the timer fires and removes
/// `vcpu_id` itself, or some other caller's `wake`/`remove` takes it
/// off the queue first. An early wake stops the timer before it fires.
pub fn waitqueue_sleep_timeout(
    wq: Arc<WaitQueue>,
    vcpu_id: usize,
    cpu: usize,
    duration_ns: u64,
    timers: &TimerSubsystem,
) -> SleepResult {
    wq.park(vcpu_id);

    let timed_out = Arc::new(AtomicBool::new(false));
    let handler_wq = wq.clone();
    let handler_flag = timed_out.clone();
    let handler: Arc<dyn Fn(&mut TimerEvent) + Send + Sync> = Arc::new(move |_ev| {
        if handler_wq.remove(vcpu_id) {
            handler_flag.store(true, Ordering::Release);
        }
    });
    let handler_for_stop = handler.clone();
    timers.start(
        cpu,
        TimerEvent {
            expiry_ns: 0,
            duration_ns,
            active: false,
            handler,
        },
    )?;

    let guard = wq.signal.0.lock().unwrap();
    let _guard = wq
        .signal
        .1
        .wait_while(guard, |_| {
            wq.contains(vcpu_id) && !timed_out.load(Ordering::Acquire)
        })
        .unwrap();
    drop(_guard);

    if timed_out.load(Ordering::Acquire) {
        Ok(WakeReason::TimedOut)
    } else {
        timers.stop(cpu, move |e| Arc::ptr_eq(&e.handler, &handler_for_stop))?;
        Ok(WakeReason::Woken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use crate::timer::Clocksource;

    fn manual_clocksource(raw: Arc<std::sync::atomic::AtomicU64>) -> Clocksource {
        Clocksource::new("sleep-test", 1, u64::MAX, 1, 0, Arc::new(move || {
            raw.load(Ordering::SeqCst)
        }))
    }

    #[test]
    fn sleep_timeout_fires_when_nobody_wakes_it() {
        let raw = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let timers = Arc::new(TimerSubsystem::new(manual_clocksource(raw.clone()), 1));
        let wq = Arc::new(WaitQueue::new());

        let t_timers = timers.clone();
        let t_wq = wq.clone();
        let handle = thread::spawn(move || waitqueue_sleep_timeout(t_wq, 7, 0, 1_000_000, &t_timers));

        while wq.len() == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(5));
        raw.store(1_000_000, Ordering::SeqCst);
        timers.on_tick(0).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), WakeReason::TimedOut);
        assert!(wq.is_empty());
    }

    #[test]
    fn sleep_timeout_woken_early_reports_woken() {
        let raw = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let timers = Arc::new(TimerSubsystem::new(manual_clocksource(raw.clone()), 1));
        let wq = Arc::new(WaitQueue::new());

        let t_timers = timers.clone();
        let t_wq = wq.clone();
        let handle =
            thread::spawn(move || waitqueue_sleep_timeout(t_wq, 9, 0, 1_000_000_000, &t_timers));

        while wq.len() == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(5));
        assert_eq!(wq.wake(1), vec![9]);

        assert_eq!(handle.join().unwrap().unwrap(), WakeReason::Woken);
    }
}
