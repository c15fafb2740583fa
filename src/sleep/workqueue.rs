//! Deferred work (§3 "Workqueue", §4.6 "Workqueue").
//!
//! A real bottom-half thread is an orphan VCPU elsewhere in the system;
//! this module only owns the work list and the state machine. Whatever
//! drives the orphan VCPU's run loop calls [`Workqueue::run_one`]
//! repeatedly; [`Workqueue::flush`] drains everything synchronously,
//! which is what `tests/` exercises against.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::HvResult;
use crate::sync::SpinLock;
use crate::timer::{TimerEvent, TimerQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkState {
    Created = 0,
    Scheduled = 1,
    InProgress = 2,
    Stopped = 3,
}

impl WorkState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkState::Created,
            1 => WorkState::Scheduled,
            2 => WorkState::InProgress,
            _ => WorkState::Stopped,
        }
    }
}

/// `(state, workqueue?, func, data)`, §3.
pub struct Work {
    state: AtomicU8,
    func: Box<dyn Fn() + Send + Sync>,
}

impl Work {
    pub fn new(func: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(WorkState::Created as u8),
            func: Box::new(func),
        })
    }

    pub fn state(&self) -> WorkState {
        WorkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: WorkState) {
        self.state.store(s as u8, Ordering::Release);
    }
}

/// `(thread, lock, work_list, completion)`, §3. `thread` itself is an
/// orphan VCPU owned elsewhere; only the queue lives here.
pub struct Workqueue {
    work_list: SpinLock<VecDeque<Arc<Work>>>,
}

impl Workqueue {
    pub const fn new() -> Self {
        Self {
            work_list: SpinLock::new(VecDeque::new()),
        }
    }

    /// No-op unless `work` is `Created` or `Stopped` (§4.6).
    pub fn schedule_work(&self, work: Arc<Work>) {
        let prev = work.state();
        if prev != WorkState::Created && prev != WorkState::Stopped {
            return;
        }
        work.set_state(WorkState::Scheduled);
        self.work_list.lock().push_back(work);
    }

    /// Pop one work item, run it with the lock released across the
    /// callback, mark it stopped. Returns `false` if the queue was
    /// empty.
    pub fn run_one(&self) -> bool {
        let work = match self.work_list.lock().pop_front() {
            Some(w) => w,
            None => return false,
        };
        work.set_state(WorkState::InProgress);
        (work.func)();
        work.set_state(WorkState::Stopped);
        true
    }

    /// Drain the queue; on return every work item scheduled before the
    /// call is `Stopped` (§8 scenario 6).
    pub fn flush(&self) {
        while self.run_one() {}
    }

    /// Spin-wait (bounded by the caller's own time slice in practice)
    /// until `work` leaves `InProgress`, then remove it from the queue
    /// if it is still pending.
    pub fn stop_work(&self, work: &Arc<Work>) {
        while work.state() == WorkState::InProgress {
            std::thread::yield_now();
        }
        self.work_list.lock().retain(|w| !Arc::ptr_eq(w, work));
    }

    pub fn len(&self) -> usize {
        self.work_list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Workqueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A work item with an embedded timer event (§3 "delayed work"). Firing
/// the timer just calls `schedule_work` on the owning queue.
pub struct DelayedWork {
    pub work: Arc<Work>,
}

/// Arms a timer on `timers` whose handler schedules `dw.work` onto `wq`
/// after `duration_ns` (§4.6 `schedule_delayed_work`).
pub fn schedule_delayed_work(
    wq: Arc<Workqueue>,
    timers: &TimerQueue,
    now_ns: u64,
    dw: DelayedWork,
    duration_ns: u64,
) -> HvResult<()> {
    let work = dw.work;
    let event = TimerEvent {
        expiry_ns: 0,
        duration_ns,
        active: false,
        handler: Arc::new(move |_ev| wq.schedule_work(work.clone())),
    };
    timers.event_start(event, now_ns);
    Ok(())
}

/// A process-wide workqueue one priority band above the default
/// (§4.6's `syswq`).
pub const SYSWQ_PRIORITY_BONUS: u8 = 1;

pub fn duration_to_ns(d: Duration) -> u64 {
    d.as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn flush_drains_and_stops_every_work() {
        let wq = Workqueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            wq.schedule_work(Work::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        wq.flush();
        assert!(wq.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn schedule_work_is_noop_while_already_scheduled() {
        let wq = Workqueue::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let work = Work::new(move || {
            runs2.fetch_add(1, Ordering::SeqCst);
        });
        wq.schedule_work(work.clone());
        wq.schedule_work(work.clone()); // no-op: already Scheduled
        wq.flush();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
