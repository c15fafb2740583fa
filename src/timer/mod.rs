//! Clocksource, clockchip, and the per-CPU tickless timer queue (§4.3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{HvError, HvResult};
use crate::sync::SpinLock;

/// A free-running counter plus the linear cycles→ns conversion (§3
/// "Clocksource").
pub struct Clocksource {
    pub name: &'static str,
    pub rating: u32,
    pub mask: u64,
    pub mult: u64,
    pub shift: u32,
    read: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl Clocksource {
    pub fn new(name: &'static str, rating: u32, mask: u64, mult: u64, shift: u32, read: Arc<dyn Fn() -> u64 + Send + Sync>) -> Self {
        Self {
            name,
            rating,
            mask,
            mult,
            shift,
            read,
        }
    }

    fn read_cycles(&self) -> u64 {
        (self.read)() & self.mask
    }
}

/// Tracks `(cycles_last, nsec)` atop a clocksource so repeated reads
/// accumulate monotonically even across counter wraparound, as long as
/// `read` is called at least once per `mask / mult` nanoseconds (§4.3).
pub struct Timecounter {
    source: Clocksource,
    cycles_last: AtomicU64,
    nsec: AtomicU64,
}

impl Timecounter {
    pub fn new(source: Clocksource) -> Self {
        let cycles_last = source.read_cycles();
        Self {
            source,
            cycles_last: AtomicU64::new(cycles_last),
            nsec: AtomicU64::new(0),
        }
    }

    /// Sample the counter, mutating `cycles_last`/`nsec`.
    pub fn read(&self) -> u64 {
        let now = self.source.read_cycles();
        let last = self.cycles_last.swap(now, Ordering::AcqRel);
        let delta = now.wrapping_sub(last) & self.source.mask;
        let delta_ns = (delta as u128 * self.source.mult as u128 >> self.source.shift) as u64;
        self.nsec.fetch_add(delta_ns, Ordering::AcqRel) + delta_ns
    }

    /// Same value as `read` without mutating `cycles_last`, so a
    /// concurrent profiler cannot corrupt the counter (§4.3).
    pub fn peek(&self) -> u64 {
        let now = self.source.read_cycles();
        let last = self.cycles_last.load(Ordering::Acquire);
        let delta = now.wrapping_sub(last) & self.source.mask;
        let delta_ns = (delta as u128 * self.source.mult as u128 >> self.source.shift) as u64;
        self.nsec.load(Ordering::Acquire) + delta_ns
    }
}

/// A one-shot event timer bound to one or more CPUs (§3 "Clockchip").
pub trait Clockchip: Send + Sync {
    fn rating(&self) -> u32;
    fn min_delta_ns(&self) -> u64;
    fn max_delta_ns(&self) -> u64;
    fn mult(&self) -> u64;
    fn shift(&self) -> u32;
    fn set_next_event(&self, cycles: u64) -> HvResult<()>;
    /// Called when the hardware refuses to program a past deadline.
    fn expire(&self) {}
}

/// `program_event` (§4.3): clamp the delta, convert to chip cycles, and
/// ask the chip to arm. Falls back to `expire` when the chip refuses.
pub fn program_event(chip: &dyn Clockchip, now_ns: u64, expiry_ns: u64) {
    let wanted = expiry_ns.saturating_sub(now_ns);
    let delta_ns = wanted.max(chip.min_delta_ns()).min(chip.max_delta_ns());
    let cycles = (delta_ns as u128 * chip.mult() as u128 >> chip.shift()) as u64;
    if chip.set_next_event(cycles).is_err() {
        chip.expire();
    }
}

/// One pending deadline in a CPU's timer queue (§3 "Timer event").
pub struct TimerEvent {
    pub expiry_ns: u64,
    pub duration_ns: u64,
    pub active: bool,
    pub handler: Arc<dyn Fn(&mut TimerEvent) + Send + Sync>,
}

/// Per-CPU ordered queue of timer events, keyed by expiry (§4.3 "Timer
/// queue").
pub struct TimerQueue {
    events: SpinLock<Vec<TimerEvent>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            events: SpinLock::new(Vec::new()),
        }
    }

    /// Insert in sort order; returns whether this event became the new
    /// head (the caller should reprogram the clockchip when it is).
    pub fn event_start(&self, mut event: TimerEvent, now_ns: u64) -> bool {
        event.expiry_ns = now_ns + event.duration_ns;
        event.active = true;
        let mut events = self.events.lock();
        let idx = events.partition_point(|e| e.expiry_ns <= event.expiry_ns);
        events.insert(idx, event);
        idx == 0
    }

    /// Idempotent against an event that has already fired.
    pub fn event_stop(&self, predicate: impl Fn(&TimerEvent) -> bool) {
        self.events.lock().retain(|e| !(e.active && predicate(e)));
    }

    pub fn head_expiry(&self) -> Option<u64> {
        self.events.lock().first().map(|e| e.expiry_ns)
    }

    /// Pop and run every event with `expiry_ns <= now`, in expiry order.
    /// Returns the new head's expiry so the caller can reprogram.
    pub fn event_handler(&self, now_ns: u64) -> Option<u64> {
        loop {
            let due = {
                let events = self.events.lock();
                events.first().map(|e| e.expiry_ns <= now_ns).unwrap_or(false)
            };
            if !due {
                break;
            }
            let mut event = self.events.lock().remove(0);
            event.active = false;
            let handler = event.handler.clone();
            handler(&mut event);
        }
        self.head_expiry()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// `timer_timestamp`/`timer_start`/`timer_stop` (§4.3): the monotonic
/// clock plus per-CPU clockchip enable/disable, composed from the best
/// available clocksource.
pub struct TimerSubsystem {
    timecounter: Timecounter,
    queues: Vec<TimerQueue>,
    chips: Vec<Option<Arc<dyn Clockchip>>>,
}

impl TimerSubsystem {
    pub fn new(clocksource: Clocksource, cpu_count: usize) -> Self {
        Self {
            timecounter: Timecounter::new(clocksource),
            queues: (0..cpu_count).map(|_| TimerQueue::new()).collect(),
            chips: (0..cpu_count).map(|_| None).collect(),
        }
    }

    pub fn bind_chip(&mut self, cpu: usize, chip: Arc<dyn Clockchip>) -> HvResult<()> {
        *self.chips.get_mut(cpu).ok_or(HvError::Invalid)? = Some(chip);
        Ok(())
    }

    pub fn timestamp(&self) -> u64 {
        self.timecounter.read()
    }

    pub fn queue(&self, cpu: usize) -> Option<&TimerQueue> {
        self.queues.get(cpu)
    }

    pub fn start(&self, cpu: usize, event: TimerEvent) -> HvResult<()> {
        let now = self.timestamp();
        let queue = self.queues.get(cpu).ok_or(HvError::Invalid)?;
        let became_head = queue.event_start(event, now);
        if became_head {
            if let Some(chip) = self.chips.get(cpu).and_then(|c| c.as_ref()) {
                if let Some(expiry) = queue.head_expiry() {
                    program_event(chip.as_ref(), now, expiry);
                }
            }
        }
        Ok(())
    }

    pub fn stop(&self, cpu: usize, predicate: impl Fn(&TimerEvent) -> bool) -> HvResult<()> {
        self.queues.get(cpu).ok_or(HvError::Invalid)?.event_stop(predicate);
        Ok(())
    }

    /// Clockchip interrupt entry point: fire due events and reprogram
    /// for the new head.
    pub fn on_tick(&self, cpu: usize) -> HvResult<()> {
        let now = self.timestamp();
        let queue = self.queues.get(cpu).ok_or(HvError::Invalid)?;
        if let Some(next_expiry) = queue.event_handler(now) {
            if let Some(chip) = self.chips.get(cpu).and_then(|c| c.as_ref()) {
                program_event(chip.as_ref(), now, next_expiry);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn counting_clocksource(counter: Arc<AtomicU64>) -> Clocksource {
        Clocksource::new("test", 100, u64::MAX, 1, 0, Arc::new(move || counter.load(Ordering::SeqCst)))
    }

    #[test]
    fn timecounter_is_monotonic_across_reads() {
        let raw = Arc::new(AtomicU64::new(0));
        let tc = Timecounter::new(counting_clocksource(raw.clone()));
        let t1 = tc.read();
        raw.fetch_add(1_000, Ordering::SeqCst);
        let t2 = tc.read();
        assert!(t2 >= t1);
    }

    #[test]
    fn events_fire_in_expiry_order() {
        let raw = Arc::new(AtomicU64::new(0));
        let sub = TimerSubsystem::new(counting_clocksource(raw.clone()), 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (tag, duration_ns) in [(3, 3_000_000u64), (1, 1_000_000), (2, 2_000_000)] {
            let order = order.clone();
            sub.start(
                0,
                TimerEvent {
                    expiry_ns: 0,
                    duration_ns,
                    active: false,
                    handler: Arc::new(move |_ev| order.lock().unwrap().push(tag)),
                },
            )
            .unwrap();
        }

        raw.store(3_000_000, Ordering::SeqCst);
        sub.on_tick(0).unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }
}
