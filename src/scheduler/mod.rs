//! Per-CPU runqueue: priority bands with round-robin time-slicing within
//! a band (§4.5). Pure selection data structure; [`crate::manager`] owns
//! the VCPU lifecycle and calls into this to learn/ask who should run.
//!
//! A single flat round-robin ring over one global VCPU array generalizes
//! into one ring per priority band, one set of bands per host CPU,
//! keeping the same "states array + next index" shape underneath.

use std::collections::VecDeque;

use crate::error::{HvError, HvResult};
use crate::sync::SpinLock;

pub const MAX_PRIORITY: usize = 32;

struct RunQueue {
    bands: Vec<VecDeque<usize>>,
    current: Option<usize>,
    preempt_count: u32,
}

impl RunQueue {
    fn new() -> Self {
        Self {
            bands: (0..MAX_PRIORITY).map(|_| VecDeque::new()).collect(),
            current: None,
            preempt_count: 0,
        }
    }

    fn remove(&mut self, vcpu_id: usize) {
        for band in self.bands.iter_mut() {
            band.retain(|&id| id != vcpu_id);
        }
    }
}

/// One ready-queue array per online host CPU.
pub struct Scheduler {
    queues: Vec<SpinLock<RunQueue>>,
}

impl Scheduler {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            queues: (0..cpu_count).map(|_| SpinLock::new(RunQueue::new())).collect(),
        }
    }

    fn queue(&self, cpu: usize) -> HvResult<&SpinLock<RunQueue>> {
        self.queues.get(cpu).ok_or(HvError::Invalid)
    }

    /// Sole path by which the scheduler learns of a lifecycle event
    /// (§4.5). `Ready` enqueues at the back of its priority band;
    /// anything else dequeues.
    pub fn notify_state_change(
        &self,
        cpu: usize,
        vcpu_id: usize,
        priority: u8,
        is_ready: bool,
    ) -> HvResult<()> {
        let mut rq = self.queue(cpu)?.lock();
        rq.remove(vcpu_id);
        if rq.current == Some(vcpu_id) && !is_ready {
            rq.current = None;
        }
        if is_ready {
            let band = (priority as usize).min(MAX_PRIORITY - 1);
            rq.bands[band].push_back(vcpu_id);
        }
        Ok(())
    }

    /// Highest-priority ready vCPU without removing it from its band.
    pub fn peek_next(&self, cpu: usize) -> HvResult<Option<usize>> {
        let rq = self.queue(cpu)?.lock();
        Ok(rq.bands.iter().rev().find_map(|b| b.front().copied()))
    }

    /// Remove `vcpu_id` from its band and mark it the running vCPU on
    /// `cpu`, call once the caller has committed to switching to it.
    pub fn dequeue_as_current(&self, cpu: usize, vcpu_id: usize) -> HvResult<()> {
        let mut rq = self.queue(cpu)?.lock();
        rq.remove(vcpu_id);
        rq.current = Some(vcpu_id);
        Ok(())
    }

    pub fn current(&self, cpu: usize) -> HvResult<Option<usize>> {
        Ok(self.queue(cpu)?.lock().current)
    }

    pub fn preempt_disable(&self, cpu: usize) -> HvResult<()> {
        self.queue(cpu)?.lock().preempt_count += 1;
        Ok(())
    }

    pub fn preempt_enable(&self, cpu: usize) -> HvResult<()> {
        let mut rq = self.queue(cpu)?.lock();
        rq.preempt_count = rq.preempt_count.saturating_sub(1);
        Ok(())
    }

    pub fn preempt_count(&self, cpu: usize) -> HvResult<u32> {
        Ok(self.queue(cpu)?.lock().preempt_count)
    }
}
