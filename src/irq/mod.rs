//! Host IRQ routing (§4.2).
//!
//! A fixed table indexed by physical IRQ number. Each line is dispatched
//! through one of a small set of flow handlers chosen at registration
//! time; the line's own state bits (`masked`, `inprogress`, `per_cpu`,
//! trigger type) govern how actions are serialized against a concurrent
//! unregister.

use std::sync::Arc;

use crate::error::{HvError, HvResult};
use crate::sync::IrqSpinLock;

pub const MAX_IRQS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Level,
    Edge,
}

/// Whether a line's actions run `handle_level_irq` (mask, run, unmask)
/// or `handle_fast_eoi` (run, then EOI), §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowHandler {
    HandleLevelIrq,
    HandleFastEoi,
}

/// Outcome an action returns from its callback; a level line stops
/// calling further actions once one returns `Handled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    Handled,
    NotHandled,
}

pub type IrqAction = Arc<dyn Fn(u32, usize) -> IrqReturn + Send + Sync>;

/// Per-line hardware control: mask/unmask/ack/eoi/set-type/set-affinity
/// (§3 "chip descriptor").
pub trait IrqChip: Send + Sync {
    fn mask(&self, irq: u32);
    fn unmask(&self, irq: u32);
    fn ack(&self, irq: u32) {}
    fn eoi(&self, irq: u32) {}
    fn set_type(&self, irq: u32, trigger: TriggerType) -> HvResult<()> {
        let _ = (irq, trigger);
        Ok(())
    }
    fn set_affinity(&self, irq: u32, cpu: usize) -> HvResult<()> {
        let _ = (irq, cpu);
        Ok(())
    }
    /// Resolve a CPU-local interrupt id to the global IRQ number
    /// (`host_irq_exec`'s chip query, §4.2).
    fn resolve_cpu_irq(&self, cpu_irq: u32) -> Option<u32> {
        Some(cpu_irq)
    }
}

struct Line {
    name: &'static str,
    disabled: bool,
    masked: bool,
    inprogress: bool,
    per_cpu: bool,
    level: bool,
    trigger: TriggerType,
    flow: FlowHandler,
    chip: Arc<dyn IrqChip>,
    actions: Vec<(IrqAction, usize)>,
    counters: Vec<u64>,
}

/// The fixed host-IRQ table, one global IRQ-save spinlock per §5
/// ("Shared resources").
pub struct HostIrqTable {
    lines: IrqSpinLock<Vec<Option<Line>>>,
    cpu_count: usize,
}

impl HostIrqTable {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            lines: IrqSpinLock::new((0..MAX_IRQS).map(|_| None).collect()),
            cpu_count,
        }
    }

    pub fn setup_line(
        &self,
        arch: &dyn crate::arch::ArchOps,
        irq: u32,
        name: &'static str,
        flow: FlowHandler,
        trigger: TriggerType,
        per_cpu: bool,
        chip: Arc<dyn IrqChip>,
    ) -> HvResult<()> {
        let idx = irq as usize;
        if idx >= MAX_IRQS {
            return Err(HvError::Invalid);
        }
        let mut lines = self.lines.lock(arch);
        lines[idx] = Some(Line {
            name,
            disabled: false,
            masked: true,
            inprogress: false,
            per_cpu,
            level: trigger == TriggerType::Level,
            trigger,
            flow,
            chip,
            actions: Vec::new(),
            counters: vec![0; self.cpu_count],
        });
        Ok(())
    }

    pub fn set_type(&self, arch: &dyn crate::arch::ArchOps, irq: u32, trigger: TriggerType) -> HvResult<()> {
        let mut lines = self.lines.lock(arch);
        let line = lines
            .get_mut(irq as usize)
            .and_then(|l| l.as_mut())
            .ok_or(HvError::NotAvailable)?;
        line.chip.set_type(irq, trigger)?;
        line.trigger = trigger;
        line.level = trigger == TriggerType::Level;
        Ok(())
    }

    /// Register `(callback, dev_cookie)`. Unmasks the line on first
    /// registration (§4.2).
    pub fn register_action(
        &self,
        arch: &dyn crate::arch::ArchOps,
        irq: u32,
        callback: IrqAction,
        dev_cookie: usize,
    ) -> HvResult<()> {
        let mut lines = self.lines.lock(arch);
        let line = lines
            .get_mut(irq as usize)
            .and_then(|l| l.as_mut())
            .ok_or(HvError::NotAvailable)?;
        let was_empty = line.actions.is_empty();
        line.actions.push((callback, dev_cookie));
        if was_empty {
            line.masked = false;
            line.chip.unmask(irq);
        }
        Ok(())
    }

    /// Unregister the `(irq, dev_cookie)` pair. Masks the line once the
    /// last action is gone, registration and unregistration are
    /// symmetric, no handle required (§4.2).
    pub fn unregister_action(&self, arch: &dyn crate::arch::ArchOps, irq: u32, dev_cookie: usize) -> HvResult<()> {
        let mut lines = self.lines.lock(arch);
        let line = lines
            .get_mut(irq as usize)
            .and_then(|l| l.as_mut())
            .ok_or(HvError::NotAvailable)?;
        line.actions.retain(|(_, cookie)| *cookie != dev_cookie);
        if line.actions.is_empty() {
            line.masked = true;
            line.chip.mask(irq);
        }
        Ok(())
    }

    /// Entry point from architecture-specific trap code (§4.2).
    pub fn host_generic_irq_exec(&self, arch: &dyn crate::arch::ArchOps, irq: u32, cpu: usize) -> HvResult<()> {
        let idx = irq as usize;
        {
            let mut lines = self.lines.lock(arch);
            let line = lines.get_mut(idx).and_then(|l| l.as_mut()).ok_or(HvError::NotAvailable)?;
            if cpu < line.counters.len() {
                line.counters[cpu] += 1;
            }
        }
        self.dispatch(arch, irq)
    }

    /// Resolves a CPU-local interrupt id through the owning chip, then
    /// dispatches (§4.2).
    pub fn host_irq_exec(&self, arch: &dyn crate::arch::ArchOps, irq_hint: u32, cpu_irq: u32, cpu: usize) -> HvResult<()> {
        let global_irq = {
            let lines = self.lines.lock(arch);
            let line = lines
                .get(irq_hint as usize)
                .and_then(|l| l.as_ref())
                .ok_or(HvError::NotAvailable)?;
            line.chip.resolve_cpu_irq(cpu_irq).ok_or(HvError::NotAvailable)?
        };
        self.host_generic_irq_exec(arch, global_irq, cpu)
    }

    fn dispatch(&self, arch: &dyn crate::arch::ArchOps, irq: u32) -> HvResult<()> {
        let idx = irq as usize;
        match self.flow_of(arch, idx)? {
            FlowHandler::HandleLevelIrq => self.handle_level_irq(arch, idx),
            FlowHandler::HandleFastEoi => self.handle_fast_eoi(arch, idx),
        }
    }

    fn flow_of(&self, arch: &dyn crate::arch::ArchOps, idx: usize) -> HvResult<FlowHandler> {
        let lines = self.lines.lock(arch);
        let line = lines.get(idx).and_then(|l| l.as_ref()).ok_or(HvError::NotAvailable)?;
        Ok(line.flow)
    }

    fn handle_level_irq(&self, arch: &dyn crate::arch::ArchOps, idx: usize) -> HvResult<()> {
        let per_cpu = {
            let mut lines = self.lines.lock(arch);
            let line = lines.get_mut(idx).and_then(|l| l.as_mut()).ok_or(HvError::NotAvailable)?;
            if !line.per_cpu {
                if line.inprogress {
                    return Ok(()); // serialized against a concurrent unregister
                }
                line.inprogress = true;
            }
            line.masked = true;
            line.chip.mask(idx as u32);
            line.chip.ack(idx as u32);
            line.per_cpu
        };

        self.run_actions(arch, idx, 0);

        let mut lines = self.lines.lock(arch);
        let line = lines.get_mut(idx).and_then(|l| l.as_mut()).ok_or(HvError::NotAvailable)?;
        line.masked = false;
        line.chip.unmask(idx as u32);
        if !per_cpu {
            line.inprogress = false;
        }
        Ok(())
    }

    fn handle_fast_eoi(&self, arch: &dyn crate::arch::ArchOps, idx: usize) -> HvResult<()> {
        self.run_actions(arch, idx, 0);
        let lines = self.lines.lock(arch);
        let line = lines.get(idx).and_then(|l| l.as_ref()).ok_or(HvError::NotAvailable)?;
        line.chip.eoi(idx as u32);
        Ok(())
    }

    fn run_actions(&self, arch: &dyn crate::arch::ArchOps, idx: usize, cpu: usize) {
        let actions = {
            let lines = self.lines.lock(arch);
            match lines.get(idx).and_then(|l| l.as_ref()) {
                Some(line) => line.actions.clone(),
                None => return,
            }
        };
        for (callback, cookie) in actions {
            if callback(idx as u32, cookie) == IrqReturn::Handled {
                break;
            }
        }
        let _ = cpu;
    }

    pub fn counter(&self, arch: &dyn crate::arch::ArchOps, irq: u32, cpu: usize) -> HvResult<u64> {
        let lines = self.lines.lock(arch);
        let line = lines
            .get(irq as usize)
            .and_then(|l| l.as_ref())
            .ok_or(HvError::NotAvailable)?;
        line.counters.get(cpu).copied().ok_or(HvError::Invalid)
    }

    pub fn name(&self, arch: &dyn crate::arch::ArchOps, irq: u32) -> HvResult<&'static str> {
        let lines = self.lines.lock(arch);
        let line = lines
            .get(irq as usize)
            .and_then(|l| l.as_ref())
            .ok_or(HvError::NotAvailable)?;
        Ok(line.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::MockArch;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullChip;
    impl IrqChip for NullChip {
        fn mask(&self, _irq: u32) {}
        fn unmask(&self, _irq: u32) {}
    }

    #[test]
    fn unknown_irq_is_not_available() {
        let arch = MockArch::new();
        let table = HostIrqTable::new(1);
        assert_eq!(
            table.host_generic_irq_exec(&arch, 7, 0).unwrap_err(),
            HvError::NotAvailable
        );
    }

    #[test]
    fn level_irq_runs_registered_action_once() {
        let arch = MockArch::new();
        let table = HostIrqTable::new(1);
        table
            .setup_line(&arch, 5, "test", FlowHandler::HandleLevelIrq, TriggerType::Level, false, Arc::new(NullChip))
            .unwrap();

        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        table
            .register_action(
                &arch,
                5,
                Arc::new(move |_irq, _cookie| {
                    hits2.fetch_add(1, Ordering::SeqCst);
                    IrqReturn::Handled
                }),
                0,
            )
            .unwrap();

        table.host_generic_irq_exec(&arch, 5, 0).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(table.counter(&arch, 5, 0).unwrap(), 1);
    }
}
