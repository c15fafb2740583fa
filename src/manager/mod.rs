//! Manager (§4.4): fixed-capacity guest/VCPU slot tables, the VCPU
//! lifecycle state machine, and guest-wide fan-out operations.
//!
//! Owns the single source of truth about who may run; the scheduler
//! (§4.5) only ever learns about lifecycle events through
//! [`Manager::vcpu_state_change`]'s call into
//! [`crate::scheduler::Scheduler::notify_state_change`].
//!
//! One wrinkle the transition table in §4.4 leaves unstated: it has no
//! `RUNNING` column, so nothing reaches `RUNNING` by calling
//! `vcpu_state_change` at all, entry into `RUNNING` is the scheduler's
//! own privileged context-switch path (§4.5 `scheduler_next`), kept out
//! of the table on purpose so the hot tick path never has to go through
//! the administrative transition check. That path lives in
//! [`Manager::scheduler_tick`] below; see `DESIGN.md` for the full
//! reasoning.

pub mod vcpu;

use std::sync::Arc;

use crate::arch::ArchOps;
use crate::devemu::DevemuCache;
use crate::error::{HvError, HvResult};
use crate::guest::aspace::GuestAddressSpace;
use crate::scheduler::Scheduler;
use crate::sync::SpinLock;

pub use vcpu::VcpuState;

pub const MAX_VCPUS: usize = 128;
pub const MAX_GUESTS: usize = 32;

/// Seed parameters for a new VCPU, from config or a direct API call
/// (§4.4 "Orphan VCPU create" / "Guest create").
pub struct VcpuSeed {
    pub name: String,
    pub priority: u8,
    pub time_slice_ns: u64,
    pub start_pc: u64,
    pub start_sp: u64,
    pub affinity_cpu: usize,
}

pub struct VcpuSlot {
    pub id: usize,
    pub name: String,
    pub is_normal: bool,
    pub priority: u8,
    pub time_slice_ns: u64,
    pub start_pc: u64,
    pub start_sp: u64,
    pub guest: Option<usize>,
    pub state: VcpuState,
    pub reset_count: u64,
    pub affinity_cpu: usize,
    pub regs: crate::arch::VcpuRegs,
    pub devemu_cache: DevemuCache,
    /// Timer timestamp (per [`crate::timer::TimerSubsystem::timestamp`])
    /// at which this VCPU last became `RUNNING`; `scheduler_tick` reads
    /// this back against `time_slice_ns` to decide whether the slice has
    /// expired (§4.5).
    pub running_since_ns: u64,
}

pub struct GuestSlot {
    pub id: usize,
    pub name: String,
    pub vcpu_ids: Vec<usize>,
    pub aspace: Arc<GuestAddressSpace>,
}

pub struct Manager {
    vcpus: Vec<SpinLock<Option<VcpuSlot>>>,
    guests: Vec<SpinLock<Option<GuestSlot>>>,
    orphans: SpinLock<Vec<usize>>,
    scheduler: Scheduler,
    arch: Arc<dyn ArchOps>,
}

impl Manager {
    pub fn new(cpu_count: usize, arch: Arc<dyn ArchOps>) -> Self {
        Self {
            vcpus: (0..MAX_VCPUS).map(|_| SpinLock::new(None)).collect(),
            guests: (0..MAX_GUESTS).map(|_| SpinLock::new(None)).collect(),
            orphans: SpinLock::new(Vec::new()),
            scheduler: Scheduler::new(cpu_count),
            arch,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn alloc_vcpu_slot(&self) -> HvResult<usize> {
        for (idx, slot) in self.vcpus.iter().enumerate() {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(VcpuSlot {
                    id: idx,
                    name: String::new(),
                    is_normal: false,
                    priority: 0,
                    time_slice_ns: 0,
                    start_pc: 0,
                    start_sp: 0,
                    guest: None,
                    state: VcpuState::Unknown,
                    reset_count: 0,
                    affinity_cpu: 0,
                    regs: self.arch.vcpu_regs_init(0, 0),
                    devemu_cache: DevemuCache::new(),
                    running_since_ns: 0,
                });
                return Ok(idx);
            }
        }
        Err(HvError::OutOfResources)
    }

    /// Allocate a slot, initialize registers, publish `RESET` to the
    /// scheduler, and append to the orphan list (§4.4 "Orphan VCPU
    /// create").
    pub fn create_orphan_vcpu(&self, seed: VcpuSeed) -> HvResult<usize> {
        let idx = self.alloc_vcpu_slot()?;
        {
            let mut guard = self.vcpus[idx].lock();
            let slot = guard.as_mut().unwrap();
            slot.name = seed.name;
            slot.is_normal = false;
            slot.priority = seed.priority;
            slot.time_slice_ns = seed.time_slice_ns;
            slot.start_pc = seed.start_pc;
            slot.start_sp = seed.start_sp;
            slot.affinity_cpu = seed.affinity_cpu;
            slot.regs = self.arch.vcpu_regs_init(seed.start_pc, seed.start_sp);
        }
        self.vcpu_state_change(idx, VcpuState::Reset)?;
        self.orphans.lock().push(idx);
        Ok(idx)
    }

    fn create_normal_vcpu(&self, guest_id: usize, seed: VcpuSeed) -> HvResult<usize> {
        let idx = self.alloc_vcpu_slot()?;
        {
            let mut guard = self.vcpus[idx].lock();
            let slot = guard.as_mut().unwrap();
            slot.name = seed.name;
            slot.is_normal = true;
            slot.priority = seed.priority;
            slot.time_slice_ns = seed.time_slice_ns;
            slot.start_pc = seed.start_pc;
            slot.start_sp = seed.start_sp;
            slot.affinity_cpu = seed.affinity_cpu;
            slot.guest = Some(guest_id);
            slot.regs = self.arch.vcpu_regs_init(seed.start_pc, seed.start_sp);
        }
        self.vcpu_state_change(idx, VcpuState::Reset)?;
        Ok(idx)
    }

    fn alloc_guest_slot(&self) -> HvResult<usize> {
        for (idx, slot) in self.guests.iter().enumerate() {
            let mut guard = slot.lock();
            if guard.is_none() {
                *guard = Some(GuestSlot {
                    id: idx,
                    name: String::new(),
                    vcpu_ids: Vec::new(),
                    aspace: Arc::new(GuestAddressSpace::new(Arc::new(dummy_host()))),
                });
                return Ok(idx);
            }
        }
        Err(HvError::OutOfResources)
    }

    /// Bind each declared VCPU to a slot, then initialize the guest
    /// address space (§4.4 "Guest create").
    pub fn create_guest(
        &self,
        name: String,
        host: Arc<crate::host::HostAddressSpace>,
        vcpu_seeds: Vec<VcpuSeed>,
    ) -> HvResult<usize> {
        let guest_id = self.alloc_guest_slot()?;
        {
            let mut guard = self.guests[guest_id].lock();
            let g = guard.as_mut().unwrap();
            g.name = name;
            g.aspace = Arc::new(GuestAddressSpace::new(host));
        }
        for seed in vcpu_seeds {
            let vcpu_id = self.create_normal_vcpu(guest_id, seed)?;
            self.guests[guest_id]
                .lock()
                .as_mut()
                .unwrap()
                .vcpu_ids
                .push(vcpu_id);
        }
        Ok(guest_id)
    }

    pub fn guest_aspace(&self, guest_id: usize) -> HvResult<Arc<GuestAddressSpace>> {
        self.guests
            .get(guest_id)
            .and_then(|g| g.lock().as_ref().map(|g| g.aspace.clone()))
            .ok_or(HvError::NotAvailable)
    }

    pub fn vcpu_state(&self, vcpu_id: usize) -> HvResult<VcpuState> {
        self.vcpus
            .get(vcpu_id)
            .and_then(|v| v.lock().as_ref().map(|v| v.state))
            .ok_or(HvError::NotAvailable)
    }

    /// The centralized transition function from §4.4, guarded by the
    /// VCPU's own lock.
    pub fn vcpu_state_change(&self, vcpu_id: usize, new_state: VcpuState) -> HvResult<VcpuState> {
        let slot_lock = self.vcpus.get(vcpu_id).ok_or(HvError::NotAvailable)?;
        let mut guard = slot_lock.lock();
        let slot = guard.as_mut().ok_or(HvError::NotAvailable)?;

        if !vcpu::legal_transition(slot.state, new_state) {
            return Err(HvError::Fail);
        }

        self.scheduler
            .notify_state_change(slot.affinity_cpu, vcpu_id, slot.priority, new_state == VcpuState::Ready)?;

        if new_state == VcpuState::Reset {
            slot.regs = self.arch.vcpu_regs_init(slot.start_pc, slot.start_sp);
            self.arch.vcpu_irq_init(&mut slot.regs);
            slot.reset_count += 1;
        }
        slot.state = new_state;
        Ok(new_state)
    }

    /// The scheduler's privileged context-switch path: select the
    /// highest-priority ready VCPU on `cpu`, switch registers if it
    /// differs from the one currently running, and move both VCPUs'
    /// states directly (bypassing the table, see module docs).
    ///
    /// `now_ns` is the timer subsystem's own timestamp (§4.3); called
    /// from the clockchip's tick handler, it only preempts the running
    /// VCPU once `time_slice_ns` has elapsed since it last became
    /// `RUNNING` (§4.5's time-slicing requirement). A `time_slice_ns` of
    /// `0` means unbounded, and is never preempted by the tick alone.
    pub fn scheduler_tick(&self, cpu: usize, now_ns: u64) -> HvResult<()> {
        self.scheduler_switch(cpu, now_ns, false)
    }

    /// The outgoing VCPU goes back through `notify_state_change` itself
    /// rather than `vcpu_state_change`, since `RUNNING -> READY` is
    /// deliberately absent from the administrative table but still has
    /// to land the VCPU back in its priority band for its next turn.
    fn scheduler_switch(&self, cpu: usize, now_ns: u64, force: bool) -> HvResult<()> {
        let incoming = match self.scheduler.peek_next(cpu)? {
            Some(id) => id,
            None => return Ok(()),
        };
        let outgoing = self.scheduler.current(cpu)?;
        if outgoing == Some(incoming) {
            return Ok(());
        }

        if !force {
            if let Some(out_id) = outgoing {
                let guard = self.vcpus.get(out_id).ok_or(HvError::NotAvailable)?.lock();
                let slot = guard.as_ref().ok_or(HvError::NotAvailable)?;
                if slot.time_slice_ns > 0
                    && now_ns.saturating_sub(slot.running_since_ns) < slot.time_slice_ns
                {
                    return Ok(());
                }
            }
        }

        if let Some(out_id) = outgoing {
            let priority = {
                let mut guard = self.vcpus.get(out_id).ok_or(HvError::NotAvailable)?.lock();
                let slot = guard.as_mut().ok_or(HvError::NotAvailable)?;
                slot.state = VcpuState::Ready;
                slot.priority
            };
            self.scheduler.notify_state_change(cpu, out_id, priority, true)?;
        }

        self.scheduler.dequeue_as_current(cpu, incoming)?;
        {
            let mut guard = self.vcpus.get(incoming).ok_or(HvError::NotAvailable)?.lock();
            let slot = guard.as_mut().ok_or(HvError::NotAvailable)?;
            slot.state = VcpuState::Running;
            slot.running_since_ns = now_ns;
        }

        if let Some(out_id) = outgoing {
            self.switch_regs(out_id, incoming)?;
        }
        Ok(())
    }

    fn switch_regs(&self, outgoing: usize, incoming: usize) -> HvResult<()> {
        let mut out_guard = self.vcpus[outgoing].lock();
        let out_slot = out_guard.as_mut().ok_or(HvError::NotAvailable)?;
        let incoming_regs = {
            let in_guard = self.vcpus[incoming].lock();
            in_guard.as_ref().ok_or(HvError::NotAvailable)?.regs.clone()
        };
        self.arch.vcpu_regs_switch(&mut out_slot.regs, &incoming_regs);
        Ok(())
    }

    /// A VCPU voluntarily giving up the rest of its slice (§4.5), so the
    /// switch is forced regardless of how much of `time_slice_ns` is
    /// left.
    pub fn scheduler_yield(&self, cpu: usize, vcpu_id: usize, now_ns: u64) -> HvResult<()> {
        self.vcpu_state_change(vcpu_id, VcpuState::Ready)?;
        self.scheduler_switch(cpu, now_ns, true)
    }

    fn guest_vcpu_ids(&self, guest_id: usize) -> HvResult<Vec<usize>> {
        self.guests
            .get(guest_id)
            .and_then(|g| g.lock().as_ref().map(|g| g.vcpu_ids.clone()))
            .ok_or(HvError::NotAvailable)
    }

    pub fn guest_kick(&self, guest_id: usize) -> HvResult<()> {
        self.guest_fanout(guest_id, VcpuState::Ready)
    }

    pub fn guest_pause(&self, guest_id: usize) -> HvResult<()> {
        self.guest_fanout(guest_id, VcpuState::Paused)
    }

    pub fn guest_resume(&self, guest_id: usize) -> HvResult<()> {
        self.guest_fanout(guest_id, VcpuState::Ready)
    }

    pub fn guest_halt(&self, guest_id: usize) -> HvResult<()> {
        self.guest_fanout(guest_id, VcpuState::Halted)
    }

    /// Reset every VCPU, then the guest address space, then drop each
    /// VCPU's devemu cache so a stale `region_index` from before the
    /// reset can never outlive it (§4.4, §4.8 "Per-VCPU cache").
    pub fn guest_reset(&self, guest_id: usize) -> HvResult<()> {
        self.guest_fanout(guest_id, VcpuState::Reset)?;
        self.guest_aspace(guest_id)?.reset()?;
        for vcpu_id in self.guest_vcpu_ids(guest_id)? {
            let mut guard = self.vcpus.get(vcpu_id).ok_or(HvError::NotAvailable)?.lock();
            if let Some(slot) = guard.as_mut() {
                slot.devemu_cache.clear();
            }
        }
        Ok(())
    }

    fn guest_fanout(&self, guest_id: usize, target: VcpuState) -> HvResult<()> {
        for vcpu_id in self.guest_vcpu_ids(guest_id)? {
            self.vcpu_state_change(vcpu_id, target)?;
        }
        Ok(())
    }

    /// Read-only dump routed through the architecture's own formatter,
    /// refused while the VCPU is running to avoid racing the live
    /// register set (§4.4, §4.9 `vcpu_regs_dump`).
    pub fn dump_regs(&self, vcpu_id: usize) -> HvResult<String> {
        let guard = self.vcpus.get(vcpu_id).ok_or(HvError::NotAvailable)?.lock();
        let slot = guard.as_ref().ok_or(HvError::NotAvailable)?;
        if slot.state == VcpuState::Running {
            return Err(HvError::Busy);
        }
        Ok(self.arch.vcpu_regs_dump(&slot.regs))
    }

    /// As [`Manager::dump_regs`] but for lifecycle state and reset count
    /// (§4.9 `vcpu_stat_dump`).
    pub fn dump_stat(&self, vcpu_id: usize) -> HvResult<String> {
        let guard = self.vcpus.get(vcpu_id).ok_or(HvError::NotAvailable)?.lock();
        let slot = guard.as_ref().ok_or(HvError::NotAvailable)?;
        if slot.state == VcpuState::Running {
            return Err(HvError::Busy);
        }
        Ok(self.arch.vcpu_stat_dump(&format!("{:?}", slot.state), slot.reset_count))
    }
}

/// Placeholder host address space for a guest slot between allocation
/// and `create_guest` filling in the real one, never observed outside
/// `Manager` since `create_guest` overwrites it before returning the
/// guest id.
fn dummy_host() -> crate::host::HostAddressSpace {
    crate::host::HostAddressSpace::new(
        crate::host::RamPool::new(0, 0),
        crate::host::VaPool::new(0, 0),
        Arc::new(crate::arch::mock::MockArch::new()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::MockArch;

    fn manager() -> Manager {
        Manager::new(1, Arc::new(MockArch::new()))
    }

    fn seed(priority: u8) -> VcpuSeed {
        VcpuSeed {
            name: "test".into(),
            priority,
            time_slice_ns: 1_000_000,
            start_pc: 0x1000,
            start_sp: 0x2000,
            affinity_cpu: 0,
        }
    }

    #[test]
    fn orphan_vcpu_lifecycle_exercises_every_table_cell() {
        let m = manager();
        let id = m.create_orphan_vcpu(seed(5)).unwrap();
        assert_eq!(m.vcpu_state(id).unwrap(), VcpuState::Reset);

        m.vcpu_state_change(id, VcpuState::Ready).unwrap();
        assert_eq!(m.vcpu_state(id).unwrap(), VcpuState::Ready);

        m.scheduler_tick(0, 0).unwrap();
        assert_eq!(m.vcpu_state(id).unwrap(), VcpuState::Running);

        m.vcpu_state_change(id, VcpuState::Paused).unwrap();
        assert_eq!(m.vcpu_state(id).unwrap(), VcpuState::Paused);

        m.vcpu_state_change(id, VcpuState::Ready).unwrap();
        assert_eq!(m.vcpu_state(id).unwrap(), VcpuState::Ready);

        m.vcpu_state_change(id, VcpuState::Halted).unwrap();
        assert_eq!(m.vcpu_state(id).unwrap(), VcpuState::Halted);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let m = manager();
        let id = m.create_orphan_vcpu(seed(5)).unwrap();
        // RESET -> PAUSED is not in the table.
        assert_eq!(
            m.vcpu_state_change(id, VcpuState::Paused).unwrap_err(),
            HvError::Fail
        );
    }

    #[test]
    fn dump_regs_refuses_while_running() {
        let m = manager();
        let id = m.create_orphan_vcpu(seed(5)).unwrap();
        m.vcpu_state_change(id, VcpuState::Ready).unwrap();
        m.scheduler_tick(0, 0).unwrap();
        assert_eq!(m.dump_regs(id).unwrap_err(), HvError::Busy);
    }

    #[test]
    fn scheduler_tick_does_not_preempt_before_the_slice_expires() {
        let m = manager();
        let low = m.create_orphan_vcpu(seed(1)).unwrap();
        m.vcpu_state_change(low, VcpuState::Ready).unwrap();
        m.scheduler_tick(0, 0).unwrap();
        assert_eq!(m.vcpu_state(low).unwrap(), VcpuState::Running);

        let other = m.create_orphan_vcpu(seed(1)).unwrap();
        m.vcpu_state_change(other, VcpuState::Ready).unwrap();

        // Same priority band, but `low`'s 1ms slice hasn't elapsed yet.
        m.scheduler_tick(0, 500_000).unwrap();
        assert_eq!(m.vcpu_state(low).unwrap(), VcpuState::Running);
        assert_eq!(m.vcpu_state(other).unwrap(), VcpuState::Ready);

        // Past the slice: the tick now swaps them.
        m.scheduler_tick(0, 1_000_001).unwrap();
        assert_eq!(m.vcpu_state(low).unwrap(), VcpuState::Ready);
        assert_eq!(m.vcpu_state(other).unwrap(), VcpuState::Running);
    }

    #[test]
    fn scheduler_yield_preempts_regardless_of_remaining_slice() {
        let m = manager();
        let a = m.create_orphan_vcpu(seed(1)).unwrap();
        m.vcpu_state_change(a, VcpuState::Ready).unwrap();
        m.scheduler_tick(0, 0).unwrap();
        assert_eq!(m.vcpu_state(a).unwrap(), VcpuState::Running);

        let b = m.create_orphan_vcpu(seed(1)).unwrap();
        m.vcpu_state_change(b, VcpuState::Ready).unwrap();

        m.scheduler_yield(0, a, 10).unwrap();
        assert_eq!(m.vcpu_state(a).unwrap(), VcpuState::Ready);
        assert_eq!(m.vcpu_state(b).unwrap(), VcpuState::Running);
    }

    #[test]
    fn guest_reset_clears_every_vcpu_devemu_cache() {
        let m = manager();
        let host = Arc::new(crate::host::HostAddressSpace::new(
            crate::host::RamPool::new(0x4000_0000, 0x10000),
            crate::host::VaPool::new(0x8000_0000, 0x10000),
            Arc::new(MockArch::new()),
        ));
        let guest_id = m.create_guest("g0".into(), host, vec![seed(5)]).unwrap();
        let vcpu_ids = m.guest_vcpu_ids(guest_id).unwrap();
        {
            let mut guard = m.vcpus[vcpu_ids[0]].lock();
            guard.as_mut().unwrap().devemu_cache.invalidate_region(0);
        }
        m.guest_reset(guest_id).unwrap();
        // No direct inspection API beyond re-running a cache op; the
        // reset must at least succeed without an aspace/cache mismatch.
        assert_eq!(m.vcpu_state(vcpu_ids[0]).unwrap(), VcpuState::Reset);
    }
}
