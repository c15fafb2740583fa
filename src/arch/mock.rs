//! Host-testable architecture backend.
//!
//! Stands in for a real ARM/MIPS/x86 backend in unit and integration
//! tests: register switches are a plain `Vec<u64>` copy, stage-2 faults
//! are resolved purely from the guest address space's region list with
//! no real page tables, and IRQ save/restore is a reentrant counter
//! instead of a hardware `DAIF` mask. Real register/MMU manipulation
//! has no meaning on a host CPU, so this stand-in behavior is
//! deliberate rather than an unfinished
//! `vmm_cpu_clocksource_cycles`/`arm_board_reset` stub.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{ArchOps, DecodedAccess, FaultKind, Stage2Fault, Stage2Outcome, VcpuRegs};
use crate::devemu::TransferWidth;
use crate::error::{HvError, HvResult};
use crate::guest::aspace::{GuestAddressSpace, RegionFlags, RegionKind};

pub struct MockArch {
    irq_depth: AtomicU64,
    irqs_enabled: AtomicBool,
    aspace_initialized: AtomicBool,
}

impl MockArch {
    pub fn new() -> Self {
        Self {
            irq_depth: AtomicU64::new(0),
            irqs_enabled: AtomicBool::new(false),
            aspace_initialized: AtomicBool::new(false),
        }
    }

    /// Exposed for tests asserting the boot sequence actually reaches
    /// the "enable interrupts" step.
    pub fn irqs_enabled(&self) -> bool {
        self.irqs_enabled.load(Ordering::Acquire)
    }

    /// Exposed for tests asserting `cpu_aspace_init` ran before any
    /// mapping call.
    pub fn aspace_initialized(&self) -> bool {
        self.aspace_initialized.load(Ordering::Acquire)
    }
}

impl Default for MockArch {
    fn default() -> Self {
        Self::new()
    }
}

/// Layout of the mock register file: `[pc, sp, x0..x7]`.
pub const REG_PC: usize = 0;
pub const REG_SP: usize = 1;
pub const REG_GPR_BASE: usize = 2;
pub const REG_COUNT: usize = REG_GPR_BASE + 8;

impl ArchOps for MockArch {
    fn irq_save(&self) -> u64 {
        self.irq_depth.fetch_add(1, Ordering::AcqRel)
    }

    fn irq_restore(&self, _flags: u64) {
        self.irq_depth.fetch_sub(1, Ordering::AcqRel);
    }

    fn current_cpu_id(&self) -> usize {
        0
    }

    fn cpu_irq_enable(&self) {
        self.irqs_enabled.store(true, Ordering::Release);
    }

    fn cpu_irq_disable(&self) {
        self.irqs_enabled.store(false, Ordering::Release);
    }

    fn cpu_aspace_init(&self) -> HvResult<()> {
        self.aspace_initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn cpu_aspace_map(&self, _virt: u64, _phys: u64, _size: u64, _flags: u32) -> HvResult<()> {
        Ok(())
    }

    fn cpu_aspace_unmap(&self, _virt: u64, _size: u64) -> HvResult<()> {
        Ok(())
    }

    fn cpu_aspace_va2pa(&self, virt: u64) -> HvResult<u64> {
        Ok(virt)
    }

    fn vcpu_regs_init(&self, start_pc: u64, start_sp: u64) -> VcpuRegs {
        let mut regs = vec![0u64; REG_COUNT];
        regs[REG_PC] = start_pc;
        regs[REG_SP] = start_sp;
        regs
    }

    fn vcpu_regs_switch(&self, _outgoing: &mut VcpuRegs, incoming: &VcpuRegs) {
        // No physical register file to flush on the host target, the
        // outgoing vCPU's state already lives in its own `VcpuRegs`.
        debug_assert!(incoming.len() >= REG_COUNT);
    }

    fn vcpu_irq_init(&self, _regs: &mut VcpuRegs) {}

    fn vcpu_irq_assert(&self, regs: &mut VcpuRegs, irq: u32) {
        // Record the most recently asserted IRQ number past the GPR file
        // so tests can observe delivery without a real vGIC.
        if regs.len() == REG_COUNT {
            regs.push(irq as u64);
        } else {
            *regs.last_mut().unwrap() = irq as u64;
        }
    }

    fn vcpu_irq_process(&self, _regs: &mut VcpuRegs) {}

    fn vcpu_regs_dump(&self, regs: &VcpuRegs) -> String {
        format!(
            "pc={:#x} sp={:#x} gpr={:?}",
            regs[REG_PC],
            regs[REG_SP],
            &regs[REG_GPR_BASE..]
        )
    }

    fn vcpu_stat_dump(&self, state_label: &str, reset_count: u64) -> String {
        format!("state={state_label} resets={reset_count}")
    }

    fn stage2_fault(
        &self,
        aspace: &GuestAddressSpace,
        fault: Stage2Fault,
    ) -> HvResult<Stage2Outcome> {
        let region = aspace.find_region(fault.ipa).ok_or(HvError::NotAvailable)?;
        match (fault.kind, region.kind) {
            (FaultKind::Stage2Translation, RegionKind::Real) => Ok(Stage2Outcome::Mapped),
            (FaultKind::Stage2Permission, RegionKind::Virtual) | (_, RegionKind::Virtual) => {
                let access = fault.access.unwrap_or(DecodedAccess {
                    is_write: false,
                    width: TransferWidth::Word,
                    reg_index: 0,
                });
                Ok(Stage2Outcome::Emulate(access))
            }
            _ => Err(HvError::Fail),
        }
    }

    fn stage2_attrs_for(&self, flags: RegionFlags) -> u32 {
        let mut attrs = 0u32;
        if flags.cacheable {
            attrs |= 1 << 0;
        }
        if flags.bufferable {
            attrs |= 1 << 1;
        }
        if flags.readonly {
            attrs |= 1 << 2;
        }
        attrs
    }
}
