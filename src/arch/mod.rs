//! Architecture glue contract (§4.9).
//!
//! The original per-function globals (`arch_vcpu_regs_switch` and
//! friends) are replaced by a single object-safe trait injected at boot,
//! per the Design Notes' "Architecture dispatch" entry: this is what
//! makes the core unit-testable on a host without any virtualization
//! hardware. A concrete ARM/MIPS/x86 backend lives outside this crate
//! and is handed in as a `Box<dyn ArchOps>`; [`mock`] provides the
//! trivial backend the core's own tests run against.

pub mod mock;

use crate::devemu::TransferWidth;
use crate::error::HvResult;
use crate::guest::aspace::{GuestAddressSpace, RegionFlags};

/// Register context for one vCPU. Opaque to the core; only the
/// architecture backend interprets its contents.
pub type VcpuRegs = Vec<u64>;

/// Reason a guest trapped into the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Stage-2 translation fault: no mapping yet exists for this IPA.
    Stage2Translation,
    /// Permission fault against an installed stage-2 mapping (virtual
    /// device region, route to device emulation).
    Stage2Permission,
    /// Anything else; the owning vCPU is halted.
    Other,
}

/// Decoded information about a trapped guest memory access, enough for
/// the devemu framework to perform the emulated transfer (§4.9, last
/// paragraph).
#[derive(Debug, Clone, Copy)]
pub struct DecodedAccess {
    pub is_write: bool,
    pub width: TransferWidth,
    /// Index into the vCPU's general-purpose register file.
    pub reg_index: u8,
}

/// Stage-2 / guest-physical fault report handed to [`ArchOps::stage2_fault`].
#[derive(Debug, Clone, Copy)]
pub struct Stage2Fault {
    pub ipa: u64,
    pub kind: FaultKind,
    pub access: Option<DecodedAccess>,
}

/// The per-architecture hook the core calls into (§4.9).
///
/// Every method here corresponds 1:1 to a bullet in §4.9; none of them
/// encode policy, they only perform the hardware-specific half of an
/// operation the core already decided to do.
pub trait ArchOps: Send + Sync {
    // ---- host IRQ plumbing -------------------------------------------------
    /// Disable local interrupts, returning the previous flags so they can
    /// be restored later. Backing primitive for [`crate::sync::IrqSpinLock`].
    fn irq_save(&self) -> u64;
    fn irq_restore(&self, flags: u64);
    /// Index of the calling physical CPU (e.g. `MPIDR_EL1.Aff0` on ARM).
    fn current_cpu_id(&self) -> usize;
    /// One-time board bring-up of the interrupt controller, called once
    /// per CPU before any line is registered.
    fn cpu_irq_setup(&self) -> HvResult<()> {
        Ok(())
    }
    /// Globally enable/disable interrupts on the calling CPU. Distinct
    /// from the nested `irq_save`/`irq_restore` pair `IrqSpinLock` uses:
    /// these are the boot-time "turn interrupts on for good" switch.
    fn cpu_irq_enable(&self);
    fn cpu_irq_disable(&self);

    // ---- host address space -------------------------------------------------
    /// One-time MMU bring-up; `cpu_aspace_map`/`unmap`/`va2pa` are only
    /// legal to call afterward.
    fn cpu_aspace_init(&self) -> HvResult<()> {
        Ok(())
    }
    fn cpu_aspace_map(&self, virt: u64, phys: u64, size: u64, flags: u32) -> HvResult<()>;
    fn cpu_aspace_unmap(&self, virt: u64, size: u64) -> HvResult<()>;
    fn cpu_aspace_va2pa(&self, virt: u64) -> HvResult<u64>;

    // ---- vCPU register lifecycle ---------------------------------------------
    fn vcpu_regs_init(&self, start_pc: u64, start_sp: u64) -> VcpuRegs;
    fn vcpu_regs_deinit(&self, _regs: &mut VcpuRegs) {}
    /// Save `outgoing`'s live register file and load `incoming`'s.
    fn vcpu_regs_switch(&self, outgoing: &mut VcpuRegs, incoming: &VcpuRegs);
    /// Human-readable register dump for the `dump_regs` admin command.
    fn vcpu_regs_dump(&self, regs: &VcpuRegs) -> String;
    /// Human-readable stat line for the `dump_stat` admin command, given
    /// the VCPU's lifecycle state already formatted by the caller (the
    /// arch layer has no notion of manager-level VCPU state).
    fn vcpu_stat_dump(&self, state_label: &str, reset_count: u64) -> String;

    // ---- per-vCPU IRQ state -------------------------------------------------
    fn vcpu_irq_init(&self, regs: &mut VcpuRegs);
    fn vcpu_irq_assert(&self, regs: &mut VcpuRegs, irq: u32);
    /// Process (deliver) any pending virtual interrupts before resuming
    /// the vCPU.
    fn vcpu_irq_process(&self, regs: &mut VcpuRegs);

    // ---- stage-2 fault handling -----------------------------------------------
    /// Consult the guest address space and either install a stage-2
    /// mapping for a translation fault, or decode the access and return
    /// it for a permission fault against a virtual region.
    fn stage2_fault(
        &self,
        aspace: &GuestAddressSpace,
        fault: Stage2Fault,
    ) -> HvResult<Stage2Outcome>;

    /// Translate region flags into the attribute bits this architecture
    /// uses for a stage-2 entry (normal/device/cacheable/bufferable/ro).
    fn stage2_attrs_for(&self, flags: RegionFlags) -> u32;
}

/// What happened in response to a stage-2 fault.
#[derive(Debug, Clone, Copy)]
pub enum Stage2Outcome {
    /// A mapping was installed; the guest can be resumed and will retry
    /// the access.
    Mapped,
    /// The fault was against a virtual region; `access` describes the
    /// transfer the devemu framework must now perform.
    Emulate(DecodedAccess),
}
