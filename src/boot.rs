//! Boot sequence orchestration (§6 "Boot sequence (externally
//! observable)").
//!
//! `main.rs`/`boot.S` drove this as a linear, un-returning
//! `rust_main`; here it is a plain function so `tests/` can drive it
//! against [`crate::arch::mock::MockArch`] and assert on the resulting
//! [`System`] instead of reading UART output.

use std::sync::Arc;

use log::info;

use crate::arch::ArchOps;
use crate::config::Config;
use crate::devemu::EmulatorRegistry;
use crate::error::HvResult;
use crate::host::{HostAddressSpace, MapFlags, RamPool, VaPool};
use crate::irq::HostIrqTable;
use crate::manager::Manager;
use crate::sleep::workqueue::Workqueue;
use crate::timer::{Clocksource, TimerSubsystem};

/// Everything boot wires together, handed back so callers (tests, or a
/// real entry point elsewhere) can keep driving the system afterward.
pub struct System {
    pub host: Arc<HostAddressSpace>,
    pub irq_table: HostIrqTable,
    pub timers: TimerSubsystem,
    pub manager: Manager,
    pub syswq: Workqueue,
    pub devices: Arc<EmulatorRegistry>,
}

impl System {
    /// Clockchip interrupt entry point (§4.3/§4.5): drain due timer
    /// events for `cpu`, then give the scheduler a chance to preempt the
    /// running VCPU if its time slice has expired.
    pub fn on_timer_tick(&self, cpu: usize) -> HvResult<()> {
        self.timers.on_tick(cpu)?;
        self.manager.scheduler_tick(cpu, self.timers.timestamp())
    }
}

/// Fixed layout for the boot-time RAM/VA pools; real firmware discovers
/// these from `/memory` instead (§6).
pub struct BootParams {
    pub ram_base: u64,
    pub ram_size: u64,
    pub va_base: u64,
    pub va_size: u64,
    pub cpu_count: usize,
    pub config: Option<Config>,
    /// Emulators board-support code wants available to config-driven
    /// guests, registered before `boot` runs (§4.8 "Emulator registry").
    /// Virtual regions declared in `config` resolve against this same
    /// registry, still reachable afterward through [`System::devices`]
    /// for guests created later via the direct API.
    pub devices: Arc<EmulatorRegistry>,
}

/// Runs the sequence in §6 up through "manager" / "scheduler"; SMP
/// bringup, per-CPU thread creation, and the idle hang are the caller's
/// run loop, not this function's (there is nothing to return from an
/// infinite loop).
pub fn boot(params: BootParams, arch: Arc<dyn ArchOps>, clocksource: Clocksource) -> HvResult<System> {
    info!("hvcore booting");

    let host = Arc::new(HostAddressSpace::new(
        RamPool::new(params.ram_base, params.ram_size),
        VaPool::new(params.va_base, params.va_size),
        arch.clone(),
    ));
    info!(
        "host address space ready: ram={:#x}+{:#x}",
        params.ram_base, params.ram_size
    );

    // "init heap": the hypervisor's own working set comes out of the VA
    // pool via ordinary alloc_pages, same as any other caller.
    let _heap_probe = host.alloc_pages(1, MapFlags::READABLE | MapFlags::WRITABLE)?;
    host.free_pages(_heap_probe, 1)?;

    let irq_table = HostIrqTable::new(params.cpu_count);
    info!("host IRQ table ready ({} lines)", crate::irq::MAX_IRQS);

    let timers = TimerSubsystem::new(clocksource, params.cpu_count);
    info!("clocksource/timer subsystem ready");

    let manager = Manager::new(params.cpu_count, arch.clone());
    info!("manager + scheduler ready for {} CPU(s)", params.cpu_count);

    let syswq = Workqueue::new();

    if let Some(config) = params.config {
        load_config(&manager, &host, config, &params.devices)?;
    }

    // No clockchip bound yet; a real backend calls `timers.bind_chip`
    // per CPU with its own hardware timer before enabling interrupts.

    info!("boot sequence complete");
    Ok(System {
        host,
        irq_table,
        timers,
        manager,
        syswq,
        devices: params.devices,
    })
}

fn load_config(
    manager: &Manager,
    host: &Arc<HostAddressSpace>,
    config: Config,
    devices: &EmulatorRegistry,
) -> HvResult<()> {
    if let Some(console) = &config.console {
        info!("chosen console: {console}");
    }
    for guest_cfg in config.guests {
        let name = guest_cfg.name.clone();
        let seeds = guest_cfg
            .vcpus
            .into_iter()
            .map(|v| v.into_seed(0))
            .collect();
        let guest_id = manager.create_guest(guest_cfg.name, host.clone(), seeds)?;
        info!("guest '{name}' created as slot {guest_id}");

        let aspace = manager.guest_aspace(guest_id)?;
        for region in guest_cfg.regions {
            aspace.add_region(
                crate::guest::aspace::RegionConfig {
                    node: crate::devemu::RegionNodeDesc {
                        name: region.name.clone(),
                        device_type: Some(region.device_type.clone()),
                        compatible: region.compatible.clone(),
                    },
                    kind: region.kind(),
                    address_kind: region.address_kind(),
                    mem_kind: region.mem_kind(),
                    guest_phys_addr: region.guest_phys_addr,
                    host_phys_addr: region.host_phys_addr,
                    physical_size: region.physical_size,
                    flags: region.flags(),
                },
                devices,
            )?;
        }
    }
    Ok(())
}
