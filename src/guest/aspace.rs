//! Guest address space (§4.7): the per-guest region list and the
//! guest-physical read/write/map contract built on top of it.

use std::sync::Arc;

use crate::devemu::irq::IrqHandlerList;
use crate::devemu::registry::EmulatorRegistry;
use crate::devemu::{EmudevHandle, RegionNodeDesc};
use crate::error::{HvError, HvResult};
use crate::host::HostAddressSpace;
use crate::sync::SpinLock;

/// Whether a region's backing is real host memory or an emulated device
/// (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Real,
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Memory,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    Ram,
    Rom,
    Device,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegionFlags {
    pub readonly: bool,
    pub cacheable: bool,
    pub bufferable: bool,
}

/// A single mapped range of guest-physical address space (§3 "Guest
/// address space").
pub struct Region {
    pub guest_phys_start: u64,
    pub size: u64,
    /// For `Real` regions, the backing host-physical address. For
    /// `Virtual` regions this equals `guest_phys_start`, §4.7: "Virtual
    /// regions use the guest-physical address as their host address".
    pub host_phys_start: u64,
    pub kind: RegionKind,
    pub address_kind: AddressKind,
    pub mem_kind: MemKind,
    pub flags: RegionFlags,
    pub emu: Option<EmudevHandle>,
}

impl Region {
    fn contains(&self, gpa: u64) -> bool {
        gpa >= self.guest_phys_start && gpa < self.guest_phys_start + self.size
    }
}

/// A candidate region parsed from the `/aspace` device-tree subtree
/// (§4.7, §6).
pub struct RegionConfig {
    pub node: RegionNodeDesc,
    pub kind: RegionKind,
    pub address_kind: AddressKind,
    pub mem_kind: MemKind,
    pub guest_phys_addr: u64,
    pub host_phys_addr: Option<u64>,
    pub physical_size: u64,
    pub flags: RegionFlags,
}

/// Owns the region list and provides the narrow guest-physical access
/// contract the device-emulation framework and stage-2 fault handler
/// call into (§4.7).
pub struct GuestAddressSpace {
    host: Arc<HostAddressSpace>,
    regions: SpinLock<Vec<Region>>,
    irq_handlers: SpinLock<IrqHandlerList>,
}

impl GuestAddressSpace {
    pub fn new(host: Arc<HostAddressSpace>) -> Self {
        Self {
            host,
            regions: SpinLock::new(Vec::new()),
            irq_handlers: SpinLock::new(IrqHandlerList::new()),
        }
    }

    /// Append one region from config, reserving RAM and binding an
    /// emulator as needed (§4.7, §4.8 "Emulator registry"). Regions must
    /// stay non-overlapping in guest-physical space (§3 invariant).
    pub fn add_region(&self, cfg: RegionConfig, registry: &EmulatorRegistry) -> HvResult<()> {
        if cfg.physical_size == 0 {
            return Err(HvError::Invalid);
        }
        let mut regions = self.regions.lock();
        let insert_at = Self::non_overlapping_index(&regions, cfg.guest_phys_addr, cfg.physical_size)?;

        let host_phys_start = match cfg.kind {
            RegionKind::Real => {
                let hpa = cfg.host_phys_addr.ok_or(HvError::Invalid)?;
                self.host.ram().reserve(hpa, cfg.physical_size)?;
                hpa
            }
            RegionKind::Virtual => cfg.guest_phys_addr,
        };

        let emu = if cfg.kind == RegionKind::Virtual {
            let handle = registry.probe_region(&cfg.node)?;
            if let Err(e) = handle.reset() {
                handle.remove();
                return Err(e);
            }
            Some(handle)
        } else {
            None
        };

        regions.insert(
            insert_at,
            Region {
                guest_phys_start: cfg.guest_phys_addr,
                size: cfg.physical_size,
                host_phys_start,
                kind: cfg.kind,
                address_kind: cfg.address_kind,
                mem_kind: cfg.mem_kind,
                flags: cfg.flags,
                emu,
            },
        );
        Ok(())
    }

    fn non_overlapping_index(regions: &[Region], gpa: u64, size: u64) -> HvResult<usize> {
        let end = gpa.checked_add(size).ok_or(HvError::Overflow)?;
        let idx = regions.partition_point(|r| r.guest_phys_start < gpa);
        if idx > 0 && regions[idx - 1].guest_phys_start + regions[idx - 1].size > gpa {
            return Err(HvError::Invalid);
        }
        if idx < regions.len() && regions[idx].guest_phys_start < end {
            return Err(HvError::Invalid);
        }
        Ok(idx)
    }

    pub fn find_region_index(&self, gpa: u64) -> Option<usize> {
        self.regions.lock().iter().position(|r| r.contains(gpa))
    }

    /// Clone the minimal fields a caller needs without holding the
    /// region list lock across a call into an emulator.
    pub fn region_snapshot(&self, idx: usize) -> (u64, u64, RegionKind, RegionFlags) {
        let regions = self.regions.lock();
        let r = &regions[idx];
        (r.guest_phys_start, r.size, r.kind, r.flags)
    }

    /// Access to a region through an already-resolved index, used by the
    /// devemu cache so it does not need to re-take the region lock on a
    /// hit against a field that can't change (kind, emu).
    pub fn region_at(&self, idx: usize) -> RegionView<'_> {
        RegionView {
            guard: self.regions.lock(),
            idx,
        }
    }

    pub fn find_region(&self, gpa: u64) -> Option<RegionView<'_>> {
        let idx = self.find_region_index(gpa)?;
        Some(self.region_at(idx))
    }

    pub fn irq_handlers(&self) -> &SpinLock<IrqHandlerList> {
        &self.irq_handlers
    }

    /// Stride through covered `Real`/memory regions only, rejecting
    /// virtual or IO regions (§4.7).
    pub fn guest_physical_read(&self, gpa: u64, buf: &mut [u8]) -> HvResult<()> {
        self.guest_physical_copy(gpa, buf, true)
    }

    pub fn guest_physical_write(&self, gpa: u64, buf: &[u8]) -> HvResult<()> {
        let mut scratch = buf.to_vec();
        self.guest_physical_copy(gpa, &mut scratch, false)
    }

    fn guest_physical_copy(&self, gpa: u64, buf: &mut [u8], is_read: bool) -> HvResult<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let idx = self.find_region_index(gpa + done as u64).ok_or(HvError::NotAvailable)?;
            let (start, size, kind, _) = self.region_snapshot(idx);
            if kind != RegionKind::Real {
                return Err(HvError::Access);
            }
            let region_off = gpa + done as u64 - start;
            let avail = (size - region_off).min((buf.len() - done) as u64) as usize;
            let hpa = self.host_phys_for(idx, region_off);
            if is_read {
                self.host.physical_read(hpa, &mut buf[done..done + avail])?;
            } else {
                self.host.physical_write(hpa, &buf[done..done + avail])?;
            }
            done += avail;
        }
        Ok(())
    }

    fn host_phys_for(&self, idx: usize, region_off: u64) -> u64 {
        let regions = self.regions.lock();
        regions[idx].host_phys_start + region_off
    }

    /// Largest contiguous host extent covering `gpa`, up to `size`
    /// bytes. A short `available < size` marks a region boundary the
    /// caller must loop across (§4.7).
    pub fn guest_physical_map(&self, gpa: u64, size: u64) -> HvResult<(u64, u64, RegionFlags)> {
        let idx = self.find_region_index(gpa).ok_or(HvError::NotAvailable)?;
        let (start, rsize, kind, flags) = self.region_snapshot(idx);
        if kind != RegionKind::Real {
            return Err(HvError::Access);
        }
        let region_off = gpa - start;
        let available = (rsize - region_off).min(size);
        let hpa = self.host_phys_for(idx, region_off);
        Ok((hpa, available, flags))
    }

    /// Fan out `reset` to every virtual region's emulator (§4.7).
    pub fn reset(&self) -> HvResult<()> {
        let regions = self.regions.lock();
        for region in regions.iter() {
            if let Some(emu) = &region.emu {
                emu.reset()?;
            }
        }
        Ok(())
    }
}

/// A read-only view of one region held behind the region-list lock,
/// cheap enough to hand to the devemu cache on every access.
pub struct RegionView<'a> {
    guard: crate::sync::SpinLockGuard<'a, Vec<Region>>,
    idx: usize,
}

impl<'a> std::ops::Deref for RegionView<'a> {
    type Target = Region;
    fn deref(&self) -> &Region {
        &self.guard[self.idx]
    }
}
