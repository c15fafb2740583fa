//! Host address space (§4.1): RAM pool, VA pool, and the `memmap` /
//! `physical_read` / `physical_write` contract built on top of them.
//!
//! The RAM pool owns a real backing allocation (on bare metal this is
//! physical DRAM discovered at boot; here it is a boxed byte slice) so
//! that `physical_read`/`physical_write` round-trip against actual
//! memory instead of touching addresses a test host cannot back. The VA
//! pool and the architecture MMU hook still perform their bookkeeping on
//! every `memmap`/`memunmap` so the invariant in §4.1 ("every page the
//! architecture MMU has mapped is also marked allocated in both
//! bitmaps") is exercised even though, on this backend, the returned
//! virtual address is the RAM pool's own backing pointer rather than a
//! page table walk away from it.

pub mod bitmap_pool;

use std::collections::HashMap;

use bitmap_pool::{BitmapPool, PAGE_SIZE};

use crate::arch::ArchOps;
use crate::error::{HvError, HvResult};
use crate::sync::SpinLock;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READABLE   = 1 << 0;
        const WRITABLE   = 1 << 1;
        const EXECUTABLE = 1 << 2;
        const CACHEABLE  = 1 << 3;
    }
}

struct Backing(Box<[u8]>);
// SAFETY: access is always through `RamPool`'s bitmap lock or restricted
// to a caller-owned byte range that the bitmap has marked allocated, so
// two callers never observe the same bytes concurrently without
// synchronizing through the bitmap lock first.
unsafe impl Sync for Backing {}

/// Host-physical RAM, tracked page-by-page (§3 "RAM pool").
pub struct RamPool {
    base: u64,
    backing: Backing,
    bitmap: SpinLock<BitmapPool>,
}

impl RamPool {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            backing: Backing(vec![0u8; size as usize].into_boxed_slice()),
            bitmap: SpinLock::new(BitmapPool::new(base, size)),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn alloc_pages(&self, count: usize) -> HvResult<u64> {
        self.bitmap.lock().alloc(count, 1)
    }

    pub fn free_pages(&self, addr: u64, count: usize) -> HvResult<()> {
        self.bitmap.lock().free(addr, count)
    }

    /// Reserve frames for a real guest region or the hypervisor image.
    /// Fails if any covered frame is already allocated (§3).
    pub fn reserve(&self, phys: u64, size: u64) -> HvResult<()> {
        let count = size.div_ceil(PAGE_SIZE) as usize;
        self.bitmap.lock().reserve(phys, count)
    }

    pub fn free_count(&self) -> usize {
        self.bitmap.lock().free_count()
    }

    /// Raw pointer to `len` bytes at physical address `phys`, bounds
    /// checked against the pool's backing allocation.
    fn ptr_for(&self, phys: u64, len: usize) -> HvResult<*mut u8> {
        let end = self.backing.0.len() as u64;
        if phys < self.base || phys - self.base + len as u64 > end {
            return Err(HvError::Invalid);
        }
        let off = (phys - self.base) as usize;
        Ok(self.backing.0.as_ptr().wrapping_add(off) as *mut u8)
    }
}

/// Host-virtual backing for transient mappings and the hypervisor heap
/// (§3 "VA pool").
pub struct VaPool {
    bitmap: SpinLock<BitmapPool>,
}

impl VaPool {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            bitmap: SpinLock::new(BitmapPool::new(base, size)),
        }
    }

    pub fn alloc(&self, count: usize) -> HvResult<u64> {
        self.bitmap.lock().alloc(count, 1)
    }

    pub fn free(&self, addr: u64, count: usize) -> HvResult<()> {
        self.bitmap.lock().free(addr, count)
    }
}

/// A live virt→phys mapping installed by [`HostAddressSpace::memmap`],
/// torn down by [`HostAddressSpace::memunmap`].
struct Mapping {
    virt_base: u64,
    phys_base: u64,
    page_count: usize,
}

/// Composes the RAM pool, VA pool, and architecture MMU behind the
/// narrow contract described in §4.1.
pub struct HostAddressSpace {
    ram: RamPool,
    va: VaPool,
    arch: std::sync::Arc<dyn ArchOps>,
    // keyed by the RAM-backed pointer value returned from `memmap`,
    // which doubles as the VA-pool-allocated placeholder's bitmap key.
    mappings: SpinLock<HashMap<u64, Mapping>>,
}

impl HostAddressSpace {
    pub fn new(ram: RamPool, va: VaPool, arch: std::sync::Arc<dyn ArchOps>) -> Self {
        Self {
            ram,
            va,
            arch,
            mappings: SpinLock::new(HashMap::new()),
        }
    }

    pub fn ram(&self) -> &RamPool {
        &self.ram
    }

    pub fn va(&self) -> &VaPool {
        &self.va
    }

    /// Map `size` bytes of host-physical memory starting at `phys`,
    /// rounding up to page granularity, and return the virtual address
    /// plus the original page offset so byte-granular access works
    /// (§4.1).
    pub fn memmap(&self, phys: u64, size: u64, flags: MapFlags) -> HvResult<u64> {
        let offset = phys % PAGE_SIZE;
        let span = (size + offset).div_ceil(PAGE_SIZE) as usize;
        let page_count = span.max(1);
        let phys_base = phys - offset;

        // VA-pool bookkeeping placeholder: every live mapping consumes
        // a run from the VA pool even though the returned address comes
        // from the RAM backing store directly (see module docs).
        let va_placeholder = self.va.alloc(page_count)?;

        for i in 0..page_count {
            if let Err(e) = self.arch.cpu_aspace_map(
                va_placeholder + (i as u64) * PAGE_SIZE,
                phys_base + (i as u64) * PAGE_SIZE,
                PAGE_SIZE,
                flags.bits(),
            ) {
                let _ = self.va.free(va_placeholder, page_count);
                return Err(e);
            }
        }

        let ptr = self.ram.ptr_for(phys_base, page_count * PAGE_SIZE as usize)? as u64;
        self.mappings.lock().insert(
            ptr,
            Mapping {
                virt_base: va_placeholder,
                phys_base,
                page_count,
            },
        );
        Ok(ptr + offset)
    }

    pub fn memunmap(&self, virt: u64, _size: u64) -> HvResult<()> {
        let offset = virt % PAGE_SIZE;
        let base = virt - offset;
        let mapping = self
            .mappings
            .lock()
            .remove(&base)
            .ok_or(HvError::NotAvailable)?;
        for i in 0..mapping.page_count {
            self.arch
                .cpu_aspace_unmap(mapping.virt_base + (i as u64) * PAGE_SIZE, PAGE_SIZE)?;
        }
        self.va.free(mapping.virt_base, mapping.page_count)
    }

    pub fn alloc_pages(&self, count: usize, flags: MapFlags) -> HvResult<u64> {
        let phys = self.ram.alloc_pages(count)?;
        match self.memmap(phys, count as u64 * PAGE_SIZE, flags) {
            Ok(virt) => Ok(virt),
            Err(e) => {
                let _ = self.ram.free_pages(phys, count);
                Err(e)
            }
        }
    }

    pub fn free_pages(&self, virt: u64, count: usize) -> HvResult<()> {
        let base = virt - (virt % PAGE_SIZE);
        let phys_base = self.mappings.lock().get(&base).map(|m| m.phys_base);
        let phys_base = phys_base.ok_or(HvError::NotAvailable)?;
        self.memunmap(virt, count as u64 * PAGE_SIZE)?;
        self.ram.free_pages(phys_base, count)
    }

    pub fn va2pa(&self, virt: u64) -> HvResult<u64> {
        self.arch.cpu_aspace_va2pa(virt)
    }

    /// Copy `buf.len()` bytes out of host-physical memory through a
    /// transient single-page window per covered page (§4.1).
    pub fn physical_read(&self, phys: u64, buf: &mut [u8]) -> HvResult<()> {
        let mut done = 0usize;
        let mut cur = phys;
        while done < buf.len() {
            let page_off = (cur % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - page_off).min(buf.len() - done);
            let window = self.memmap(cur, chunk as u64, MapFlags::READABLE)?;
            let src = unsafe { std::slice::from_raw_parts(window as *const u8, chunk) };
            buf[done..done + chunk].copy_from_slice(src);
            self.memunmap(window - page_off as u64, PAGE_SIZE)?;
            done += chunk;
            cur += chunk as u64;
        }
        Ok(())
    }

    pub fn physical_write(&self, phys: u64, buf: &[u8]) -> HvResult<()> {
        let mut done = 0usize;
        let mut cur = phys;
        while done < buf.len() {
            let page_off = (cur % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - page_off).min(buf.len() - done);
            let window = self.memmap(cur, chunk as u64, MapFlags::READABLE | MapFlags::WRITABLE)?;
            let dst = unsafe { std::slice::from_raw_parts_mut(window as *mut u8, chunk) };
            dst.copy_from_slice(&buf[done..done + chunk]);
            self.memunmap(window - page_off as u64, PAGE_SIZE)?;
            done += chunk;
            cur += chunk as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mock::MockArch;
    use std::sync::Arc;

    fn host() -> HostAddressSpace {
        HostAddressSpace::new(
            RamPool::new(0x1000_0000, 64 * 1024 * 1024),
            VaPool::new(0x8000_0000, 64 * 1024 * 1024),
            Arc::new(MockArch::new()),
        )
    }

    #[test]
    fn ram_alloc_free_round_trip() {
        let h = host();
        let before = h.ram.free_count();
        let mut addrs = Vec::new();
        for _ in 0..10 {
            addrs.push(h.ram.alloc_pages(1).unwrap());
        }
        for a in addrs.into_iter().rev() {
            h.ram.free_pages(a, 1).unwrap();
        }
        assert_eq!(h.ram.free_count(), before);
    }

    #[test]
    fn memmap_memunmap_restores_va_pool() {
        let h = host();
        let phys = h.ram.alloc_pages(4).unwrap();
        let virt = h.memmap(phys, 4 * PAGE_SIZE, MapFlags::READABLE).unwrap();
        h.memunmap(virt, 4 * PAGE_SIZE).unwrap();
        let virt2 = h.memmap(phys, 4 * PAGE_SIZE, MapFlags::READABLE).unwrap();
        assert_eq!(virt, virt2);
        h.memunmap(virt2, 4 * PAGE_SIZE).unwrap();
        h.ram.free_pages(phys, 4).unwrap();
    }

    #[test]
    fn physical_write_then_read_round_trips() {
        let h = host();
        let phys = h.ram.alloc_pages(1).unwrap();
        let data = [0xAAu8; 256];
        h.physical_write(phys + 10, &data).unwrap();
        let mut out = [0u8; 256];
        h.physical_read(phys + 10, &mut out).unwrap();
        assert_eq!(out, data);
        h.ram.free_pages(phys, 1).unwrap();
    }
}
