//! Per-VCPU devemu cache (§3 "VCPU devemu cache", §4.8 "Per-VCPU cache").

use crate::error::{HvError, HvResult};
use crate::guest::aspace::{GuestAddressSpace, RegionKind};

const CACHE_DEPTH: usize = 4;

#[derive(Clone, Copy)]
struct CacheEntry {
    gpa_base: u64,
    size: u64,
    region_index: usize,
}

struct CacheTable {
    entries: [Option<CacheEntry>; CACHE_DEPTH],
    victim: usize,
}

impl CacheTable {
    fn new() -> Self {
        Self {
            entries: [None; CACHE_DEPTH],
            victim: 0,
        }
    }

    fn lookup(&self, gpa: u64) -> Option<usize> {
        self.entries.iter().find_map(|e| {
            e.filter(|e| gpa >= e.gpa_base && gpa < e.gpa_base + e.size)
                .map(|e| e.region_index)
        })
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.entries[self.victim] = Some(entry);
        self.victim = (self.victim + 1) % CACHE_DEPTH;
    }

    fn invalidate(&mut self, region_index: usize) {
        for e in self.entries.iter_mut() {
            if e.map(|e| e.region_index) == Some(region_index) {
                *e = None;
            }
        }
    }

    fn clear(&mut self) {
        self.entries = [None; CACHE_DEPTH];
        self.victim = 0;
    }
}

/// Two independent fully-associative tables, one per access direction,
/// owned by each VCPU (§3).
pub struct DevemuCache {
    read: CacheTable,
    write: CacheTable,
}

impl DevemuCache {
    pub fn new() -> Self {
        Self {
            read: CacheTable::new(),
            write: CacheTable::new(),
        }
    }

    pub fn invalidate_region(&mut self, region_index: usize) {
        self.read.invalidate(region_index);
        self.write.invalidate(region_index);
    }

    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
    }

    pub fn emulate_read(
        &mut self,
        aspace: &GuestAddressSpace,
        gpa: u64,
        dst: &mut [u8],
    ) -> HvResult<()> {
        self.emulate(&mut Self::read_table, aspace, gpa, dst, false)
    }

    pub fn emulate_write(&mut self, aspace: &GuestAddressSpace, gpa: u64, src: &[u8]) -> HvResult<()> {
        let mut buf = src.to_vec();
        self.emulate(&mut Self::write_table, aspace, gpa, &mut buf, true)
    }

    fn read_table(&mut self) -> &mut CacheTable {
        &mut self.read
    }

    fn write_table(&mut self) -> &mut CacheTable {
        &mut self.write
    }

    fn emulate(
        &mut self,
        table_of: &mut dyn FnMut(&mut Self) -> &mut CacheTable,
        aspace: &GuestAddressSpace,
        gpa: u64,
        buf: &mut [u8],
        is_write: bool,
    ) -> HvResult<()> {
        let cached = table_of(self).lookup(gpa);
        let region_index = match cached {
            Some(idx) => idx,
            None => {
                let idx = aspace.find_region_index(gpa).ok_or(HvError::NotAvailable)?;
                let region = aspace.region_at(idx);
                if region.kind == RegionKind::Virtual {
                    table_of(self).insert(CacheEntry {
                        gpa_base: region.guest_phys_start,
                        size: region.size,
                        region_index: idx,
                    });
                }
                idx
            }
        };
        // Pull out everything needed and drop the region-list lock
        // before calling into the emulator: devemu callbacks must not
        // run with a spinlock held.
        let (emu, offset) = {
            let region = aspace.region_at(region_index);
            if region.kind != RegionKind::Virtual {
                return Err(HvError::Access);
            }
            let emu = region.emu.clone().ok_or(HvError::NoDevice)?;
            (emu, gpa - region.guest_phys_start)
        };
        if is_write {
            emu.write(offset, buf)
        } else {
            emu.read(offset, buf)
        }
    }
}

impl Default for DevemuCache {
    fn default() -> Self {
        Self::new()
    }
}
