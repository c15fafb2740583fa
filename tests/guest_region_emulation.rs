//! §8 scenario 4: a guest's virtual region backed by a registered
//! `test,mmio` emulator round-trips a 4-byte write/read pair.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use hvcore::arch::mock::MockArch;
use hvcore::devemu::{DevemuCache, Emudev, EmudevHandle, Emulator, MatchEntry, RegionNodeDesc};
use hvcore::error::HvResult;
use hvcore::guest::aspace::{AddressKind, GuestAddressSpace, MemKind, RegionConfig, RegionFlags, RegionKind};
use hvcore::host::{HostAddressSpace, RamPool, VaPool};

struct RegisterBank {
    value: AtomicU32,
}

impl Emudev for RegisterBank {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> HvResult<()> {
        buf.copy_from_slice(&self.value.load(Ordering::SeqCst).to_le_bytes()[..buf.len()]);
        Ok(())
    }
    fn write(&self, _offset: u64, buf: &[u8]) -> HvResult<()> {
        let mut bytes = [0u8; 4];
        bytes[..buf.len()].copy_from_slice(buf);
        self.value.store(u32::from_le_bytes(bytes), Ordering::SeqCst);
        Ok(())
    }
}

struct MmioEmulator;
impl Emulator for MmioEmulator {
    fn name(&self) -> &str {
        "test-mmio"
    }
    fn match_table(&self) -> &[MatchEntry] {
        static TABLE: std::sync::OnceLock<Vec<MatchEntry>> = std::sync::OnceLock::new();
        TABLE.get_or_init(|| {
            vec![MatchEntry {
                compatible: Some("test,mmio".into()),
                ..Default::default()
            }]
        })
    }
    fn probe(&self, _node: &RegionNodeDesc, _matched: &MatchEntry) -> HvResult<EmudevHandle> {
        Ok(Arc::new(RegisterBank {
            value: AtomicU32::new(0),
        }))
    }
}

#[test]
fn write_then_read_round_trips_through_the_bound_emulator() {
    let host = Arc::new(HostAddressSpace::new(
        RamPool::new(0x1000_0000, 16 * 1024 * 1024),
        VaPool::new(0x8000_0000, 16 * 1024 * 1024),
        Arc::new(MockArch::new()),
    ));
    let aspace = GuestAddressSpace::new(host);
    let registry = hvcore::devemu::EmulatorRegistry::new();
    registry.register(Arc::new(MmioEmulator));

    aspace
        .add_region(
            RegionConfig {
                node: RegionNodeDesc {
                    name: "mmio0".into(),
                    device_type: None,
                    compatible: Some("test,mmio".into()),
                },
                kind: RegionKind::Virtual,
                address_kind: AddressKind::Io,
                mem_kind: MemKind::Device,
                guest_phys_addr: 0x1000_0000,
                host_phys_addr: None,
                physical_size: 0x1000,
                flags: RegionFlags::default(),
            },
            &registry,
        )
        .unwrap();

    let mut cache = DevemuCache::new();
    cache
        .emulate_write(&aspace, 0x1000_0004, &0xDEADBEEFu32.to_le_bytes())
        .unwrap();
    let mut out = [0u8; 4];
    cache.emulate_read(&aspace, 0x1000_0004, &mut out).unwrap();
    assert_eq!(u32::from_le_bytes(out), 0xDEADBEEF);
}
