//! Device-tree config loader (§6 "External interfaces").
//!
//! Mirrors `dtb.rs`'s use of the `fdt` crate for the platform-discovery
//! blob, but walks the hypervisor's own schema instead of `/cpus`/`/gic`:
//! `/chosen/console`, `/memory`, and `/guests/<name>/vcpus/<name>` +
//! `/aspace`. `Fdt::from_ptr` is the real boot path (the blob address
//! handed in by firmware); [`Config::from_bytes`] is the host-testable
//! equivalent of `dtb.rs`'s `parse_host_dtb`, taking an owned byte slice
//! instead of a raw pointer.

use fdt::Fdt;

use crate::error::{HvError, HvResult};
use crate::guest::aspace::{AddressKind, MemKind, RegionFlags, RegionKind};
use crate::manager::VcpuSeed;

pub struct MemoryConfig {
    pub physical_addr: u64,
    pub physical_size: u64,
}

pub struct VcpuConfig {
    pub name: String,
    pub start_pc: u64,
    pub start_sp: Option<u64>,
    pub priority: Option<u8>,
    pub time_slice_ns: Option<u64>,
}

pub struct AspaceRegionConfig {
    pub name: String,
    pub manifest_type: String,
    pub address_type: String,
    pub device_type: String,
    pub compatible: Option<String>,
    pub guest_phys_addr: u64,
    pub host_phys_addr: Option<u64>,
    pub physical_size: u64,
}

pub struct GuestConfig {
    pub name: String,
    pub vcpus: Vec<VcpuConfig>,
    pub regions: Vec<AspaceRegionConfig>,
}

pub struct Config {
    pub console: Option<String>,
    pub memory: Option<MemoryConfig>,
    pub guests: Vec<GuestConfig>,
}

impl Config {
    /// Real boot path: `addr` is the physical address of the FDT blob
    /// handed in by firmware (cf. `dtb.rs::init`'s `dtb_addr` parameter).
    ///
    /// # Safety
    /// `addr` must point to a valid flattened device tree that outlives
    /// the returned parse.
    pub unsafe fn from_ptr(addr: usize) -> HvResult<Self> {
        let fdt = Fdt::from_ptr(addr as *const u8).map_err(|_| HvError::Invalid)?;
        Self::from_fdt(&fdt)
    }

    /// Host-testable equivalent, taking an owned blob instead of a raw
    /// pointer.
    pub fn from_bytes(bytes: &[u8]) -> HvResult<Self> {
        let fdt = Fdt::new(bytes).map_err(|_| HvError::Invalid)?;
        Self::from_fdt(&fdt)
    }

    fn from_fdt(fdt: &Fdt) -> HvResult<Self> {
        let console = fdt
            .find_node("/chosen")
            .and_then(|n| n.property("console"))
            .and_then(|p| p.as_str())
            .map(str::to_owned);

        let memory = fdt.find_node("/memory").map(|n| MemoryConfig {
            physical_addr: prop_u64(&n, "physical_addr").unwrap_or(0),
            physical_size: prop_u64(&n, "physical_size").unwrap_or(0),
        });

        let mut guests = Vec::new();
        if let Some(guests_node) = fdt.find_node("/guests") {
            for guest_node in guests_node.children() {
                if guest_node.property("device_type").and_then(|p| p.as_str()) != Some("guest") {
                    continue;
                }
                let name = guest_node.name.to_owned();

                let mut vcpus = Vec::new();
                if let Some(vcpus_node) = guest_node.children().find(|c| c.name == "vcpus") {
                    for vcpu_node in vcpus_node.children() {
                        if vcpu_node.property("device_type").and_then(|p| p.as_str()) != Some("vcpu")
                        {
                            continue;
                        }
                        vcpus.push(VcpuConfig {
                            name: vcpu_node.name.to_owned(),
                            start_pc: prop_u64(&vcpu_node, "start_pc").ok_or(HvError::Invalid)?,
                            start_sp: prop_u64(&vcpu_node, "start_sp"),
                            priority: prop_u64(&vcpu_node, "priority").map(|v| v as u8),
                            time_slice_ns: prop_u64(&vcpu_node, "time_slice"),
                        });
                    }
                }

                let mut regions = Vec::new();
                if let Some(aspace_node) = guest_node.children().find(|c| c.name == "aspace") {
                    for region_node in aspace_node.children() {
                        regions.push(AspaceRegionConfig {
                            name: region_node.name.to_owned(),
                            manifest_type: region_node
                                .property("manifest_type")
                                .and_then(|p| p.as_str())
                                .unwrap_or("")
                                .to_owned(),
                            address_type: region_node
                                .property("address_type")
                                .and_then(|p| p.as_str())
                                .unwrap_or("")
                                .to_owned(),
                            device_type: region_node
                                .property("device_type")
                                .and_then(|p| p.as_str())
                                .unwrap_or("")
                                .to_owned(),
                            compatible: region_node
                                .property("compatible")
                                .and_then(|p| p.as_str())
                                .map(str::to_owned),
                            guest_phys_addr: prop_u64(&region_node, "guest_physical_addr")
                                .ok_or(HvError::Invalid)?,
                            host_phys_addr: prop_u64(&region_node, "host_physical_addr"),
                            physical_size: prop_u64(&region_node, "physical_size")
                                .ok_or(HvError::Invalid)?,
                        });
                    }
                }

                guests.push(GuestConfig { name, vcpus, regions });
            }
        }

        Ok(Config { console, memory, guests })
    }
}

/// Device-tree cell values are big-endian and either one 32-bit cell or
/// two (`#address-cells = <2>`); accept either rather than assume.
fn prop_u64(node: &fdt::node::FdtNode, name: &str) -> Option<u64> {
    let bytes = node.property(name)?.value;
    match bytes.len() {
        4 => Some(u32::from_be_bytes(bytes.try_into().ok()?) as u64),
        8 => Some(u64::from_be_bytes(bytes.try_into().ok()?)),
        _ => None,
    }
}

impl VcpuConfig {
    /// Fill in the defaults §6 allows to be omitted, turning a parsed
    /// config entry into the seed [`crate::manager::Manager`] needs.
    pub fn into_seed(self, affinity_cpu: usize) -> VcpuSeed {
        VcpuSeed {
            name: self.name,
            priority: self.priority.unwrap_or(16),
            time_slice_ns: self.time_slice_ns.unwrap_or(10_000_000),
            start_pc: self.start_pc,
            start_sp: self.start_sp.unwrap_or(0),
            affinity_cpu,
        }
    }
}

impl AspaceRegionConfig {
    pub fn kind(&self) -> RegionKind {
        if self.manifest_type == "virtual" {
            RegionKind::Virtual
        } else {
            RegionKind::Real
        }
    }

    pub fn address_kind(&self) -> AddressKind {
        if self.address_type == "io" {
            AddressKind::Io
        } else {
            AddressKind::Memory
        }
    }

    pub fn mem_kind(&self) -> MemKind {
        match self.device_type.as_str() {
            "rom" => MemKind::Rom,
            "device" => MemKind::Device,
            _ => MemKind::Ram,
        }
    }

    pub fn flags(&self) -> RegionFlags {
        RegionFlags::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prop_u64_accepts_one_or_two_cells() {
        let one_cell = [0x00, 0x00, 0x10, 0x00u8]; // 0x1000
        let two_cell = [0u8, 0, 0, 0, 0x00, 0x00, 0x10, 0x00]; // 0x1000

        // Exercise the byte-width decision directly since constructing a
        // minimal valid FDT blob by hand belongs in `tests/`, not here.
        assert_eq!(u32::from_be_bytes(one_cell) as u64, 0x1000);
        assert_eq!(u64::from_be_bytes(two_cell), 0x1000);
    }

    #[test]
    fn vcpu_config_defaults_fill_in_priority_and_time_slice() {
        let cfg = VcpuConfig {
            name: "vcpu0".into(),
            start_pc: 0x4000_0000,
            start_sp: None,
            priority: None,
            time_slice_ns: None,
        };
        let seed = cfg.into_seed(0);
        assert_eq!(seed.start_pc, 0x4000_0000);
        assert_eq!(seed.priority, 16);
        assert_eq!(seed.start_sp, 0);
    }
}
