//! Device emulation framework (§4.8).
//!
//! Matching guest MMIO against devices through a closed `Device` enum
//! chosen at compile time doesn't fit here: emulators are registered
//! dynamically by name at runtime (a test can register a
//! `compatible = "test,mmio"` emulator the core has never heard of), so
//! matching goes through a trait-object registry instead of an
//! enum-dispatch table. Emulators and host-IRQ chips are naturally
//! function tables and stay that way. What the registry keeps is a
//! fixed small list, a `contains`-style address match, and
//! `read`/`write` taking an offset relative to the device's base.

pub mod cache;
pub mod irq;
pub mod registry;

use std::sync::Arc;

use crate::error::HvResult;

pub use cache::DevemuCache;
pub use irq::IrqEmudev;
pub use registry::EmulatorRegistry;

/// Width of a decoded guest memory access (§4.9's "decoded transfer
/// width").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferWidth {
    Byte,
    Half,
    Word,
    Double,
}

impl TransferWidth {
    pub fn bytes(self) -> usize {
        match self {
            TransferWidth::Byte => 1,
            TransferWidth::Half => 2,
            TransferWidth::Word => 4,
            TransferWidth::Double => 8,
        }
    }
}

/// An instance of a virtual device bound to one guest-address-space
/// region (§3 "Emulator / Emudev").
pub trait Emudev: Send + Sync {
    /// `offset` is relative to the owning region's `guest_phys_start`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> HvResult<()>;
    fn write(&self, offset: u64, buf: &[u8]) -> HvResult<()>;
    fn reset(&self) -> HvResult<()> {
        Ok(())
    }
    fn remove(&self) {}
}

impl std::fmt::Debug for dyn Emudev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emudev").finish_non_exhaustive()
    }
}

pub type EmudevHandle = Arc<dyn Emudev>;

/// Device-tree attributes of a candidate virtual region, used to match
/// it against an emulator's match table (§4.8).
#[derive(Debug, Clone, Default)]
pub struct RegionNodeDesc {
    pub name: String,
    pub device_type: Option<String>,
    pub compatible: Option<String>,
}

/// One entry of an emulator's match table. A field left `None` is not
/// checked; a match requires every populated field to agree (§4.8: "all
/// non-empty fields").
#[derive(Debug, Clone, Default)]
pub struct MatchEntry {
    pub name: Option<String>,
    pub device_type: Option<String>,
    pub compatible: Option<String>,
    pub cookie: u64,
}

impl MatchEntry {
    fn matches(&self, node: &RegionNodeDesc) -> bool {
        if let Some(name) = &self.name {
            if *name != node.name {
                return false;
            }
        }
        if let Some(dt) = &self.device_type {
            if Some(dt) != node.device_type.as_ref() {
                return false;
            }
        }
        if let Some(compat) = &self.compatible {
            if Some(compat) != node.compatible.as_ref() {
                return false;
            }
        }
        true
    }
}

/// A class descriptor for a virtual device (§3 "Emulator / Emudev").
pub trait Emulator: Send + Sync {
    fn name(&self) -> &str;
    fn match_table(&self) -> &[MatchEntry];
    /// Allocate and initialize a new instance bound to the matched
    /// region. Probe failure must not leave a partially built emudev
    /// registered anywhere the caller can observe.
    fn probe(&self, node: &RegionNodeDesc, matched: &MatchEntry) -> HvResult<EmudevHandle>;
}
