//! Global emulator registry (§4.8 "Emulator registry").

use std::sync::Arc;

use crate::error::{HvError, HvResult};
use crate::sync::SpinLock;

use super::{EmudevHandle, Emulator, MatchEntry, RegionNodeDesc};

/// Keyed by name; names are expected to be distinct, not enforced
/// beyond the last writer winning the slot.
pub struct EmulatorRegistry {
    emulators: SpinLock<Vec<Arc<dyn Emulator>>>,
}

impl EmulatorRegistry {
    pub const fn new() -> Self {
        Self {
            emulators: SpinLock::new(Vec::new()),
        }
    }

    pub fn register(&self, emulator: Arc<dyn Emulator>) {
        self.emulators.lock().push(emulator);
    }

    pub fn unregister(&self, name: &str) {
        self.emulators.lock().retain(|e| e.name() != name);
    }

    /// Try every registered emulator's match table against `node`,
    /// returning the first hit's probed emudev. `HvError::NoDevice` if
    /// nothing matches.
    pub fn probe_region(&self, node: &RegionNodeDesc) -> HvResult<EmudevHandle> {
        let emulators = self.emulators.lock();
        for emulator in emulators.iter() {
            for entry in emulator.match_table() {
                if entry_matches(entry, node) {
                    return emulator.probe(node, entry);
                }
            }
        }
        Err(HvError::NoDevice)
    }
}

impl Default for EmulatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_matches(entry: &MatchEntry, node: &RegionNodeDesc) -> bool {
    entry.matches(node)
}
