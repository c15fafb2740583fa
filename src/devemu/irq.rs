//! IRQ injection into emulated interrupt controllers (§4.8 "IRQ
//! injection").

use std::sync::Arc;

use crate::error::HvResult;

use super::Emudev;

/// A registered virtual interrupt controller (typically a vGIC
/// emulator) able to receive edges for a physical-or-emulated IRQ
/// number it has claimed.
pub trait IrqEmudev: Emudev {
    /// `cpu < 0` means a shared IRQ; `cpu >= 0` is a per-CPU IRQ and the
    /// receiving controller decides routing.
    fn handle_irq(&self, irq: u32, cpu: i32, level: bool) -> HvResult<()>;
}

struct HandlerEntry {
    irq: u32,
    handler: Arc<dyn IrqEmudev>,
}

/// Per-guest list of claimed IRQ numbers, populated by emulated
/// interrupt controllers at probe time.
pub struct IrqHandlerList {
    handlers: Vec<HandlerEntry>,
}

impl IrqHandlerList {
    pub const fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, irq: u32, handler: Arc<dyn IrqEmudev>) {
        self.handlers.push(HandlerEntry { irq, handler });
    }

    pub fn unregister(&mut self, irq: u32) {
        self.handlers.retain(|e| e.irq != irq);
    }

    /// Walk every handler claiming `irq` and deliver the edge. Handlers
    /// are responsible for re-raising into the correct VCPU themselves
    /// (typically via `vcpu_irq_assert`).
    pub fn emulate_irq(&self, irq: u32, cpu: i32, level: bool) -> HvResult<()> {
        for entry in self.handlers.iter().filter(|e| e.irq == irq) {
            entry.handler.handle_irq(irq, cpu, level)?;
        }
        Ok(())
    }
}

impl Default for IrqHandlerList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HvResult;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct RecordingController {
        edges: Mutex<Vec<bool>>,
        pending: AtomicU32,
    }

    impl Emudev for RecordingController {
        fn read(&self, _offset: u64, buf: &mut [u8]) -> HvResult<()> {
            buf.fill(self.pending.load(Ordering::SeqCst) as u8);
            Ok(())
        }
        fn write(&self, _offset: u64, _buf: &[u8]) -> HvResult<()> {
            Ok(())
        }
    }

    impl IrqEmudev for RecordingController {
        fn handle_irq(&self, _irq: u32, _cpu: i32, level: bool) -> HvResult<()> {
            self.edges.lock().unwrap().push(level);
            if level {
                self.pending.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[test]
    fn observes_both_edges_in_order_and_asserts_once() {
        let controller = Arc::new(RecordingController {
            edges: Mutex::new(Vec::new()),
            pending: AtomicU32::new(0),
        });
        let mut list = IrqHandlerList::new();
        list.register(42, controller.clone());

        list.emulate_irq(42, -1, true).unwrap();
        list.emulate_irq(42, -1, false).unwrap();

        assert_eq!(*controller.edges.lock().unwrap(), vec![true, false]);
        assert_eq!(controller.pending.load(Ordering::SeqCst), 1);
    }
}
