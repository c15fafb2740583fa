//! §8 scenario 5: an emulated interrupt controller registered for IRQ
//! 42 observes both edges, in order, and asserts exactly once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use hvcore::devemu::irq::IrqHandlerList;
use hvcore::devemu::{Emudev, IrqEmudev};
use hvcore::error::HvResult;

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
fn assert_then_deassert_observes_both_edges_once() {
    let controller = Arc::new(RecordingController {
        edges: Mutex::new(Vec::new()),
        pending: AtomicU32::new(0),
    });
    let mut handlers = IrqHandlerList::new();
    handlers.register(42, controller.clone());

    handlers.emulate_irq(42, -1, true).unwrap();
    handlers.emulate_irq(42, -1, false).unwrap();

    assert_eq!(*controller.edges.lock().unwrap(), vec![true, false]);
    assert_eq!(controller.pending.load(Ordering::SeqCst), 1);
}
