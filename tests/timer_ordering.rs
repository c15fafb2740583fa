//! §8 scenario 2: three timer events with durations 3ms/1ms/2ms on the
//! same CPU must fire in expiry order (1, 2, 3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hvcore::timer::{Clocksource, TimerEvent, TimerSubsystem};

fn counting_clocksource(counter: Arc<AtomicU64>) -> Clocksource {
    Clocksource::new("test", 100, u64::MAX, 1, 0, Arc::new(move || {
        counter.load(Ordering::SeqCst)
    }))
}

#[test]
fn events_fire_in_expiry_order_across_the_subsystem() {
    let raw = Arc::new(AtomicU64::new(0));
    let sub = TimerSubsystem::new(counting_clocksource(raw.clone()), 1);
    let order = Arc::new(Mutex::new(Vec::new()));

    for (tag, duration_ns) in [(3u32, 3_000_000u64), (1, 1_000_000), (2, 2_000_000)] {
        let order = order.clone();
        sub.start(
            0,
            TimerEvent {
                expiry_ns: 0,
                duration_ns,
                active: false,
                handler: Arc::new(move |_ev| order.lock().unwrap().push(tag)),
            },
        )
        .unwrap();
    }

    raw.store(3_000_000, Ordering::SeqCst);
    sub.on_tick(0).unwrap();

    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}
