//! §8 scenario 6: 100 scheduled works all run and land in STOPPED by the
//! time `flush` returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hvcore::sleep::workqueue::{Work, WorkState, Workqueue};

#[test]
fn flush_runs_every_scheduled_work_exactly_once() {
    let wq = Workqueue::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let works: Vec<_> = (0..100)
        .map(|_| {
            let counter = counter.clone();
            Work::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    for w in &works {
        wq.schedule_work(w.clone());
    }

    wq.flush();

    assert!(wq.is_empty());
    assert_eq!(counter.load(Ordering::SeqCst), 100);
    for w in &works {
        assert_eq!(w.state(), WorkState::Stopped);
    }
}
