//! §8 scenario 1: allocate 10 pages from a 64 MiB RAM pool, free them in
//! reverse order, and check the free-frame count returns to baseline.

use hvcore::host::RamPool;

#[test]
fn alloc_then_free_in_reverse_restores_free_count() {
    let pool = RamPool::new(0x4000_0000, 64 * 1024 * 1024);
    let before = pool.free_count();

    let mut addrs = Vec::new();
    for _ in 0..10 {
        addrs.push(pool.alloc_pages(1).unwrap());
    }
    assert_eq!(pool.free_count(), before - 10);

    for addr in addrs.into_iter().rev() {
        pool.free_pages(addr, 1).unwrap();
    }
    assert_eq!(pool.free_count(), before);
}
