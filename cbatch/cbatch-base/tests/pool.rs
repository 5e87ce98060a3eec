use cbatch::pool::{BufferKind, BufferPool, Recycler};
use std::sync::Arc;

#[test]
fn test_rented_buffer_is_zeroed() {
    let pool = BufferPool::new(16);
    {
        let mut buf = pool.rent(BufferKind::Frequency);
        assert_eq!(buf.len(), 16);
        assert!(buf.iter().all(|v| *v == 0.0));
        buf[3] = -0.5;
        buf[15] = 2.0;
    }
    let buf = pool.rent(BufferKind::Frequency);
    assert!(buf.iter().all(|v| *v == 0.0));

    let stats = pool.stats(BufferKind::Frequency);
    assert_eq!(stats.allocated, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[test]
fn test_leases_are_exclusive() {
    let pool = BufferPool::new(8);
    let mut a = pool.rent(BufferKind::Presence);
    let b = pool.rent(BufferKind::Presence);
    a[0] = 1.0;
    assert_eq!(b[0], 0.0);
    assert_eq!(pool.stats(BufferKind::Presence).allocated, 2);
    assert_eq!(pool.stats(BufferKind::Presence).free, 0);

    drop(a);
    drop(b);
    assert_eq!(pool.stats(BufferKind::Presence).free, 2);
}

#[test]
fn test_kinds_do_not_share_lists() {
    let pool = BufferPool::new(8);
    drop(pool.rent(BufferKind::LogitBias));
    assert_eq!(pool.stats(BufferKind::LogitBias).free, 1);
    assert_eq!(pool.stats(BufferKind::Scratch).free, 0);

    let _scratch = pool.rent(BufferKind::Scratch);
    assert_eq!(pool.stats(BufferKind::Scratch).misses, 1);
    assert_eq!(pool.stats(BufferKind::LogitBias).free, 1);
}

#[test]
fn test_token_set_cleared_on_return() {
    let pool = BufferPool::new(8);
    {
        let mut set = pool.rent_set();
        set.insert(3);
        set.insert(5);
    }
    let set = pool.rent_set();
    assert!(set.is_empty());
    assert_eq!(pool.set_stats().allocated, 1);
}

#[test]
fn test_concurrent_rent_and_return() {
    let recycler: Recycler<Vec<f32>> = Recycler::new(|| vec![0.0; 32]);
    let recycler = Arc::new(recycler);
    let threads: Vec<_> = (0..4)
        .map(|t| {
            let recycler = recycler.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let mut buf = recycler.rent();
                    assert!(buf.iter().all(|v| *v == 0.0));
                    buf[i % 32] = t as f32 + 1.0;
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let stats = recycler.stats();
    assert!(stats.allocated <= 4);
    assert_eq!(stats.free, stats.allocated);
    assert_eq!(stats.hits + stats.misses, 2000);
}
