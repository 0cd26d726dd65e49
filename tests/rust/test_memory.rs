/// Integration tests for KV-cache memory accounting.
use servesim_core::memory::MemoryModel;
use servesim_core::request::Request;

#[test]
fn test_memory_lifecycle() {
    let mut mem = MemoryModel::new(1000, 100, 16);
    let mut requests: Vec<Request> = (0..10)
        .map(|i| Request::new(i, "m", 256, 320, 0))
        .collect();

    for req in requests.iter_mut() {
        let tokens = req.footprint_tokens();
        assert!(mem.try_allocate(req, tokens)); // 16 blocks each
    }
    assert_eq!(mem.used_blocks(), 260);
    assert!(mem.utilization_ratio() > 0.25);

    for req in requests.iter_mut() {
        mem.release(req);
    }
    assert!(mem.is_leak_free());
    assert_eq!(mem.utilization(), (100, 1000));
}

#[test]
fn test_release_twice_does_not_double_free() {
    let mut mem = MemoryModel::new(100, 10, 8);
    let mut a = Request::new(0, "m", 40, 48, 0);
    let mut b = Request::new(1, "m", 40, 48, 0);
    assert!(mem.try_allocate(&mut a, 40));
    assert!(mem.try_allocate(&mut b, 40));

    mem.release(&mut a);
    mem.release(&mut a);
    assert_eq!(mem.used_blocks(), 15);
    assert_eq!(b.allocated_blocks, 5);
}

#[test]
fn test_refuses_above_kv_capacity() {
    // C - B = 90 blocks of 8 tokens.
    let mut mem = MemoryModel::new(100, 10, 8);
    let mut fits = Request::new(0, "m", 720, 721, 0);
    let mut too_big = Request::new(1, "m", 721, 722, 0);

    assert!(!mem.try_allocate(&mut too_big, 721));
    assert_eq!(too_big.allocated_blocks, 0);
    assert!(mem.try_allocate(&mut fits, 720));
    assert_eq!(mem.free_blocks(), 0);
    assert_eq!(mem.refusals, 1);
}

#[test]
fn test_growth_tracks_generation() {
    let mut mem = MemoryModel::new(100, 0, 8);
    let mut req = Request::new(0, "m", 6, 30, 0);
    let mut reallocations = 0;
    let mut last = 0;
    while !req.is_finished() {
        let tokens = req.footprint_tokens();
        assert!(mem.try_allocate(&mut req, tokens));
        if mem.used_blocks() != last {
            reallocations += 1;
            last = mem.used_blocks();
        }
        req.advance(0);
    }
    // Footprints 6..=29 touch blocks 1 through 4.
    assert_eq!(reallocations, 4);
    assert_eq!(mem.stats().used_blocks, 4);
}
