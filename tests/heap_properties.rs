//! Allocator properties over randomized allocate / free / reallocate traces.

use core::ptr::NonNull;

use pantheros_kmm::mm::{
    Heap, HeapConfig, HeapError, Owner, RegionMemory, COMPACT_HEADER, GRANULE, TRACKED_HEADER,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

struct Live {
    ptr: NonNull<u8>,
    len: usize,
    tag: u8,
}

fn paint(ptr: NonNull<u8>, len: usize, tag: u8) {
    // SAFETY: callers pass live allocations of at least `len` bytes.
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), tag, len) };
}

fn intact(live: &Live) -> bool {
    // SAFETY: `live` is a live allocation of `live.len` bytes.
    let bytes = unsafe { core::slice::from_raw_parts(live.ptr.as_ptr(), live.len) };
    bytes.iter().all(|&b| b == live.tag)
}

/// Structural properties that must hold between operations.
fn assert_consistent(heap: &Heap<'_>) {
    heap.check().unwrap();
    let stats = heap.stats();
    assert_eq!(stats.used + stats.free, stats.arena);

    let mut nodes = 0;
    for index in 0..heap.region_count() {
        let info = heap.region(index).unwrap();
        let mut total = 0usize;
        let mut prev_free = false;
        for node in heap.walk(index) {
            assert!(!(prev_free && node.is_free()), "adjacent free nodes at {:#x}", node.addr);
            assert_eq!(node.size as usize % GRANULE, 0);
            prev_free = node.is_free();
            total += node.size as usize;
        }
        assert_eq!(total, info.end - info.start);
        assert_eq!(info.free_nodes, heap.walk(index).filter(|n| n.is_free()).count());
        nodes += info.nodes;
    }
    assert_eq!(nodes, stats.nodes);
}

#[test]
fn random_traces_preserve_invariants() {
    for seed in 0..6u64 {
        let mut buf = vec![0u8; 64 * 1024];
        let mut heap = Heap::initialize(HeapConfig::DEFAULT, [RegionMemory::new(&mut buf)]).unwrap();
        let pristine = heap.stats();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut live: Vec<Live> = Vec::new();

        for step in 0..3000usize {
            if live.is_empty() || rng.gen_bool(0.55) {
                let len = rng.gen_range(1..=700);
                match heap.allocate(len, Owner::UNKNOWN) {
                    Ok(ptr) => {
                        assert_eq!(ptr.as_ptr() as usize % GRANULE, 0);
                        let tag = step as u8;
                        paint(ptr, len, tag);
                        live.push(Live { ptr, len, tag });
                    }
                    Err(HeapError::OutOfMemory { requested }) => assert_eq!(requested, len),
                    Err(err) => panic!("unexpected allocation failure: {}", err),
                }
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(intact(&victim), "payload clobbered at step {}", step);
                heap.free(victim.ptr).unwrap();
            }
            if step % 64 == 0 {
                assert_consistent(&heap);
            }
        }

        for victim in live.drain(..) {
            assert!(intact(&victim));
            heap.free(victim.ptr).unwrap();
        }
        assert_consistent(&heap);

        // Everything coalesced back into the one initial free node.
        let stats = heap.stats();
        assert_eq!(stats, pristine);
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(stats.largest_free, stats.arena - 2 * COMPACT_HEADER);
        assert_eq!(stats.nodes, 3);
    }
}

#[test]
fn reallocation_keeps_prefix() {
    let mut buf = vec![0u8; 32 * 1024];
    let mut heap = Heap::initialize(HeapConfig::DEFAULT, [RegionMemory::new(&mut buf)]).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<Live> = Vec::new();

    for step in 0..1500usize {
        let roll = rng.gen_range(0..3);
        if live.is_empty() || roll == 0 {
            let len = rng.gen_range(1..=300);
            if let Ok(ptr) = heap.allocate(len, Owner::UNKNOWN) {
                paint(ptr, len, step as u8);
                live.push(Live { ptr, len, tag: step as u8 });
            }
        } else if roll == 1 {
            let i = rng.gen_range(0..live.len());
            let new_len = rng.gen_range(1..=900);
            let (old_ptr, old_len, tag) = (live[i].ptr, live[i].len, live[i].tag);
            let keep = old_len.min(new_len);
            match heap.reallocate(old_ptr, new_len, Owner::UNKNOWN) {
                Ok(ptr) => {
                    let moved = Live { ptr, len: keep, tag };
                    assert!(intact(&moved), "prefix lost at step {}", step);
                    paint(ptr, new_len, tag);
                    live[i] = Live { ptr, len: new_len, tag };
                }
                Err(HeapError::OutOfMemory { .. }) => assert!(intact(&live[i])),
                Err(err) => panic!("unexpected reallocation failure: {}", err),
            }
        } else {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            assert!(intact(&victim));
            heap.free(victim.ptr).unwrap();
        }
        if step % 50 == 0 {
            assert_consistent(&heap);
        }
    }

    for victim in live.drain(..) {
        heap.free(victim.ptr).unwrap();
    }
    assert_consistent(&heap);
    assert_eq!(heap.stats().free_chunks, 1);
}

#[test]
fn regions_fill_and_drain_independently() {
    let mut a = vec![0u8; 2048];
    let mut b = vec![0u8; 8192];
    let mut c = vec![0u8; 4096];
    let config = HeapConfig::DEFAULT.with_regions(3).with_owner_tracking(true);
    let mut heap = Heap::initialize(
        config,
        [
            RegionMemory::new(&mut a),
            RegionMemory::new(&mut b),
            RegionMemory::new(&mut c),
        ],
    )
    .unwrap();
    assert_eq!(heap.region_count(), 3);

    let mut live = Vec::new();
    let mut hits = [0usize; 3];
    loop {
        match heap.allocate(200, Owner::caller(1)) {
            Ok(ptr) => {
                let addr = ptr.as_ptr() as usize;
                let region = (0..3)
                    .find(|&i| {
                        let info = heap.region(i).unwrap();
                        addr >= info.start && addr < info.end
                    })
                    .expect("allocation outside every region");
                hits[region] += 1;
                live.push(ptr);
            }
            Err(HeapError::OutOfMemory { .. }) => break,
            Err(err) => panic!("unexpected failure: {}", err),
        }
    }
    assert!(hits.iter().all(|&n| n > 0), "some region never served: {:?}", hits);
    assert_consistent(&heap);

    // Exhaustion leaves the heap exactly as it was.
    let full = heap.stats();
    assert!(heap.allocate(200, Owner::UNKNOWN).is_err());
    assert_eq!(heap.stats(), full);

    for ptr in live.drain(..).rev() {
        heap.free(ptr).unwrap();
    }
    for index in 0..3 {
        let info = heap.region(index).unwrap();
        assert_eq!(info.nodes, 3);
        let free = heap.walk(index).nth(1).unwrap();
        assert_eq!(free.size as usize, info.end - info.start - 2 * TRACKED_HEADER);
    }
    assert_consistent(&heap);
}

#[test]
fn owner_attribution_is_per_call_site() {
    let mut buf = vec![0u8; 4096];
    let config = HeapConfig::DEFAULT.with_owner_tracking(true);
    let mut heap = Heap::initialize(config, [RegionMemory::new(&mut buf)]).unwrap();
    let first = Owner::caller(5);
    let second = Owner::caller(5);
    assert_ne!(first.call_site, second.call_site);
    heap.allocate(10, first).unwrap();
    heap.allocate(10, second).unwrap();
    let owners: Vec<_> = heap.walk(0).filter_map(|n| n.owner).collect();
    assert_eq!(owners.first(), Some(&Owner::UNKNOWN));
    assert!(owners.contains(&first) && owners.contains(&second));
}
