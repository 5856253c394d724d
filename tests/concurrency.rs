//! LockedHeap under contention from several task-context threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use pantheros_kmm::mm::{HeapConfig, LockedHeap, RegionMemory};
use pantheros_kmm::TaskContext;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn leak(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

#[test]
fn threads_never_observe_each_others_payloads() {
    let heap: Arc<LockedHeap<'static>> = Arc::new(LockedHeap::new(
        HeapConfig::DEFAULT.with_regions(2),
        TaskContext,
    ));
    heap.init([RegionMemory::new(leak(256 * 1024)), RegionMemory::new(leak(64 * 1024))])
        .unwrap();
    let pristine = heap.stats().unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let checker = {
        let heap = Arc::clone(&heap);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut passes = 0usize;
            while !stop.load(Ordering::SeqCst) {
                heap.check_corruption().unwrap();
                passes += 1;
                thread::yield_now();
            }
            passes
        })
    };

    let workers: Vec<_> = (0..4u64)
        .map(|id| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(id);
                let tag = 0x10 + id as u8;
                let mut live: Vec<(usize, usize)> = Vec::new();
                for _ in 0..2000 {
                    if live.is_empty() || rng.gen_bool(0.5) {
                        let len = rng.gen_range(1..=512);
                        if let Ok(ptr) = heap.allocate(len) {
                            // SAFETY: fresh allocation of `len` bytes.
                            unsafe { core::ptr::write_bytes(ptr.as_ptr(), tag, len) };
                            live.push((ptr.as_ptr() as usize, len));
                        }
                    } else {
                        let (addr, len) = live.swap_remove(rng.gen_range(0..live.len()));
                        // SAFETY: `addr` is a live allocation of `len` bytes
                        // owned by this thread.
                        let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, len) };
                        assert!(bytes.iter().all(|&b| b == tag));
                        heap.free(core::ptr::NonNull::new(addr as *mut u8).unwrap()).unwrap();
                    }
                }
                for (addr, _) in live {
                    heap.free(core::ptr::NonNull::new(addr as *mut u8).unwrap()).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    let passes = checker.join().unwrap();
    assert!(passes > 0);

    heap.check_corruption().unwrap();
    assert_eq!(heap.stats().unwrap(), pristine);
}
