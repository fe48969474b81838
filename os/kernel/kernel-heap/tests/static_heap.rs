use kernel_heap::{
    HEADER_SIZE, Heap, HeapConfig, HeapError, MIN_DUMP_PERIOD_SECONDS, PRESSURE_FIRST_MSG_PERCENT,
    Region,
};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

const KIB: usize = 1024;

fn heap(name: &'static str, size: usize, config: HeapConfig) -> Heap<'static> {
    let backing = vec![0u8; size].leak();
    Heap::create_static(name, backing, config).unwrap()
}

#[test]
fn empty_heap_reports_all_memory_available() {
    let heap = heap("empty", 64 * KIB, HeapConfig::unchecked());
    let stats = heap.stats();
    assert!(!heap.is_dynamic());
    assert_eq!(stats.current, stats.maximum);
    assert_eq!(stats.avail, stats.maximum);
    assert_eq!(stats.current_avail, stats.current);
    assert_eq!(stats.ranges, 1);
    assert!(stats.maximum < 64 * KIB);
    assert!(stats.maximum > 60 * KIB);
}

#[test]
fn backing_too_small_is_rejected() {
    let backing = vec![0u8; 64].leak();
    let err = Heap::create_static("tiny", backing, HeapConfig::unchecked()).unwrap_err();
    assert_eq!(err, HeapError::BadParameter);
}

#[test]
fn allocations_round_trip() {
    let heap = heap("round trip", 64 * KIB, HeapConfig::unchecked());
    let initial = heap.avail();

    let ptrs: Vec<NonNull<u8>> = [1, 100, 200, 4000, 17]
        .into_iter()
        .map(|size| {
            let p = heap.alloc(size).unwrap();
            assert_eq!(p.as_ptr() as usize % 16, 0);
            unsafe { p.as_ptr().write_bytes(0xAB, size) };
            p
        })
        .collect();
    assert!(heap.avail() < initial - 4300);

    for p in ptrs.into_iter().rev() {
        unsafe { heap.free(p) };
    }
    assert_eq!(heap.avail(), initial);
    heap.destroy().unwrap();
}

#[test]
fn alignment_is_honored() {
    for config in [HeapConfig::unchecked(), HeapConfig::checked()] {
        let heap = heap("aligned", 64 * KIB, config);
        let initial = heap.avail();
        for align in [1, 8, 16, 64, 256, 4096] {
            let p = heap.alloc_aligned(40, align).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0, "alignment {align}");
            unsafe { heap.free(p) };
        }
        assert_eq!(heap.avail(), initial);
    }
}

#[test]
fn invalid_requests_return_nothing() {
    let heap = heap("invalid", 16 * KIB, HeapConfig::checked());
    assert!(heap.alloc(0).is_none());
    assert!(heap.alloc_aligned(64, 0).is_none());
    assert!(heap.alloc_aligned(64, 48).is_none());
    assert!(heap.alloc(usize::MAX).is_none());
    assert!(heap.alloc(usize::MAX - 8).is_none());
    assert_eq!(heap.current_avail(), heap.stats().current);
}

#[test]
fn static_heap_never_grows() {
    let heap = heap("exhaust", 64 * KIB, HeapConfig::unchecked());
    let maximum = heap.stats().maximum;

    assert!(heap.alloc(maximum).is_none());
    let whole = heap.alloc(maximum - HEADER_SIZE).unwrap();
    assert_eq!(heap.avail(), 0);
    assert!(heap.alloc(1).is_none());

    unsafe { heap.free(whole) };
    assert_eq!(heap.avail(), maximum);
    assert_eq!(heap.stats().ranges, 1);
}

#[test]
fn chunks_are_listed_in_address_order() {
    let heap = heap("chunks", 64 * KIB, HeapConfig::unchecked());
    let a = heap.alloc(100).unwrap();
    let b = heap.alloc(300).unwrap();
    let c = heap.alloc(50).unwrap();
    unsafe { heap.free(b) };

    let mut in_use = Vec::new();
    heap.for_each_chunk(true, |chunk| in_use.push(chunk));
    let addrs: Vec<_> = in_use.iter().map(|c| c.addr).collect();
    assert_eq!(addrs, [a.as_ptr() as usize, c.as_ptr() as usize]);
    assert!(in_use.iter().all(|c| c.in_use && c.len >= 50));

    let mut all = 0;
    let mut free = 0;
    heap.for_each_chunk(false, |chunk| {
        all += 1;
        free += usize::from(!chunk.in_use);
    });
    assert_eq!((all, free), (4, 2));
}

#[test]
fn dump_visits_the_single_range() {
    let heap = heap("dump", 64 * KIB, HeapConfig::unchecked());
    let mut ranges = Vec::new();
    heap.dump(|r: Region| {
        ranges.push(r);
        Ok::<_, ()>(())
    })
    .unwrap();
    assert_eq!(ranges.len(), 1);
    assert!(ranges[0].len > heap.stats().maximum);

    assert_eq!(heap.dump(|_| Err("stop")), Err("stop"));
}

#[test]
fn throttled_dumps_without_clock_run_once() {
    let heap = heap("no clock", 64 * KIB, HeapConfig::checked());
    let p = heap.alloc(10).unwrap();
    assert!(heap.dump_allocations(true));
    assert!(!heap.dump_allocations(true));
    assert!(heap.dump_allocations(false));
    unsafe { heap.free(p) };
}

static NOW: AtomicU64 = AtomicU64::new(1000);

fn clock() -> u64 {
    NOW.load(Ordering::SeqCst)
}

#[test]
fn throttled_dumps_follow_the_clock() {
    let heap = heap("clock", 64 * KIB, HeapConfig::checked().with_clock(clock));
    assert!(heap.dump_allocations(true));
    NOW.fetch_add(MIN_DUMP_PERIOD_SECONDS - 1, Ordering::SeqCst);
    assert!(!heap.dump_allocations(true));
    NOW.fetch_add(1, Ordering::SeqCst);
    assert!(heap.dump_allocations(true));
    assert!(!heap.dump_allocations(true));
}

#[test]
fn memory_pressure_is_tracked() {
    let heap = heap("pressure", 1024 * KIB, HeapConfig::unchecked());
    let initial = heap.avail();

    // Enough small allocations below the caller logging threshold to
    // trigger a dump of the most frequent callers.
    let mut ptrs = Vec::new();
    while let Some(p) = heap.alloc(16) {
        ptrs.push(p);
    }
    assert!(ptrs.len() > 30_000);
    assert!(heap.stats().least_percent_free < PRESSURE_FIRST_MSG_PERCENT);

    for p in ptrs {
        unsafe { heap.free(p) };
    }
    assert_eq!(heap.avail(), initial);
    heap.log_stats();
}

#[test]
fn non_empty_destroy_is_reported() {
    let heap = heap("leaky", 64 * KIB, HeapConfig::checked());
    let _leak = heap.alloc(64).unwrap();
    assert_eq!(heap.destroy_with_panic(false), Err(HeapError::NonEmpty));
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "Non-empty heap (leaky debug) being destroyed")]
fn non_empty_destroy_panics_in_debug_builds() {
    let heap = heap("leaky debug", 64 * KIB, HeapConfig::unchecked());
    let _leak = heap.alloc(64).unwrap();
    let _ = heap.destroy();
}

#[test]
#[should_panic(expected = "does not own")]
fn foreign_pointers_are_refused() {
    let owner = heap("owner", 16 * KIB, HeapConfig::checked());
    let other = heap("other", 16 * KIB, HeapConfig::checked());
    let p = owner.alloc(32).unwrap();
    unsafe { other.free(p) };
}

#[test]
#[should_panic(expected = "is not an allocated chunk")]
fn double_free_is_fatal() {
    let heap = heap("double", 16 * KIB, HeapConfig::unchecked());
    let p = heap.alloc(32).unwrap();
    let _keep = heap.alloc(32).unwrap();
    unsafe {
        heap.free(p);
        heap.free(p);
    }
}

#[test]
fn concurrent_users_share_a_heap() {
    let heap = Arc::new(heap("shared", 256 * KIB, HeapConfig::checked()));
    let initial = heap.avail();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                for i in 0..500 {
                    let size = 1 + (t * 37 + i * 13) % 700;
                    let p = heap.alloc(size).unwrap();
                    unsafe {
                        p.as_ptr().write_bytes(0x11, size);
                        heap.free(p);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(heap.avail(), initial);
    heap.check_poison();
}
