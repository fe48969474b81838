use kernel_heap::{Heap, HeapConfig, POISON_PREFIX_SIZE, POISON_SUFFIX_SIZE};

fn checked_heap(name: &'static str) -> Heap<'static> {
    let backing = vec![0u8; 64 * 1024].leak();
    Heap::create_static(name, backing, HeapConfig::checked()).unwrap()
}

#[test]
fn poisoned_allocations_carry_guard_bytes() {
    let heap = checked_heap("guarded");
    let initial = heap.avail();
    let p = heap.alloc(100).unwrap();
    assert!(initial - heap.avail() >= 100 + POISON_PREFIX_SIZE + POISON_SUFFIX_SIZE);

    unsafe { p.as_ptr().write_bytes(0x42, 100) };
    heap.check_poison();
    unsafe { heap.free(p) };
    assert_eq!(heap.avail(), initial);
}

#[test]
fn aligned_poisoned_allocations_stay_aligned() {
    let heap = checked_heap("aligned poison");
    let ptrs: Vec<_> = [32, 64, 256, 1024]
        .into_iter()
        .map(|align| {
            let p = heap.alloc_aligned(100, align).unwrap();
            assert_eq!(p.as_ptr() as usize % align, 0);
            p
        })
        .collect();
    heap.check_poison();
    for p in ptrs {
        unsafe { heap.free(p) };
    }
}

#[test]
fn freed_memory_is_wiped() {
    let heap = checked_heap("wiped");
    let p = heap.alloc(64).unwrap();
    let _neighbor = heap.alloc(64).unwrap();
    unsafe {
        p.as_ptr().write_bytes(0x42, 64);
        heap.free(p);
        let bytes = std::slice::from_raw_parts(p.as_ptr(), 64);
        assert!(bytes.iter().all(|&b| b == 0xff));
    }
}

#[test]
#[should_panic(expected = "suffix poison [0] overwritten")]
fn overrun_is_caught_on_free() {
    let heap = checked_heap("overrun");
    let p = heap.alloc(10).unwrap();
    unsafe {
        p.as_ptr().write_bytes(0, 11);
        heap.free(p);
    }
}

#[test]
#[should_panic(expected = "poison overwritten")]
fn periodic_check_finds_underruns() {
    let heap = checked_heap("underrun");
    let _a = heap.alloc(10).unwrap();
    let b = heap.alloc(10).unwrap();
    unsafe { b.as_ptr().sub(POISON_PREFIX_SIZE - 12).write(0) };
    heap.check_poison();
}

#[test]
fn unchecked_frees_skip_the_guard_check() {
    let backing = vec![0u8; 64 * 1024].leak();
    let config = HeapConfig {
        check_on_free: false,
        ..HeapConfig::checked()
    };
    let heap = Heap::create_static("lenient", backing, config).unwrap();
    let initial = heap.avail();
    let p = heap.alloc(10).unwrap();
    unsafe {
        p.as_ptr().write_bytes(0, 12);
        heap.free(p);
    }
    assert_eq!(heap.avail(), initial);
}
