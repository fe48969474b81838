mod common;

use common::{CountingNotifier, KIB, MIB, MockMapper, arena};
use kernel_heapmgr::{HeapMgr, HeapMgrConfig, MAX_BUF_SIZE, PAGE_SIZE, ReleaseSchedule};
use std::sync::atomic::Ordering;

#[test]
fn released_granule_is_reclaimed_in_place() {
    let mapper = MockMapper::new(8);
    let notifier = CountingNotifier::new();
    let release = ReleaseSchedule::new(&notifier);
    let config = HeapMgrConfig::checked().with_release_water(MIB, MIB / 2);
    let mgr = HeapMgr::new(&mapper, &release, arena(), arena(), config).unwrap();

    let region = mgr.request_any_mem(64 * KIB).unwrap();
    assert_eq!(region.start, mapper.slot(0) + PAGE_SIZE);
    assert!(!release.is_scheduled());
    mgr.free_any_mem(region.start, region.len).unwrap();
    assert!(release.is_scheduled());
    assert_eq!(notifier.calls(), 1);

    let management = mgr.any().stats().management_bytes_left;
    mgr.release_extra_memory();
    assert!(!release.is_scheduled());
    assert!(mgr.any().is_released(mapper.slot(0)));
    assert!(mgr.any().is_released(region.start));
    assert!(mgr.low().is_released(mapper.slot(1)));
    assert!(!mapper.is_mapped(mapper.slot(0)));
    assert_eq!(mapper.unmaps(), 2);
    assert_eq!(mapper.outstanding(), 0);

    let stats = mgr.any().stats();
    assert_eq!(stats.free_bytes, 0);
    assert_eq!(stats.mapped_bytes, 0);
    assert_eq!(stats.released_bytes, MAX_BUF_SIZE);

    // The next request maps the same slot and frees it back into the space
    // instead of hot-adding it.
    let again = mgr.request_any_mem(64 * KIB).unwrap();
    assert_eq!(again.start, region.start);
    assert!(!mgr.any().is_released(mapper.slot(0)));
    assert_eq!(mapper.maps(), 3);
    let stats = mgr.any().stats();
    assert_eq!(stats.released_bytes, 0);
    assert_eq!(stats.mapped_bytes, MAX_BUF_SIZE);
    assert_eq!(stats.management_bytes_left, management);

    mgr.free_any_mem(again.start, again.len).unwrap();
    assert_eq!(notifier.calls(), 2);
    mgr.shutdown();
    assert_eq!(mapper.outstanding(), 0);
    assert_eq!(mapper.mapped_slots(), 0);
}

#[test]
fn release_stops_at_the_low_water_mark() {
    let mapper = MockMapper::new(8);
    let notifier = CountingNotifier::new();
    let release = ReleaseSchedule::new(&notifier);
    let config = HeapMgrConfig::unchecked().with_release_water(3 * MIB, 2 * MIB);
    let mgr = HeapMgr::new(&mapper, &release, arena(), arena(), config).unwrap();

    let regions: Vec<_> = (0..3)
        .map(|_| mgr.request_any_mem(MAX_BUF_SIZE).unwrap())
        .collect();
    assert_eq!(mapper.maps(), 4);
    for region in &regions {
        mgr.free_any_mem(region.start, region.len).unwrap();
    }
    // Single shot: the third free finds the release pending.
    assert_eq!(notifier.calls(), 1);

    mgr.release_extra_memory();
    let any = mgr.any().stats();
    assert_eq!(any.free_bytes, 2 * MIB);
    assert_eq!(any.released_bytes, 4 * MIB);
    assert_eq!(any.mapped_bytes, MAX_BUF_SIZE);
    assert_eq!(mgr.low().stats().released_bytes, 0);
    assert_eq!(mapper.unmaps(), 2);
    assert_eq!(mapper.page_frees(), 2);

    mgr.shutdown();
    assert_eq!(mapper.outstanding(), 0);
}

#[test]
fn partially_used_chunks_stay_mapped() {
    let mapper = MockMapper::new(8);
    let notifier = CountingNotifier::new();
    let release = ReleaseSchedule::new(&notifier);
    let config = HeapMgrConfig::unchecked().with_release_water(MIB, 0);
    let mgr = HeapMgr::new(&mapper, &release, arena(), arena(), config).unwrap();

    let held = mgr.request_any_mem(64 * KIB).unwrap();
    let dropped = mgr.request_any_mem(64 * KIB).unwrap();
    mgr.free_any_mem(dropped.start, dropped.len).unwrap();
    assert!(release.is_scheduled());

    mgr.release_extra_memory();
    assert!(!release.is_scheduled());
    assert!(!mgr.any().is_released(held.start));
    assert_eq!(mgr.any().stats().released_bytes, 0);
    // The untouched low pool is released.
    assert!(mgr.low().is_released(mapper.slot(1)));
    assert_eq!(mapper.unmaps(), 1);

    unsafe { core::ptr::write_bytes(held.start as *mut u8, 1, held.len) };
    mgr.free_any_mem(held.start, held.len).unwrap();
    mgr.shutdown();
}

#[test]
fn refused_schedule_is_retried_on_the_next_free() {
    let mapper = MockMapper::new(8);
    let notifier = CountingNotifier::new();
    notifier.refuse.store(true, Ordering::SeqCst);
    let release = ReleaseSchedule::new(&notifier);
    let config = HeapMgrConfig::unchecked().with_release_water(MIB, MIB / 2);
    let mgr = HeapMgr::new(&mapper, &release, arena(), arena(), config).unwrap();

    let region = mgr.request_low_mem(4 * KIB).unwrap();
    mgr.free_low_mem(region.start, region.len).unwrap();
    assert_eq!(notifier.calls(), 1);
    assert!(!release.is_scheduled());

    notifier.refuse.store(false, Ordering::SeqCst);
    let region = mgr.request_low_mem(4 * KIB).unwrap();
    mgr.free_low_mem(region.start, region.len).unwrap();
    assert_eq!(notifier.calls(), 2);
    assert!(release.is_scheduled());

    mgr.release_extra_memory();
    assert!(!release.is_scheduled());
    mgr.shutdown();
}

#[test]
fn released_slot_mapped_by_the_other_pool_stays_released() {
    let mapper = MockMapper::new(8);
    let notifier = CountingNotifier::new();
    let release = ReleaseSchedule::new(&notifier);
    let config = HeapMgrConfig::checked().with_release_water(MIB, 0);
    let mgr = HeapMgr::new(&mapper, &release, arena(), arena(), config).unwrap();

    // Keep the low pool busy so only the any pool gives its chunk back.
    let low = mgr.request_low_mem(4 * KIB).unwrap();
    let any = mgr.request_any_mem(4 * KIB).unwrap();
    mgr.free_any_mem(any.start, any.len).unwrap();
    mgr.release_extra_memory();
    assert!(mgr.any().is_released(mapper.slot(0)));
    assert!(!mgr.low().is_released(mapper.slot(1)));

    // The low pool grows into the slot the any pool gave up.
    let whole = mgr.request_low_mem(MAX_BUF_SIZE - PAGE_SIZE).unwrap();
    assert_eq!(whole.start, mapper.slot(0) + PAGE_SIZE);
    assert!(mgr.any().is_released(mapper.slot(0)));

    // And the any pool has to hot-add a fresh one.
    let any = mgr.request_any_mem(4 * KIB).unwrap();
    assert_eq!(any.start, mapper.slot(2) + PAGE_SIZE);

    mgr.free_any_mem(any.start, any.len).unwrap();
    mgr.free_low_mem(whole.start, whole.len).unwrap();
    mgr.free_low_mem(low.start, low.len).unwrap();
    mgr.shutdown();
    assert_eq!(mapper.outstanding(), 0);
}
