use kernel_buddy::{AddrRange, BuddyError, Color, DynamicRange, MemorySpace, SizeType, StaticRange};

const PAGE: u32 = 4096;
const MIB: u32 = 1 << 20;

fn scratch(bytes: usize) -> &'static mut [u8] {
    vec![0u8; bytes].leak()
}

fn static_space(len: u32, min: u32, max: u32) -> MemorySpace<'static> {
    let range = StaticRange::new("static", 0, len, min, max);
    let mem = scratch(range.mem_req().unwrap());
    MemorySpace::create_static(&range, mem, &[AddrRange::new(0, len)]).unwrap()
}

fn dynamic_space(len: u32, min: u32, max: u32) -> MemorySpace<'static> {
    let range = DynamicRange::new(StaticRange::new("dynamic", 0, len, min, max), len, max);
    let mem = scratch(range.mem_req().unwrap());
    MemorySpace::create_dynamic(&range, mem, &[AddrRange::new(0, len)]).unwrap()
}

#[test]
fn carved_space_starts_fully_free() {
    let space = static_space(4 * MIB, PAGE, MIB);
    let stats = space.stats().unwrap();
    assert_eq!(stats.num_carved, 1024);
    assert_eq!(stats.num_free, 1024);
    assert_eq!(stats.free_bufs[8], 4);
    assert_eq!(stats.free_size_classes(), 1);
    assert_eq!(space.num_used_bufs().unwrap(), 0);
}

#[test]
fn allocations_are_aligned_to_their_size_class() {
    let space = static_space(4 * MIB, PAGE, MIB);
    for size in [PAGE, 2 * PAGE, 4 * PAGE, 64 * 1024, MIB] {
        let loc = space.allocate(size).unwrap();
        assert_eq!(loc % size, 0, "size {size:#x} at {loc:#x}");
        assert!(space.free(loc).unwrap() >= size);
    }
    assert_eq!(space.num_free_bufs().unwrap(), 1024);
}

#[test]
fn sizes_below_the_minimum_round_up() {
    let space = static_space(MIB, PAGE, MIB);
    let loc = space.allocate(1).unwrap();
    assert_eq!(space.get_loc_size(loc).unwrap(), PAGE);
    assert_eq!(space.free(loc).unwrap(), PAGE);
}

#[test]
fn rejects_unsupported_sizes() {
    let space = static_space(MIB, PAGE, 64 * 1024);
    assert_eq!(space.allocate(0), Err(BuddyError::Unsupported));
    assert_eq!(space.allocate(64 * 1024 + 1), Err(BuddyError::Unsupported));
}

#[test]
fn exhaustion_reports_no_buffers() {
    let space = static_space(64 * 1024, PAGE, 64 * 1024);
    let locs: Vec<u32> = (0..16).map(|_| space.allocate(PAGE).unwrap()).collect();
    assert_eq!(space.allocate(PAGE), Err(BuddyError::NoBuffers));
    space.free(locs[7]).unwrap();
    assert_eq!(space.allocate(PAGE).unwrap(), locs[7]);
}

#[test]
fn fifo_and_lifo_round_trips_restore_counters() {
    let space = static_space(4 * MIB, PAGE, MIB);
    let before = space.stats().unwrap();
    let sizes = [PAGE, 3 * PAGE, 5 * PAGE, 16 * PAGE, 7 * PAGE, 2 * PAGE, 100 * PAGE];

    let locs: Vec<u32> = sizes.iter().map(|&s| space.allocate(s).unwrap()).collect();
    for &loc in &locs {
        space.free(loc).unwrap();
    }
    assert_eq!(space.stats().unwrap().num_free, before.num_free);
    assert_eq!(space.num_free_bufs_for_color(0).unwrap(), 1024);

    let locs: Vec<u32> = sizes.iter().map(|&s| space.allocate(s).unwrap()).collect();
    for &loc in locs.iter().rev() {
        space.free(loc).unwrap();
    }
    let after = space.stats().unwrap();
    assert_eq!(after.num_free, before.num_free);
    assert_eq!(after.free_bufs, before.free_bufs);
    assert_eq!(space.num_used_bufs_for_color(0).unwrap(), 0);
}

#[test]
fn freeing_everything_coalesces_back_to_one_size_class() {
    let space = static_space(MIB, PAGE, MIB);
    let locs: Vec<u32> = (0..256).map(|_| space.allocate(PAGE).unwrap()).collect();
    assert_eq!(space.stats().unwrap().free_size_classes(), 0);

    // Free every other page first so nothing can merge, then the rest.
    for &loc in locs.iter().step_by(2) {
        space.free(loc).unwrap();
    }
    let half = space.stats().unwrap();
    assert_eq!(half.free_bufs[0], 128);
    assert_eq!(half.free_size_classes(), 1);

    for &loc in locs.iter().skip(1).step_by(2) {
        space.free(loc).unwrap();
    }
    let stats = space.stats().unwrap();
    assert_eq!(stats.free_size_classes(), 1);
    assert_eq!(stats.free_bufs[8], 1);
}

#[test]
fn non_power_of_two_sizes_free_exactly_what_was_kept() {
    let space = static_space(4 * MIB, PAGE, MIB);
    for units in [3u32, 5, 6, 7, 9, 100, 255] {
        let size = units * PAGE - 17;
        let free_before = space.num_free_bufs().unwrap();
        let loc = space.allocate(size).unwrap();
        assert_eq!(space.num_free_bufs().unwrap(), free_before - units);
        assert_eq!(space.get_loc_size(loc).unwrap(), units * PAGE);
        assert_eq!(space.free(loc).unwrap(), units * PAGE);
    }
    let stats = space.stats().unwrap();
    assert_eq!(stats.allocated[SizeType::ThreeUnits as usize], 1);
    assert_eq!(stats.allocated[SizeType::Complex as usize], 6);
    assert_eq!(stats.released, stats.allocated);
    assert_eq!(stats.free_size_classes(), 1);
}

#[test]
fn fragmentation_tail_is_reusable() {
    let space = static_space(8 * PAGE, PAGE, 8 * PAGE);
    let five = space.allocate(5 * PAGE).unwrap();
    assert_eq!(five, 0);
    // The three trailing pages are free again right away.
    let a = space.allocate(PAGE).unwrap();
    let b = space.allocate(2 * PAGE).unwrap();
    assert_eq!(a, 5 * PAGE);
    assert_eq!(b, 6 * PAGE);
    assert_eq!(space.allocate(PAGE), Err(BuddyError::NoBuffers));

    space.free(five).unwrap();
    space.free(a).unwrap();
    space.free(b).unwrap();
    assert_eq!(space.allocate(8 * PAGE).unwrap(), 0);
}

#[test]
fn invalid_frees_are_rejected() {
    let space = static_space(MIB, PAGE, MIB);
    let loc = space.allocate(2 * PAGE).unwrap();
    assert_eq!(space.free(loc + 1), Err(BuddyError::BadParameter));
    assert_eq!(space.free(2 * MIB), Err(BuddyError::BadParameter));
    assert_eq!(space.free(loc + PAGE), Err(BuddyError::BadParameter));
    space.free(loc).unwrap();
    assert_eq!(space.free(loc), Err(BuddyError::BadParameter));
    assert_eq!(space.get_loc_size(loc), Err(BuddyError::BadParameter));
}

#[test]
fn interior_of_a_non_power_of_two_allocation_is_not_freeable() {
    let space = static_space(MIB, PAGE, 256 * 1024);
    let before = space.stats().unwrap();
    // 54 pages are kept as 32 + 16 + 4 + 2, and the count byte 54 reads as
    // an in-use head of two pages.
    let loc = space.allocate(54 * PAGE).unwrap();
    assert_eq!(space.get_loc_size(loc + PAGE), Err(BuddyError::BadParameter));
    assert_eq!(space.free(loc + PAGE), Err(BuddyError::BadParameter));
    for piece in [32, 48, 52] {
        assert_eq!(space.free(loc + piece * PAGE), Err(BuddyError::BadParameter));
    }

    assert_eq!(space.free(loc).unwrap(), 54 * PAGE);
    let after = space.stats().unwrap();
    assert_eq!(after.num_free, before.num_free);
    assert_eq!(after.used_bufs, before.used_bufs);
    assert_eq!(after.free_bufs, before.free_bufs);
}

#[test]
fn partial_carve_ranges_only_free_their_units() {
    let range = StaticRange::new("partial", 0, MIB, PAGE, 64 * 1024);
    let mem = scratch(range.mem_req().unwrap());
    let carve = [AddrRange::new(PAGE + 1, 3 * PAGE), AddrRange::new(64 * 1024, 64 * 1024)];
    let space = MemorySpace::create_static(&range, mem, &carve).unwrap();
    // The first range rounds inward to pages 2 and 3.
    assert_eq!(space.num_free_bufs().unwrap(), 2 + 16);
    let loc = space.allocate(2 * PAGE).unwrap();
    assert_eq!(loc, 2 * PAGE);
}

#[test]
fn undersized_scratch_is_rejected() {
    let range = StaticRange::new("small", 0, MIB, PAGE, MIB);
    let mem = scratch(range.mem_req().unwrap() - 1);
    assert!(matches!(
        MemorySpace::create_static(&range, mem, &[]),
        Err(BuddyError::BadParameter)
    ));
}

#[test]
fn scenario_reuse_after_freeing_the_third_page() {
    let space = dynamic_space(MIB, PAGE, MIB);
    let total = space.num_free_bufs().unwrap();

    let locs: Vec<u32> = (0..5).map(|_| space.allocate(PAGE).unwrap()).collect();
    assert_eq!(locs, [0, PAGE, 2 * PAGE, 3 * PAGE, 4 * PAGE]);

    space.free(locs[2]).unwrap();
    // The buddy of the third page is still allocated, so the pair comes from elsewhere.
    let pair = space.allocate(2 * PAGE).unwrap();
    assert_ne!(pair, locs[2]);
    assert_eq!(pair % (2 * PAGE), 0);
    assert_eq!(space.num_free_bufs().unwrap(), total - 4 - 2);

    // Once the fourth page is gone too, the pair is whole again and gets reused.
    space.free(locs[3]).unwrap();
    let reused = space.allocate(2 * PAGE).unwrap();
    assert_eq!(reused, locs[2]);
    assert_eq!(space.num_free_bufs().unwrap(), total - 3 - 4);

    for loc in [locs[0], locs[1], locs[4], pair, reused] {
        space.free(loc).unwrap();
    }
    assert_eq!(space.num_free_bufs().unwrap(), total);
    assert_eq!(space.stats().unwrap().free_size_classes(), 1);
}

#[test]
fn dump_entries_counts_allocations() {
    let space = static_space(MIB, PAGE, MIB);
    let a = space.allocate(PAGE).unwrap();
    let b = space.allocate(5 * PAGE).unwrap();
    let _c = space.allocate(3 * PAGE).unwrap();
    assert_eq!(space.dump_entries().unwrap(), 3);
    space.free(a).unwrap();
    space.free(b).unwrap();
    assert_eq!(space.dump_entries().unwrap(), 1);
    space.log_stats();
}

#[test]
fn any_color_in_uncolored_space_equals_color_zero() {
    let space = static_space(MIB, PAGE, MIB);
    assert_eq!(space.num_colors(PAGE), 1);
    let loc = space.allocate_color(PAGE, Color::Fixed(0)).unwrap();
    assert_eq!(space.allocate_color(PAGE, Color::Fixed(1)), Err(BuddyError::BadParameter));
    space.free(loc).unwrap();
}
