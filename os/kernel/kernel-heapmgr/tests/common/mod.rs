#![allow(dead_code)]

use kernel_heap::Region;
use kernel_heapmgr::{LARGE_PAGE_SIZE, LargePage, LargePageMapper, MemKind, ReleaseNotifier};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

#[derive(Debug, Default, Clone)]
struct MapperState {
    /// Large page mapped at each window slot.
    slots: Vec<Option<LargePage>>,
    outstanding: Vec<(LargePage, MemKind)>,
    next_page: u64,
    page_limit: usize,
    maps: usize,
    unmaps: usize,
    page_frees: usize,
}

/// Maps large pages into a 2 MiB aligned block of host memory.
///
/// Addresses are handed out lowest free slot first, so a released slot is
/// the next one mapped again.
pub struct MockMapper {
    window: Region,
    layout: Layout,
    state: Mutex<MapperState>,
}

impl MockMapper {
    pub fn new(slots: usize) -> Self {
        Self::with_page_limit(slots, usize::MAX)
    }

    pub fn with_page_limit(slots: usize, page_limit: usize) -> Self {
        let layout = Layout::from_size_align(slots * LARGE_PAGE_SIZE, LARGE_PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self {
            window: Region::new(ptr as usize, layout.size()),
            layout,
            state: Mutex::new(MapperState {
                slots: vec![None; slots],
                page_limit,
                next_page: 0x1000,
                ..MapperState::default()
            }),
        }
    }

    pub fn slot(&self, index: usize) -> usize {
        self.window.start + index * LARGE_PAGE_SIZE
    }

    pub fn maps(&self) -> usize {
        self.state.lock().unwrap().maps
    }

    pub fn unmaps(&self) -> usize {
        self.state.lock().unwrap().unmaps
    }

    pub fn page_frees(&self) -> usize {
        self.state.lock().unwrap().page_frees
    }

    /// Large pages allocated and not freed.
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding.len()
    }

    pub fn outstanding_of(&self, kind: MemKind) -> usize {
        let state = self.state.lock().unwrap();
        state.outstanding.iter().filter(|(_, k)| *k == kind).count()
    }

    pub fn mapped_slots(&self) -> usize {
        self.state.lock().unwrap().slots.iter().flatten().count()
    }

    pub fn is_mapped(&self, va: usize) -> bool {
        let index = (va - self.window.start) / LARGE_PAGE_SIZE;
        self.state.lock().unwrap().slots[index].is_some()
    }
}

impl Drop for MockMapper {
    fn drop(&mut self) {
        unsafe { dealloc(self.window.start as *mut u8, self.layout) };
    }
}

impl LargePageMapper for MockMapper {
    fn window(&self) -> Region {
        self.window
    }

    fn alloc_large_page(&self, kind: MemKind) -> Option<LargePage> {
        let mut state = self.state.lock().unwrap();
        if state.outstanding.len() >= state.page_limit {
            return None;
        }
        let page = LargePage(state.next_page);
        state.next_page += 1;
        state.outstanding.push((page, kind));
        Some(page)
    }

    fn free_large_page(&self, page: LargePage) {
        let mut state = self.state.lock().unwrap();
        let index = state
            .outstanding
            .iter()
            .position(|(p, _)| *p == page)
            .expect("freeing a page that is not allocated");
        state.outstanding.swap_remove(index);
        state.page_frees += 1;
    }

    fn map(&self, pages: &[LargePage]) -> Option<usize> {
        let mut state = self.state.lock().unwrap();
        let n = pages.len();
        let first = (0..=state.slots.len().checked_sub(n)?)
            .find(|&i| state.slots[i..i + n].iter().all(Option::is_none))?;
        for (slot, page) in state.slots[first..first + n].iter_mut().zip(pages) {
            *slot = Some(*page);
        }
        state.maps += 1;
        Some(self.slot(first))
    }

    fn unmap(&self, va: usize, len: usize) {
        let mut state = self.state.lock().unwrap();
        let first = (va - self.window.start) / LARGE_PAGE_SIZE;
        for slot in &mut state.slots[first..first + len / LARGE_PAGE_SIZE] {
            assert!(slot.take().is_some(), "unmapping a slot that is not mapped");
        }
        state.unmaps += 1;
    }

    fn translate(&self, va: usize) -> Option<LargePage> {
        if !self.window.contains(va) {
            return None;
        }
        let index = (va - self.window.start) / LARGE_PAGE_SIZE;
        self.state.lock().unwrap().slots[index]
    }
}

/// Counts release requests instead of running a worker.
pub struct CountingNotifier {
    pub calls: AtomicUsize,
    pub refuse: AtomicBool,
}

impl CountingNotifier {
    pub const fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReleaseNotifier for CountingNotifier {
    fn schedule_release(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        !self.refuse.load(Ordering::SeqCst)
    }
}

/// Management memory for one pool.
pub fn arena() -> &'static mut [u8] {
    vec![0u8; 64 * KIB].leak()
}
