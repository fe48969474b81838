//! Fill patterns that catch stale pointers and overruns.

use crate::PAGE_SIZE;
use core::slice;

/// Fill value of guard pages.
pub const GUARD_PAGE_VALUE: u32 = 0xA5FF_00A5;

/// Fill value of free memory.
pub const FREE_REGION_VALUE: u32 = 0xA5CC_33A5;

const WORDS_PER_PAGE: usize = PAGE_SIZE / size_of::<u32>();

/// Fill `pages` pages at `va` with `value`.
///
/// # Safety
/// The pages must be mapped, writable and owned by the caller.
pub(crate) unsafe fn fill_pages(va: usize, pages: usize, value: u32) {
    let words = unsafe { slice::from_raw_parts_mut(va as *mut u32, pages * WORDS_PER_PAGE) };
    words.fill(value);
}

/// Verify that `pages` pages at `va` still hold `value`.
///
/// # Panics
/// On the first differing word; somebody wrote through a stale pointer.
///
/// # Safety
/// The pages must be mapped and readable.
pub(crate) unsafe fn check_pages(va: usize, pages: usize, value: u32) {
    let words = unsafe { slice::from_raw_parts(va as *const u32, pages * WORDS_PER_PAGE) };
    if let Some(i) = words.iter().position(|&w| w != value) {
        let page = va + (i * size_of::<u32>() / PAGE_SIZE) * PAGE_SIZE;
        panic!(
            "Heap manager page at {page:#x} has been overwritten at location {:#x}.",
            va + i * size_of::<u32>()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct Pages([u8; 2 * PAGE_SIZE]);

    #[test]
    fn filled_pages_pass_their_check() {
        let mut pages = Box::new(Pages([0; 2 * PAGE_SIZE]));
        let va = pages.0.as_mut_ptr() as usize;
        unsafe {
            fill_pages(va, 2, FREE_REGION_VALUE);
            check_pages(va, 2, FREE_REGION_VALUE);
        }
        assert_eq!(&pages.0[..4], &FREE_REGION_VALUE.to_ne_bytes());
    }

    #[test]
    #[should_panic(expected = "overwritten at location")]
    fn stale_write_is_fatal() {
        let mut pages = Box::new(Pages([0; 2 * PAGE_SIZE]));
        let va = pages.0.as_mut_ptr() as usize;
        unsafe { fill_pages(va, 2, GUARD_PAGE_VALUE) };
        // Byte 1 of each word is already zero.
        pages.0[PAGE_SIZE + 17] = 0x12;
        unsafe { check_pages(va, 2, GUARD_PAGE_VALUE) };
    }
}
