use core::mem::MaybeUninit;

/// Bytes needed to carve `len` values of `T`, including worst-case alignment padding.
pub(crate) const fn table_bytes<T>(len: usize) -> usize {
    len * size_of::<T>() + align_of::<T>() - 1
}

/// Bump carver over caller-supplied scratch memory.
///
/// Every carved table borrows from the scratch for `'a`, so the tables can
/// outlive the carver itself but never the memory behind it.
pub(crate) struct Scratch<'a> {
    rest: &'a mut [MaybeUninit<u8>],
}

impl<'a> Scratch<'a> {
    pub(crate) fn new(mem: &'a mut [u8]) -> Self {
        let len = mem.len();
        let ptr = mem.as_mut_ptr().cast::<MaybeUninit<u8>>();
        // Safety: `MaybeUninit<u8>` has the layout of `u8`, and the borrow is moved in.
        let rest = unsafe { core::slice::from_raw_parts_mut(ptr, len) };
        Self { rest }
    }

    pub(crate) const fn remaining(&self) -> usize {
        self.rest.len()
    }

    /// Carve a table of `len` values produced by `init`.
    ///
    /// Returns `None` (and leaves the scratch untouched) if the remaining
    /// memory is too small.
    pub(crate) fn carve<T>(&mut self, len: usize, mut init: impl FnMut(usize) -> T) -> Option<&'a mut [T]> {
        let pad = self.rest.as_ptr().align_offset(align_of::<T>());
        let bytes = len.checked_mul(size_of::<T>())?;
        if pad.checked_add(bytes)? > self.rest.len() {
            return None;
        }

        let rest = core::mem::take(&mut self.rest);
        let (_, rest) = rest.split_at_mut(pad);
        let (table, rest) = rest.split_at_mut(bytes);
        self.rest = rest;

        let ptr = table.as_mut_ptr().cast::<T>();
        for i in 0..len {
            // Safety: `ptr` is aligned for `T` and `table` spans `len` values.
            unsafe { ptr.add(i).write(init(i)) };
        }
        // Safety: every element was initialized above; the borrow is exclusive for `'a`.
        Some(unsafe { core::slice::from_raw_parts_mut(ptr, len) })
    }
}
