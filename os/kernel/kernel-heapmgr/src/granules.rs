use crate::MAX_GRANULES;

type Slot = u32;

const SLOT_BITS: usize = Slot::BITS as usize;
const SLOTS: usize = MAX_GRANULES / SLOT_BITS;

/// One bit per large page of the window.
#[derive(Debug, Clone)]
struct Bitmap([Slot; SLOTS]);

impl Bitmap {
    const fn new() -> Self {
        Self([0; SLOTS])
    }

    const fn slot_and_flag(index: usize) -> (usize, Slot) {
        (index / SLOT_BITS, 1 << (index % SLOT_BITS))
    }

    const fn get(&self, index: usize) -> bool {
        let (slot, flag) = Self::slot_and_flag(index);
        self.0[slot] & flag != 0
    }

    const fn set(&mut self, index: usize, value: bool) {
        let (slot, flag) = Self::slot_and_flag(index);
        if value {
            self.0[slot] |= flag;
        } else {
            self.0[slot] &= !flag;
        }
    }

    fn count(&self) -> u32 {
        self.0.iter().map(|s| s.count_ones()).sum()
    }
}

/// Tracks which large pages of the window a pool has mapped, and which it
/// returned to the system while keeping them allocated in its buddy space.
///
/// A granule is never mapped and released at the same time.
#[derive(Debug, Clone)]
pub(crate) struct GranuleMap {
    mapped: Bitmap,
    released: Bitmap,
}

impl GranuleMap {
    pub(crate) const fn new() -> Self {
        Self {
            mapped: Bitmap::new(),
            released: Bitmap::new(),
        }
    }

    pub(crate) const fn is_released(&self, index: usize) -> bool {
        self.released.get(index)
    }

    pub(crate) const fn is_mapped(&self, index: usize) -> bool {
        self.mapped.get(index)
    }

    pub(crate) fn mark_mapped(&mut self, index: usize) {
        debug_assert!(!self.is_mapped(index), "granule {index} mapped twice");
        self.released.set(index, false);
        self.mapped.set(index, true);
    }

    pub(crate) fn mark_released(&mut self, index: usize) {
        debug_assert!(!self.is_released(index), "granule {index} released twice");
        self.mapped.set(index, false);
        self.released.set(index, true);
    }

    pub(crate) fn released_count(&self) -> u32 {
        self.released.count()
    }

    /// Indices of all mapped granules.
    pub(crate) fn mapped(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_GRANULES).filter(|&i| self.mapped.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_and_reclaim_flip_the_state() {
        let mut map = GranuleMap::new();
        map.mark_mapped(33);
        assert!(map.is_mapped(33));
        assert!(!map.is_released(33));

        map.mark_released(33);
        assert!(!map.is_mapped(33));
        assert!(map.is_released(33));
        assert_eq!(map.released_count(), 1);

        map.mark_mapped(33);
        assert!(map.is_mapped(33));
        assert_eq!(map.released_count(), 0);
    }

    #[test]
    fn granules_are_independent() {
        let mut map = GranuleMap::new();
        for i in [0, 31, 32, MAX_GRANULES - 1] {
            map.mark_mapped(i);
        }
        map.mark_released(31);
        assert_eq!(map.mapped().collect::<Vec<_>>(), [0, 32, MAX_GRANULES - 1]);
        assert!(!map.is_released(32));
    }
}
