//! Per-unit status entries.

use bitfield_struct::bitfield;

/// Shift value of units that are not the head of a buffer.
pub(crate) const INVALID_SHIFT: u8 = 32;
/// Head shift of a three-unit allocation.
pub(crate) const THREE_UNITS_SHIFT: u8 = 33;
/// Head shift of an allocation whose unit count lives in the next three entries.
pub(crate) const COMPLEX_SHIFT: u8 = 34;

/// Lifecycle state of a minimum unit.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum BufState {
    /// No backing memory was carved for the unit yet.
    Reserved = 0,
    /// Part of a buffer on a free list.
    Free = 1,
    /// Part of an allocated buffer.
    InUse = 2,
}

impl BufState {
    #[inline]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn from_bits(v: u8) -> Self {
        match v & 0b11 {
            1 => Self::Free,
            2 => Self::InUse,
            _ => Self::Reserved,
        }
    }
}

/// One status byte per minimum unit.
///
/// Only the head unit of a buffer carries a meaningful `shift`; the other
/// units hold `INVALID_SHIFT`. For complex allocations the three entries
/// following the head are reused as raw bytes of the unit count.
#[bitfield(u8)]
pub struct BufStatus {
    /// Reserved, free or in use (bits 0..=1).
    #[bits(2)]
    pub state: BufState,
    /// Size shift of the buffer in location units, or one of the sentinels (bits 2..=7).
    #[bits(6)]
    pub shift: u8,
}

impl BufStatus {
    /// Status of a unit that has not been carved yet.
    pub(crate) const RESERVED: Self = Self::new()
        .with_state(BufState::Reserved)
        .with_shift(INVALID_SHIFT);

    #[inline]
    pub(crate) const fn head(state: BufState, shift: u8) -> Self {
        Self::new().with_state(state).with_shift(shift)
    }
}

/// Groups of allocation sizes, used for statistics.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SizeType {
    PowerOfTwo = 0,
    ThreeUnits = 1,
    Complex = 2,
}

impl SizeType {
    pub const ALL: [Self; 3] = [Self::PowerOfTwo, Self::ThreeUnits, Self::Complex];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PowerOfTwo => "powerof2",
            Self::ThreeUnits => "size3",
            Self::Complex => "complex",
        }
    }
}

/// Decoded size of an allocated buffer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SizeEncoding {
    /// `2^shift` location units.
    PowerOfTwo(u8),
    /// Exactly three minimum units.
    ThreeUnits,
    /// Any other number of minimum units.
    Complex(u32),
}

impl SizeEncoding {
    /// Size of the allocation in minimum units.
    #[must_use]
    pub const fn units(self, min_shift: u32) -> u32 {
        match self {
            Self::PowerOfTwo(shift) => 1 << (shift as u32 - min_shift),
            Self::ThreeUnits => 3,
            Self::Complex(units) => units,
        }
    }

    #[must_use]
    pub const fn size_type(self) -> SizeType {
        match self {
            Self::PowerOfTwo(_) => SizeType::PowerOfTwo,
            Self::ThreeUnits => SizeType::ThreeUnits,
            Self::Complex(_) => SizeType::Complex,
        }
    }

    /// Pick the cheapest encoding for an allocation of `units` minimum units.
    #[must_use]
    pub const fn for_units(units: u32, min_shift: u32) -> Self {
        if units.is_power_of_two() {
            #[allow(clippy::cast_possible_truncation)]
            Self::PowerOfTwo((units.trailing_zeros() + min_shift) as u8)
        } else if units == 3 {
            Self::ThreeUnits
        } else {
            Self::Complex(units)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_layout_is_state_low_shift_high() {
        let s = BufStatus::head(BufState::InUse, 12);
        assert_eq!(s.into_bits(), (12 << 2) | 2);
        let back = BufStatus::from_bits(s.into_bits());
        assert_eq!(back.state(), BufState::InUse);
        assert_eq!(back.shift(), 12);
    }

    #[test]
    fn reserved_is_invalid_shift() {
        assert_eq!(BufStatus::RESERVED.state(), BufState::Reserved);
        assert_eq!(BufStatus::RESERVED.shift(), INVALID_SHIFT);
    }

    #[test]
    fn encoding_choice() {
        assert_eq!(SizeEncoding::for_units(4, 12), SizeEncoding::PowerOfTwo(14));
        assert_eq!(SizeEncoding::for_units(3, 12), SizeEncoding::ThreeUnits);
        assert_eq!(SizeEncoding::for_units(5, 12), SizeEncoding::Complex(5));
        assert_eq!(SizeEncoding::Complex(7).units(12), 7);
        assert_eq!(SizeEncoding::PowerOfTwo(14).units(12), 4);
    }
}
