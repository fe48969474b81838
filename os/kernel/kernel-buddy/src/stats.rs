use crate::status::SizeType;
use crate::MAX_NUM_SIZES;
use log::info;

/// Live counters of a space, updated under the main lock.
pub(crate) struct Counters<'a> {
    /// Units carved into buffers so far.
    pub num_carved: u32,
    /// Carved units that are currently free.
    pub num_free_carved: u32,
    /// Allocated buffers (or allocation pieces) per size class.
    pub num_used: [u32; MAX_NUM_SIZES],
    pub type_allocated: [u32; 3],
    pub type_released: [u32; 3],
    /// Free units per color of the minimum size class.
    pub color_free: &'a mut [u32],
    /// Carved units per color of the minimum size class.
    pub color_tot: &'a mut [u32],
}

/// Snapshot of a space's statistics.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BuddyStats {
    pub min_shift: u32,
    pub num_sizes: usize,
    /// Carved minimum units.
    pub num_carved: u32,
    /// Free minimum units.
    pub num_free: u32,
    /// Buffers on the free lists per size class.
    pub free_bufs: [u32; MAX_NUM_SIZES],
    /// Allocated buffers per size class.
    pub used_bufs: [u32; MAX_NUM_SIZES],
    /// Allocations per [`SizeType`].
    pub allocated: [u32; 3],
    /// Releases per [`SizeType`].
    pub released: [u32; 3],
}

impl BuddyStats {
    /// Allocated minimum units.
    #[must_use]
    pub const fn num_used(&self) -> u32 {
        self.num_carved - self.num_free
    }

    /// Buffer size of size class `idx` in location units.
    #[must_use]
    pub const fn buffer_size(&self, idx: usize) -> u64 {
        1u64 << (self.min_shift as usize + idx)
    }

    /// Number of size classes that currently have at least one free buffer.
    #[must_use]
    pub fn free_size_classes(&self) -> usize {
        self.free_bufs[..self.num_sizes].iter().filter(|&&n| n > 0).count()
    }

    /// Log the statistics table; `colors` adds the per-color breakdown.
    pub fn log(&self, name: &str, colors: Option<(&[u32], &[u32])>) {
        info!("{name}");
        info!("Number of {} sized buffers : {}", "carved", self.num_carved);
        info!("Number of {} sized buffers : {}", "free", self.num_free);
        info!("Number of {} sized buffers : {}", "used", self.num_used());
        info!("{:>12} {:>10} {:>10}", "buffer size", "free", "used");
        for i in 0..self.num_sizes {
            info!(
                "{:>12x} {:>10} {:>10}",
                self.buffer_size(i),
                self.free_bufs[i],
                self.used_bufs[i]
            );
        }

        let Some((free, total)) = colors else {
            return;
        };
        info!("{:>8} {:>10} {:>10} {:>10}", "color", "free", "used", "total");
        let (mut sum_free, mut sum_total) = (0u64, 0u64);
        for (color, (&f, &t)) in free.iter().zip(total).enumerate() {
            info!("{color:>8} {f:>10} {:>10} {t:>10}", t - f);
            sum_free += u64::from(f);
            sum_total += u64::from(t);
        }
        info!(
            "{:>8} {sum_free:>10} {:>10} {sum_total:>10}",
            "Total",
            sum_total - sum_free
        );

        info!("{:>10} {:>10} {:>10}", "size type", "allocated", "freed");
        for ty in SizeType::ALL {
            info!(
                "{:>10} {:>10} {:>10}",
                ty.name(),
                self.allocated[ty as usize],
                self.released[ty as usize]
            );
        }
    }
}
