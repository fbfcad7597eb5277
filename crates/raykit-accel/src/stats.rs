//! Compaction statistics.

use ash::vk;
use std::fmt;

const MIB: f64 = 1024.0 * 1024.0;

/// Running totals of structure sizes before and after compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlasStats {
    pub total_original_size: vk::DeviceSize,
    pub total_compact_size: vk::DeviceSize,
}

impl BlasStats {
    /// Account for one compacted structure.
    pub fn record(&mut self, original_size: vk::DeviceSize, compact_size: vk::DeviceSize) {
        self.total_original_size += original_size;
        self.total_compact_size += compact_size;
    }

    pub const fn saved_size(&self) -> vk::DeviceSize {
        self.total_original_size
            .saturating_sub(self.total_compact_size)
    }

    /// Share of the original size removed by compaction, in `[0, 1]`.
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction_smaller(&self) -> f64 {
        if self.total_original_size == 0 {
            return 0.0;
        }
        self.saved_size() as f64 / self.total_original_size as f64
    }
}

impl fmt::Display for BlasStats {
    #[allow(clippy::cast_precision_loss)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BLAS Compaction: {:.1}MB -> {:.1}MB ({:.1}MB saved, {:.1}% smaller)",
            self.total_original_size as f64 / MIB,
            self.total_compact_size as f64 / MIB,
            self.saved_size() as f64 / MIB,
            self.fraction_smaller() * 100.0
        )
    }
}
