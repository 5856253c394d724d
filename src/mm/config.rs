//! Heap Configuration
//!
//! Layout constants shared by every region, plus the runtime options the
//! embedding kernel selects once when the heap is brought up.

use super::heap::ConfigError;

/// Minimum alignment of every node offset, node size and payload.
pub const GRANULE: usize = 16;

/// Bit of `preceding` that marks the node itself as allocated.
pub const ALLOC_BIT: u32 = 1 << 31;

/// Largest region span the 31-bit size fields can describe.
pub const MAX_REGION_SPAN: usize = (ALLOC_BIT as usize) - GRANULE;

/// Capacity of the region table.
pub const MAX_REGIONS: usize = 4;

/// Header size when owner tracking is off.
pub const COMPACT_HEADER: usize = 16;

/// Header size when owner tracking is on.
pub const TRACKED_HEADER: usize = 32;

/// Runtime heap options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Number of regions the heap may manage (1..=MAX_REGIONS).
    pub max_regions: usize,
    /// Record owner pid and call site in every allocated node.
    pub track_owners: bool,
}

impl HeapConfig {
    /// Single region, compact headers.
    pub const DEFAULT: Self = Self {
        max_regions: 1,
        track_owners: false,
    };

    /// Set the number of regions.
    pub const fn with_regions(mut self, max_regions: usize) -> Self {
        self.max_regions = max_regions;
        self
    }

    /// Enable or disable owner tracking.
    pub const fn with_owner_tracking(mut self, track_owners: bool) -> Self {
        self.track_owners = track_owners;
        self
    }

    /// Size of the header at the front of every node.
    #[inline]
    pub const fn header_size(&self) -> usize {
        if self.track_owners {
            TRACKED_HEADER
        } else {
            COMPACT_HEADER
        }
    }

    /// Smallest chunk worth splitting off: a header plus one granule.
    #[inline]
    pub const fn min_chunk(&self) -> usize {
        self.header_size() + GRANULE
    }

    /// Smallest region that fits both sentinels and one minimal free node.
    #[inline]
    pub const fn min_region_span(&self) -> usize {
        2 * self.header_size() + self.min_chunk()
    }

    /// Reject configurations the region table cannot hold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_regions == 0 || self.max_regions > MAX_REGIONS {
            return Err(ConfigError::InvalidConfig);
        }
        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Align `value` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}
