//! Construction-time configuration of the pool tiers.
//!
//! Every struct has sensible defaults and a `validate` method; the builder
//! validates everything before any memory is touched.

use crate::error::{PoolError, Result};
use crate::page::{MINIMUM_ALIGN, MINIMUM_CAPACITY};

/// Configuration of a [`PagedBPool`](crate::PagedBPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagedConfig {
    /// Bytes of direct memory managed by the tree; 0 disables direct memory.
    pub direct_capacity: usize,
    /// Bytes of heap memory managed by the tree; 0 disables heap memory.
    pub heap_capacity: usize,
}

impl Default for PagedConfig {
    fn default() -> Self {
        Self {
            direct_capacity: 1024 * 1024,
            heap_capacity: 1024 * 1024,
        }
    }
}

impl PagedConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if both capacities are 0 or a
    /// non-zero capacity is below the minimum page capacity.
    pub fn validate(&self) -> Result<()> {
        if self.direct_capacity == 0 && self.heap_capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "paged tier needs direct or heap capacity".into(),
            ));
        }
        for (name, capacity) in [
            ("direct_capacity", self.direct_capacity),
            ("heap_capacity", self.heap_capacity),
        ] {
            if capacity != 0 && capacity < MINIMUM_CAPACITY {
                return Err(PoolError::InvalidConfig(format!(
                    "paged {name} ({capacity}) must be 0 or at least {MINIMUM_CAPACITY}"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of a [`BitmapBPool`](crate::BitmapBPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapConfig {
    /// Allocation granularity. Must be a power of two of at least 8.
    pub chunk_size: usize,
    /// Bytes per memory kind. Must be a multiple of `chunk_size`.
    pub capacity: usize,
}

impl Default for BitmapConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            capacity: 512 * 1024,
        }
    }
}

impl BitmapConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if the chunk size is not a power
    /// of two of at least 8, or the capacity is not a non-zero multiple of at
    /// least two chunks.
    pub fn validate(&self) -> Result<()> {
        if !self.chunk_size.is_power_of_two() || self.chunk_size < MINIMUM_ALIGN {
            return Err(PoolError::InvalidConfig(format!(
                "bitmap chunk_size ({}) must be a power of two >= {MINIMUM_ALIGN}",
                self.chunk_size
            )));
        }
        if self.capacity % self.chunk_size != 0 || self.capacity < 2 * self.chunk_size {
            return Err(PoolError::InvalidConfig(format!(
                "bitmap capacity ({}) must be a multiple of chunk_size ({}) spanning at least two chunks",
                self.capacity, self.chunk_size
            )));
        }
        Ok(())
    }

    /// Number of chunks per memory kind.
    #[must_use]
    pub const fn chunks(&self) -> usize {
        self.capacity / self.chunk_size
    }
}

/// Configuration of a [`SimpleBPool`](crate::SimpleBPool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleConfig {
    /// Smallest block handed out; smaller requests are rounded up to it.
    pub min_size: usize,
    /// Largest request the tier accepts.
    pub max_size: usize,
    /// Blocks kept in the cache across both memory kinds.
    pub max_count: usize,
}

impl Default for SimpleConfig {
    fn default() -> Self {
        Self {
            min_size: 4 * 1024,
            max_size: 4 * 1024 * 1024,
            max_count: 16,
        }
    }
}

impl SimpleConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if `min_size` is 0 or larger than
    /// `max_size`.
    pub fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "simple tier needs 0 < min_size ({}) <= max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Configuration of the leak detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakConfig {
    /// Every `sample_interval`-th allocation is tracked; 1 tracks all.
    pub sample_interval: u64,
}

impl Default for LeakConfig {
    fn default() -> Self {
        Self {
            sample_interval: 128,
        }
    }
}

impl LeakConfig {
    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if the interval is 0.
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval == 0 {
            return Err(PoolError::InvalidConfig(
                "leak sample_interval must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// One tier of a pool, in the order the facade tries them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierConfig {
    /// A [`PagedBPool`](crate::PagedBPool).
    Paged(PagedConfig),
    /// A [`BitmapBPool`](crate::BitmapBPool).
    Bitmap(BitmapConfig),
    /// A [`SimpleBPool`](crate::SimpleBPool).
    Simple(SimpleConfig),
}

impl TierConfig {
    /// The default tier stack: paged, then bitmap, then simple.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::Paged(PagedConfig::default()),
            Self::Bitmap(BitmapConfig::default()),
            Self::Simple(SimpleConfig::default()),
        ]
    }

    /// Checks the wrapped configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Paged(config) => config.validate(),
            Self::Bitmap(config) => config.validate(),
            Self::Simple(config) => config.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        for tier in TierConfig::defaults() {
            tier.validate().unwrap();
        }
        LeakConfig::default().validate().unwrap();
        assert_eq!(BitmapConfig::default().chunks(), 1024);
    }

    #[test]
    fn test_paged_config_validation() {
        let config = PagedConfig {
            direct_capacity: 0,
            heap_capacity: 0,
        };
        assert!(matches!(config.validate(), Err(PoolError::InvalidConfig(_))));

        let config = PagedConfig {
            direct_capacity: 100,
            heap_capacity: 0,
        };
        assert!(config.validate().is_err());

        let config = PagedConfig {
            direct_capacity: 0,
            heap_capacity: 4096,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bitmap_config_validation() {
        let bad_chunk = BitmapConfig {
            chunk_size: 500,
            capacity: 5000,
        };
        assert!(bad_chunk.validate().is_err());

        let ragged = BitmapConfig {
            chunk_size: 512,
            capacity: 1000,
        };
        assert!(ragged.validate().is_err());

        let single = BitmapConfig {
            chunk_size: 512,
            capacity: 512,
        };
        assert!(single.validate().is_err());
    }

    #[test]
    fn test_simple_and_leak_validation() {
        let inverted = SimpleConfig {
            min_size: 2048,
            max_size: 1024,
            max_count: 4,
        };
        assert!(inverted.validate().is_err());
        assert!(LeakConfig { sample_interval: 0 }.validate().is_err());
    }
}
