//! Error type shared by the pool, its tiers and the page tree constructor.

use thiserror::Error;

/// Errors produced by the buffer pool.
///
/// Allocator internals never produce errors: a full page tree or a tier that
/// cannot fit a request reports `None`/`false`, and only the facade turns that
/// into [`PoolError::Exhausted`] once every tier has declined.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// No configured tier could satisfy the request.
    #[error("no tier can satisfy a request of {requested} bytes")]
    Exhausted {
        /// Total bytes requested, headroom included.
        requested: usize,
    },

    /// The buffer was handed out by a different pool.
    #[error("buffer is not owned by this pool")]
    Foreign,

    /// A page tree cannot be built over this many bytes.
    #[error("page capacity {0} is below the minimum of 512 bytes")]
    InvalidCapacity(usize),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The backing allocator failed to provide memory.
    #[error("failed to allocate {0} bytes of backing memory")]
    OutOfMemory(usize),

    /// A shrink asked for more bytes than the buffer holds.
    #[error("cannot shrink a {len} byte buffer by {less} bytes")]
    ShrinkTooLarge {
        /// Current buffer length.
        len: usize,
        /// Requested reduction.
        less: usize,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            PoolError::Exhausted { requested: 4096 }.to_string(),
            "no tier can satisfy a request of 4096 bytes"
        );
        assert_eq!(
            PoolError::InvalidCapacity(100).to_string(),
            "page capacity 100 is below the minimum of 512 bytes"
        );
        assert_eq!(
            PoolError::ShrinkTooLarge { len: 8, less: 9 }.to_string(),
            "cannot shrink a 8 byte buffer by 9 bytes"
        );
    }
}
