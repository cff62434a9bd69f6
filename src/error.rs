//! Errors at the cache's fallible construction/configuration boundary.
//!
//! Spec §7 draws a line between construction-time failures (these) and
//! the steady-state operational surface (`store`, `find`, `fetch`, ...),
//! which keeps the boolean/`Option` return convention spec.md §7 asks
//! for — those are expected outcomes, not exceptional ones.
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to map shared-memory region: {0}")]
    Region(#[from] io::Error),

    #[error("requested sma_size ({sma_size}) is smaller than the minimum arena ({min})")]
    SmaTooSmall { sma_size: u32, min: u32 },
}
