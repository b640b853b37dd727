//! Error types.
//!
//! Only conditions a caller can act on are reported as errors. Broken invariants
//! (a kernel mapping without a preallocated descriptor, running out of memory with no
//! way to fail) panic instead.

use thiserror::Error;

/// Errors reported by address space operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PmapError {
    /// A translation table or descriptor could not be allocated and the caller
    /// asked to be told instead of the kernel panicking.
    #[error("out of memory for translation structures")]
    OutOfMemory,

    /// Every address space identifier pair is in use.
    #[error("address space identifiers exhausted")]
    AsidsExhausted,
}

/// Errors reported by the bootstrap region allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    /// The region array has no room for the split.
    #[error("region array is full")]
    RegionsFull,

    /// The requested alignment is zero or not a power of two.
    #[error("alignment must be a non-zero power of two")]
    InvalidAlignment,

    /// No region is large enough for the request.
    #[error("no region large enough for the request")]
    OutOfMemory,
}
