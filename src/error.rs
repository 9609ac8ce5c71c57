//! Error types for Outpost

use std::io;
use thiserror::Error;

/// Result type for Outpost operations
pub type Result<T> = std::result::Result<T, OutpostError>;

/// Errors that can occur while supervising a worker
#[derive(Debug, Error)]
pub enum OutpostError {
    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to unlink the segment name after mapping
    #[error("Failed to unlink shared memory '{name}': {source}")]
    ShmUnlink {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to set the segment size
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to query an inherited descriptor
    #[error("Failed to stat shared memory descriptor: {0}")]
    Stat(#[source] io::Error),

    /// Failed to adjust descriptor flags before spawning
    #[error("Failed to adjust descriptor flags: {0}")]
    DescriptorFlags(#[source] io::Error),

    /// Invalid control block magic number
    #[error("Invalid control block magic: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Ring capacity must be a power of two (offsets wrap via bitmask)
    #[error("Ring buffer size {0} is not a non-zero power of two")]
    RingSizeNotPowerOfTwo(u32),

    /// Segment cannot hold the control block header
    #[error("Shared segment too small for control block: {0} bytes")]
    SegmentTooSmall(usize),

    /// Ring data region does not fit inside the mapped segment
    #[error("Ring region out of bounds: offset {offset} + size {size} exceeds segment of {segment} bytes")]
    RingOutOfBounds {
        offset: u32,
        size: u32,
        segment: usize,
    },

    /// Worker path or workload contained an interior NUL byte
    #[error("Worker argument contains an interior NUL byte")]
    NulInArgument,

    /// Failed to fork the worker process
    #[error("Failed to fork worker process: {0}")]
    Fork(#[source] io::Error),

    /// No worker process to operate on
    #[error("No worker process to operate on")]
    NoWorker,

    /// The OS wait call failed
    #[error("Failed to wait for worker: {0}")]
    Wait(#[source] io::Error),

    /// Failed to deliver a signal to the worker
    #[error("Failed to signal worker: {0}")]
    Kill(#[source] io::Error),
}
