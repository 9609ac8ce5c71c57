//! Shared control block placed at the start of the segment
//!
//! Both processes agree on this layout byte for byte: a version stamp, a
//! process-shared lock, sixteen independently-atomic progress counters and
//! the ring-buffer bookkeeping. Counters need no lock; the bookkeeping is
//! plain integers and is only touched while the lock is held.

use crate::error::{OutpostError, Result};
use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Magic/version stamp written at init and validated on worker attach
pub const BLOCK_MAGIC: u32 = 0x4F55_5431; // "OUT1"

/// Fixed chunk size for ring-buffer messages
pub const MESSAGE_SIZE: usize = 32;

/// Bytes reserved for the control block ahead of the ring data region
pub const CONTROL_REGION_SIZE: usize = 4 * 1024;

/// Default ring capacity in bytes
pub const DEFAULT_RING_SIZE: u32 = 64 * 1024;

/// Word-sized spin lock valid across process boundaries.
///
/// Held only for short bounded copies, so spinning is cheaper than parking.
/// Not robust: a process killed while holding the lock leaves it held
/// forever, same as the original's process-shared mutex.
#[repr(transparent)]
pub(crate) struct SpinLock(AtomicU32);

impl SpinLock {
    pub(crate) fn acquire(&self) {
        while self
            .0
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    pub(crate) fn release(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// Control block shared between supervisor and worker
///
/// Counter fields are public: the worker bumps them directly as it replays
/// items, the supervisor only ever loads them. Cross-counter consistency is
/// not guaranteed; each counter is independently atomic.
#[repr(C)]
pub struct ControlBlock {
    version_cookie: u32,
    pub(crate) lock: SpinLock,

    pub successful_modules: AtomicU32,
    pub successful_graphics: AtomicU32,
    pub successful_compute: AtomicU32,
    pub skipped_graphics: AtomicU32,
    pub skipped_compute: AtomicU32,
    pub clean_process_deaths: AtomicU32,
    pub dirty_process_deaths: AtomicU32,
    pub parsed_graphics: AtomicU32,
    pub parsed_compute: AtomicU32,
    pub total_graphics: AtomicU32,
    pub total_compute: AtomicU32,
    pub total_modules: AtomicU32,
    pub banned_modules: AtomicU32,
    pub module_validation_failures: AtomicU32,
    pub progress_started: AtomicU32,
    pub progress_complete: AtomicU32,

    // Ring bookkeeping. write_count/read_count are monotonic byte totals;
    // the offsets wrap via bitmask. Mutated only under `lock`, which also
    // provides the cross-process visibility ordering.
    pub(crate) write_count: Cell<u32>,
    pub(crate) read_count: Cell<u32>,
    pub(crate) read_offset: Cell<u32>,
    pub(crate) write_offset: Cell<u32>,
    pub(crate) ring_buffer_offset: Cell<u32>,
    pub(crate) ring_buffer_size: Cell<u32>,
}

const _: () = assert!(std::mem::size_of::<ControlBlock>() <= CONTROL_REGION_SIZE);

/// Snapshot of per-stage replay progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageProgress {
    pub total: u32,
    pub parsed: u32,
    pub skipped: u32,
    pub completed: u32,
}

/// Snapshot of all progress counters
///
/// Loads are relaxed; the snapshot may interleave with worker updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub graphics: StageProgress,
    pub compute: StageProgress,
    pub completed_modules: u32,
    pub total_modules: u32,
    pub banned_modules: u32,
    pub module_validation_failures: u32,
    pub clean_crashes: u32,
    pub dirty_crashes: u32,
}

impl ControlBlock {
    /// Initialize a control block in place
    ///
    /// # Safety
    /// `ptr` must point to the start of a zero-filled region with at least
    /// `ring_offset + ring_size` accessible bytes, and `ring_offset` must
    /// leave room for the control block itself.
    pub unsafe fn init(ptr: *mut Self, ring_size: u32, ring_offset: u32) {
        debug_assert!(ring_size.is_power_of_two());
        debug_assert!(ring_offset as usize >= std::mem::size_of::<Self>());

        (*ptr).version_cookie = BLOCK_MAGIC;
        (*ptr).lock = SpinLock(AtomicU32::new(0));
        // Counters and ring counts are already zero in a fresh segment.
        (*ptr).ring_buffer_offset.set(ring_offset);
        (*ptr).ring_buffer_size.set(ring_size);
    }

    /// Check the magic/version stamp, failing closed on mismatch
    pub fn validate(&self) -> Result<()> {
        let got = self.version_cookie;
        if got != BLOCK_MAGIC {
            return Err(OutpostError::InvalidMagic {
                expected: BLOCK_MAGIC,
                got,
            });
        }
        Ok(())
    }

    /// Ring capacity in bytes. Geometry is set once at init and never moves.
    #[inline(always)]
    pub fn ring_size(&self) -> u32 {
        self.ring_buffer_size.get()
    }

    /// Byte offset from the block start to the ring data region
    #[inline(always)]
    pub fn ring_offset(&self) -> u32 {
        self.ring_buffer_offset.get()
    }

    /// Whether the worker has signalled that replay has begun
    #[inline]
    pub fn has_started(&self) -> bool {
        self.progress_started.load(Ordering::Acquire) != 0
    }

    /// Whether the worker has signalled a clean end of replay
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.progress_complete.load(Ordering::Acquire) != 0
    }

    /// Worker side: flag that item processing has begun
    #[inline]
    pub fn mark_started(&self) {
        self.progress_started.store(1, Ordering::Release);
    }

    /// Worker side: flag a clean end of processing, set before exiting
    #[inline]
    pub fn mark_complete(&self) {
        self.progress_complete.store(1, Ordering::Release);
    }

    /// Load all progress counters into a [`Progress`] value
    pub fn snapshot(&self) -> Progress {
        Progress {
            graphics: StageProgress {
                total: self.total_graphics.load(Ordering::Relaxed),
                parsed: self.parsed_graphics.load(Ordering::Relaxed),
                skipped: self.skipped_graphics.load(Ordering::Relaxed),
                completed: self.successful_graphics.load(Ordering::Relaxed),
            },
            compute: StageProgress {
                total: self.total_compute.load(Ordering::Relaxed),
                parsed: self.parsed_compute.load(Ordering::Relaxed),
                skipped: self.skipped_compute.load(Ordering::Relaxed),
                completed: self.successful_compute.load(Ordering::Relaxed),
            },
            completed_modules: self.successful_modules.load(Ordering::Relaxed),
            total_modules: self.total_modules.load(Ordering::Relaxed),
            banned_modules: self.banned_modules.load(Ordering::Relaxed),
            module_validation_failures: self.module_validation_failures.load(Ordering::Relaxed),
            clean_crashes: self.clean_process_deaths.load(Ordering::Relaxed),
            dirty_crashes: self.dirty_process_deaths.load(Ordering::Relaxed),
        }
    }
}
