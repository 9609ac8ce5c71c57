//! Worker side: attach to the supervisor's segment via the inherited fd
//!
//! The worker receives the descriptor number on its command line
//! (`--shmem-fd <n>`), maps it, and refuses to proceed unless the control
//! block stamp and ring geometry check out. After that it bumps counters
//! directly and pushes short informational messages, dropping them when
//! the ring is full.

use crate::control_block::{ControlBlock, MESSAGE_SIZE};
use crate::error::{OutpostError, Result};
use crate::shm::SharedSegment;
use rustix::fd::OwnedFd;
use tracing::debug;

/// Worker-side handle to the shared control block
pub struct WorkerLink {
    shm: SharedSegment,
}

impl WorkerLink {
    /// Map the inherited segment and validate the control block
    ///
    /// Fails closed: a missing or wrong magic stamp, an undersized
    /// segment, or ring geometry that escapes the mapping all reject the
    /// attach before anything trusts the block.
    ///
    /// # Safety
    /// `fd` must be the shared-memory descriptor inherited from a
    /// supervisor, as named by its `--shmem-fd` argument.
    pub unsafe fn attach(fd: OwnedFd) -> Result<Self> {
        let shm = SharedSegment::from_owned_fd(fd)?;
        if shm.size() < std::mem::size_of::<ControlBlock>() {
            return Err(OutpostError::SegmentTooSmall(shm.size()));
        }

        let block = &*shm.as_ptr().cast::<ControlBlock>();
        block.validate()?;

        let offset = block.ring_offset();
        let size = block.ring_size();
        if size == 0 || !size.is_power_of_two() {
            return Err(OutpostError::RingSizeNotPowerOfTwo(size));
        }
        if (offset as usize) < std::mem::size_of::<ControlBlock>()
            || offset as usize + size as usize > shm.size()
        {
            return Err(OutpostError::RingOutOfBounds {
                offset,
                size,
                segment: shm.size(),
            });
        }

        Ok(Self { shm })
    }

    /// The shared control block; counters are bumped directly on it
    #[inline]
    pub fn block(&self) -> &ControlBlock {
        unsafe { &*self.shm.as_ptr().cast::<ControlBlock>() }
    }

    /// Flag that item processing has begun
    pub fn mark_started(&self) {
        self.block().mark_started();
    }

    /// Flag a clean end of processing; set this before exiting
    pub fn mark_complete(&self) {
        self.block().mark_complete();
    }

    /// Push one fixed-size message, dropping it if the ring is full
    ///
    /// Messages longer than the chunk are truncated; a trailing NUL is
    /// always kept so the supervisor can find the text end.
    pub fn push_message(&self, msg: &str) -> bool {
        let mut chunk = [0u8; MESSAGE_SIZE];
        let bytes = msg.as_bytes();
        let len = bytes.len().min(MESSAGE_SIZE - 1);
        chunk[..len].copy_from_slice(&bytes[..len]);

        let mut guard = unsafe { ControlBlock::lock_ring(self.shm.as_ptr().cast()) };
        let written = guard.write(&chunk);
        if !written {
            debug!(message = msg, "ring full, dropping message");
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_block::{BLOCK_MAGIC, CONTROL_REGION_SIZE};
    use std::os::fd::BorrowedFd;

    fn dup_fd(segment: &SharedSegment) -> OwnedFd {
        unsafe { BorrowedFd::borrow_raw(segment.raw_fd()) }
            .try_clone_to_owned()
            .unwrap()
    }

    fn init_segment(ring_size: u32) -> SharedSegment {
        let segment = SharedSegment::create(CONTROL_REGION_SIZE + ring_size as usize).unwrap();
        unsafe {
            ControlBlock::init(segment.as_ptr().cast(), ring_size, CONTROL_REGION_SIZE as u32);
        }
        segment
    }

    #[test]
    fn test_attach_validates_magic() {
        // A segment nobody initialized must be rejected.
        let segment = SharedSegment::create(CONTROL_REGION_SIZE + 64).unwrap();
        let err = unsafe { WorkerLink::attach(dup_fd(&segment)) }
            .err()
            .expect("attach must reject an uninitialized block");
        match err {
            OutpostError::InvalidMagic { expected, got } => {
                assert_eq!(expected, BLOCK_MAGIC);
                assert_eq!(got, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_attach_rejects_out_of_bounds_ring() {
        // Geometry claims more ring than the mapping holds.
        let segment = SharedSegment::create(CONTROL_REGION_SIZE + 64).unwrap();
        unsafe {
            ControlBlock::init(segment.as_ptr().cast(), 128, CONTROL_REGION_SIZE as u32);
        }
        let err = unsafe { WorkerLink::attach(dup_fd(&segment)) }
            .err()
            .expect("attach must reject ring geometry that escapes the mapping");
        assert!(matches!(err, OutpostError::RingOutOfBounds { .. }));
    }

    #[test]
    fn test_messages_cross_the_link() {
        let segment = init_segment(64);
        let link = unsafe { WorkerLink::attach(dup_fd(&segment)) }.unwrap();

        assert!(link.push_message("MODULE 1f"));
        link.mark_started();

        // Supervisor side of the same segment.
        let mut guard = unsafe { ControlBlock::lock_ring(segment.as_ptr().cast()) };
        assert_eq!(guard.read_avail() as usize, MESSAGE_SIZE);
        let mut buf = [0u8; MESSAGE_SIZE];
        assert!(guard.read(&mut buf));
        assert_eq!(&buf[..9], b"MODULE 1f");
        assert_eq!(buf[9], 0);
        drop(guard);

        let supervisor_view = unsafe { &*segment.as_ptr().cast::<ControlBlock>() };
        assert!(supervisor_view.has_started());
    }

    #[test]
    fn test_push_drops_when_full() {
        let segment = init_segment(64);
        let link = unsafe { WorkerLink::attach(dup_fd(&segment)) }.unwrap();

        // 64-byte ring holds exactly two 32-byte chunks.
        assert!(link.push_message("one"));
        assert!(link.push_message("two"));
        assert!(!link.push_message("three"));
    }
}
