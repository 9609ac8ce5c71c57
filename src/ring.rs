//! Lock-guarded byte FIFO over the control block's circular data region
//!
//! Single producer (worker), single consumer (supervisor). Acquiring the
//! embedded lock yields a [`RingGuard`]; all ring operations live on the
//! guard so the "caller must hold the lock" precondition cannot be skipped.
//!
//! `write_count`/`read_count` are monotonic byte totals and never reset;
//! their difference is the number of bytes available to read. Only the
//! derived offsets wrap, via bitmask, which is why the capacity must be a
//! power of two.

use crate::control_block::ControlBlock;

/// Exclusive, lock-holding view of the ring buffer
///
/// Releases the lock on drop. Holds a raw pointer rather than a reference
/// because the data region lives past the end of the `ControlBlock` struct
/// inside the same mapping.
pub struct RingGuard {
    block: *mut ControlBlock,
}

impl ControlBlock {
    /// Acquire the embedded lock and return a guard for ring access
    ///
    /// Blocks (spinning) until the lock is free. A peer that dies while
    /// holding the lock never releases it, so this spins forever; the
    /// exposure is the peer's short copy window inside `read`/`write`.
    ///
    /// # Safety
    /// `block` must point to an initialized control block embedded in a
    /// mapping with at least `ring_offset() + ring_size()` accessible bytes.
    pub unsafe fn lock_ring(block: *mut ControlBlock) -> RingGuard {
        (*block).lock.acquire();
        RingGuard { block }
    }
}

impl RingGuard {
    #[inline(always)]
    fn block(&self) -> &ControlBlock {
        unsafe { &*self.block }
    }

    #[inline(always)]
    fn ring_ptr(&self) -> *mut u8 {
        // Derived from the block pointer, not a reference, so the
        // provenance covers the whole mapping.
        unsafe { (self.block as *mut u8).add(self.block().ring_offset() as usize) }
    }

    /// Bytes currently readable
    #[inline]
    pub fn read_avail(&self) -> u32 {
        let block = self.block();
        block.write_count.get().wrapping_sub(block.read_count.get())
    }

    /// Bytes currently writable
    #[inline]
    pub fn write_avail(&self) -> u32 {
        let block = self.block();
        let ceiling = block.read_count.get().wrapping_add(block.ring_size());
        if block.write_count.get() >= ceiling {
            0
        } else {
            ceiling - block.write_count.get()
        }
    }

    /// Copy `out.len()` bytes out of the ring in FIFO order
    ///
    /// Fails without mutating any state if the request exceeds the ring
    /// capacity or the bytes currently available. A read that passes the end
    /// of the region is split into two copies.
    pub fn read(&mut self, out: &mut [u8]) -> bool {
        let Ok(size) = u32::try_from(out.len()) else {
            return false;
        };
        let block = self.block();
        let ring_size = block.ring_size();

        if size > ring_size || size > self.read_avail() {
            return false;
        }

        let read_offset = block.read_offset.get();
        let first = (ring_size - read_offset).min(size);
        let second = size - first;

        let ring = self.ring_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(
                ring.add(read_offset as usize),
                out.as_mut_ptr(),
                first as usize,
            );
            if second != 0 {
                std::ptr::copy_nonoverlapping(
                    ring,
                    out.as_mut_ptr().add(first as usize),
                    second as usize,
                );
            }
        }

        block.read_offset.set((read_offset + size) & (ring_size - 1));
        block.read_count.set(block.read_count.get().wrapping_add(size));
        true
    }

    /// Copy `data` into the ring in FIFO order
    ///
    /// Fails without mutating any state if the request exceeds the ring
    /// capacity or the space currently free. A write that passes the end of
    /// the region is split into two copies.
    pub fn write(&mut self, data: &[u8]) -> bool {
        let Ok(size) = u32::try_from(data.len()) else {
            return false;
        };
        let block = self.block();
        let ring_size = block.ring_size();

        if size > ring_size || size > self.write_avail() {
            return false;
        }

        let write_offset = block.write_offset.get();
        let first = (ring_size - write_offset).min(size);
        let second = size - first;

        let ring = self.ring_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ring.add(write_offset as usize),
                first as usize,
            );
            if second != 0 {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first as usize),
                    ring,
                    second as usize,
                );
            }
        }

        block.write_offset.set((write_offset + size) & (ring_size - 1));
        block.write_count.set(block.write_count.get().wrapping_add(size));
        true
    }
}

impl Drop for RingGuard {
    fn drop(&mut self) {
        self.block().lock.release();
    }
}
