//! POSIX shared memory segments, anonymous once mapped
//!
//! The supervisor creates a uniquely named segment, maps it and immediately
//! unlinks the name: no third process can ever open it, and the kernel
//! reclaims it once the last mapping goes away. The worker never sees the
//! name at all; it inherits the descriptor across `execv` and maps that.

use crate::error::{OutpostError, Result};
use rustix::fd::{AsRawFd, OwnedFd, RawFd};
use rustix::fs::{fstat, ftruncate};
use rustix::io::{fcntl_getfd, fcntl_setfd, FdFlags};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

const SHM_PREFIX: &str = "/outpost-";

/// Per-process counter qualifying segment names. Combined with the pid this
/// keeps names unique across concurrent supervisors in one process.
static SHM_INDEX: AtomicI32 = AtomicI32::new(0);

/// A mapped shared memory region
pub struct SharedSegment {
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
}

// SAFETY: the mapping itself is synchronized by the control block's lock
// and atomics; the handle carries no thread-affine state.
unsafe impl Send for SharedSegment {}

impl SharedSegment {
    /// Create, size, map and immediately unlink a fresh segment
    ///
    /// The name is observable only between `shm_open` and `shm_unlink`;
    /// unlinking must happen after the mapping is established or we would
    /// race our own cleanup.
    pub fn create(size: usize) -> Result<Self> {
        let name = format!(
            "{}{}-{}",
            SHM_PREFIX,
            std::process::id(),
            SHM_INDEX.fetch_add(1, Ordering::Relaxed)
        );
        let c_name = CString::new(name.clone()).unwrap();

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| OutpostError::ShmCreate {
            name: name.clone(),
            source: e.into(),
        })?;

        // Whatever happens below, the name must not linger in the namespace.
        let mapped = size_and_map(&fd, size);
        let unlinked = shm_unlink(c_name.as_c_str());

        let addr = mapped?;
        let segment = Self { fd, addr, size };
        unlinked.map_err(|e| OutpostError::ShmUnlink {
            name,
            source: e.into(),
        })?;
        Ok(segment)
    }

    /// Map a segment from a descriptor inherited from a supervisor
    ///
    /// The size is taken from the underlying object.
    ///
    /// # Safety
    /// `fd` must reference a shared memory object produced by [`create`]
    /// in the parent process.
    ///
    /// [`create`]: SharedSegment::create
    pub unsafe fn from_owned_fd(fd: OwnedFd) -> Result<Self> {
        let stat = fstat(&fd).map_err(|e| OutpostError::Stat(e.into()))?;
        let size = stat.st_size as usize;

        let addr = mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            &fd,
            0,
        )
        .map_err(|e| OutpostError::Mmap(e.into()))?;
        let addr = NonNull::new(addr.cast::<u8>()).expect("mmap returned null");

        Ok(Self { fd, addr, size })
    }

    /// Get raw pointer to the mapping
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Size of the mapping in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Numeric descriptor handed to the worker on its command line
    #[inline(always)]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Clear `FD_CLOEXEC` so the descriptor survives image replacement
    pub fn keep_across_exec(&self) -> Result<()> {
        let flags = fcntl_getfd(&self.fd).map_err(|e| OutpostError::DescriptorFlags(e.into()))?;
        fcntl_setfd(&self.fd, flags.difference(FdFlags::CLOEXEC))
            .map_err(|e| OutpostError::DescriptorFlags(e.into()))
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // The name is already gone; dropping the last mapping releases the
        // segment itself.
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}

fn size_and_map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    ftruncate(fd, size as u64).map_err(|e| OutpostError::Truncate(e.into()))?;

    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| OutpostError::Mmap(e.into()))?
    };
    let addr = NonNull::new(addr.cast::<u8>()).expect("mmap returned null");

    // ftruncate gives zero-filled pages, but the control block layout
    // depends on it, so don't take any chances.
    unsafe {
        std::ptr::write_bytes(addr.as_ptr(), 0, size);
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::BorrowedFd;

    #[test]
    fn test_create_and_write() {
        let segment = SharedSegment::create(4096).unwrap();
        assert_eq!(segment.size(), 4096);

        unsafe {
            std::ptr::write(segment.as_ptr(), 0xA5u8);
            assert_eq!(std::ptr::read(segment.as_ptr()), 0xA5u8);
        }
    }

    #[test]
    fn test_names_do_not_collide() {
        // Unlinked right after mapping, but EXCL creation would still fail
        // if the per-process counter handed out the same name twice while
        // both were linked.
        let a = SharedSegment::create(4096).unwrap();
        let b = SharedSegment::create(4096).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_attach_sees_creator_writes() {
        let segment = SharedSegment::create(8192).unwrap();
        unsafe {
            std::ptr::write(segment.as_ptr().add(100), 42u8);
        }

        let dup = unsafe { BorrowedFd::borrow_raw(segment.raw_fd()) }
            .try_clone_to_owned()
            .unwrap();
        let attached = unsafe { SharedSegment::from_owned_fd(dup).unwrap() };
        assert_eq!(attached.size(), 8192);
        assert_eq!(unsafe { std::ptr::read(attached.as_ptr().add(100)) }, 42);
    }

    #[test]
    fn test_keep_across_exec_clears_cloexec() {
        let segment = SharedSegment::create(4096).unwrap();
        segment.keep_across_exec().unwrap();
        let flags = fcntl_getfd(unsafe { BorrowedFd::borrow_raw(segment.raw_fd()) }).unwrap();
        assert!(!flags.contains(FdFlags::CLOEXEC));
    }
}
