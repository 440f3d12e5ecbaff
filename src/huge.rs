//! Zero-filled anonymous memory advised for huge-page backing.
//!
//! Large sequential scans touch one TLB entry per page; backing the element
//! stream with 2 MiB pages keeps translation misses out of the measurement.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use crate::Result;

/// Transparent huge page size on x86_64 and most aarch64 kernels.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// An owned, zero-initialized `[i8]` living in its own anonymous mapping.
pub struct HugeBuffer {
    ptr: NonNull<i8>,
    len: usize,
}

// The buffer exclusively owns its mapping.
unsafe impl Send for HugeBuffer {}
unsafe impl Sync for HugeBuffer {}

impl HugeBuffer {
    /// Maps `len` zeroed bytes and asks the kernel to back them with huge
    /// pages. The hint is best-effort; only a refused mapping is an error.
    pub fn zeroed(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len,
            });
        }

        let ptr = sys::map(len)?;
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for HugeBuffer {
    type Target = [i8];

    fn deref(&self) -> &[i8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for HugeBuffer {
    fn deref_mut(&mut self) -> &mut [i8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HugeBuffer {
    fn drop(&mut self) {
        if self.len != 0 {
            unsafe { sys::unmap(self.ptr, self.len) }
        }
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use std::io;
    use std::ptr::{self, NonNull};

    use tracing::debug;

    use crate::{Error, Result};

    pub(super) fn map(len: usize) -> Result<NonNull<i8>> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::Alloc {
                size: len,
                source: io::Error::last_os_error(),
            });
        }

        if unsafe { libc::madvise(addr, len, libc::MADV_HUGEPAGE) } != 0 {
            debug!(
                len,
                error = %io::Error::last_os_error(),
                "madvise(MADV_HUGEPAGE) rejected, continuing with base pages"
            );
        }

        NonNull::new(addr.cast::<i8>()).ok_or_else(|| Error::Alloc {
            size: len,
            source: io::Error::other("mmap returned null"),
        })
    }

    pub(super) unsafe fn unmap(ptr: NonNull<i8>, len: usize) {
        libc::munmap(ptr.as_ptr().cast(), len);
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::alloc::{self, Layout};
    use std::io;
    use std::ptr::NonNull;

    use super::HUGE_PAGE_SIZE;
    use crate::{Error, Result};

    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len, HUGE_PAGE_SIZE).map_err(|err| Error::Alloc {
            size: len,
            source: io::Error::other(err),
        })
    }

    pub(super) fn map(len: usize) -> Result<NonNull<i8>> {
        let layout = layout(len)?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(ptr.cast::<i8>()).ok_or_else(|| Error::Alloc {
            size: len,
            source: io::ErrorKind::OutOfMemory.into(),
        })
    }

    pub(super) unsafe fn unmap(ptr: NonNull<i8>, len: usize) {
        if let Ok(layout) = layout(len) {
            alloc::dealloc(ptr.as_ptr().cast(), layout);
        }
    }
}
