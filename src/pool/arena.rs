//! Backing memory of a pool: one contiguous, aligned allocation sliced into
//! fixed-stride descriptor slots.

use std::alloc::{self, Layout};
use std::io::{self, ErrorKind};
use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::errors::{Error, Result};

pub(crate) struct Arena {
    ptr: NonNull<u8>,
    layout: Layout,
    stride: usize,
    pinned: bool,
}

// The arena is a plain block of bytes; access to each data room is
// serialized by the reference count of the descriptor that owns it.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub(crate) fn new(slots: usize, stride: usize, align: usize, pin: bool) -> Result<Self> {
        let invalid = || Error::Generic(io::Error::new(ErrorKind::InvalidInput, "Invalid layout"));
        let size = slots.checked_mul(stride).ok_or_else(invalid)?;
        let layout = Layout::from_size_align(size, align).map_err(|_| invalid())?;
        if layout.size() == 0 {
            return Err(Error::NoMemory);
        }

        // SAFETY: layout's size is greater than 0
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::NoMemory)?;

        let mut arena = Arena {
            ptr,
            layout,
            stride,
            pinned: false,
        };
        if pin {
            arena.pin();
        }
        Ok(arena)
    }

    fn pin(&mut self) {
        let addr = self.ptr.as_ptr() as *const libc::c_void;
        let ret = unsafe { libc::mlock(addr, self.layout.size()) };
        if ret == 0 {
            self.pinned = true;
            debug!(bytes = self.layout.size(), "mempool arena pinned");
        } else {
            warn!(
                bytes = self.layout.size(),
                error = %io::Error::last_os_error(),
                "cannot pin mempool arena, continuing unpinned"
            );
        }
    }

    /// Start of slot `index`.
    #[inline]
    pub(crate) fn slot(&self, index: usize) -> *mut u8 {
        debug_assert!((index + 1) * self.stride <= self.layout.size());
        unsafe { self.ptr.as_ptr().add(index * self.stride) }
    }

    pub(crate) fn contains(&self, addr: *const u8) -> bool {
        let start = self.ptr.as_ptr() as usize;
        (start..start + self.layout.size()).contains(&(addr as usize))
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            if self.pinned {
                libc::munlock(self.ptr.as_ptr() as *const libc::c_void, self.layout.size());
            }
            alloc::dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}
