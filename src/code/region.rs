//! Page regions that move one way: writable, then executable.
//!
//! `WritableRegion` -> `ExecutableRegion` -> `EntryPoint`
//!
//! Each step consumes or borrows the previous state, so a region is never
//! writable and executable at once, and the only way to obtain something
//! callable is through `make_executable`. Both region types release their
//! pages on drop.

use std::ffi::{c_char, c_int};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ptr::NonNull;

use tracing::debug;

use crate::error::{Error, Result, fail};
use crate::platform;

/// Calling convention of loaded code: `int entry(int argc, char **argv)`.
pub type EntryFn = unsafe extern "C" fn(c_int, *const *const c_char) -> c_int;

/// Anonymous read+write pages awaiting code.
pub struct WritableRegion {
    ptr: NonNull<u8>,
    len: usize,
    mapped: usize,
}

// The region exclusively owns its mapping.
unsafe impl Send for WritableRegion {}

impl WritableRegion {
    /// Map at least `size` bytes of read+write memory (rounded up to pages).
    pub fn allocate(size: usize) -> Result<Self> {
        if size == 0 {
            return fail(Error::EmptyInput("zero-sized code region"));
        }
        let Some(mapped) = platform::page_align(size) else {
            return fail(Error::Alloc(io::Error::from(io::ErrorKind::OutOfMemory)));
        };

        let ptr = match platform::alloc_writable(mapped) {
            Ok(ptr) => ptr,
            Err(e) => return fail(Error::Alloc(e)),
        };
        debug!("Mapped {} bytes RW for {} bytes of code", mapped, size);

        Ok(Self {
            ptr,
            len: size,
            mapped,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the mapping is live, writable and at least `len` bytes long.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Flip the pages to read+execute and flush the instruction cache.
    ///
    /// On failure the pages are released.
    pub fn make_executable(self) -> Result<ExecutableRegion> {
        let this = ManuallyDrop::new(self);
        let (ptr, len, mapped) = (this.ptr, this.len, this.mapped);

        // SAFETY: ptr/mapped come from alloc_writable and are still mapped.
        unsafe {
            if let Err(e) = platform::protect_exec(ptr, mapped) {
                platform::release(ptr, mapped);
                return fail(Error::Protect(e));
            }
            platform::flush_icache(ptr, mapped);
        }
        debug!("Sealed {} bytes RX at {:p}", mapped, ptr);

        Ok(ExecutableRegion { ptr, len, mapped })
    }
}

impl Drop for WritableRegion {
    fn drop(&mut self) {
        // SAFETY: we own the mapping and no borrow outlives self.
        unsafe { platform::release(self.ptr, self.mapped) };
    }
}

impl fmt::Debug for WritableRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Read+execute pages holding loaded code.
pub struct ExecutableRegion {
    ptr: NonNull<u8>,
    len: usize,
    mapped: usize,
}

// Exclusively owned and never written after sealing.
unsafe impl Send for ExecutableRegion {}
unsafe impl Sync for ExecutableRegion {}

impl ExecutableRegion {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The loaded code bytes (pages stay readable).
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the mapping is live, readable and at least `len` bytes long.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn entry(&self) -> EntryPoint<'_> {
        EntryPoint {
            ptr: self.ptr,
            _region: PhantomData,
        }
    }
}

impl Drop for ExecutableRegion {
    fn drop(&mut self) {
        // SAFETY: we own the mapping; EntryPoint borrows prevent use after drop.
        unsafe { platform::release(self.ptr, self.mapped) };
    }
}

impl fmt::Debug for ExecutableRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Callable start of an [`ExecutableRegion`], valid while the region lives.
#[derive(Clone, Copy)]
pub struct EntryPoint<'a> {
    ptr: NonNull<u8>,
    _region: PhantomData<&'a ExecutableRegion>,
}

impl EntryPoint<'_> {
    /// Jump into the region.
    ///
    /// # Safety
    /// The region must hold machine code for the host architecture that
    /// follows the C ABI for [`EntryFn`] and returns. `argv` must point to
    /// `argc` C strings followed by a null pointer.
    pub unsafe fn invoke(&self, argc: c_int, argv: *const *const c_char) -> c_int {
        // SAFETY: the pointer addresses live RX pages; the caller vouches for
        // the code behind it.
        let entry = unsafe { mem::transmute::<*mut u8, EntryFn>(self.ptr.as_ptr()) };
        unsafe { entry(argc, argv) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_is_rejected() {
        assert!(matches!(WritableRegion::allocate(0), Err(Error::EmptyInput(_))));
    }

    #[test]
    fn huge_size_fails_cleanly() {
        assert!(matches!(
            WritableRegion::allocate(usize::MAX),
            Err(Error::Alloc(_))
        ));
    }

    #[test]
    fn bytes_survive_sealing() {
        let mut region = WritableRegion::allocate(4).unwrap();
        region.as_mut_slice().copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let sealed = region.make_executable().unwrap();
        assert_eq!(sealed.len(), 4);
        assert_eq!(sealed.as_bytes(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[cfg(all(target_arch = "x86_64", any(unix, windows)))]
    #[test]
    fn entry_point_returns_immediate() {
        // mov eax, 7; ret
        let code = [0xB8, 0x07, 0x00, 0x00, 0x00, 0xC3];
        let mut region = WritableRegion::allocate(code.len()).unwrap();
        region.as_mut_slice().copy_from_slice(&code);
        let sealed = region.make_executable().unwrap();

        let argv = [std::ptr::null::<c_char>()];
        let result = unsafe { sealed.entry().invoke(0, argv.as_ptr()) };
        assert_eq!(result, 7);
    }
}
