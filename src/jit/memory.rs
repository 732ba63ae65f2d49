//! Page-granular blocks of executable memory, allocated with mmap.
//!
//! A block starts out readable and writable. Emitted code is written and
//! patched in place, then the host calls `make_executable()` before jumping
//! into it.

use log::trace;
use std::ptr::NonNull;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
}

/// A block of memory that can be made executable.
///
/// The size is always a multiple of the page size; the block is unmapped on
/// drop.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Allocate a writable block of at least `size` bytes, zero filled.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = size
            .checked_add(page_size - 1)
            .ok_or(MemoryError::InvalidSize)?
            & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size)?;
        trace!("mapped {} bytes at {:p}", aligned_size, ptr.as_ptr());

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    pub fn page_size() -> usize {
        #[cfg(unix)]
        {
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Plain heap pages; code placed here can be inspected but not run.
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Address of the first byte, as seen by emitted code.
    pub fn address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is at least readable for `size` bytes while self lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Mutable view of the block. Fails once the block is executable.
    pub fn bytes_mut(&mut self) -> Result<&mut [u8], MemoryError> {
        if self.executable {
            return Err(MemoryError::ProtectionFailed);
        }
        // SAFETY: the mapping is writable until make_executable, and &mut self
        // guarantees exclusive access.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) })
    }

    /// Write bytes at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        let end = offset.checked_add(data.len()).ok_or(MemoryError::InvalidSize)?;
        if end > self.size {
            return Err(MemoryError::InvalidSize);
        }
        self.bytes_mut()?[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Make the memory executable (and read-only).
    #[cfg(unix)]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };

        if result != 0 {
            return Err(MemoryError::ProtectionFailed);
        }

        self.executable = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        self.executable = true;
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("executable", &self.executable)
            .finish()
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        trace!("unmapping {} bytes at {:p}", self.size, self.ptr.as_ptr());
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
                unsafe {
                    std::alloc::dealloc(self.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// The block is exclusively owned; nothing else holds the mapping.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_page() {
        let mem = ExecutableMemory::new(100).unwrap();
        assert_eq!(mem.size() % ExecutableMemory::page_size(), 0);
        assert!(mem.size() >= 100);
        assert!(!mem.is_executable());
        assert!(mem.bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(
            ExecutableMemory::new(0),
            Err(MemoryError::InvalidSize)
        ));
    }

    #[test]
    fn test_write_memory() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.write(8, &[0x90, 0x90, 0xC3]).unwrap();
        assert_eq!(&mem.bytes()[8..11], &[0x90, 0x90, 0xC3]);
        assert!(mem.write(mem.size() - 1, &[0, 0]).is_err());
    }

    #[test]
    fn test_cannot_write_after_executable() {
        let mut mem = ExecutableMemory::new(4096).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.is_executable());
        assert!(mem.write(0, &[0x90]).is_err());
        assert!(mem.bytes_mut().is_err());
    }
}
