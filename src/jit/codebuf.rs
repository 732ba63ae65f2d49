//! Fixed-capacity code buffer with a forward-only cursor.
//!
//! The buffer never grows. A write that does not fit is dropped and the
//! buffer is marked overflowed; from then on every write is ignored. The
//! emitter notices the overflow when it finalizes the function and retries
//! with a bigger buffer.

use log::trace;

use super::memory::{ExecutableMemory, MemoryError};
use crate::target::align_to;

pub struct CodeBuffer {
    memory: ExecutableMemory,
    cursor: usize,
    overflowed: bool,
}

impl CodeBuffer {
    pub fn new(memory: ExecutableMemory) -> Self {
        Self {
            memory,
            cursor: 0,
            overflowed: false,
        }
    }

    /// Map a fresh block of at least `size` bytes.
    pub fn with_capacity(size: usize) -> Result<Self, MemoryError> {
        Ok(Self::new(ExecutableMemory::new(size)?))
    }

    pub fn capacity(&self) -> usize {
        self.memory.size()
    }

    /// Current offset from the start of the buffer.
    pub fn offset(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.cursor
    }

    pub fn base_address(&self) -> u64 {
        self.memory.address()
    }

    pub fn current_address(&self) -> u64 {
        self.base_address() + self.cursor as u64
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    /// True if the buffer has to be considered too small: either a write was
    /// dropped or the cursor sits exactly at the end.
    pub fn is_exhausted(&self) -> bool {
        self.overflowed || self.cursor == self.capacity()
    }

    fn put(&mut self, bytes: &[u8]) {
        if self.overflowed {
            return;
        }
        if bytes.len() > self.remaining() {
            trace!(
                "CodeBuffer: overflow writing {} bytes @ {}",
                bytes.len(),
                self.cursor
            );
            self.overflowed = true;
            return;
        }
        let start = self.cursor;
        match self.memory.bytes_mut() {
            Ok(dest) => {
                dest[start..start + bytes.len()].copy_from_slice(bytes);
                self.cursor += bytes.len();
            }
            Err(_) => self.overflowed = true,
        }
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.put(&[byte]);
    }

    /// Emit a 16-bit value (little-endian).
    pub fn emit_u16(&mut self, value: u16) {
        self.put(&value.to_le_bytes());
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    /// Emit a 64-bit value (little-endian).
    pub fn emit_u64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.put(bytes);
    }

    /// Pad with zeros up to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        if self.overflowed {
            return;
        }
        let aligned = align_to(self.cursor, alignment);
        if aligned > self.capacity() {
            self.overflowed = true;
            return;
        }
        if let Ok(dest) = self.memory.bytes_mut() {
            dest[self.cursor..aligned].fill(0);
        }
        self.cursor = aligned;
    }

    /// Reserve `size` bytes at `alignment`, returning their offset.
    ///
    /// Returns `None` if the block would reach the end of the buffer. The
    /// buffer is then marked overflowed and the cursor is left where it was.
    pub fn allocate_space(&mut self, size: usize, alignment: usize) -> Option<usize> {
        if self.overflowed {
            return None;
        }
        let saved = self.cursor;
        self.align(alignment);
        if self.overflowed || size >= self.remaining() {
            self.cursor = saved;
            self.overflowed = true;
            return None;
        }
        let offset = self.cursor;
        self.cursor += size;
        Some(offset)
    }

    /// Mutable view of `len` bytes at `offset`, for filling reserved space.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let end = offset.checked_add(len)?;
        if end > self.cursor {
            return None;
        }
        self.memory.bytes_mut().ok().map(|b| &mut b[offset..end])
    }

    /// Bytes written so far.
    pub fn code(&self) -> &[u8] {
        &self.memory.bytes()[..self.cursor]
    }

    pub fn into_memory(self) -> ExecutableMemory {
        self.memory
    }
}
