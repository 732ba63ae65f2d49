//! Storage for global variables referenced by emitted code.
//!
//! Globals are laid out back to back in one growable byte arena. Emitted
//! code does not see real pointers into it: it gets the arena offset with
//! [`ARENA_TAG`] OR'd in, and anything that dereferences such an address
//! has to strip the tag with [`ArenaOffset::from_tagged`] first.

use std::collections::HashMap;

use log::debug;

use crate::error::JitError;
use crate::ir::{GlobalId, GlobalVariable};
use crate::target::{TargetData, ValueInit, align_to};

/// Bit pattern OR'd into every arena offset handed to emitted code.
pub const ARENA_TAG: u64 = 0xDA00_0000;

const OFFSET_BITS: u32 = 24;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Maximum number of bytes the arena can hold.
pub const ARENA_CAPACITY: usize = 1 << OFFSET_BITS;

/// Offset of a global inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaOffset(u32);

impl ArenaOffset {
    pub fn new(offset: usize) -> Option<Self> {
        if offset < ARENA_CAPACITY {
            Some(Self(offset as u32))
        } else {
            None
        }
    }

    pub fn offset(self) -> usize {
        self.0 as usize
    }

    /// The address emitted code uses for this slot.
    pub fn tagged(self) -> u64 {
        ARENA_TAG | self.0 as u64
    }

    /// Strip the tag from an address produced by [`ArenaOffset::tagged`].
    /// Returns `None` for addresses that do not carry the tag.
    pub fn from_tagged(addr: u64) -> Option<Self> {
        if addr & !OFFSET_MASK == ARENA_TAG {
            Some(Self((addr & OFFSET_MASK) as u32))
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct GlobalArena {
    bytes: Vec<u8>,
    slots: HashMap<GlobalId, ArenaOffset>,
}

impl GlobalArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes in use, including alignment padding.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn slot(&self, id: GlobalId) -> Option<ArenaOffset> {
        self.slots.get(&id).copied()
    }

    pub fn read(&self, offset: ArenaOffset, len: usize) -> Option<&[u8]> {
        self.bytes.get(offset.offset()..offset.offset().checked_add(len)?)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Slot of `global`, allocating and initializing it on first use.
    pub fn address_of<T: TargetData + ValueInit + ?Sized>(
        &mut self,
        global: &GlobalVariable,
        target: &T,
    ) -> Result<ArenaOffset, JitError> {
        if let Some(offset) = self.slot(global.id) {
            return Ok(offset);
        }
        if global.is_external() {
            return Err(JitError::ExternalGlobal(global.name.clone()));
        }

        let mut size = target.alloc_size(&global.ty);
        if let Some(init) = &global.init {
            size = size.max(target.alloc_size(&init.ty()));
        }
        let align = global
            .align
            .unwrap_or(1)
            .max(target.preferred_align(&global.ty))
            .max(1);

        let start = align_to(self.bytes.len(), align);
        let end = start
            .checked_add(size)
            .filter(|&end| end <= ARENA_CAPACITY)
            .ok_or_else(|| JitError::ArenaExhausted(global.name.clone()))?;
        let offset =
            ArenaOffset::new(start).ok_or_else(|| JitError::ArenaExhausted(global.name.clone()))?;

        let high_water = self.bytes.len();
        self.bytes.resize(end, 0);
        if !global.thread_local {
            if let Some(init) = &global.init {
                if let Err(err) = target.initialize_memory(init, &mut self.bytes[start..end]) {
                    self.bytes.truncate(high_water);
                    return Err(err);
                }
            }
        }

        debug!(
            "arena: '{}' -> {:#x} ({} bytes, align {})",
            global.name,
            offset.tagged(),
            size,
            align
        );
        self.slots.insert(global.id, offset);
        Ok(offset)
    }
}
