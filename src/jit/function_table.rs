//! Committed functions, keyed by function id.
//!
//! A record owns the buffer its function was emitted into, together with
//! everything the resolver needs later: the relocation log, block and label
//! locations, and the constant pool / jump table layout. Records are kept in
//! id order so that resolution walks functions deterministically.

use std::collections::BTreeMap;

use super::layout::PoolLayout;
use super::locations::LocationTable;
use super::memory::{ExecutableMemory, MemoryError};
use super::reloc::MachineRelocation;
use crate::error::JitError;
use crate::ir::{BlockId, FuncId, LabelId, SourceLoc};

/// One emitted function.
#[derive(Debug)]
pub struct FunctionRecord<K> {
    pub id: FuncId,
    pub name: String,
    pub(crate) memory: ExecutableMemory,
    /// Offset of the first instruction in the buffer.
    pub code_offset: usize,
    /// Bytes of instructions, excluding the constant pool and jump tables.
    pub size: usize,
    pub relocations: Vec<MachineRelocation<K>>,
    pub locations: LocationTable,
    pub layout: PoolLayout,
    /// Buffer offset and source position of each debug location marker.
    pub debug_locs: Vec<(usize, SourceLoc)>,
    pub resolved: bool,
}

impl<K> FunctionRecord<K> {
    pub fn base_address(&self) -> u64 {
        self.memory.address()
    }

    /// Entry address of the function.
    pub fn code_address(&self) -> u64 {
        self.base_address() + self.code_offset as u64
    }

    /// Whole buffer, including the constant pool and jump tables.
    pub fn buffer(&self) -> &[u8] {
        &self.memory.bytes()[..self.code_offset + self.size]
    }

    /// Instruction bytes only.
    pub fn code(&self) -> &[u8] {
        &self.memory.bytes()[self.code_offset..self.code_offset + self.size]
    }

    pub fn block_offset(&self, block: BlockId) -> Result<usize, JitError> {
        self.locations
            .block_offset(block)
            .ok_or_else(|| JitError::BlockNotEmitted {
                function: self.name.clone(),
                block,
            })
    }

    pub fn block_address(&self, block: BlockId) -> Result<u64, JitError> {
        Ok(self.base_address() + self.block_offset(block)? as u64)
    }

    pub fn label_address(&self, label: LabelId) -> Result<u64, JitError> {
        self.locations
            .label_offset(label)
            .map(|off| self.base_address() + off as u64)
            .ok_or_else(|| JitError::LabelNotEmitted {
                function: self.name.clone(),
                label,
            })
    }

    pub fn constant_address(&self, index: usize) -> Result<u64, JitError> {
        Ok(self.base_address() + self.layout.constant_offset(index)? as u64)
    }

    pub fn jump_table_address(&self, index: usize) -> Result<u64, JitError> {
        Ok(self.base_address() + self.layout.jump_table_offset(index)? as u64)
    }

    /// Flip the buffer to read/execute. No patching is possible afterwards.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        self.memory.make_executable()
    }

    pub fn is_executable(&self) -> bool {
        self.memory.is_executable()
    }

    /// Entry point as a function pointer of type `F`.
    ///
    /// # Safety
    /// The record must be resolved and executable, and `F` must match the
    /// signature of the emitted code.
    pub unsafe fn entry_point<F: Copy>(&self) -> F {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
        let addr = self.code_address() as usize;
        unsafe { std::mem::transmute_copy(&addr) }
    }
}

/// Function id to committed record.
#[derive(Debug)]
pub struct FunctionTable<K> {
    records: BTreeMap<FuncId, FunctionRecord<K>>,
}

impl<K> Default for FunctionTable<K> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }
}

impl<K> FunctionTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, returning the one it replaces.
    pub fn insert(&mut self, record: FunctionRecord<K>) -> Option<FunctionRecord<K>> {
        self.records.insert(record.id, record)
    }

    pub fn get(&self, id: FuncId) -> Option<&FunctionRecord<K>> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: FuncId) -> Option<&mut FunctionRecord<K>> {
        self.records.get_mut(&id)
    }

    pub fn remove(&mut self, id: FuncId) -> Option<FunctionRecord<K>> {
        self.records.remove(&id)
    }

    pub fn contains(&self, id: FuncId) -> bool {
        self.records.contains_key(&id)
    }

    /// Entry address of a committed function.
    pub fn code_address(&self, id: FuncId) -> Option<u64> {
        self.records.get(&id).map(FunctionRecord::code_address)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.records.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionRecord<K>> {
        self.records.values()
    }
}
