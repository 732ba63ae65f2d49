//! Constant pool and jump table layout.
//!
//! Both regions are placed at the front of a function buffer, before the
//! instructions. The constant pool is written immediately; jump table slots
//! are only reserved, because block addresses are unknown until the whole
//! function has been emitted. The resolver fills them later.
//!
//! All offsets here are relative to the start of the function buffer.

use log::trace;

use super::codebuf::CodeBuffer;
use super::locations::LocationTable;
use crate::error::JitError;
use crate::ir::{BlockId, ConstantPoolEntry, JumpTableInfo, JumpTableKind, PoolValue};
use crate::target::{Target, TargetData, ValueInit, align_to};

/// Reserved jump table region of one function.
#[derive(Debug, Clone, PartialEq)]
pub struct JumpTableLayout {
    pub kind: JumpTableKind,
    pub entry_size: usize,
    /// Offset of the first slot of the first table.
    pub base: usize,
    pub tables: Vec<Vec<BlockId>>,
}

impl JumpTableLayout {
    /// Offset of the first slot of table `index`.
    pub fn table_offset(&self, index: usize) -> Result<usize, JitError> {
        if index >= self.tables.len() {
            return Err(JitError::JumpTableIndex {
                index,
                len: self.tables.len(),
            });
        }
        let preceding: usize = self.tables[..index].iter().map(Vec::len).sum();
        Ok(self.base + preceding * self.entry_size)
    }

    pub fn num_entries(&self) -> usize {
        self.tables.iter().map(Vec::len).sum()
    }
}

/// Where the constant pool entries and jump tables of a function ended up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolLayout {
    pub constants: Vec<usize>,
    pub jump_tables: Option<JumpTableLayout>,
}

impl PoolLayout {
    pub fn constant_offset(&self, index: usize) -> Result<usize, JitError> {
        self.constants
            .get(index)
            .copied()
            .ok_or(JitError::ConstantPoolIndex {
                index,
                len: self.constants.len(),
            })
    }

    pub fn jump_table_offset(&self, index: usize) -> Result<usize, JitError> {
        match &self.jump_tables {
            Some(layout) => layout.table_offset(index),
            None => Err(JitError::JumpTableIndex { index, len: 0 }),
        }
    }
}

/// Total size and alignment of a constant pool.
pub fn constant_pool_size<T: TargetData + ?Sized>(
    target: &T,
    pool: &[ConstantPoolEntry],
) -> (usize, usize) {
    let mut size = 0;
    let mut align = 1;
    for entry in pool {
        let entry_align = entry.align.max(1);
        size = align_to(size, entry_align).saturating_add(target.alloc_size(&entry.ty()));
        align = align.max(entry_align);
    }
    (size, align)
}

/// Allocate and fill the constant pool, returning each entry's offset.
///
/// Returns an empty list if the buffer ran out of space; the caller sees
/// the overflow when it finalizes.
pub fn emit_constant_pool<T: TargetData + ValueInit + ?Sized>(
    target: &T,
    pool: &[ConstantPoolEntry],
    buf: &mut CodeBuffer,
) -> Result<Vec<usize>, JitError> {
    if let Some(index) = pool
        .iter()
        .position(|e| matches!(e.value, PoolValue::Machine(_)))
    {
        return Err(JitError::MachineConstantPoolEntry { index });
    }
    if pool.is_empty() {
        return Ok(Vec::new());
    }

    let (size, align) = constant_pool_size(target, pool);
    let Some(start) = buf.allocate_space(size, align) else {
        return Ok(Vec::new());
    };
    trace!("constant pool: {} entries, {} bytes @ {}", pool.len(), size, start);

    let mut offsets = Vec::with_capacity(pool.len());
    let mut offset = 0;
    for entry in pool {
        offset = align_to(offset, entry.align.max(1));
        let at = start + offset;
        let len = target.alloc_size(&entry.ty());
        if let (PoolValue::Constant(value), Some(dest)) = (&entry.value, buf.slice_mut(at, len)) {
            target.initialize_memory(value, dest)?;
        }
        offsets.push(at);
        offset += len;
    }
    Ok(offsets)
}

/// Reserve slots for every jump table of the function without filling them.
///
/// Returns `None` when there is nothing to reserve: no tables, inline
/// tables, targets that lay out tables themselves, or an overflowed buffer.
pub fn reserve_jump_tables<T: Target>(
    target: &T,
    info: Option<&JumpTableInfo>,
    buf: &mut CodeBuffer,
) -> Result<Option<JumpTableLayout>, JitError> {
    let Some(info) = info else {
        return Ok(None);
    };
    if info.tables.is_empty()
        || info.kind == JumpTableKind::Inline
        || target.has_custom_jump_tables()
    {
        return Ok(None);
    }
    if info.kind == JumpTableKind::GpRel64BlockAddress {
        return Err(JitError::UnsupportedJumpTable(info.kind));
    }

    let entry_size = target.jump_table_entry_size(info.kind);
    let size = info.num_entries() * entry_size;
    let align = target.jump_table_entry_align(info.kind);
    let base = if size == 0 {
        align_to(buf.offset(), align)
    } else {
        match buf.allocate_space(size, align) {
            Some(base) => base,
            None => return Ok(None),
        }
    };
    trace!("jump tables: {} slots, {} bytes @ {}", info.num_entries(), size, base);

    Ok(Some(JumpTableLayout {
        kind: info.kind,
        entry_size,
        base,
        tables: info.tables.iter().map(|t| t.targets.clone()).collect(),
    }))
}

/// Write the final contents of every reserved jump table slot.
///
/// `code` is the whole function buffer mapped at `base_address`, and every
/// target block must have been recorded in `locations`.
pub fn fill_jump_tables<T: Target>(
    target: &T,
    layout: &JumpTableLayout,
    code: &mut [u8],
    base_address: u64,
    locations: &LocationTable,
    function: &str,
) -> Result<(), JitError> {
    if target.has_custom_jump_tables() {
        return Ok(());
    }

    let block_address = |block: BlockId| {
        locations
            .block_offset(block)
            .map(|off| base_address + off as u64)
            .ok_or_else(|| JitError::BlockNotEmitted {
                function: function.to_string(),
                block,
            })
    };

    match layout.kind {
        JumpTableKind::Inline => Ok(()),
        JumpTableKind::GpRel64BlockAddress => Err(JitError::UnsupportedJumpTable(layout.kind)),
        JumpTableKind::BlockAddress => {
            let pointer_size = target.pointer_size();
            if layout.entry_size != pointer_size {
                return Err(JitError::JumpTableEntrySize {
                    expected: pointer_size,
                    actual: layout.entry_size,
                });
            }
            let mut slot = layout.base;
            for &block in layout.tables.iter().flatten() {
                let addr = block_address(block)?;
                write_slot(code, slot, &addr.to_le_bytes()[..pointer_size])?;
                slot += pointer_size;
            }
            Ok(())
        }
        JumpTableKind::GpRel32BlockAddress
        | JumpTableKind::LabelDifference32
        | JumpTableKind::Custom32 => {
            for (index, table) in layout.tables.iter().enumerate() {
                let table_offset = layout.table_offset(index)?;
                let table_base = base_address + table_offset as u64;
                for (i, &block) in table.iter().enumerate() {
                    let entry = target.pic_jump_table_entry(block_address(block)?, table_base);
                    write_slot(code, table_offset + i * 4, &entry.to_le_bytes())?;
                }
            }
            Ok(())
        }
    }
}

fn write_slot(code: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), JitError> {
    code.get_mut(offset..offset + bytes.len())
        .ok_or(JitError::RelocationOutOfBounds { offset })?
        .copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, JumpTable, Type};
    use crate::target::x86_64::X86_64;

    fn tables(kind: JumpTableKind, tables: Vec<Vec<u32>>) -> JumpTableInfo {
        JumpTableInfo {
            kind,
            tables: tables
                .into_iter()
                .map(|t| JumpTable {
                    targets: t.into_iter().map(BlockId).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_constant_pool_size() {
        let target = X86_64::new();
        let pool = vec![
            ConstantPoolEntry::new(Constant::int(Type::I8, 1), 1),
            ConstantPoolEntry::new(Constant::F64(2.0), 8),
            ConstantPoolEntry::new(Constant::i32(3), 16),
        ];
        // i8 @ 0, f64 @ 8, i32 @ 16
        assert_eq!(constant_pool_size(&target, &pool), (20, 16));
    }

    #[test]
    fn test_emit_constant_pool() {
        let target = X86_64::new();
        let mut buf = CodeBuffer::with_capacity(4096).unwrap();
        let pool = vec![
            ConstantPoolEntry::new(Constant::i32(-7), 4),
            ConstantPoolEntry::new(Constant::F64(0.25), 8),
        ];
        let offsets = emit_constant_pool(&target, &pool, &mut buf).unwrap();
        assert_eq!(offsets, vec![0, 8]);
        assert_eq!(&buf.code()[0..4], &(-7i32).to_le_bytes());
        assert_eq!(&buf.code()[8..16], &0.25f64.to_le_bytes());
    }

    #[test]
    fn test_machine_entry_rejected() {
        let target = X86_64::new();
        let mut buf = CodeBuffer::with_capacity(4096).unwrap();
        let pool = vec![
            ConstantPoolEntry::new(Constant::i32(1), 4),
            ConstantPoolEntry::machine(vec![1, 2, 3, 4], 4),
        ];
        let err = emit_constant_pool(&target, &pool, &mut buf).unwrap_err();
        assert!(matches!(err, JitError::MachineConstantPoolEntry { index: 1 }));
        assert_eq!(buf.offset(), 0);
    }

    #[test]
    fn test_table_offsets() {
        let target = X86_64::new();
        let mut buf = CodeBuffer::with_capacity(4096).unwrap();
        buf.emit_u8(0);
        let info = tables(JumpTableKind::BlockAddress, vec![vec![0, 1, 2], vec![3]]);
        let layout = reserve_jump_tables(&target, Some(&info), &mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(layout.base, 8);
        assert_eq!(layout.table_offset(0).unwrap(), 8);
        assert_eq!(layout.table_offset(1).unwrap(), 32);
        assert_eq!(buf.offset(), 40);
        assert!(matches!(
            layout.table_offset(2),
            Err(JitError::JumpTableIndex { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_gprel64_rejected() {
        let target = X86_64::new();
        let mut buf = CodeBuffer::with_capacity(4096).unwrap();
        let info = tables(JumpTableKind::GpRel64BlockAddress, vec![vec![0]]);
        assert!(matches!(
            reserve_jump_tables(&target, Some(&info), &mut buf),
            Err(JitError::UnsupportedJumpTable(JumpTableKind::GpRel64BlockAddress))
        ));
    }

    #[test]
    fn test_inline_tables_reserve_nothing() {
        let target = X86_64::new();
        let mut buf = CodeBuffer::with_capacity(4096).unwrap();
        let info = tables(JumpTableKind::Inline, vec![vec![0, 1]]);
        assert!(reserve_jump_tables(&target, Some(&info), &mut buf).unwrap().is_none());
        assert_eq!(buf.offset(), 0);
    }

    #[test]
    fn test_fill_block_address_tables() {
        let target = X86_64::new();
        let layout = JumpTableLayout {
            kind: JumpTableKind::BlockAddress,
            entry_size: 8,
            base: 0,
            tables: vec![vec![BlockId(1), BlockId(0)]],
        };
        let mut locations = LocationTable::new();
        locations.record_block(BlockId(0), 16).unwrap();
        locations.record_block(BlockId(1), 40).unwrap();

        let mut code = vec![0u8; 64];
        fill_jump_tables(&target, &layout, &mut code, 0x1000, &locations, "f").unwrap();
        assert_eq!(&code[0..8], &0x1028u64.to_le_bytes());
        assert_eq!(&code[8..16], &0x1010u64.to_le_bytes());
    }

    #[test]
    fn test_fill_relative_tables() {
        let target = X86_64::new();
        let layout = JumpTableLayout {
            kind: JumpTableKind::LabelDifference32,
            entry_size: 4,
            base: 0,
            tables: vec![vec![BlockId(0)], vec![BlockId(0), BlockId(1)]],
        };
        let mut locations = LocationTable::new();
        locations.record_block(BlockId(0), 16).unwrap();
        locations.record_block(BlockId(1), 20).unwrap();

        let mut code = vec![0u8; 32];
        fill_jump_tables(&target, &layout, &mut code, 0x1000, &locations, "f").unwrap();
        // second table starts at offset 4
        assert_eq!(&code[0..4], &16i32.to_le_bytes());
        assert_eq!(&code[4..8], &12i32.to_le_bytes());
        assert_eq!(&code[8..12], &16i32.to_le_bytes());
    }

    #[test]
    fn test_fill_requires_emitted_blocks() {
        let target = X86_64::new();
        let layout = JumpTableLayout {
            kind: JumpTableKind::BlockAddress,
            entry_size: 8,
            base: 0,
            tables: vec![vec![BlockId(3)]],
        };
        let mut code = vec![0u8; 8];
        let err = fill_jump_tables(&target, &layout, &mut code, 0, &LocationTable::new(), "g")
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }
}
