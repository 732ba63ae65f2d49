//! Target capabilities the emitter depends on.
//!
//! The emitter never encodes instructions or patches bytes itself. It asks a
//! [`Target`] for three things:
//! - data layout ([`TargetData`]): sizes and alignments of types and of jump
//!   table entries,
//! - value initialization ([`ValueInit`]): the bit pattern of a constant,
//! - JIT hooks ([`TargetJitInfo`]): instruction emission and relocation
//!   patching.

pub mod x86_64;

use std::fmt;

use crate::error::JitError;
use crate::ir::{Constant, JumpTableKind, Type};
use crate::jit::{FunctionEmitter, MachineRelocation};

/// Round `value` up to a multiple of `align` (a power of two, or 0/1).
/// Saturates at `usize::MAX`.
pub fn align_to(value: usize, align: usize) -> usize {
    if align <= 1 {
        return value;
    }
    match value.checked_add(align - 1) {
        Some(v) => v & !(align - 1),
        None => usize::MAX,
    }
}

pub trait TargetData {
    fn pointer_size(&self) -> usize;

    /// Number of bytes written when storing a value of `ty`.
    fn store_size(&self, ty: &Type) -> usize;

    fn abi_align(&self, ty: &Type) -> usize;

    fn preferred_align(&self, ty: &Type) -> usize {
        self.abi_align(ty)
    }

    /// Distance between consecutive values of `ty` in memory.
    fn alloc_size(&self, ty: &Type) -> usize {
        align_to(self.store_size(ty), self.abi_align(ty))
    }

    fn struct_field_offsets(&self, fields: &[Type]) -> Vec<usize> {
        let mut offset = 0;
        fields
            .iter()
            .map(|field| {
                offset = align_to(offset, self.abi_align(field));
                let start = offset;
                offset += self.alloc_size(field);
                start
            })
            .collect()
    }

    fn jump_table_entry_size(&self, kind: JumpTableKind) -> usize {
        match kind {
            JumpTableKind::BlockAddress => self.pointer_size(),
            JumpTableKind::GpRel64BlockAddress => 8,
            JumpTableKind::GpRel32BlockAddress
            | JumpTableKind::LabelDifference32
            | JumpTableKind::Custom32 => 4,
            JumpTableKind::Inline => 0,
        }
    }

    fn jump_table_entry_align(&self, kind: JumpTableKind) -> usize {
        self.jump_table_entry_size(kind).max(1)
    }
}

/// Writes the bit pattern of a constant into memory.
pub trait ValueInit {
    /// `dest` starts at the value and is at least its alloc size long.
    fn initialize_memory(&self, value: &Constant, dest: &mut [u8]) -> Result<(), JitError>;
}

/// Target hooks used while emitting and relocating code.
pub trait TargetJitInfo {
    /// Target instruction as produced by instruction selection.
    type Inst;
    /// How a resolved address is encoded into the instruction bytes.
    type RelocKind: Copy + fmt::Debug;

    /// Encode one instruction, recording relocations, labels and debug
    /// locations through `cx`.
    fn emit_inst(
        &self,
        inst: &Self::Inst,
        cx: &mut FunctionEmitter<Self::RelocKind>,
    ) -> Result<(), JitError>;

    /// Patch resolved addresses into `code`, the whole function buffer
    /// mapped at `base`. Entries marked `let_target_resolve` arrive without a
    /// result; the target fills `result` for those it handles and returns
    /// `UnhandledRelocation` for the rest.
    fn relocate(
        &self,
        code: &mut [u8],
        base: u64,
        relocs: &mut [MachineRelocation<Self::RelocKind>],
    ) -> Result<(), JitError>;

    /// Targets that lay out jump tables themselves return true.
    fn has_custom_jump_tables(&self) -> bool {
        false
    }

    /// Entry stored in a 32-bit jump table slot for `block_addr`.
    fn pic_jump_table_entry(&self, block_addr: u64, table_base: u64) -> i32 {
        block_addr.wrapping_sub(table_base) as i64 as i32
    }
}

pub trait Target: TargetData + ValueInit + TargetJitInfo {}

impl<T: TargetData + ValueInit + TargetJitInfo> Target for T {}

/// Little-endian layout with naturally aligned scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLayout {
    pointer_size: usize,
}

impl DataLayout {
    pub const fn new(pointer_size: usize) -> Self {
        Self { pointer_size }
    }

    pub const fn host() -> Self {
        Self::new(std::mem::size_of::<usize>())
    }

    fn struct_size(&self, fields: &[Type]) -> usize {
        let end = match (fields.last(), self.struct_field_offsets(fields).last()) {
            (Some(last), Some(&offset)) => offset + self.alloc_size(last),
            _ => 0,
        };
        let align = fields.iter().map(|f| self.abi_align(f)).max().unwrap_or(1);
        align_to(end, align)
    }
}

impl Default for DataLayout {
    fn default() -> Self {
        Self::host()
    }
}

impl TargetData for DataLayout {
    fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    fn store_size(&self, ty: &Type) -> usize {
        match ty {
            Type::I1 | Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 | Type::F32 => 4,
            Type::I64 | Type::F64 => 8,
            Type::Ptr => self.pointer_size,
            Type::Array { elem, len } => self.alloc_size(elem).saturating_mul(*len as usize),
            Type::Struct { fields } => self.struct_size(fields),
        }
    }

    fn abi_align(&self, ty: &Type) -> usize {
        match ty {
            Type::Array { elem, .. } => self.abi_align(elem),
            Type::Struct { fields } => fields.iter().map(|f| self.abi_align(f)).max().unwrap_or(1),
            scalar => self.store_size(scalar).max(1),
        }
    }
}

impl ValueInit for DataLayout {
    fn initialize_memory(&self, value: &Constant, dest: &mut [u8]) -> Result<(), JitError> {
        write_constant(self, value, dest)
    }
}

/// Write `value` into `dest` using `layout`, recursing into aggregates.
///
/// Fails if the value does not match its own type (an array element of
/// the wrong type, an integer of a non-integer type) or does not fit in
/// `dest`.
pub fn write_constant<D: TargetData + ?Sized>(
    layout: &D,
    value: &Constant,
    dest: &mut [u8],
) -> Result<(), JitError> {
    match value {
        Constant::Int { ty, value } => {
            if !ty.is_integer() {
                return Err(JitError::MalformedConstant(format!(
                    "integer constant of type {:?}",
                    ty
                )));
            }
            let size = layout.store_size(ty).min(8);
            let value = if *ty == Type::I1 { value & 1 } else { *value };
            field(dest, 0, size)?.copy_from_slice(&value.to_le_bytes()[..size]);
        }
        Constant::F32(v) => field(dest, 0, 4)?.copy_from_slice(&v.to_le_bytes()),
        Constant::F64(v) => field(dest, 0, 8)?.copy_from_slice(&v.to_le_bytes()),
        Constant::Null => field(dest, 0, layout.pointer_size())?.fill(0),
        Constant::Zero(ty) => field(dest, 0, layout.store_size(ty))?.fill(0),
        Constant::Array { elem, elems } => {
            let stride = layout.alloc_size(elem);
            for (i, e) in elems.iter().enumerate() {
                if e.ty() != *elem {
                    return Err(JitError::MalformedConstant(format!(
                        "element {} of a [{:?}] array has type {:?}",
                        i,
                        elem,
                        e.ty()
                    )));
                }
                let at = i.checked_mul(stride).unwrap_or(usize::MAX);
                write_constant(layout, e, field(dest, at, stride)?)?;
            }
        }
        Constant::Struct(fields) => {
            let types: Vec<Type> = fields.iter().map(Constant::ty).collect();
            let offsets = layout.struct_field_offsets(&types);
            for ((value, ty), offset) in fields.iter().zip(&types).zip(offsets) {
                write_constant(layout, value, field(dest, offset, layout.alloc_size(ty))?)?;
            }
        }
        Constant::Bytes(bytes) => field(dest, 0, bytes.len())?.copy_from_slice(bytes),
    }
    Ok(())
}

fn field(dest: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], JitError> {
    let available = dest.len();
    offset
        .checked_add(len)
        .and_then(|end| dest.get_mut(offset..end))
        .ok_or_else(|| {
            JitError::MalformedConstant(format!(
                "{} bytes at offset {} do not fit in {} bytes",
                len, offset, available
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 16), 0);
        assert_eq!(align_to(1, 16), 16);
        assert_eq!(align_to(17, 8), 24);
        assert_eq!(align_to(5, 0), 5);
    }

    #[test]
    fn test_struct_layout() {
        let dl = DataLayout::new(8);
        let ty = Type::Struct {
            fields: vec![Type::I8, Type::I64, Type::I16],
        };
        assert_eq!(dl.struct_field_offsets(&[Type::I8, Type::I64, Type::I16]), vec![0, 8, 16]);
        assert_eq!(dl.alloc_size(&ty), 24);
        assert_eq!(dl.abi_align(&ty), 8);
        assert_eq!(dl.alloc_size(&Type::array(Type::I32, 3)), 12);
        assert_eq!(dl.alloc_size(&Type::Struct { fields: vec![] }), 0);
    }

    #[test]
    fn test_jump_table_entry_sizes() {
        let dl = DataLayout::new(8);
        assert_eq!(dl.jump_table_entry_size(JumpTableKind::BlockAddress), 8);
        assert_eq!(dl.jump_table_entry_size(JumpTableKind::LabelDifference32), 4);
        assert_eq!(dl.jump_table_entry_align(JumpTableKind::Inline), 1);
    }

    #[test]
    fn test_write_aggregate() {
        let dl = DataLayout::new(8);
        let value = Constant::Struct(vec![
            Constant::int(Type::I8, 0x7f),
            Constant::i32(-2),
            Constant::Array {
                elem: Type::I16,
                elems: vec![Constant::int(Type::I16, 1), Constant::int(Type::I16, 0x0203)],
            },
        ]);
        let mut dest = vec![0xAAu8; dl.alloc_size(&value.ty())];
        write_constant(&dl, &value, &mut dest).unwrap();
        // i8 at 0, padding, i32 at 4, [2 x i16] at 8
        assert_eq!(dest[0], 0x7f);
        assert_eq!(&dest[4..8], &(-2i32).to_le_bytes());
        assert_eq!(&dest[8..12], &[0x01, 0x00, 0x03, 0x02]);
    }

    #[test]
    fn test_write_i1_and_float() {
        let dl = DataLayout::new(8);
        let mut dest = [0u8; 8];
        write_constant(&dl, &Constant::int(Type::I1, 3), &mut dest).unwrap();
        assert_eq!(dest[0], 1);
        write_constant(&dl, &Constant::F64(1.5), &mut dest).unwrap();
        assert_eq!(dest, 1.5f64.to_le_bytes());
    }

    #[test]
    fn test_array_element_type_mismatch() {
        let dl = DataLayout::new(8);
        let value = Constant::Array {
            elem: Type::I8,
            elems: vec![Constant::i64(1)],
        };
        let mut dest = vec![0u8; dl.alloc_size(&value.ty())];
        let err = write_constant(&dl, &value, &mut dest).unwrap_err();
        assert!(matches!(err, JitError::MalformedConstant(_)));
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_malformed_scalars() {
        let dl = DataLayout::new(8);
        let mut dest = [0u8; 4];
        assert!(write_constant(&dl, &Constant::F64(1.0), &mut dest).is_err());
        assert!(write_constant(&dl, &Constant::int(Type::F32, 1), &mut dest).is_err());
        assert!(write_constant(&dl, &Constant::Bytes(vec![1; 5]), &mut dest).is_err());
        assert!(write_constant(&dl, &Constant::Bytes(vec![1; 4]), &mut dest).is_ok());
    }

    #[test]
    fn test_huge_array_size_saturates() {
        let dl = DataLayout::new(8);
        assert_eq!(dl.alloc_size(&Type::array(Type::I64, u64::MAX)), usize::MAX);
    }
}
