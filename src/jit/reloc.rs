//! Pending references recorded while code is written.

use crate::ir::{BlockId, GlobalRef};

/// What a relocation refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocTarget {
    /// A named symbol outside the batch.
    ExternalSymbol(String),
    GlobalValue(GlobalRef),
    /// Address loaded through an indirection cell.
    IndirectSymbol(GlobalRef),
    /// A block of the function that owns the relocation.
    BasicBlock(BlockId),
    ConstantPoolIndex(usize),
    JumpTableIndex(usize),
}

/// A place in a function buffer that needs an address patched in.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineRelocation<K> {
    /// Byte offset from the start of the function buffer.
    pub offset: usize,
    /// Target-specific encoding of the patch.
    pub kind: K,
    pub target: RelocTarget,
    pub addend: i64,
    pub may_need_far_stub: bool,
    /// The target patch step resolves this entry on its own.
    pub let_target_resolve: bool,
    /// Concrete address, once resolved.
    pub result: Option<u64>,
}

impl<K> MachineRelocation<K> {
    pub fn new(offset: usize, kind: K, target: RelocTarget) -> Self {
        Self {
            offset,
            kind,
            target,
            addend: 0,
            may_need_far_stub: false,
            let_target_resolve: false,
            result: None,
        }
    }

    pub fn external_symbol(offset: usize, kind: K, name: &str) -> Self {
        Self::new(offset, kind, RelocTarget::ExternalSymbol(name.to_string()))
    }

    pub fn global_value(offset: usize, kind: K, global: GlobalRef) -> Self {
        Self::new(offset, kind, RelocTarget::GlobalValue(global))
    }

    pub fn indirect_symbol(offset: usize, kind: K, global: GlobalRef) -> Self {
        Self::new(offset, kind, RelocTarget::IndirectSymbol(global))
    }

    pub fn basic_block(offset: usize, kind: K, block: BlockId) -> Self {
        Self::new(offset, kind, RelocTarget::BasicBlock(block))
    }

    pub fn constant_pool(offset: usize, kind: K, index: usize) -> Self {
        Self::new(offset, kind, RelocTarget::ConstantPoolIndex(index))
    }

    pub fn jump_table(offset: usize, kind: K, index: usize) -> Self {
        Self::new(offset, kind, RelocTarget::JumpTableIndex(index))
    }

    pub fn with_addend(mut self, addend: i64) -> Self {
        self.addend = addend;
        self
    }

    pub fn with_far_stub(mut self) -> Self {
        self.may_need_far_stub = true;
        self
    }

    pub fn resolved_by_target(mut self) -> Self {
        self.let_target_resolve = true;
        self
    }

    pub fn is_external_symbol(&self) -> bool {
        matches!(self.target, RelocTarget::ExternalSymbol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::FuncId;

    #[test]
    fn test_builders() {
        let reloc = MachineRelocation::global_value(12, (), GlobalRef::Function(FuncId(2)))
            .with_addend(-4)
            .with_far_stub();
        assert_eq!(reloc.offset, 12);
        assert_eq!(reloc.addend, -4);
        assert!(reloc.may_need_far_stub);
        assert!(!reloc.let_target_resolve);
        assert!(reloc.result.is_none());

        let reloc = MachineRelocation::external_symbol(0, (), "memcpy").resolved_by_target();
        assert!(reloc.is_external_symbol());
        assert!(reloc.let_target_resolve);
    }
}
