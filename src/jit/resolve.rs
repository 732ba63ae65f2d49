//! Second pass: turn every recorded relocation into an address and patch.

use log::{debug, trace};

use super::diagnostics::EmittedCode;
use super::emitter::Emitter;
use super::function_table::FunctionRecord;
use super::layout::fill_jump_tables;
use super::reloc::{MachineRelocation, RelocTarget};
use crate::error::JitError;
use crate::ir::FuncId;
use crate::target::Target;

impl<T: Target> Emitter<T> {
    /// Resolve and patch every function committed since the last call.
    ///
    /// Returns the number of functions patched. The first failure abandons
    /// the pass; functions patched before it stay resolved.
    pub fn resolve_relocations(&mut self) -> Result<usize, JitError> {
        let result = self.resolve_pending();
        self.check(result)
    }

    fn resolve_pending(&mut self) -> Result<usize, JitError> {
        let pending: Vec<FuncId> = self
            .functions
            .iter()
            .filter(|r| !r.resolved)
            .map(|r| r.id)
            .collect();
        for &id in &pending {
            self.resolve_function(id)?;
        }
        Ok(pending.len())
    }

    fn record(&self, id: FuncId) -> Result<&FunctionRecord<T::RelocKind>, JitError> {
        self.functions.get(id).ok_or(JitError::FunctionNotEmitted(id))
    }

    fn resolve_function(&mut self, id: FuncId) -> Result<(), JitError> {
        let mut relocs = match self.functions.get_mut(id) {
            Some(record) => std::mem::take(&mut record.relocations),
            None => return Err(JitError::FunctionNotEmitted(id)),
        };
        let result = self.patch_function(id, &mut relocs);
        if let Some(record) = self.functions.get_mut(id) {
            record.relocations = relocs;
        }
        result
    }

    fn patch_function(
        &mut self,
        id: FuncId,
        relocs: &mut [MachineRelocation<T::RelocKind>],
    ) -> Result<(), JitError> {
        for reloc in relocs.iter_mut().filter(|r| !r.let_target_resolve) {
            let addr = self.resolve_target(id, &reloc.target)?;
            trace!(
                "{} +{:#x}: {:?} -> {:#x}",
                id, reloc.offset, reloc.target, addr
            );
            reloc.result = Some(addr);
        }

        let record = self
            .functions
            .get_mut(id)
            .ok_or(JitError::FunctionNotEmitted(id))?;
        let end = record.code_offset + record.size;
        if let Some(reloc) = relocs.iter().find(|r| r.offset >= end) {
            return Err(JitError::RelocationOutOfBounds {
                offset: reloc.offset,
            });
        }

        let base = record.base_address();
        let code = record.memory.bytes_mut()?;
        self.target.relocate(&mut code[..end], base, relocs)?;
        if let Some(layout) = &record.layout.jump_tables {
            fill_jump_tables(
                &self.target,
                layout,
                code,
                base,
                &record.locations,
                &record.name,
            )?;
        }
        record.resolved = true;
        self.stats.resolved += 1;
        debug!("resolved '{}' ({} relocations)", record.name, relocs.len());

        self.diagnostics.code_emitted(&EmittedCode {
            name: &record.name,
            address: record.code_address(),
            code: record.code(),
            debug_locs: &record.debug_locs,
        });
        Ok(())
    }

    fn resolve_target(&mut self, id: FuncId, target: &RelocTarget) -> Result<u64, JitError> {
        match target {
            RelocTarget::ExternalSymbol(name) => self
                .symbols
                .lookup(name)
                .ok_or_else(|| JitError::UnresolvedSymbol(name.clone())),
            // No stub is synthesized for indirect symbols.
            RelocTarget::GlobalValue(global) | RelocTarget::IndirectSymbol(global) => {
                self.global_address(*global)
            }
            RelocTarget::BasicBlock(block) => self.record(id)?.block_address(*block),
            RelocTarget::ConstantPoolIndex(index) => self.record(id)?.constant_address(*index),
            RelocTarget::JumpTableIndex(index) => self.record(id)?.jump_table_address(*index),
        }
    }
}
