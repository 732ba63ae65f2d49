//! Per-function emission sessions.
//!
//! A session lays a function out as
//!
//! ```text
//! [constant pool][jump tables][padding][instructions]
//! ```
//!
//! in a fresh buffer. The buffer size is a guess; if the function does not
//! fit, the whole attempt is thrown away and repeated with twice the space.
//! A committed function keeps its buffer, relocation log and layout in a
//! [`FunctionRecord`] until [`Emitter::resolve_relocations`] patches it.

use log::{debug, trace};
use serde::Serialize;

use super::arena::GlobalArena;
use super::codebuf::CodeBuffer;
use super::diagnostics::{DiagnosticsSink, LogSink};
use super::function_table::{FunctionRecord, FunctionTable};
use super::layout::{self, PoolLayout};
use super::locations::LocationTable;
use super::memory::ExecutableMemory;
use super::reloc::{MachineRelocation, RelocTarget};
use super::symbols::SymbolTable;
use crate::config::EmitterConfig;
use crate::error::JitError;
use crate::ir::{
    BlockId, FuncId, GlobalAlias, GlobalRef, GlobalVariable, LabelId, MachineFunction, Module,
    SourceLoc,
};
use crate::target::{Target, align_to};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Sizing,
    Emitting,
    Finalizing,
    Committed,
    Overflowed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmitStats {
    /// Functions committed.
    pub functions: usize,
    /// Attempts thrown away because the buffer was too small.
    pub retries: usize,
    pub relocations: usize,
    /// Instruction bytes of committed functions.
    pub code_bytes: usize,
    /// Functions whose relocations have been patched.
    pub resolved: usize,
}

/// State of the function currently being emitted.
///
/// Targets receive this in [`TargetJitInfo::emit_inst`] and write their
/// bytes and bookkeeping through it.
///
/// [`TargetJitInfo::emit_inst`]: crate::target::TargetJitInfo::emit_inst
pub struct FunctionEmitter<K> {
    function: String,
    buf: CodeBuffer,
    relocations: Vec<MachineRelocation<K>>,
    locations: LocationTable,
    layout: PoolLayout,
    debug_locs: Vec<(usize, SourceLoc)>,
}

impl<K> FunctionEmitter<K> {
    pub fn new(function: &str, buf: CodeBuffer) -> Self {
        Self {
            function: function.to_string(),
            buf,
            relocations: Vec::new(),
            locations: LocationTable::new(),
            layout: PoolLayout::default(),
            debug_locs: Vec::new(),
        }
    }

    pub fn buffer(&self) -> &CodeBuffer {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    pub fn current_address(&self) -> u64 {
        self.buf.current_address()
    }

    pub fn add_relocation(&mut self, reloc: MachineRelocation<K>) {
        self.relocations.push(reloc);
    }

    pub fn relocations(&self) -> &[MachineRelocation<K>] {
        &self.relocations
    }

    /// Record that `block` starts at the current offset.
    pub fn start_block(&mut self, block: BlockId) -> Result<(), JitError> {
        trace!("{}: {} @ {}", self.function, block, self.buf.offset());
        self.locations.record_block(block, self.buf.offset())
    }

    pub fn emit_label(&mut self, label: LabelId) -> Result<(), JitError> {
        self.locations.record_label(label, self.buf.offset())
    }

    pub fn process_debug_loc(&mut self, loc: SourceLoc) {
        if self.debug_locs.last().map(|(_, prev)| *prev) != Some(loc) {
            self.debug_locs.push((self.buf.offset(), loc));
        }
    }

    /// Offset of a block emitted earlier in this function.
    pub fn block_offset(&self, block: BlockId) -> Option<usize> {
        self.locations.block_offset(block)
    }

    pub fn label_offset(&self, label: LabelId) -> Option<usize> {
        self.locations.label_offset(label)
    }

    pub fn constant_pool_offset(&self, index: usize) -> Result<usize, JitError> {
        self.layout.constant_offset(index)
    }

    /// Carve `size` bytes out of the function buffer.
    pub fn allocate_space(&mut self, size: usize, alignment: usize) -> Option<usize> {
        self.buf.allocate_space(size, alignment)
    }

    fn into_record(self, id: FuncId, code_offset: usize) -> FunctionRecord<K> {
        let size = self.buf.offset() - code_offset;
        FunctionRecord {
            id,
            name: self.function,
            memory: self.buf.into_memory(),
            code_offset,
            size,
            relocations: self.relocations,
            locations: self.locations,
            layout: self.layout,
            debug_locs: self.debug_locs,
            resolved: false,
        }
    }
}

/// The emission engine.
///
/// Owns the target, the module's globals, every committed function and the
/// global arena. Functions are streamed in with [`Emitter::emit_function`];
/// once the batch is complete, [`Emitter::resolve_relocations`] patches all
/// of them.
pub struct Emitter<T: Target> {
    pub(super) target: T,
    pub(super) module: Module,
    pub(super) config: EmitterConfig,
    pub(super) functions: FunctionTable<T::RelocKind>,
    pub(super) arena: GlobalArena,
    pub(super) symbols: SymbolTable,
    pub(super) diagnostics: Box<dyn DiagnosticsSink>,
    pub(super) stats: EmitStats,
    detached: Vec<ExecutableMemory>,
    size_estimate: usize,
    state: SessionState,
}

impl<T: Target> Emitter<T> {
    pub fn new(target: T, module: Module, config: EmitterConfig) -> Self {
        Self {
            symbols: SymbolTable::new(config.search_process_symbols),
            target,
            module,
            config,
            functions: FunctionTable::new(),
            arena: GlobalArena::new(),
            diagnostics: Box::new(LogSink),
            stats: EmitStats::default(),
            detached: Vec::new(),
            size_estimate: 0,
            state: SessionState::Idle,
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    pub fn add_global(&mut self, global: GlobalVariable) {
        self.module.globals.push(global);
    }

    pub fn add_alias(&mut self, alias: GlobalAlias) {
        self.module.aliases.push(alias);
    }

    /// Make `name` resolve to `addr` for external symbol relocations.
    pub fn define_symbol(&mut self, name: &str, addr: u64) {
        self.symbols.define(name, addr);
    }

    pub fn set_diagnostics(&mut self, sink: Box<dyn DiagnosticsSink>) {
        self.diagnostics = sink;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &EmitStats {
        &self.stats
    }

    pub fn arena(&self) -> &GlobalArena {
        &self.arena
    }

    pub fn function(&self, id: FuncId) -> Option<&FunctionRecord<T::RelocKind>> {
        self.functions.get(id)
    }

    pub fn function_mut(&mut self, id: FuncId) -> Option<&mut FunctionRecord<T::RelocKind>> {
        self.functions.get_mut(id)
    }

    pub fn functions(&self) -> &FunctionTable<T::RelocKind> {
        &self.functions
    }

    /// Drop a committed function and unmap its buffer.
    ///
    /// Functions already patched against it are marked unresolved again.
    /// Fails, leaving everything in place, if one of them is executable.
    pub fn deallocate_function(&mut self, id: FuncId) -> Result<bool, JitError> {
        debug!("deallocating {}", id);
        let dependents = self.patched_dependents(id)?;
        let removed = self.functions.remove(id).is_some();
        self.mark_unresolved(&dependents);
        Ok(removed)
    }

    /// Whether a relocation against `global` lands on function `id`.
    fn refers_to_function(&self, global: GlobalRef, id: FuncId) -> bool {
        let mut current = global;
        for _ in 0..=self.module.aliases.len() {
            match current {
                GlobalRef::Function(f) => return f == id,
                GlobalRef::Variable(_) => return false,
                GlobalRef::Alias(alias) => match self.module.alias(alias) {
                    Some(alias) => current = alias.aliasee,
                    None => return false,
                },
            }
        }
        false
    }

    /// Resolved functions whose code holds the address of function `id`.
    fn patched_dependents(&self, id: FuncId) -> Result<Vec<FuncId>, JitError> {
        let mut dependents = Vec::new();
        if !self.functions.contains(id) {
            return Ok(dependents);
        }
        for record in self.functions.iter().filter(|r| r.id != id) {
            let refers = record.relocations.iter().any(|reloc| match &reloc.target {
                RelocTarget::GlobalValue(global) | RelocTarget::IndirectSymbol(global) => {
                    self.refers_to_function(*global, id)
                }
                _ => false,
            });
            if !refers {
                continue;
            }
            if record.is_executable() {
                return Err(JitError::DependentExecutable {
                    function: id,
                    dependent: record.id,
                });
            }
            if record.resolved {
                dependents.push(record.id);
            }
        }
        Ok(dependents)
    }

    fn mark_unresolved(&mut self, ids: &[FuncId]) {
        for &id in ids {
            if let Some(record) = self.functions.get_mut(id) {
                trace!("{} needs patching again", id);
                record.resolved = false;
            }
        }
    }

    /// Map `size` bytes that belong to no function. The block lives as long
    /// as the emitter.
    pub fn allocate_space(&mut self, size: usize, alignment: usize) -> Result<u64, JitError> {
        let alignment = alignment.max(1);
        let extra = if alignment > ExecutableMemory::page_size() {
            alignment
        } else {
            0
        };
        let memory = ExecutableMemory::new(size.max(1) + extra)?;
        let addr = align_to(memory.address() as usize, alignment) as u64;
        trace!("detached block of {} bytes @ {:#x}", size, addr);
        self.detached.push(memory);
        Ok(addr)
    }

    /// Address a relocation against `global` resolves to.
    ///
    /// Variables get an arena slot on first use; aliases are followed to
    /// their final target; functions must already be committed.
    pub fn global_address(&mut self, global: GlobalRef) -> Result<u64, JitError> {
        let mut current = global;
        let mut hops = 0;
        loop {
            match current {
                GlobalRef::Function(id) => {
                    return self
                        .functions
                        .code_address(id)
                        .ok_or(JitError::FunctionNotEmitted(id));
                }
                GlobalRef::Variable(id) => {
                    let var = self.module.global(id).ok_or(JitError::UnknownGlobal(id))?;
                    return Ok(self.arena.address_of(var, &self.target)?.tagged());
                }
                GlobalRef::Alias(id) => {
                    if hops > self.module.aliases.len() {
                        return Err(JitError::AliasCycle(id));
                    }
                    hops += 1;
                    current = self.module.alias(id).ok_or(JitError::UnknownGlobal(id))?.aliasee;
                }
            }
        }
    }

    /// Emit one function and commit it, replacing any earlier version.
    /// Returns the address of its first instruction.
    ///
    /// Functions already patched against an earlier version are marked
    /// unresolved so the next [`Emitter::resolve_relocations`] repoints them.
    pub fn emit_function(&mut self, func: &MachineFunction<T::Inst>) -> Result<u64, JitError> {
        let result = self.replace_function(func);
        if result.is_err() {
            self.state = SessionState::Idle;
            self.size_estimate = 0;
        }
        self.check(result)
    }

    fn replace_function(&mut self, func: &MachineFunction<T::Inst>) -> Result<u64, JitError> {
        let dependents = self.patched_dependents(func.id)?;
        let result = self.run_session(func);
        // An overflowed attempt drops the old record even if the session fails later.
        self.mark_unresolved(&dependents);
        result
    }

    fn run_session(&mut self, func: &MachineFunction<T::Inst>) -> Result<u64, JitError> {
        debug!("emitting '{}' ({})", func.name, func.id);
        loop {
            self.state = SessionState::Sizing;
            let size = if self.size_estimate != 0 {
                self.size_estimate
            } else {
                self.config.initial_buffer_size.max(1)
            };

            self.state = SessionState::Emitting;
            let mut cx = FunctionEmitter::new(&func.name, CodeBuffer::with_capacity(size)?);
            let code_offset = self.emit_body(func, &mut cx)?;

            self.state = SessionState::Finalizing;
            if cx.buf.is_exhausted() {
                let capacity = cx.buf.capacity();
                debug!(
                    "'{}' does not fit in {} bytes, retrying with {}",
                    func.name,
                    capacity,
                    capacity.saturating_mul(2)
                );
                self.state = SessionState::Overflowed;
                drop(cx);
                self.functions.remove(func.id);
                self.size_estimate = capacity.saturating_mul(2);
                self.stats.retries += 1;
                continue;
            }

            let record = cx.into_record(func.id, code_offset);
            let addr = record.code_address();
            debug!(
                "committed '{}': {} bytes @ {:#x}, {} relocations",
                record.name,
                record.size,
                addr,
                record.relocations.len()
            );
            self.stats.functions += 1;
            self.stats.relocations += record.relocations.len();
            self.stats.code_bytes += record.size;
            if self.functions.insert(record).is_some() {
                trace!("replaced previous code for {}", func.id);
            }
            self.size_estimate = 0;
            self.state = SessionState::Committed;
            return Ok(addr);
        }
    }

    /// Lay out one attempt. Returns the offset of the instruction region.
    fn emit_body(
        &self,
        func: &MachineFunction<T::Inst>,
        cx: &mut FunctionEmitter<T::RelocKind>,
    ) -> Result<usize, JitError> {
        cx.buf.align(self.config.pool_alignment.max(16));
        cx.layout.constants = layout::emit_constant_pool(&self.target, &func.constant_pool, &mut cx.buf)?;
        cx.layout.jump_tables =
            layout::reserve_jump_tables(&self.target, func.jump_tables.as_ref(), &mut cx.buf)?;

        cx.buf.align(
            func.alignment
                .max(self.config.min_function_alignment)
                .max(8),
        );
        let code_offset = cx.buf.offset();

        for block in &func.blocks {
            if cx.buf.is_overflowed() {
                break;
            }
            cx.start_block(block.number)?;
            for inst in &block.insts {
                self.target.emit_inst(inst, cx)?;
            }
        }
        Ok(code_offset)
    }

    /// Panic on invariant violations when configured to.
    pub(super) fn check<R>(&self, result: Result<R, JitError>) -> Result<R, JitError> {
        if let Err(err) = &result {
            if self.config.abort_on_invariant_violation && err.is_invariant_violation() {
                panic!("emission invariant violated: {}", err);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Constant, ConstantPoolEntry, Type};
    use crate::target::x86_64::{Inst, Reg, X86_64};

    fn emitter() -> Emitter<X86_64> {
        Emitter::new(X86_64::new(), Module::default(), EmitterConfig::default())
    }

    fn ret_function(id: u32) -> MachineFunction<Inst> {
        let mut func = MachineFunction::new(FuncId(id), &format!("f{}", id));
        func.push_block(vec![Inst::MovRi { dst: Reg::Rax, imm: 1 }, Inst::Ret]);
        func
    }

    #[test]
    fn test_commit_records_function() {
        let mut em = emitter();
        let addr = em.emit_function(&ret_function(0)).unwrap();
        let rec = em.function(FuncId(0)).unwrap();
        assert_eq!(rec.code_address(), addr);
        assert_eq!(rec.code_offset, 0);
        assert_eq!(rec.block_offset(BlockId(0)).unwrap(), 0);
        assert_eq!(em.state(), SessionState::Committed);
        assert_eq!(em.stats().functions, 1);
        assert_eq!(em.stats().retries, 0);
    }

    #[test]
    fn test_instruction_region_is_aligned() {
        let mut em = emitter();
        let mut func = ret_function(0);
        func.constant_pool.push(ConstantPoolEntry::new(Constant::int(Type::I8, 1), 1));
        func.alignment = 32;
        em.emit_function(&func).unwrap();
        let rec = em.function(FuncId(0)).unwrap();
        assert_eq!(rec.code_offset, 32);
        assert_eq!(rec.code_address() % 32, 0);
    }

    #[test]
    fn test_overflow_retries_with_double_size() {
        let mut em = emitter();
        let page = ExecutableMemory::page_size();
        let mut func = MachineFunction::new(FuncId(0), "big");
        func.push_block(vec![Inst::Nop; page + 1]);
        em.emit_function(&func).unwrap();

        let rec = em.function(FuncId(0)).unwrap();
        assert_eq!(rec.size, page + 1);
        assert_eq!(em.stats().retries, 1);
        assert_eq!(em.size_estimate, 0);
    }

    #[test]
    fn test_exact_fit_counts_as_overflow() {
        let mut em = emitter();
        let page = ExecutableMemory::page_size();
        let mut func = MachineFunction::new(FuncId(0), "exact");
        func.push_block(vec![Inst::Nop; page]);
        em.emit_function(&func).unwrap();
        assert_eq!(em.stats().retries, 1);
        assert_eq!(em.function(FuncId(0)).unwrap().size, page);
    }

    #[test]
    fn test_reemit_replaces_record() {
        let mut em = emitter();
        em.emit_function(&ret_function(3)).unwrap();
        let addr = em.emit_function(&ret_function(3)).unwrap();
        assert_eq!(em.functions().len(), 1);
        assert_eq!(em.function(FuncId(3)).unwrap().code_address(), addr);
        assert!(em.deallocate_function(FuncId(3)).unwrap());
        assert!(!em.deallocate_function(FuncId(3)).unwrap());
    }

    #[test]
    fn test_function_emitter_bookkeeping() {
        let buf = CodeBuffer::with_capacity(64).unwrap();
        let capacity = buf.capacity();
        let mut cx: FunctionEmitter<()> = FunctionEmitter::new("cx", buf);
        cx.buffer_mut().emit_u8(0x90);
        assert_eq!(cx.allocate_space(8, 8), Some(8));
        assert_eq!(cx.offset(), 16);
        assert_eq!(cx.allocate_space(capacity, 1), None);
        assert!(cx.buffer().is_overflowed());

        let loc = SourceLoc { line: 3, col: 1 };
        cx.process_debug_loc(loc);
        cx.process_debug_loc(loc);
        assert_eq!(cx.debug_locs.len(), 1);

        cx.emit_label(LabelId(2)).unwrap();
        assert_eq!(cx.label_offset(LabelId(2)), Some(16));
        assert_eq!(cx.block_offset(BlockId(0)), None);
    }

    #[test]
    fn test_failed_session_resets_size_estimate() {
        let mut em = emitter();
        let mut func = MachineFunction::new(FuncId(0), "huge_pool");
        func.constant_pool.push(ConstantPoolEntry::new(
            Constant::Zero(Type::array(Type::I8, 1 << 50)),
            16,
        ));
        func.push_block(vec![Inst::Ret]);
        assert!(em.emit_function(&func).is_err());
        assert!(em.stats().retries > 0);
        assert_eq!(em.size_estimate, 0);
        assert_eq!(em.state(), SessionState::Idle);
        assert!(em.function(FuncId(0)).is_none());

        let retries = em.stats().retries;
        em.emit_function(&ret_function(1)).unwrap();
        assert_eq!(em.stats().retries, retries);
        assert_eq!(em.function(FuncId(1)).unwrap().memory.size(), ExecutableMemory::page_size());
    }

    #[test]
    fn test_replacing_a_callee_unresolves_callers() {
        let mut em = emitter();
        em.emit_function(&ret_function(2)).unwrap();
        let mut caller = MachineFunction::new(FuncId(1), "caller");
        caller.push_block(vec![
            Inst::LoadGlobal {
                dst: Reg::Rax,
                global: GlobalRef::Function(FuncId(2)),
            },
            Inst::Ret,
        ]);
        em.emit_function(&caller).unwrap();
        em.emit_function(&ret_function(3)).unwrap();
        em.resolve_relocations().unwrap();

        em.emit_function(&ret_function(2)).unwrap();
        assert!(!em.function(FuncId(1)).unwrap().resolved);
        assert!(em.function(FuncId(3)).unwrap().resolved);

        em.resolve_relocations().unwrap();
        assert!(em.deallocate_function(FuncId(2)).unwrap());
        assert!(!em.function(FuncId(1)).unwrap().resolved);
        assert!(matches!(
            em.resolve_relocations(),
            Err(JitError::FunctionNotEmitted(FuncId(2)))
        ));
    }

    #[test]
    fn test_dependents_through_aliases() {
        let mut em = emitter();
        em.add_alias(GlobalAlias {
            id: crate::ir::GlobalId(0),
            name: "entry".to_string(),
            aliasee: GlobalRef::Function(FuncId(2)),
        });
        em.emit_function(&ret_function(2)).unwrap();
        let mut caller = MachineFunction::new(FuncId(1), "caller");
        caller.push_block(vec![
            Inst::LoadIndirect {
                dst: Reg::Rax,
                global: GlobalRef::Alias(crate::ir::GlobalId(0)),
            },
            Inst::Ret,
        ]);
        em.emit_function(&caller).unwrap();
        em.resolve_relocations().unwrap();

        em.emit_function(&ret_function(2)).unwrap();
        assert!(!em.function(FuncId(1)).unwrap().resolved);
    }

    #[test]
    fn test_duplicate_block_rejected() {
        let mut em = emitter();
        let mut func = MachineFunction::new(FuncId(0), "dup");
        func.push_block(vec![Inst::Nop]);
        func.blocks.push(crate::ir::MachineBlock {
            number: BlockId(0),
            insts: vec![Inst::Ret],
        });
        assert!(matches!(
            em.emit_function(&func),
            Err(JitError::DuplicateBlock(BlockId(0)))
        ));
        assert!(em.function(FuncId(0)).is_none());
    }

    #[test]
    fn test_detached_allocation() {
        let mut em = emitter();
        let addr = em.allocate_space(100, 64).unwrap();
        assert_eq!(addr % 64, 0);
        assert_eq!(em.detached.len(), 1);
    }

    #[test]
    fn test_alias_chain() {
        let mut em = emitter();
        em.add_global(GlobalVariable::new(
            crate::ir::GlobalId(0),
            "x",
            Type::I32,
            Some(Constant::i32(1)),
        ));
        em.add_alias(GlobalAlias {
            id: crate::ir::GlobalId(1),
            name: "y".to_string(),
            aliasee: GlobalRef::Variable(crate::ir::GlobalId(0)),
        });
        em.add_alias(GlobalAlias {
            id: crate::ir::GlobalId(2),
            name: "z".to_string(),
            aliasee: GlobalRef::Alias(crate::ir::GlobalId(1)),
        });
        let direct = em.global_address(GlobalRef::Variable(crate::ir::GlobalId(0))).unwrap();
        let aliased = em.global_address(GlobalRef::Alias(crate::ir::GlobalId(2))).unwrap();
        assert_eq!(direct, aliased);
    }

    #[test]
    fn test_alias_cycle_detected() {
        let mut em = emitter();
        for (id, target) in [(0, 1), (1, 0)] {
            em.add_alias(GlobalAlias {
                id: crate::ir::GlobalId(id),
                name: format!("a{}", id),
                aliasee: GlobalRef::Alias(crate::ir::GlobalId(target)),
            });
        }
        assert!(matches!(
            em.global_address(GlobalRef::Alias(crate::ir::GlobalId(0))),
            Err(JitError::AliasCycle(_))
        ));
    }

    #[test]
    fn test_function_address_requires_commit() {
        let mut em = emitter();
        let err = em.global_address(GlobalRef::Function(FuncId(9))).unwrap_err();
        assert!(matches!(err, JitError::FunctionNotEmitted(FuncId(9))));
    }

    #[test]
    #[should_panic(expected = "emission invariant violated")]
    fn test_abort_on_invariant_violation() {
        let config = EmitterConfig {
            abort_on_invariant_violation: true,
            ..EmitterConfig::default()
        };
        let mut em = Emitter::new(X86_64::new(), Module::default(), config);
        let mut func = MachineFunction::new(FuncId(0), "bad");
        func.push_block(vec![Inst::LoadConst { dst: Reg::Rax, index: 4 }, Inst::Ret]);
        em.emit_function(&func).unwrap();
        let _ = em.resolve_relocations();
    }
}
