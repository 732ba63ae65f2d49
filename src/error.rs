//! Error types for code emission and relocation.
//!
//! Buffer overflow never shows up here: it is absorbed by the retry loop in
//! the emitter. Everything else is fatal for the batch and is classified by
//! [`ErrorKind`] so a host can turn pipeline defects into hard crashes while
//! still reporting bad input.

use thiserror::Error;

use crate::ir::{BlockId, FuncId, GlobalId, JumpTableKind, LabelId};
use crate::jit::memory::MemoryError;

/// Broad classification of a [`JitError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A defect upstream of the emitter (unemitted block, bad index, ...).
    InvariantViolation,
    /// Input the emitter cannot materialize.
    Unsupported,
    /// A reference to something outside the engine that could not be found.
    Unresolved,
    /// Memory could not be acquired or protected.
    Resource,
}

#[derive(Debug, Error)]
pub enum JitError {
    #[error("basic block {block} of function '{function}' was never emitted")]
    BlockNotEmitted { function: String, block: BlockId },

    #[error("label {label} of function '{function}' was never emitted")]
    LabelNotEmitted { function: String, label: LabelId },

    #[error("basic block {0} emitted twice")]
    DuplicateBlock(BlockId),

    #[error("label {0} emitted twice")]
    DuplicateLabel(LabelId),

    #[error("constant pool index {index} out of range (pool has {len} entries)")]
    ConstantPoolIndex { index: usize, len: usize },

    #[error("jump table index {index} out of range ({len} tables)")]
    JumpTableIndex { index: usize, len: usize },

    #[error("function {0} has no committed code")]
    FunctionNotEmitted(FuncId),

    #[error("global {0} is not declared in the module")]
    UnknownGlobal(GlobalId),

    #[error("alias chain starting at global {0} does not terminate")]
    AliasCycle(GlobalId),

    #[error("jump table entry size {actual} does not match pointer size {expected}")]
    JumpTableEntrySize { expected: usize, actual: usize },

    #[error("malformed constant: {0}")]
    MalformedConstant(String),

    #[error("cannot replace {function}: executable function {dependent} refers to it")]
    DependentExecutable { function: FuncId, dependent: FuncId },

    #[error("relocation at offset {offset:#x} lies outside the function buffer")]
    RelocationOutOfBounds { offset: usize },

    #[error("machine-specific constant pool entry {index} cannot be materialized")]
    MachineConstantPoolEntry { index: usize },

    #[error("jump table encoding {0:?} is not supported")]
    UnsupportedJumpTable(JumpTableKind),

    #[error("relocation at offset {offset:#x} is not handled by the target")]
    UnhandledRelocation { offset: usize },

    #[error("relocation at offset {offset:#x} cannot reach {target:#x}")]
    RelocationRange { offset: usize, target: u64 },

    #[error("could not resolve external symbol '{0}'")]
    UnresolvedSymbol(String),

    #[error("could not resolve external global address: {0}")]
    ExternalGlobal(String),

    #[error("global arena exhausted while allocating '{0}'")]
    ArenaExhausted(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl JitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JitError::BlockNotEmitted { .. }
            | JitError::LabelNotEmitted { .. }
            | JitError::DuplicateBlock(_)
            | JitError::DuplicateLabel(_)
            | JitError::ConstantPoolIndex { .. }
            | JitError::JumpTableIndex { .. }
            | JitError::FunctionNotEmitted(_)
            | JitError::UnknownGlobal(_)
            | JitError::AliasCycle(_)
            | JitError::JumpTableEntrySize { .. }
            | JitError::MalformedConstant(_)
            | JitError::DependentExecutable { .. }
            | JitError::RelocationOutOfBounds { .. } => ErrorKind::InvariantViolation,
            JitError::MachineConstantPoolEntry { .. }
            | JitError::UnsupportedJumpTable(_)
            | JitError::UnhandledRelocation { .. }
            | JitError::RelocationRange { .. } => ErrorKind::Unsupported,
            JitError::UnresolvedSymbol(_) | JitError::ExternalGlobal(_) => ErrorKind::Unresolved,
            JitError::ArenaExhausted(_) | JitError::Memory(_) => ErrorKind::Resource,
        }
    }

    pub fn is_invariant_violation(&self) -> bool {
        self.kind() == ErrorKind::InvariantViolation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = JitError::BlockNotEmitted {
            function: "f".to_string(),
            block: BlockId(3),
        };
        assert!(err.is_invariant_violation());
        assert_eq!(
            JitError::UnsupportedJumpTable(JumpTableKind::GpRel64BlockAddress).kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            JitError::UnresolvedSymbol("puts".to_string()).kind(),
            ErrorKind::Unresolved
        );
        assert_eq!(
            JitError::from(MemoryError::AllocationFailed).kind(),
            ErrorKind::Resource
        );
    }

    #[test]
    fn test_messages() {
        let err = JitError::BlockNotEmitted {
            function: "main".to_string(),
            block: BlockId(1),
        };
        assert_eq!(
            err.to_string(),
            "basic block bb1 of function 'main' was never emitted"
        );
        assert_eq!(
            JitError::ExternalGlobal("errno".to_string()).to_string(),
            "could not resolve external global address: errno"
        );
    }
}
