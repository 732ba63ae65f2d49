//! Input model handed to the emitter by instruction selection.
//!
//! A [`MachineFunction`] is already lowered: its blocks hold target
//! instructions (the `I` parameter), and everything the emitter has to lay
//! out itself (constant pool, jump tables) is described separately.
//! Global variables and aliases live in a [`Module`] shared by a batch.

mod types;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use types::{Constant, Type};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FuncId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalId(pub u32);

/// Basic block number, unique within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

/// Symbolic label, unique within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A reference to something with a global address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalRef {
    Function(FuncId),
    Variable(GlobalId),
    Alias(GlobalId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    #[default]
    Internal,
    External,
    /// Declared here, defined elsewhere.
    Declaration,
    /// A definition that may be replaced by an external one.
    AvailableExternally,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalVariable {
    pub id: GlobalId,
    pub name: String,
    pub ty: Type,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Constant>,
    /// Explicit alignment; the type's preferred alignment is used if larger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub align: Option<usize>,
    #[serde(default)]
    pub thread_local: bool,
    #[serde(default)]
    pub linkage: Linkage,
}

impl GlobalVariable {
    pub fn new(id: GlobalId, name: &str, ty: Type, init: Option<Constant>) -> Self {
        Self {
            id,
            name: name.to_string(),
            ty,
            init,
            align: None,
            thread_local: false,
            linkage: Linkage::Internal,
        }
    }

    /// Whether the storage for this global lives outside the engine.
    pub fn is_external(&self) -> bool {
        matches!(
            self.linkage,
            Linkage::Declaration | Linkage::AvailableExternally
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAlias {
    pub id: GlobalId,
    pub name: String,
    pub aliasee: GlobalRef,
}

/// Global declarations shared by every function of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    #[serde(default)]
    pub globals: Vec<GlobalVariable>,
    #[serde(default)]
    pub aliases: Vec<GlobalAlias>,
}

impl Module {
    pub fn global(&self, id: GlobalId) -> Option<&GlobalVariable> {
        self.globals.iter().find(|g| g.id == id)
    }

    pub fn alias(&self, id: GlobalId) -> Option<&GlobalAlias> {
        self.aliases.iter().find(|a| a.id == id)
    }
}

/// A source position attached to the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolValue {
    Constant(Constant),
    /// Target-specific encoded constant. The emitter cannot lower these.
    Machine(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantPoolEntry {
    pub value: PoolValue,
    pub align: usize,
}

impl ConstantPoolEntry {
    pub fn new(value: Constant, align: usize) -> Self {
        Self {
            value: PoolValue::Constant(value),
            align,
        }
    }

    pub fn machine(bytes: Vec<u8>, align: usize) -> Self {
        Self {
            value: PoolValue::Machine(bytes),
            align,
        }
    }

    pub fn ty(&self) -> Type {
        match &self.value {
            PoolValue::Constant(c) => c.ty(),
            PoolValue::Machine(bytes) => Type::array(Type::I8, bytes.len() as u64),
        }
    }
}

/// How the entries of a function's jump tables are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JumpTableKind {
    /// Pointer-sized absolute block address.
    BlockAddress,
    /// 64-bit GP-relative block address.
    GpRel64BlockAddress,
    /// 32-bit GP-relative block address.
    GpRel32BlockAddress,
    /// 32-bit difference between the block and the table.
    LabelDifference32,
    /// Folded into the instruction stream by the target.
    Inline,
    /// 32-bit target-defined entry.
    Custom32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JumpTable {
    pub targets: Vec<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JumpTableInfo {
    pub kind: JumpTableKind,
    pub tables: Vec<JumpTable>,
}

impl JumpTableInfo {
    pub fn num_entries(&self) -> usize {
        self.tables.iter().map(|t| t.targets.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineBlock<I> {
    pub number: BlockId,
    pub insts: Vec<I>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineFunction<I> {
    pub id: FuncId,
    pub name: String,
    /// Required start alignment of the instruction region.
    #[serde(default)]
    pub alignment: usize,
    #[serde(default)]
    pub constant_pool: Vec<ConstantPoolEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jump_tables: Option<JumpTableInfo>,
    pub blocks: Vec<MachineBlock<I>>,
}

impl<I> MachineFunction<I> {
    pub fn new(id: FuncId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            alignment: 0,
            constant_pool: Vec::new(),
            jump_tables: None,
            blocks: Vec::new(),
        }
    }

    /// Append a block numbered after the existing ones.
    pub fn push_block(&mut self, insts: Vec<I>) -> BlockId {
        let number = BlockId(self.blocks.len() as u32);
        self.blocks.push(MachineBlock { number, insts });
        number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_lookup() {
        let module = Module {
            globals: vec![GlobalVariable::new(GlobalId(4), "x", Type::I32, None)],
            aliases: vec![GlobalAlias {
                id: GlobalId(5),
                name: "y".to_string(),
                aliasee: GlobalRef::Variable(GlobalId(4)),
            }],
        };
        assert_eq!(module.global(GlobalId(4)).map(|g| g.name.as_str()), Some("x"));
        assert!(module.global(GlobalId(5)).is_none());
        assert!(module.alias(GlobalId(5)).is_some());
    }

    #[test]
    fn test_jump_table_entries() {
        let info = JumpTableInfo {
            kind: JumpTableKind::BlockAddress,
            tables: vec![
                JumpTable {
                    targets: vec![BlockId(0), BlockId(1)],
                },
                JumpTable {
                    targets: vec![BlockId(2)],
                },
            ],
        };
        assert_eq!(info.num_entries(), 3);
    }

    #[test]
    fn test_external_linkage() {
        let mut g = GlobalVariable::new(GlobalId(0), "errno", Type::I32, None);
        assert!(!g.is_external());
        g.linkage = Linkage::Declaration;
        assert!(g.is_external());
        g.linkage = Linkage::AvailableExternally;
        assert!(g.is_external());
    }
}
