//! Where each block and label of a function was emitted.

use std::collections::{BTreeMap, HashMap};

use crate::error::JitError;
use crate::ir::{BlockId, LabelId};

/// Block number and label to buffer offset. Written once per key during
/// emission, read during resolution.
///
/// Block numbers come from the input and may be sparse, so both tables are
/// maps.
#[derive(Debug, Clone, Default)]
pub struct LocationTable {
    blocks: BTreeMap<BlockId, usize>,
    labels: HashMap<LabelId, usize>,
}

impl LocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.labels.clear();
    }

    pub fn record_block(&mut self, block: BlockId, offset: usize) -> Result<(), JitError> {
        if self.blocks.contains_key(&block) {
            return Err(JitError::DuplicateBlock(block));
        }
        self.blocks.insert(block, offset);
        Ok(())
    }

    pub fn block_offset(&self, block: BlockId) -> Option<usize> {
        self.blocks.get(&block).copied()
    }

    pub fn record_label(&mut self, label: LabelId, offset: usize) -> Result<(), JitError> {
        if self.labels.contains_key(&label) {
            return Err(JitError::DuplicateLabel(label));
        }
        self.labels.insert(label, offset);
        Ok(())
    }

    pub fn label_offset(&self, label: LabelId) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Emitted blocks in block-number order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, usize)> + '_ {
        self.blocks.iter().map(|(&b, &off)| (b, off))
    }
}
