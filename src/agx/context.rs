//! Per-compilation state of the AGX backend.
//!
//! A [`Context`] owns the target block arena and the table mapping source SSA
//! values to virtual registers. It borrows the optimized source shader and
//! the compile key for as long as the compilation runs and is handed to the
//! register allocator and packer afterwards.

use hashbrown::HashMap;
use log::trace;

use super::{Block, BlockId, Index, Size};
use crate::core::{CompileError, CompileKey, CompileResult};
use crate::ir::{self, Shader, Ssa, Stage};

pub struct Context<'a> {
    pub shader: &'a Shader,
    pub key: &'a CompileKey,
    pub stage: Stage,
    pub blocks: Vec<Block>,
    /// Source SSA index to virtual register.
    vregs: HashMap<u32, u32>,
    /// Next free virtual register.
    pub alloc: u32,
    pub loop_count: u32,
    pub spills: u32,
    pub fills: u32,
    defs: HashMap<u32, &'a ir::Instr>,
}

impl<'a> Context<'a> {
    pub fn new(shader: &'a Shader, key: &'a CompileKey) -> Self {
        let mut defs = HashMap::new();
        let mut capacity = 0;
        for body in shader.bodies() {
            defs.extend(body.defs());
            capacity += body.ssa_alloc as usize;
        }
        Self {
            shader,
            key,
            stage: shader.stage(),
            blocks: Vec::new(),
            vregs: HashMap::with_capacity(capacity),
            alloc: 0,
            loop_count: 0,
            spills: 0,
            fills: 0,
            defs,
        }
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id));
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn last_block(&self) -> Option<BlockId> {
        self.blocks.last().map(|b| b.id)
    }

    /// Virtual register holding `ssa`, allocated on first reference.
    pub fn ssa_index(&mut self, ssa: &Ssa, operation: &'static str) -> CompileResult<Index> {
        let size = Size::from_bits(ssa.bit_size).ok_or_else(|| {
            CompileError::invariant(operation, format!("%{} has width {}", ssa.index, ssa.bit_size))
        })?;
        let next = &mut self.alloc;
        let value = *self.vregs.entry(ssa.index).or_insert_with(|| {
            let value = *next;
            *next += 1;
            trace!("%{} -> vreg {value}", ssa.index);
            value
        });
        Ok(Index::normal(value, size))
    }

    /// Fresh virtual register with no source counterpart.
    pub fn temp(&mut self, size: Size) -> Index {
        let value = self.alloc;
        self.alloc += 1;
        Index::normal(value, size)
    }

    /// Instruction defining `ssa` in the source shader.
    pub fn source_def(&self, ssa: &Ssa) -> Option<&'a ir::Instr> {
        self.defs.get(&ssa.index).copied()
    }

    /// Value of `ssa` if it is a scalar constant.
    pub fn const_value(&self, ssa: &Ssa) -> Option<u64> {
        match self.source_def(ssa)? {
            ir::Instr::LoadConst(load) if load.values.len() == 1 => load.values.first().copied(),
            _ => None,
        }
    }

    /// Name blocks in creation order.
    pub fn name_blocks(&mut self) {
        for (name, block) in self.blocks.iter_mut().enumerate() {
            block.name = name as u32;
        }
    }

    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Human-readable dump of every block.
    pub fn print(&self) -> String {
        self.blocks.iter().map(|b| b.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    #[test]
    fn vregs_are_allocated_on_first_use() {
        let shader = Shader::parse(
            "shader fragment
             fn main {
               block b0 {
                 %7:32 = load_const 0x2a
                 %9:16 = load_const 0x1
               }
             }",
        )
        .unwrap();
        let key = CompileKey::default();
        let mut ctx = Context::new(&shader, &key);

        let a = Ssa::new(9, 16, 1);
        let b = Ssa::new(7, 32, 1);
        assert_eq!(ctx.ssa_index(&a, "test").unwrap(), Index::normal(0, Size::B16));
        assert_eq!(ctx.ssa_index(&b, "test").unwrap(), Index::normal(1, Size::B32));
        assert_eq!(ctx.ssa_index(&a, "test").unwrap(), Index::normal(0, Size::B16));
        assert_eq!(ctx.temp(Size::B32), Index::normal(2, Size::B32));

        assert_eq!(ctx.const_value(&b), Some(0x2a));
        let err = ctx.ssa_index(&Ssa::new(3, 1, 1), "test").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[test]
    fn blocks_are_named_in_creation_order() {
        let shader = Shader::new(Stage::Fragment);
        let key = CompileKey::default();
        let mut ctx = Context::new(&shader, &key);
        let first = ctx.create_block();
        let second = ctx.create_block();
        ctx.name_blocks();
        assert_eq!(ctx.block(first).name, 0);
        assert_eq!(ctx.block(second).name, 1);
        assert_eq!(ctx.last_block(), Some(second));
    }
}
