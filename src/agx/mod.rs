// This module defines the AGX target IR produced by instruction selection: fixed-size
// pseudo-instructions whose operands are virtual registers or immediates, grouped into
// basic blocks owned by a per-compilation Context. Nothing here is physically allocated
// yet; the external register allocator rewrites operands in place later and the packer
// encodes the result. Submodules hold the block-local builder, the context arena, the
// selector, the CFG builder and a printer for debug dumps.

//! AGX target IR.

use hashbrown::HashSet;

use crate::core::PixelFormat;

pub mod builder;
pub mod context;
pub mod emit;
pub mod print;
pub mod select;

pub use builder::Builder;
pub use context::Context;

/// Width of a register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Size {
    B16,
    B32,
    B64,
}

impl Size {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            16 => Some(Size::B16),
            32 => Some(Size::B32),
            64 => Some(Size::B64),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Size::B16 => 16,
            Size::B32 => 32,
            Size::B64 => 64,
        }
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Index {
    #[default]
    Null,
    /// Virtual register.
    Normal { value: u32, size: Size },
    Immediate(u32),
}

impl Index {
    pub fn normal(value: u32, size: Size) -> Self {
        Index::Normal { value, size }
    }

    pub fn is_null(self) -> bool {
        self == Index::Null
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    MovImm,
    LdVary,
    StVary,
    Writeout,
    Blend,
    PCombine,
    PExtract,
    Stop,
    Trap,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        match self {
            Opcode::MovImm => "mov_imm",
            Opcode::LdVary => "ld_vary",
            Opcode::StVary => "st_vary",
            Opcode::Writeout => "writeout",
            Opcode::Blend => "blend",
            Opcode::PCombine => "p_combine",
            Opcode::PExtract => "p_extract",
            Opcode::Stop => "stop",
            Opcode::Trap => "trap",
        }
    }
}

/// Target pseudo-instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub op: Opcode,
    pub dest: Index,
    pub src: [Index; 4],
    /// Literal for `mov_imm`, varying slot for `ld_vary`/`st_vary`, control
    /// pattern for `writeout`, channel for `p_extract`.
    pub imm: u32,
    /// Component write mask, 0 meaning all components.
    pub mask: u8,
    /// Perspective-correct interpolation for `ld_vary`.
    pub perspective: bool,
    /// Tile-buffer format for `blend`.
    pub format: Option<PixelFormat>,
}

impl Instr {
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            dest: Index::Null,
            src: [Index::Null; 4],
            imm: 0,
            mask: 0,
            perspective: false,
            format: None,
        }
    }

    /// Sources up to the last non-null one.
    pub fn srcs(&self) -> &[Index] {
        let used = self.src.iter().rposition(|s| !s.is_null()).map_or(0, |i| i + 1);
        &self.src[..used]
    }
}

/// Stable handle of a block in the [`Context`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    /// Display name, assigned in creation order once emission is complete.
    pub name: u32,
    pub instrs: Vec<Instr>,
    /// Filled in by whoever wires control flow; blocks never update it themselves.
    pub predecessors: HashSet<BlockId>,
    pub successors: [Option<BlockId>; 2],
}

impl Block {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            name: 0,
            instrs: Vec::new(),
            predecessors: HashSet::new(),
            successors: [None, None],
        }
    }
}
