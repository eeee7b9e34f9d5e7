//! Text dump of the target IR.
//!
//! ```text
//! block0 {
//!     %0 = ld_vary 0, perspective
//!     writeout 0xc200
//!     writeout 0xc
//!     blend %0, u8norm
//!     stop
//! }
//! ```

use std::fmt;

use super::{Block, BlockId, Index, Instr, Opcode, Size};

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::Null => f.write_str("_"),
            Index::Normal { value, size: Size::B32 } => write!(f, "%{value}"),
            Index::Normal { value, size } => write!(f, "%{value}:{}", size.bits()),
            Index::Immediate(value) => write!(f, "#{value}"),
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block{}", self.0)
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.dest.is_null() {
            write!(f, "{} = ", self.dest)?;
        }
        f.write_str(self.op.name())?;

        let mut sep = " ";
        for src in self.srcs() {
            write!(f, "{sep}{src}")?;
            sep = ", ";
        }
        match self.op {
            Opcode::MovImm | Opcode::Writeout => write!(f, "{sep}{:#x}", self.imm)?,
            Opcode::LdVary | Opcode::StVary | Opcode::PExtract => write!(f, "{sep}{}", self.imm)?,
            Opcode::Blend | Opcode::PCombine | Opcode::Stop | Opcode::Trap => {}
        }
        if let Some(format) = self.format {
            write!(f, ", {format}")?;
        }
        if self.perspective {
            f.write_str(", perspective")?;
        }
        if self.mask != 0 {
            write!(f, ", mask={:#x}", self.mask)?;
        }
        Ok(())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "block{} {{", self.name)?;
        for instr in &self.instrs {
            writeln!(f, "    {instr}")?;
        }
        write!(f, "}}")?;

        let mut succs = self.successors.iter().flatten().peekable();
        if succs.peek().is_some() {
            f.write_str(" ->")?;
            for succ in succs {
                write!(f, " {succ}")?;
            }
        }
        if !self.predecessors.is_empty() {
            let mut preds: Vec<_> = self.predecessors.iter().collect();
            preds.sort();
            f.write_str(" from")?;
            for pred in preds {
                write!(f, " {pred}")?;
            }
        }
        writeln!(f)
    }
}
