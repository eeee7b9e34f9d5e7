//! Appends target instructions to one block of a [`Context`].

use super::{BlockId, Context, Index, Instr, Opcode, Size};
use crate::core::PixelFormat;

pub struct Builder<'c, 'a> {
    pub ctx: &'c mut Context<'a>,
    pub block: BlockId,
}

impl<'c, 'a> Builder<'c, 'a> {
    pub fn new(ctx: &'c mut Context<'a>, block: BlockId) -> Self {
        Self { ctx, block }
    }

    pub fn push(&mut self, instr: Instr) -> &mut Instr {
        let instrs = &mut self.ctx.block_mut(self.block).instrs;
        instrs.push(instr);
        let last = instrs.len() - 1;
        &mut instrs[last]
    }

    pub fn mov_imm_to(&mut self, dest: Index, value: u32) {
        let mut instr = Instr::new(Opcode::MovImm);
        instr.dest = dest;
        instr.imm = value;
        self.push(instr);
    }

    /// Load varying `index`; callers narrow the mask afterwards.
    pub fn ld_vary_to(&mut self, dest: Index, index: u32, perspective: bool) -> &mut Instr {
        let mut instr = Instr::new(Opcode::LdVary);
        instr.dest = dest;
        instr.imm = index;
        instr.perspective = perspective;
        self.push(instr)
    }

    pub fn st_vary(&mut self, value: Index, index: u32) {
        let mut instr = Instr::new(Opcode::StVary);
        instr.src[0] = value;
        instr.imm = index;
        self.push(instr);
    }

    pub fn writeout(&mut self, pattern: u32) {
        let mut instr = Instr::new(Opcode::Writeout);
        instr.imm = pattern;
        self.push(instr);
    }

    pub fn blend(&mut self, value: Index, format: PixelFormat) {
        let mut instr = Instr::new(Opcode::Blend);
        instr.src[0] = value;
        instr.format = Some(format);
        self.push(instr);
    }

    /// Gather up to four scalars into the vector `dest`.
    pub fn p_combine_to(&mut self, dest: Index, srcs: &[Index]) {
        let mut instr = Instr::new(Opcode::PCombine);
        instr.dest = dest;
        for (slot, src) in instr.src.iter_mut().zip(srcs) {
            *slot = *src;
        }
        self.push(instr);
    }

    /// Copy `channel` of the vector `src` into a fresh register.
    pub fn p_extract(&mut self, src: Index, size: Size, channel: u8) -> Index {
        let dest = self.ctx.temp(size);
        let mut instr = Instr::new(Opcode::PExtract);
        instr.dest = dest;
        instr.src[0] = src;
        instr.imm = u32::from(channel);
        self.push(instr);
        dest
    }

    pub fn stop(&mut self) {
        self.push(Instr::new(Opcode::Stop));
    }

    pub fn trap(&mut self) {
        self.push(Instr::new(Opcode::Trap));
    }
}
