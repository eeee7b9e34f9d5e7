//! Builders for source IR.
//!
//! [`InstrBuilder`] is what lowering passes use to expand one instruction into
//! a sequence; [`ShaderBuilder`] assembles whole shaders, mostly for tests.

use smallvec::SmallVec;

use super::{
    next_ssa, AluOp, AluSrc, Block, CfNode, Function, FunctionBody, IfNode, Instr, Intrinsic,
    IntrinsicInstr, JumpKind, LoopNode, PhiInstr, PhiSrc, Shader, Ssa, Stage, TexInstr,
    UndefInstr, Variable,
};

/// Emits a straight-line instruction sequence with fresh SSA defs.
///
/// Every value created by the builder has `num_components` components.
pub struct InstrBuilder<'a> {
    alloc: &'a mut u32,
    num_components: u8,
    instrs: Vec<Instr>,
}

impl<'a> InstrBuilder<'a> {
    pub fn new(alloc: &'a mut u32, num_components: u8) -> Self {
        Self {
            alloc,
            num_components,
            instrs: Vec::new(),
        }
    }

    fn dest_for(&mut self, op: AluOp, srcs: &[AluSrc]) -> Ssa {
        let value = if op == AluOp::Bcsel { srcs[1] } else { srcs[0] };
        let comps = if op.is_vec() { srcs.len() as u8 } else { self.num_components };
        next_ssa(self.alloc, op.dest_bit_size(value.src.bit_size), comps)
    }

    /// Emit `op` into a fresh def and return it as an identity source.
    pub fn alu(&mut self, op: AluOp, srcs: &[AluSrc]) -> AluSrc {
        let def = self.dest_for(op, srcs);
        self.instrs.push(Instr::alu(op, def, srcs));
        AluSrc::new(def)
    }

    /// Emit `op` writing an existing def.
    pub fn alu_to(&mut self, def: Ssa, op: AluOp, srcs: &[AluSrc]) {
        self.instrs.push(Instr::alu(op, def, srcs));
    }

    /// Constant with `value` replicated in every component.
    pub fn imm(&mut self, value: u64, bit_size: u8) -> AluSrc {
        let def = next_ssa(self.alloc, bit_size, self.num_components);
        let values: SmallVec<[u64; 4]> = (0..self.num_components).map(|_| value).collect();
        self.instrs.push(Instr::load_const(def, &values));
        AluSrc::new(def)
    }

    pub fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    pub fn finish(self) -> Vec<Instr> {
        self.instrs
    }
}

enum Frame {
    If {
        condition: Ssa,
        parent: Vec<CfNode>,
        then_list: Option<Vec<CfNode>>,
    },
    Loop {
        parent: Vec<CfNode>,
    },
}

/// Builds a shader with a single entry-point function.
pub struct ShaderBuilder {
    shader: Shader,
    body: FunctionBody,
    current: Vec<CfNode>,
    frames: Vec<Frame>,
}

impl ShaderBuilder {
    pub fn new(stage: Stage) -> Self {
        let mut body = FunctionBody::default();
        let entry = body.alloc_block();
        Self {
            shader: Shader::new(stage),
            body,
            current: vec![CfNode::Block(entry)],
            frames: Vec::new(),
        }
    }

    pub fn label(&mut self, label: &str) -> &mut Self {
        self.shader.info.label = Some(label.to_string());
        self
    }

    pub fn internal(&mut self) -> &mut Self {
        self.shader.info.internal = true;
        self
    }

    pub fn variable(&mut self, var: Variable) -> &mut Self {
        self.shader.variables.push(var);
        self
    }

    fn block(&mut self) -> &mut Block {
        if !matches!(self.current.last(), Some(CfNode::Block(_))) {
            let block = self.body.alloc_block();
            self.current.push(CfNode::Block(block));
        }
        match self.current.last_mut() {
            Some(CfNode::Block(block)) => block,
            _ => unreachable!("a block was just appended"),
        }
    }

    /// Index of the block instructions are currently appended to.
    pub fn current_block(&mut self) -> u32 {
        self.block().index
    }

    pub fn push(&mut self, instr: Instr) {
        self.block().instrs.push(instr);
    }

    pub fn load_const(&mut self, bit_size: u8, values: &[u64]) -> Ssa {
        let def = self.body.alloc_ssa(bit_size, values.len() as u8);
        self.push(Instr::load_const(def, values));
        def
    }

    pub fn imm32(&mut self, value: u32) -> Ssa {
        self.load_const(32, &[u64::from(value)])
    }

    pub fn undef(&mut self, bit_size: u8, num_components: u8) -> Ssa {
        let def = self.body.alloc_ssa(bit_size, num_components);
        self.push(Instr::Undef(UndefInstr { def }));
        def
    }

    /// ALU op on whole values; the result takes the width of the widest source.
    pub fn alu(&mut self, op: AluOp, srcs: &[Ssa]) -> Ssa {
        let comps = srcs.iter().map(|s| s.num_components).max().unwrap_or(1);
        let srcs: SmallVec<[AluSrc; 4]> = srcs.iter().map(|s| AluSrc::new(*s)).collect();
        self.alu_src(op, comps, &srcs)
    }

    /// ALU op producing `num_components` components. Vector packs ignore
    /// `num_components` and produce one component per source.
    pub fn alu_src(&mut self, op: AluOp, num_components: u8, srcs: &[AluSrc]) -> Ssa {
        let value = if op == AluOp::Bcsel { srcs[1] } else { srcs[0] };
        let comps = if op.is_vec() { srcs.len() as u8 } else { num_components };
        let def = self.body.alloc_ssa(op.dest_bit_size(value.src.bit_size), comps);
        self.push(Instr::alu(op, def, srcs));
        def
    }

    pub fn intrinsic(&mut self, mut instr: IntrinsicInstr, dest: Option<(u8, u8)>) -> Option<Ssa> {
        let def = dest.map(|(bits, comps)| self.body.alloc_ssa(bits, comps));
        instr.def = def;
        if let Some(def) = def {
            instr.num_components = def.num_components;
        }
        self.push(Instr::Intrinsic(instr));
        def
    }

    fn intrinsic_with_dest(&mut self, mut instr: IntrinsicInstr, bits: u8, comps: u8) -> Ssa {
        let def = self.body.alloc_ssa(bits, comps);
        instr.def = Some(def);
        instr.num_components = comps;
        self.push(Instr::Intrinsic(instr));
        def
    }

    pub fn load_barycentric(&mut self, intrinsic: Intrinsic) -> Ssa {
        let instr = IntrinsicInstr::new(intrinsic, None, &[]);
        self.intrinsic_with_dest(instr, 32, 2)
    }

    pub fn load_interpolated_input(
        &mut self,
        barycentric: Ssa,
        offset: Ssa,
        num_components: u8,
        base: u32,
    ) -> Ssa {
        let mut instr =
            IntrinsicInstr::new(Intrinsic::LoadInterpolatedInput, None, &[barycentric, offset]);
        instr.base = base;
        self.intrinsic_with_dest(instr, 32, num_components)
    }

    pub fn load_input(&mut self, offset: Ssa, num_components: u8, base: u32) -> Ssa {
        let mut instr = IntrinsicInstr::new(Intrinsic::LoadInput, None, &[offset]);
        instr.base = base;
        self.intrinsic_with_dest(instr, 32, num_components)
    }

    pub fn store_output(
        &mut self,
        value: Ssa,
        offset: Ssa,
        base: u32,
        component: u8,
        write_mask: u8,
    ) {
        let mut instr = IntrinsicInstr::new(Intrinsic::StoreOutput, None, &[value, offset]);
        instr.base = base;
        instr.component = component;
        instr.write_mask = write_mask;
        self.intrinsic(instr, None);
    }

    pub fn tex(&mut self, coord: Ssa) -> Ssa {
        let def = self.body.alloc_ssa(32, 4);
        self.push(Instr::Tex(TexInstr {
            def,
            coord,
            texture_index: 0,
            sampler_index: 0,
        }));
        def
    }

    pub fn jump(&mut self, kind: JumpKind) {
        self.push(Instr::Jump(kind));
    }

    /// Phi at the top of the current block; `srcs` are `(pred block, value)`.
    pub fn phi(&mut self, srcs: &[(u32, Ssa)]) -> Ssa {
        let shape = srcs[0].1;
        let def = self.body.alloc_ssa(shape.bit_size, shape.num_components);
        let srcs = srcs
            .iter()
            .map(|&(pred, src)| PhiSrc { pred, src })
            .collect();
        let block = self.block();
        let at = block.phi_count();
        block.instrs.insert(at, Instr::Phi(PhiInstr { def, srcs }));
        def
    }

    pub fn begin_if(&mut self, condition: Ssa) {
        self.block();
        let entry = self.body.alloc_block();
        let parent = std::mem::replace(&mut self.current, vec![CfNode::Block(entry)]);
        self.frames.push(Frame::If {
            condition,
            parent,
            then_list: None,
        });
    }

    pub fn begin_else(&mut self) {
        let entry = self.body.alloc_block();
        let list = std::mem::replace(&mut self.current, vec![CfNode::Block(entry)]);
        match self.frames.last_mut() {
            Some(Frame::If { then_list, .. }) if then_list.is_none() => *then_list = Some(list),
            _ => panic!("begin_else outside of an if"),
        }
    }

    pub fn end_if(&mut self) {
        let Some(Frame::If {
            condition,
            parent,
            then_list,
        }) = self.frames.pop()
        else {
            panic!("end_if outside of an if");
        };
        let last = std::mem::replace(&mut self.current, parent);
        let (then_list, else_list) = match then_list {
            Some(then_list) => (then_list, last),
            None => {
                let entry = self.body.alloc_block();
                (last, vec![CfNode::Block(entry)])
            }
        };
        self.current.push(CfNode::If(IfNode {
            condition,
            then_list,
            else_list,
        }));
        let after = self.body.alloc_block();
        self.current.push(CfNode::Block(after));
    }

    pub fn begin_loop(&mut self) {
        self.block();
        let entry = self.body.alloc_block();
        let parent = std::mem::replace(&mut self.current, vec![CfNode::Block(entry)]);
        self.frames.push(Frame::Loop { parent });
    }

    pub fn end_loop(&mut self) {
        let Some(Frame::Loop { parent }) = self.frames.pop() else {
            panic!("end_loop outside of a loop");
        };
        let body = std::mem::replace(&mut self.current, parent);
        self.current.push(CfNode::Loop(LoopNode { body }));
        let after = self.body.alloc_block();
        self.current.push(CfNode::Block(after));
    }

    pub fn finish(mut self) -> Shader {
        assert!(self.frames.is_empty(), "unterminated control flow");
        self.body.body = std::mem::take(&mut self.current);
        self.shader.functions.push(Function {
            name: "main".to_string(),
            is_entrypoint: true,
            body: Some(self.body),
        });
        self.shader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_control_flow_keeps_blocks_between_nodes() {
        let mut b = ShaderBuilder::new(Stage::Fragment);
        let c = b.load_const(1, &[1]);
        b.begin_if(c);
        b.imm32(1);
        b.begin_else();
        b.imm32(2);
        b.end_if();
        b.begin_loop();
        b.jump(JumpKind::Break);
        b.end_loop();
        let shader = b.finish();

        let body = shader.functions[0].body.as_ref().unwrap();
        let kinds: Vec<_> = body
            .body
            .iter()
            .map(|n| match n {
                CfNode::Block(_) => 'b',
                CfNode::If(_) => 'i',
                CfNode::Loop(_) => 'l',
            })
            .collect();
        assert_eq!(kinds, vec!['b', 'i', 'b', 'l', 'b']);
        assert_eq!(body.blocks().len(), 6);
    }

    #[test]
    fn instr_builder_allocates_fresh_values() {
        let mut alloc = 10;
        let mut b = InstrBuilder::new(&mut alloc, 2);
        let one = b.imm(1, 32);
        let sum = b.alu(AluOp::Iadd, &[one, one]);
        let instrs = b.finish();

        assert_eq!(instrs.len(), 2);
        assert_eq!(one.src, Ssa::new(10, 32, 2));
        assert_eq!(sum.src, Ssa::new(11, 32, 2));
        assert_eq!(alloc, 12);
    }
}
