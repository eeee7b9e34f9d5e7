// This module orchestrates the source-IR optimization pipeline that runs before instruction
// selection. The pipeline has four stages: one-shot legalizations that make the shader
// conform to what the selector accepts (SSA registers, 64-bit splitting, division lowering,
// scalar ALU, flrp expansion), a fixed-point loop of generic optimizations repeated until no
// pass reports progress, a cleanup sequence that re-legalizes whatever late rules
// reintroduced, and finally code motion to shorten live ranges. Every pass implements the
// Pass trait and reports whether it changed the shader; the pipeline itself never fails.

//! Source-IR optimization pipeline.

use hashbrown::HashMap;
use log::{debug, trace};

use crate::ir::{
    visit_blocks_mut, visit_uses_mut, AluInstr, AluSrc, CfNode, FunctionBody, Instr, InstrBuilder,
    Shader, Ssa,
};

pub mod algebraic;
pub mod cf;
pub mod constant;
pub mod dce;
pub mod lower;
pub mod motion;
pub mod options;
pub mod scalar;

pub use options::{CompilerOptions, IdivOptions, Int64Lowering, MoveOptions, AGX_OPTIONS, MOVE_ALL};

/// A transformation over the whole shader.
pub trait Pass {
    fn name(&self) -> &'static str;

    /// Run the pass, returning whether anything changed.
    fn run(&self, shader: &mut Shader, options: &CompilerOptions) -> bool;
}

/// Pass backed by a plain function.
pub struct FnPass {
    name: &'static str,
    run: fn(&mut Shader, &CompilerOptions) -> bool,
}

impl FnPass {
    pub const fn new(name: &'static str, run: fn(&mut Shader, &CompilerOptions) -> bool) -> Self {
        Self { name, run }
    }
}

impl Pass for FnPass {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, shader: &mut Shader, options: &CompilerOptions) -> bool {
        (self.run)(shader, options)
    }
}

pub const LOWER_REGS_TO_SSA: FnPass = FnPass::new("lower_regs_to_ssa", lower::lower_regs_to_ssa);
pub const LOWER_INT64: FnPass = FnPass::new("lower_int64", lower::lower_int64);
pub const LOWER_IDIV: FnPass = FnPass::new("lower_idiv", lower::lower_idiv);
pub const LOWER_FLRP: FnPass = FnPass::new("lower_flrp", lower::lower_flrp);
pub const LOWER_ALU_TO_SCALAR: FnPass =
    FnPass::new("lower_alu_to_scalar", scalar::lower_alu_to_scalar);
pub const LOWER_LOAD_CONST_TO_SCALAR: FnPass =
    FnPass::new("lower_load_const_to_scalar", scalar::lower_load_const_to_scalar);
pub const COPY_PROP: FnPass = FnPass::new("copy_prop", dce::copy_prop);
pub const REMOVE_PHIS: FnPass = FnPass::new("remove_phis", dce::remove_phis);
pub const DCE: FnPass = FnPass::new("dce", dce::dce);
pub const CSE: FnPass = FnPass::new("cse", dce::cse);
pub const DEAD_CF: FnPass = FnPass::new("dead_cf", cf::dead_cf);
pub const LOOP_UNROLL: FnPass = FnPass::new("loop_unroll", cf::loop_unroll);
pub const ALGEBRAIC: FnPass = FnPass::new("algebraic", algebraic::algebraic);
pub const ALGEBRAIC_LATE: FnPass = FnPass::new("algebraic_late", algebraic::algebraic_late);
pub const CONSTANT_FOLDING: FnPass = FnPass::new("constant_folding", constant::constant_folding);
pub const OPT_UNDEF: FnPass = FnPass::new("opt_undef", constant::opt_undef);
pub const LOWER_UNDEF_TO_ZERO: FnPass =
    FnPass::new("lower_undef_to_zero", constant::lower_undef_to_zero);

/// Run `pass` and trace its outcome.
pub fn run_pass(pass: &dyn Pass, shader: &mut Shader, options: &CompilerOptions) -> bool {
    let progress = pass.run(shader, options);
    trace!("{}: {}", pass.name(), if progress { "progress" } else { "no change" });
    progress
}

/// Legalize and optimize `shader` in place.
pub fn optimize(shader: &mut Shader, options: &CompilerOptions) {
    let one_shot: [&dyn Pass; 6] = [
        &LOWER_REGS_TO_SSA,
        &LOWER_INT64,
        &LOWER_IDIV,
        &LOWER_ALU_TO_SCALAR,
        &LOWER_LOAD_CONST_TO_SCALAR,
        &LOWER_FLRP,
    ];
    for pass in one_shot {
        run_pass(pass, shader, options);
    }

    let select = cf::PeepholeSelect {
        limit: 64,
        indirect_load_ok: false,
        expensive_alu_ok: true,
    };
    let fixed_point: [&dyn Pass; 11] = [
        &COPY_PROP,
        &REMOVE_PHIS,
        &DCE,
        &DEAD_CF,
        &CSE,
        &select,
        &ALGEBRAIC,
        &CONSTANT_FOLDING,
        &OPT_UNDEF,
        &LOWER_UNDEF_TO_ZERO,
        &LOOP_UNROLL,
    ];
    let mut iterations = 0;
    loop {
        iterations += 1;
        let mut progress = false;
        for pass in fixed_point {
            progress |= run_pass(pass, shader, options);
        }
        if !progress {
            break;
        }
    }
    debug!("optimization loop settled after {iterations} iterations");

    let cleanup: [&dyn Pass; 7] = [
        &ALGEBRAIC_LATE,
        &CONSTANT_FOLDING,
        &COPY_PROP,
        &DCE,
        &CSE,
        &LOWER_ALU_TO_SCALAR,
        &LOWER_LOAD_CONST_TO_SCALAR,
    ];
    for pass in cleanup {
        run_pass(pass, shader, options);
    }

    run_pass(&motion::Sink(MOVE_ALL), shader, options);
    run_pass(&motion::Move(MOVE_ALL), shader, options);
}

/// Swizzle of `outer` read through a value that itself reads `inner`.
pub(crate) fn compose(outer: &AluSrc, inner: &AluSrc) -> AluSrc {
    let mut swizzle = [0; 4];
    for (lane, out) in swizzle.iter_mut().enumerate() {
        *out = inner.swizzle[usize::from(outer.swizzle[lane] & 3)];
    }
    AluSrc {
        src: inner.src,
        swizzle,
        negate: outer.negate ^ (inner.negate && !outer.abs),
        abs: outer.abs || inner.abs,
    }
}

/// Replace ALU instructions of `body` by whatever `f` emits for them.
///
/// `f` returns `false` to keep an instruction, in which case it must not
/// have emitted anything. Replacements must end up writing the original def.
pub(crate) fn rewrite_alu(
    body: &mut FunctionBody,
    f: &mut dyn FnMut(&AluInstr, &mut InstrBuilder<'_>) -> bool,
) -> bool {
    let mut progress = false;
    let alloc = &mut body.ssa_alloc;
    visit_blocks_mut(&mut body.body, &mut |block| {
        for instr in std::mem::take(&mut block.instrs) {
            if let Instr::Alu(alu) = &instr {
                let mut b = InstrBuilder::new(alloc, alu.def.num_components);
                if f(alu, &mut b) {
                    block.instrs.extend(b.finish());
                    progress = true;
                    continue;
                }
            }
            block.instrs.push(instr);
        }
    });
    progress
}

/// Replace every use of the keys of `map` by the mapped value.
pub(crate) fn rewrite_uses(list: &mut [CfNode], map: &HashMap<u32, Ssa>) -> bool {
    if map.is_empty() {
        return false;
    }
    let mut changed = false;
    visit_uses_mut(list, &mut |src| {
        if let Some(to) = map.get(&src.index) {
            *src = *to;
            changed = true;
        }
    });
    changed
}

/// Index of the last block of a CF list.
pub(crate) fn last_block_index(list: &[CfNode]) -> Option<u32> {
    match list.last()? {
        CfNode::Block(block) => Some(block.index),
        CfNode::If(_) | CfNode::Loop(_) => None,
    }
}

/// Merge runs of adjacent blocks. The merged block keeps the index of the
/// last block of the run, since that is where control leaves it.
pub(crate) fn merge_adjacent_blocks(list: &mut Vec<CfNode>) {
    let old = std::mem::take(list);
    for node in old {
        match node {
            CfNode::Block(next) => {
                if let Some(CfNode::Block(prev)) = list.last_mut() {
                    prev.instrs.extend(next.instrs);
                    prev.index = next.index;
                    continue;
                }
                list.push(CfNode::Block(next));
            }
            other => list.push(other),
        }
    }
}

/// Drop phi sources coming from any block in `removed`.
pub(crate) fn prune_phi_sources(list: &mut [CfNode], removed: &[u32]) {
    visit_blocks_mut(list, &mut |block| {
        for instr in &mut block.instrs {
            if let Instr::Phi(phi) = instr {
                phi.srcs.retain(|s| !removed.contains(&s.pred));
            }
        }
    });
}
