//! Algebraic simplification.
//!
//! [`algebraic`] removes identities and expands operations the target lacks;
//! [`algebraic_late`] runs once after the main loop and forms fused and
//! subtracting instructions that the early rules would otherwise undo.

use hashbrown::HashMap;
use smallvec::SmallVec;

use super::constant::{float_bits, float_value, mask};
use super::{compose, rewrite_alu, CompilerOptions};
use crate::ir::{visit_blocks, AluInstr, AluOp, AluSrc, FunctionBody, Instr, InstrBuilder, LoadConstInstr, Shader};

/// Constant and ALU definitions of a function, for matching operands.
struct Operands {
    consts: HashMap<u32, LoadConstInstr>,
    alus: HashMap<u32, AluInstr>,
}

impl Operands {
    fn collect(body: &FunctionBody) -> Self {
        let mut alus = HashMap::new();
        visit_blocks(&body.body, &mut |block| {
            for instr in &block.instrs {
                if let Instr::Alu(alu) = instr {
                    alus.insert(alu.def.index, alu.clone());
                }
            }
        });
        Self {
            consts: body.constants(),
            alus,
        }
    }

    /// Raw values `src` reads in lanes `0..comps`.
    fn lanes(&self, src: &AluSrc, comps: u8) -> Option<SmallVec<[u64; 4]>> {
        let lc = self.consts.get(&src.src.index)?;
        (0..usize::from(comps))
            .map(|c| lc.values.get(usize::from(src.swizzle[c])).copied())
            .collect()
    }

    fn is_int(&self, src: &AluSrc, comps: u8, value: i64) -> bool {
        if src.negate || src.abs {
            return false;
        }
        let want = value as u64 & mask(src.src.bit_size);
        self.lanes(src, comps)
            .is_some_and(|lanes| lanes.iter().all(|v| *v == want))
    }

    fn is_float(&self, src: &AluSrc, comps: u8, value: f64) -> bool {
        let bits = src.src.bit_size;
        self.lanes(src, comps).is_some_and(|lanes| {
            lanes.iter().all(|raw| {
                float_value(*raw, bits).is_some_and(|mut v| {
                    if src.abs {
                        v = v.abs();
                    }
                    if src.negate {
                        v = -v;
                    }
                    v == value
                })
            })
        })
    }

    /// The unmodified ALU instruction `src` reads, if it computes `op`.
    fn producer(&self, src: &AluSrc, op: AluOp) -> Option<&AluInstr> {
        if src.negate || src.abs {
            return None;
        }
        self.alus.get(&src.src.index).filter(|alu| alu.op == op)
    }
}

fn negated(src: AluSrc) -> AluSrc {
    AluSrc {
        negate: !src.negate,
        ..src
    }
}

/// Index of the operand of a commutative binary op satisfying `pred`.
fn commuted(alu: &AluInstr, pred: impl Fn(&AluSrc) -> bool) -> Option<usize> {
    (0..2).find(|i| pred(&alu.srcs[*i]))
}

fn simplify(alu: &AluInstr, ops: &Operands, options: &CompilerOptions, b: &mut InstrBuilder<'_>) -> Option<()> {
    use AluOp::*;

    let comps = alu.src_lanes();
    let bits = alu.def.bit_size;
    let def = alu.def;
    let src = |i: usize| alu.srcs[i];

    match alu.op {
        Iadd | Ior | Ixor => {
            if let Some(i) = commuted(alu, |s| ops.is_int(s, comps, 0)) {
                b.alu_to(def, Mov, &[src(1 - i)]);
                return Some(());
            }
            if alu.op == Ior && src(0) == src(1) {
                b.alu_to(def, Mov, &[src(0)]);
                return Some(());
            }
            if alu.op == Ixor && src(0) == src(1) {
                b.push(Instr::load_const(def, &vec![0; usize::from(def.num_components)]));
                return Some(());
            }
            None
        }
        Isub if src(0) == src(1) => {
            b.push(Instr::load_const(def, &vec![0; usize::from(def.num_components)]));
            Some(())
        }
        Isub if ops.is_int(&src(1), comps, 0) => {
            b.alu_to(def, Mov, &[src(0)]);
            Some(())
        }
        Isub if !options.has_isub => {
            let neg = b.alu(Ineg, &[src(1)]);
            b.alu_to(def, Iadd, &[src(0), neg]);
            Some(())
        }
        Iand if src(0) == src(1) => {
            b.alu_to(def, Mov, &[src(0)]);
            Some(())
        }
        Iand => {
            let i = commuted(alu, |s| ops.is_int(s, comps, 0))?;
            b.alu_to(def, Mov, &[src(i)]);
            Some(())
        }
        Imul => {
            if let Some(i) = commuted(alu, |s| ops.is_int(s, comps, 1)) {
                b.alu_to(def, Mov, &[src(1 - i)]);
                return Some(());
            }
            let i = commuted(alu, |s| ops.is_int(s, comps, 0))?;
            b.alu_to(def, Mov, &[src(i)]);
            Some(())
        }
        Fadd => {
            let i = commuted(alu, |s| ops.is_float(s, comps, 0.0))?;
            b.alu_to(def, Mov, &[src(1 - i)]);
            Some(())
        }
        Fmul => {
            if let Some(i) = commuted(alu, |s| ops.is_float(s, comps, 1.0)) {
                b.alu_to(def, Mov, &[src(1 - i)]);
                return Some(());
            }
            commuted(alu, |s| ops.is_float(s, comps, 0.0))?;
            let zero = float_bits(0.0, bits)?;
            b.push(Instr::load_const(def, &vec![zero; usize::from(def.num_components)]));
            Some(())
        }
        Fsub if !options.has_fsub => {
            b.alu_to(def, Fadd, &[src(0), negated(src(1))]);
            Some(())
        }
        Ishl | Ishr | Ushr if ops.is_int(&src(1), comps, 0) => {
            b.alu_to(def, Mov, &[src(0)]);
            Some(())
        }
        Fneg | Ineg | Inot => {
            let inner = ops.producer(&src(0), alu.op)?;
            let inner_src = inner.srcs[0];
            if alu.op != Fneg && (inner_src.negate || inner_src.abs) {
                return None;
            }
            b.alu_to(def, Mov, &[compose(&src(0), &inner_src)]);
            Some(())
        }
        Fdiv if options.lower_fdiv => {
            let rcp = b.alu(Frcp, &[src(1)]);
            b.alu_to(def, Fmul, &[src(0), rcp]);
            Some(())
        }
        Ffract if options.lower_ffract => {
            let floor = b.alu(Ffloor, &[src(0)]);
            b.alu_to(def, Fsub, &[src(0), floor]);
            Some(())
        }
        Fmod if options.lower_fmod => {
            let rcp = b.alu(Frcp, &[src(1)]);
            let quotient = b.alu(Fmul, &[src(0), rcp]);
            let floor = b.alu(Ffloor, &[quotient]);
            let scaled = b.alu(Fmul, &[src(1), floor]);
            b.alu_to(def, Fsub, &[src(0), scaled]);
            Some(())
        }
        Fpow if options.lower_fpow => {
            let log = b.alu(Flog2, &[src(0)]);
            let scaled = b.alu(Fmul, &[log, src(1)]);
            b.alu_to(def, Fexp2, &[scaled]);
            Some(())
        }
        Isign if options.lower_isign => {
            let minus_one = b.imm(u64::MAX & mask(bits), bits);
            let one = b.imm(1, bits);
            let clamped = b.alu(Imax, &[src(0), minus_one]);
            b.alu_to(def, Imin, &[clamped, one]);
            Some(())
        }
        Fsign if options.lower_fsign => {
            let values = [float_bits(0.0, bits)?, float_bits(1.0, bits)?, float_bits(-1.0, bits)?];
            let [zero, one, minus_one] = values.map(|v| b.imm(v, bits));
            let positive = b.alu(Flt, &[zero, src(0)]);
            let negative = b.alu(Flt, &[src(0), zero]);
            let rest = b.alu(Bcsel, &[negative, minus_one, zero]);
            b.alu_to(def, Bcsel, &[positive, one, rest]);
            Some(())
        }
        _ => None,
    }
}

pub fn algebraic(shader: &mut Shader, options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        let ops = Operands::collect(body);
        progress |= rewrite_alu(body, &mut |alu, b| simplify(alu, &ops, options, b).is_some());
    }
    progress
}

/// `a * b + c` with a single-use multiply becomes `ffma`.
fn fuse_ffma(alu: &AluInstr, ops: &Operands, uses: &HashMap<u32, usize>, b: &mut InstrBuilder<'_>) -> bool {
    let found = (0..2).find_map(|i| {
        let outer = alu.srcs[i];
        let mul = ops.producer(&outer, AluOp::Fmul)?;
        (uses.get(&outer.src.index) == Some(&1)).then_some((i, mul))
    });
    let Some((i, mul)) = found else {
        return false;
    };
    let outer = alu.srcs[i];
    b.alu_to(
        alu.def,
        AluOp::Ffma,
        &[compose(&outer, &mul.srcs[0]), compose(&outer, &mul.srcs[1]), alu.srcs[1 - i]],
    );
    true
}

/// `a + (-b)` becomes a subtraction.
fn fuse_sub(alu: &AluInstr, ops: &Operands, b: &mut InstrBuilder<'_>) -> bool {
    let (neg_op, sub_op) = match alu.op {
        AluOp::Fadd => (AluOp::Fneg, AluOp::Fsub),
        _ => (AluOp::Ineg, AluOp::Isub),
    };
    let found = (0..2).find_map(|i| Some((i, ops.producer(&alu.srcs[i], neg_op)?)));
    let Some((i, neg)) = found else {
        return false;
    };
    if sub_op == AluOp::Isub && (neg.srcs[0].negate || neg.srcs[0].abs) {
        return false;
    }
    b.alu_to(alu.def, sub_op, &[alu.srcs[1 - i], compose(&alu.srcs[i], &neg.srcs[0])]);
    true
}

fn fuse(
    alu: &AluInstr,
    ops: &Operands,
    uses: &HashMap<u32, usize>,
    options: &CompilerOptions,
    b: &mut InstrBuilder<'_>,
) -> bool {
    match alu.op {
        AluOp::Fadd => {
            (options.fuse_ffma(alu.def.bit_size) && fuse_ffma(alu, ops, uses, b)) || fuse_sub(alu, ops, b)
        }
        AluOp::Iadd => fuse_sub(alu, ops, b),
        _ => false,
    }
}

pub fn algebraic_late(shader: &mut Shader, options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        let ops = Operands::collect(body);
        let uses = body.use_counts();
        progress |= rewrite_alu(body, &mut |alu, b| fuse(alu, &ops, &uses, options, b));
    }
    progress
}
