//! One-shot legalizations: registers to SSA, 64-bit integer splitting,
//! integer division and `flrp` expansion.

use hashbrown::{HashMap, HashSet};

use super::{rewrite_alu, CompilerOptions, IdivOptions, Int64Lowering};
use crate::ir::{visit_blocks, visit_blocks_mut, AluOp, AluSrc, Instr, InstrBuilder, Intrinsic, Shader, Ssa};

/// Forward `store_reg` values to later `load_reg`s of the same block and drop
/// stores nobody loads anymore.
pub fn lower_regs_to_ssa(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        visit_blocks_mut(&mut body.body, &mut |block| {
            let mut current: HashMap<u32, Ssa> = HashMap::new();
            for instr in &mut block.instrs {
                let Instr::Intrinsic(intr) = instr else { continue };
                match intr.intrinsic {
                    Intrinsic::StoreReg => {
                        let value = intr.srcs[0];
                        let full = ((1u16 << value.num_components) - 1) as u8;
                        if intr.write_mask == 0 || intr.write_mask & full == full {
                            current.insert(intr.base, value);
                        } else {
                            current.remove(&intr.base);
                        }
                    }
                    Intrinsic::LoadReg => {
                        let (Some(def), Some(value)) = (intr.def, current.get(&intr.base)) else {
                            continue;
                        };
                        if def.bit_size == value.bit_size && def.num_components == value.num_components {
                            *instr = Instr::mov(def, AluSrc::new(*value));
                            progress = true;
                        }
                    }
                    _ => {}
                }
            }
        });

        let mut loaded: HashSet<u32> = HashSet::new();
        visit_blocks(&body.body, &mut |block| {
            for instr in &block.instrs {
                if let Instr::Intrinsic(intr) = instr {
                    if intr.intrinsic == Intrinsic::LoadReg {
                        loaded.insert(intr.base);
                    }
                }
            }
        });
        visit_blocks_mut(&mut body.body, &mut |block| {
            let before = block.instrs.len();
            block.instrs.retain(|instr| match instr {
                Instr::Intrinsic(intr) if intr.intrinsic == Intrinsic::StoreReg => {
                    loaded.contains(&intr.base)
                }
                _ => true,
            });
            progress |= block.instrs.len() != before;
        });
    }
    progress
}

/// Low and high 32-bit halves of a 64-bit source.
fn split(b: &mut InstrBuilder<'_>, src: AluSrc) -> (AluSrc, AluSrc) {
    let lo = b.alu(AluOp::Unpack64_2x32SplitX, &[src]);
    let hi = b.alu(AluOp::Unpack64_2x32SplitY, &[src]);
    (lo, hi)
}

/// `cond ? 1 : 0` as a 32-bit integer.
fn b2i32(b: &mut InstrBuilder<'_>, cond: AluSrc) -> AluSrc {
    let one = b.imm(1, 32);
    let zero = b.imm(0, 32);
    b.alu(AluOp::Bcsel, &[cond, one, zero])
}

fn lower_int64_alu(b: &mut InstrBuilder<'_>, op: AluOp, def: Ssa, srcs: &[AluSrc]) {
    use AluOp::*;

    let (alo, ahi) = split(b, srcs[0]);
    match op {
        Inot => {
            let lo = b.alu(Inot, &[alo]);
            let hi = b.alu(Inot, &[ahi]);
            b.alu_to(def, Pack64_2x32Split, &[lo, hi]);
        }
        Ineg => {
            let lo = b.alu(Ineg, &[alo]);
            let zero = b.imm(0, 32);
            let nonzero = b.alu(Ine, &[alo, zero]);
            let borrow = b2i32(b, nonzero);
            let neg_hi = b.alu(Ineg, &[ahi]);
            let hi = b.alu(Isub, &[neg_hi, borrow]);
            b.alu_to(def, Pack64_2x32Split, &[lo, hi]);
        }
        _ => {
            let (blo, bhi) = split(b, srcs[1]);
            match op {
                Iand | Ior | Ixor => {
                    let lo = b.alu(op, &[alo, blo]);
                    let hi = b.alu(op, &[ahi, bhi]);
                    b.alu_to(def, Pack64_2x32Split, &[lo, hi]);
                }
                Iadd => {
                    let lo = b.alu(Iadd, &[alo, blo]);
                    let wrapped = b.alu(Ult, &[lo, alo]);
                    let carry = b2i32(b, wrapped);
                    let sum = b.alu(Iadd, &[ahi, bhi]);
                    let hi = b.alu(Iadd, &[sum, carry]);
                    b.alu_to(def, Pack64_2x32Split, &[lo, hi]);
                }
                Isub => {
                    let lo = b.alu(Isub, &[alo, blo]);
                    let wrapped = b.alu(Ult, &[alo, blo]);
                    let borrow = b2i32(b, wrapped);
                    let diff = b.alu(Isub, &[ahi, bhi]);
                    let hi = b.alu(Isub, &[diff, borrow]);
                    b.alu_to(def, Pack64_2x32Split, &[lo, hi]);
                }
                Imul => {
                    let lo = b.alu(Imul, &[alo, blo]);
                    let carry = b.alu(UmulHigh, &[alo, blo]);
                    let cross0 = b.alu(Imul, &[alo, bhi]);
                    let cross1 = b.alu(Imul, &[ahi, blo]);
                    let cross = b.alu(Iadd, &[cross0, cross1]);
                    let hi = b.alu(Iadd, &[carry, cross]);
                    b.alu_to(def, Pack64_2x32Split, &[lo, hi]);
                }
                Ieq => {
                    let lo = b.alu(Ieq, &[alo, blo]);
                    let hi = b.alu(Ieq, &[ahi, bhi]);
                    b.alu_to(def, Iand, &[lo, hi]);
                }
                Ine => {
                    let lo = b.alu(Ine, &[alo, blo]);
                    let hi = b.alu(Ine, &[ahi, bhi]);
                    b.alu_to(def, Ior, &[lo, hi]);
                }
                Ult | Ilt | Uge | Ige => {
                    // Decided by the high halves unless they are equal.
                    let (hi_op, lo_op, hi_srcs) = match op {
                        Ult => (Ult, Ult, [ahi, bhi]),
                        Ilt => (Ilt, Ult, [ahi, bhi]),
                        Uge => (Ult, Uge, [bhi, ahi]),
                        _ => (Ilt, Uge, [bhi, ahi]),
                    };
                    let strict = b.alu(hi_op, &hi_srcs);
                    let hi_eq = b.alu(Ieq, &[ahi, bhi]);
                    let lo_cmp = b.alu(lo_op, &[alo, blo]);
                    let tie = b.alu(Iand, &[hi_eq, lo_cmp]);
                    b.alu_to(def, Ior, &[strict, tie]);
                }
                _ => unreachable!("filtered by int64_lowering_for"),
            }
        }
    }
}

/// Lowering class of a 64-bit operation, if it has one.
fn int64_lowering_for(op: AluOp) -> Option<Int64Lowering> {
    use AluOp::*;
    match op {
        Iand | Ior | Ixor | Inot => Some(Int64Lowering::LOGIC),
        Iadd => Some(Int64Lowering::IADD),
        Isub => Some(Int64Lowering::ISUB),
        Ineg => Some(Int64Lowering::INEG),
        Imul => Some(Int64Lowering::IMUL),
        Ieq | Ine | Ilt | Ige | Ult | Uge => Some(Int64Lowering::ICMP),
        _ => None,
    }
}

pub fn lower_int64(shader: &mut Shader, options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        progress |= rewrite_alu(body, &mut |alu, b| {
            let Some(class) = int64_lowering_for(alu.op) else {
                return false;
            };
            let width = alu.srcs.first().map_or(0, |s| s.src.bit_size);
            if width != 64 || !options.lower_int64.contains(class) {
                return false;
            }
            lower_int64_alu(b, alu.op, alu.def, &alu.srcs);
            true
        });
    }
    progress
}

/// Reciprocal scale, 4294966784.0 as a 32-bit float.
const UDIV_RCP_SCALE: u64 = 0x4f7f_fffe;

fn emit_udiv(
    b: &mut InstrBuilder<'_>,
    numer: AluSrc,
    denom: AluSrc,
    modulo: bool,
    opts: IdivOptions,
) -> AluSrc {
    use AluOp::*;

    if opts.imprecise_32bit {
        let fnum = b.alu(U2f32, &[numer]);
        let fden = b.alu(U2f32, &[denom]);
        let rcp = b.alu(Frcp, &[fden]);
        let fq = b.alu(Fmul, &[fnum, rcp]);
        let quotient = b.alu(F2u32, &[fq]);
        if !modulo {
            return quotient;
        }
        let prod = b.alu(Imul, &[quotient, denom]);
        return b.alu(Isub, &[numer, prod]);
    }

    let fden = b.alu(U2f32, &[denom]);
    let rcp = b.alu(Frcp, &[fden]);
    let scale = b.imm(UDIV_RCP_SCALE, 32);
    let scaled = b.alu(Fmul, &[rcp, scale]);
    let rcp = b.alu(F2u32, &[scaled]);
    let neg_denom = b.alu(Ineg, &[denom]);
    let neg_rcp_times_denom = b.alu(Imul, &[rcp, neg_denom]);
    let correction = b.alu(UmulHigh, &[rcp, neg_rcp_times_denom]);
    let rcp = b.alu(Iadd, &[rcp, correction]);

    let mut quotient = b.alu(UmulHigh, &[numer, rcp]);
    let prod = b.alu(Imul, &[quotient, denom]);
    let mut remainder = b.alu(Isub, &[numer, prod]);
    let one = b.imm(1, 32);

    // Two refinement steps.
    let ge = b.alu(Uge, &[remainder, denom]);
    if !modulo {
        let bumped = b.alu(Iadd, &[quotient, one]);
        quotient = b.alu(Bcsel, &[ge, bumped, quotient]);
    }
    let reduced = b.alu(Isub, &[remainder, denom]);
    remainder = b.alu(Bcsel, &[ge, reduced, remainder]);

    let ge = b.alu(Uge, &[remainder, denom]);
    if modulo {
        let reduced = b.alu(Isub, &[remainder, denom]);
        b.alu(Bcsel, &[ge, reduced, remainder])
    } else {
        let bumped = b.alu(Iadd, &[quotient, one]);
        b.alu(Bcsel, &[ge, bumped, quotient])
    }
}

fn emit_idiv(b: &mut InstrBuilder<'_>, op: AluOp, numer: AluSrc, denom: AluSrc, opts: IdivOptions) -> AluSrc {
    use AluOp::*;

    if matches!(op, Udiv | Umod) {
        return emit_udiv(b, numer, denom, op == Umod, opts);
    }

    let zero = b.imm(0, 32);
    let lh_sign = b.alu(Ilt, &[numer, zero]);
    let rh_sign = b.alu(Ilt, &[denom, zero]);
    let lhs = b.alu(Iabs, &[numer]);
    let rhs = b.alu(Iabs, &[denom]);

    if op == Idiv {
        let sign = b.alu(Ixor, &[lh_sign, rh_sign]);
        let res = emit_udiv(b, lhs, rhs, false, opts);
        let neg = b.alu(Ineg, &[res]);
        return b.alu(Bcsel, &[sign, neg, res]);
    }

    let res = emit_udiv(b, lhs, rhs, true, opts);
    let neg = b.alu(Ineg, &[res]);
    let res = b.alu(Bcsel, &[lh_sign, neg, res]);
    if op == Irem {
        return res;
    }
    // imod takes the sign of the divisor.
    let nonzero = b.alu(Ine, &[res, zero]);
    let signs_differ = b.alu(Ixor, &[lh_sign, rh_sign]);
    let fixup = b.alu(Iand, &[nonzero, signs_differ]);
    let adjusted = b.alu(Iadd, &[res, denom]);
    b.alu(Bcsel, &[fixup, adjusted, res])
}

pub fn lower_idiv(shader: &mut Shader, options: &CompilerOptions) -> bool {
    let opts = options.lower_idiv;
    let mut progress = false;
    for body in shader.bodies_mut() {
        progress |= rewrite_alu(body, &mut |alu, b| {
            use AluOp::*;

            if !matches!(alu.op, Udiv | Idiv | Umod | Imod | Irem) {
                return false;
            }
            let signed = matches!(alu.op, Idiv | Imod | Irem);
            match alu.def.bit_size {
                32 => {
                    let res = emit_idiv(b, alu.op, alu.srcs[0], alu.srcs[1], opts);
                    b.alu_to(alu.def, Mov, &[res]);
                    true
                }
                16 if opts.allow_fp16 => {
                    let widen = if signed { I2i32 } else { U2u32 };
                    let numer = b.alu(widen, &[alu.srcs[0]]);
                    let denom = b.alu(widen, &[alu.srcs[1]]);
                    let res = emit_idiv(b, alu.op, numer, denom, opts);
                    b.alu_to(alu.def, U2u16, &[res]);
                    true
                }
                _ => false,
            }
        });
    }
    progress
}

/// `flrp(a, b, t)` becomes `a + t * (b - a)`.
pub fn lower_flrp(shader: &mut Shader, options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        progress |= rewrite_alu(body, &mut |alu, b| {
            if alu.op != AluOp::Flrp || !options.lowers_flrp(alu.def.bit_size) {
                return false;
            }
            let [a, bv, t] = [alu.srcs[0], alu.srcs[1], alu.srcs[2]];
            let diff = b.alu(AluOp::Fsub, &[bv, a]);
            let scaled = b.alu(AluOp::Fmul, &[t, diff]);
            b.alu_to(alu.def, AluOp::Fadd, &[a, scaled]);
            true
        });
    }
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_shader;
    use crate::opt::constant::eval_alu;
    use crate::opt::AGX_OPTIONS;

    fn instrs(shader: &Shader) -> Vec<Instr> {
        shader.functions[0].body.as_ref().unwrap().blocks()[0].instrs.clone()
    }

    fn ops(shader: &Shader) -> Vec<&'static str> {
        instrs(shader).iter().map(|i| i.name()).collect()
    }

    /// Interpret a straight-line block of constants and ALU ops.
    fn run(shader: &Shader) -> HashMap<u32, u64> {
        let mut values = HashMap::new();
        for instr in instrs(shader) {
            match instr {
                Instr::LoadConst(lc) => {
                    values.insert(lc.def.index, lc.values[0]);
                }
                Instr::Alu(alu) => {
                    let srcs: Vec<u64> = alu.srcs.iter().map(|s| values[&s.src.index]).collect();
                    let bits = alu.srcs[0].src.bit_size;
                    let value = eval_alu(alu.op, bits, alu.def.bit_size, &srcs).unwrap();
                    values.insert(alu.def.index, value);
                }
                _ => {}
            }
        }
        values
    }

    #[test]
    fn register_loads_become_moves() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x2
                 store_reg %0 base=3
                 %1:32 = load_reg base=3
                 %2:32 = iadd %1, %1
               }
             }",
        )
        .unwrap();
        assert!(lower_regs_to_ssa(&mut shader, &AGX_OPTIONS));
        assert_eq!(ops(&shader), ["load_const", "mov", "iadd"]);
        assert!(!lower_regs_to_ssa(&mut shader, &AGX_OPTIONS));
    }

    #[test]
    fn udiv_sequence_divides() {
        for (n, d) in [(100u64, 7u64), (7, 100), (0xffff_ffff, 3), (12, 12), (5, 1)] {
            let mut shader = parse_shader(&format!(
                "shader fragment
                 fn main {{
                   block b0 {{
                     %0:32 = load_const {n:#x}
                     %1:32 = load_const {d:#x}
                     %2:32 = udiv %0, %1
                     %3:32 = umod %0, %1
                   }}
                 }}"
            ))
            .unwrap();
            assert!(lower_idiv(&mut shader, &AGX_OPTIONS));
            assert!(!ops(&shader).contains(&"udiv"));
            let values = run(&shader);
            assert_eq!(values[&2], n / d, "{n} / {d}");
            assert_eq!(values[&3], n % d, "{n} % {d}");
        }
    }

    #[test]
    fn signed_division_follows_operand_signs() {
        let cases: [(i32, i32); 4] = [(-7, 2), (7, -2), (-7, -2), (9, 3)];
        for (n, d) in cases {
            let mut shader = parse_shader(&format!(
                "shader fragment
                 fn main {{
                   block b0 {{
                     %0:32 = load_const {:#x}
                     %1:32 = load_const {:#x}
                     %2:32 = idiv %0, %1
                     %3:32 = irem %0, %1
                     %4:32 = imod %0, %1
                   }}
                 }}",
                n as u32, d as u32
            ))
            .unwrap();
            lower_idiv(&mut shader, &AGX_OPTIONS);
            let values = run(&shader);
            assert_eq!(values[&2] as u32 as i32, n / d);
            assert_eq!(values[&3] as u32 as i32, n % d);
            assert_eq!(values[&4] as u32 as i32, n.rem_euclid(d) + if d < 0 && n.rem_euclid(d) != 0 { d } else { 0 });
        }
    }

    #[test]
    fn int64_ops_are_split() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:64 = load_const 0x100000005
                 %1:64 = load_const 0x7
                 %2:64 = isub %0, %1
                 %3:64 = imul %0, %1
                 %4:1 = ult %1, %0
                 %5:64 = iadd %0, %1
               }
             }",
        )
        .unwrap();
        assert!(lower_int64(&mut shader, &AGX_OPTIONS));
        // 64-bit adds are native.
        assert_eq!(ops(&shader).last(), Some(&"iadd"));

        let values = run(&shader);
        assert_eq!(values[&2], 0x1_0000_0005 - 7);
        assert_eq!(values[&3], 0x7_0000_0023);
        assert_eq!(values[&4], 1);
    }

    #[test]
    fn flrp_is_expanded() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = undef
                 %1:32 = flrp %0, %0, %0
               }
             }",
        )
        .unwrap();
        assert!(lower_flrp(&mut shader, &AGX_OPTIONS));
        assert_eq!(ops(&shader), ["undef", "fsub", "fmul", "fadd"]);
    }
}
