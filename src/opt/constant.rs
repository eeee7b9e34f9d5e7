//! Constant folding and undef cleanup.

use hashbrown::HashSet;
use smallvec::SmallVec;

use super::CompilerOptions;
use crate::ir::{
    visit_blocks, visit_blocks_mut, AluClass, AluInstr, AluOp, Instr, Intrinsic, LoadConstInstr,
    Shader, UndefInstr,
};

pub(crate) fn mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Sign-extend the low `bits` of `value`.
fn sext(value: u64, bits: u8) -> i64 {
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - u32::from(bits);
    ((value << shift) as i64) >> shift
}

fn f16_to_f32(half: u16) -> f32 {
    let sign = u32::from(half >> 15) << 31;
    let exp = u32::from((half >> 10) & 0x1f);
    let mant = u32::from(half & 0x3ff);
    let bits = match exp {
        0 if mant == 0 => sign,
        0 => {
            let value = mant as f32 * 2f32.powi(-24);
            return if sign != 0 { -value } else { value };
        }
        0x1f => sign | 0x7f80_0000 | (mant << 13),
        _ => sign | ((exp + 112) << 23) | (mant << 13),
    };
    f32::from_bits(bits)
}

/// Round-to-nearest-even conversion to half precision.
fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mant = bits & 0x7f_ffff;
    if exp == 0xff {
        return sign | 0x7c00 | if mant != 0 { 0x200 } else { 0 };
    }
    let e = exp - 127 + 15;
    if e >= 0x1f {
        return sign | 0x7c00;
    }
    if e <= 0 {
        if e < -10 {
            return sign;
        }
        let m = mant | 0x80_0000;
        let shift = (14 - e) as u32;
        let half = 1 << (shift - 1);
        let rounded = (m + half - 1 + ((m >> shift) & 1)) >> shift;
        return sign | rounded as u16;
    }
    // A mantissa carry rolls into the exponent.
    let rounded = (mant + 0xfff + ((mant >> 13) & 1)) >> 13;
    let out = ((e as u32) << 10) + rounded;
    if out >= 0x7c00 {
        sign | 0x7c00
    } else {
        sign | out as u16
    }
}

/// Interpret the raw bits of a float of width `bits`.
pub fn float_value(raw: u64, bits: u8) -> Option<f64> {
    match bits {
        16 => Some(f64::from(f16_to_f32(raw as u16))),
        32 => Some(f64::from(f32::from_bits(raw as u32))),
        64 => Some(f64::from_bits(raw)),
        _ => None,
    }
}

/// Raw bits of `value` as a float of width `bits`.
pub fn float_bits(value: f64, bits: u8) -> Option<u64> {
    match bits {
        16 => Some(u64::from(f32_to_f16(value as f32))),
        32 => Some(u64::from((value as f32).to_bits())),
        64 => Some(value.to_bits()),
        _ => None,
    }
}

/// Whether `op` reads its sources as floats.
fn reads_float(op: AluOp) -> bool {
    use AluOp::*;
    op.info().class == AluClass::Float || matches!(op, Feq | Fneu | Flt | Fge | F2u32 | F2i32)
}

fn eval_float(op: AluOp, bits: u8, srcs: &[u64]) -> Option<u64> {
    use AluOp::*;

    // Folding half floats would need fp16 rounding for every intermediate.
    if bits == 16 {
        return None;
    }
    let mut v: SmallVec<[f64; 3]> = SmallVec::new();
    for raw in srcs {
        v.push(float_value(*raw, bits)?);
    }
    let result = match op {
        Fadd => v[0] + v[1],
        Fsub => v[0] - v[1],
        Fmul => v[0] * v[1],
        Ffma => v[0].mul_add(v[1], v[2]),
        Fdiv => v[0] / v[1],
        Fneg => -v[0],
        Fabs => v[0].abs(),
        Frcp => 1.0 / v[0],
        Ffloor => v[0].floor(),
        Ffract => v[0] - v[0].floor(),
        Fmod => v[0] - v[1] * (v[0] / v[1]).floor(),
        Flrp => v[0] + v[2] * (v[1] - v[0]),
        Fpow => v[0].powf(v[1]),
        Fexp2 => v[0].exp2(),
        Flog2 => v[0].log2(),
        Fsign => {
            if v[0] > 0.0 {
                1.0
            } else if v[0] < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        Feq => return Some(u64::from(v[0] == v[1])),
        Fneu => return Some(u64::from(v[0] != v[1])),
        Flt => return Some(u64::from(v[0] < v[1])),
        Fge => return Some(u64::from(v[0] >= v[1])),
        F2u32 => return Some(u64::from(v[0] as u32)),
        F2i32 => return Some(u64::from(v[0] as i32 as u32)),
        _ => return None,
    };
    float_bits(result, bits)
}

/// Evaluate one component of `op` on raw source bits.
///
/// `src_bits` is the width of the first source; the result is truncated to
/// `dest_bits`. Returns `None` for anything that cannot be folded.
pub(crate) fn eval_alu(op: AluOp, src_bits: u8, dest_bits: u8, srcs: &[u64]) -> Option<u64> {
    use AluOp::*;

    if op.is_vec() {
        return None;
    }
    if reads_float(op) {
        return eval_float(op, src_bits, srcs).map(|v| v & mask(dest_bits));
    }

    let bits = src_bits;
    let m = mask(bits);
    let a = srcs[0] & m;
    let b = srcs.get(1).map_or(0, |v| v & m);
    let (sa, sb) = (sext(a, bits), sext(b, bits));
    let shift = (b as u32) % u32::from(bits.max(1));

    let result = match op {
        Mov => a,
        Iadd => a.wrapping_add(b),
        Isub => a.wrapping_sub(b),
        Imul => a.wrapping_mul(b),
        Ineg => a.wrapping_neg(),
        Iabs => sa.wrapping_abs() as u64,
        Isign => sa.signum() as u64,
        Udiv if b != 0 => a / b,
        Umod if b != 0 => a % b,
        Idiv if b != 0 => sa.wrapping_div(sb) as u64,
        Irem if b != 0 => sa.wrapping_rem(sb) as u64,
        Imod if b != 0 => {
            let r = sa.wrapping_rem(sb);
            if r != 0 && (r < 0) != (sb < 0) {
                r.wrapping_add(sb) as u64
            } else {
                r as u64
            }
        }
        Udiv | Umod | Idiv | Irem | Imod => return None,
        UmulHigh => ((u128::from(a) * u128::from(b)) >> bits) as u64,
        Imin => sa.min(sb) as u64,
        Imax => sa.max(sb) as u64,
        Iand => a & b,
        Ior => a | b,
        Ixor => a ^ b,
        Inot => !a,
        Ishl => a << shift,
        Ishr => (sa >> shift) as u64,
        Ushr => a >> shift,
        Ieq => u64::from(a == b),
        Ine => u64::from(a != b),
        Ilt => u64::from(sa < sb),
        Ige => u64::from(sa >= sb),
        Ult => u64::from(a < b),
        Uge => u64::from(a >= b),
        Bcsel => {
            if srcs[0] != 0 {
                srcs[1]
            } else {
                srcs[2]
            }
        }
        U2f32 => float_bits(a as f64, 32)?,
        I2f32 => float_bits(sa as f64, 32)?,
        U2u16 | U2u32 => a,
        I2i32 => sa as u64,
        Pack64_2x32Split => (a & 0xffff_ffff) | (b << 32),
        Unpack64_2x32SplitX => a & 0xffff_ffff,
        Unpack64_2x32SplitY => a >> 32,
        _ => return None,
    };
    Some(result & mask(dest_bits))
}

fn fold(alu: &AluInstr, consts: &hashbrown::HashMap<u32, LoadConstInstr>) -> Option<SmallVec<[u64; 4]>> {
    if alu.op.is_vec() || alu.srcs.is_empty() {
        return None;
    }
    let float = reads_float(alu.op);
    if !float && alu.srcs.iter().any(|s| s.negate || s.abs) {
        return None;
    }
    let src_bits = alu.srcs[0].src.bit_size;

    let mut values = SmallVec::new();
    for c in 0..usize::from(alu.def.num_components) {
        let mut args: SmallVec<[u64; 3]> = SmallVec::new();
        for src in &alu.srcs {
            let lc = consts.get(&src.src.index)?;
            let mut raw = *lc.values.get(usize::from(src.swizzle[c]))?;
            if src.abs || src.negate {
                let bits = src.src.bit_size;
                let mut value = float_value(raw, bits)?;
                if src.abs {
                    value = value.abs();
                }
                if src.negate {
                    value = -value;
                }
                raw = float_bits(value, bits)?;
            }
            args.push(raw);
        }
        values.push(eval_alu(alu.op, src_bits, alu.def.bit_size, &args)?);
    }
    Some(values)
}

pub fn constant_folding(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        let mut consts = body.constants();
        visit_blocks_mut(&mut body.body, &mut |block| {
            for instr in &mut block.instrs {
                let Instr::Alu(alu) = instr else { continue };
                let Some(values) = fold(alu, &consts) else { continue };
                let def = alu.def;
                let folded = Instr::load_const(def, &values);
                if let Instr::LoadConst(lc) = &folded {
                    consts.insert(def.index, lc.clone());
                }
                *instr = folded;
                progress = true;
            }
        });
    }
    progress
}

/// Simplify operations reading undefined values.
pub fn opt_undef(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        let mut undefs = HashSet::new();
        visit_blocks(&body.body, &mut |block| {
            for instr in &block.instrs {
                if let Instr::Undef(undef) = instr {
                    undefs.insert(undef.def.index);
                }
            }
        });
        if undefs.is_empty() {
            continue;
        }

        visit_blocks_mut(&mut body.body, &mut |block| {
            let before = block.instrs.len();
            block.instrs.retain(|instr| {
                !matches!(instr, Instr::Intrinsic(intr)
                    if intr.intrinsic == Intrinsic::StoreOutput && undefs.contains(&intr.srcs[0].index))
            });
            progress |= block.instrs.len() != before;

            for instr in &mut block.instrs {
                let Instr::Alu(alu) = instr else { continue };
                let is_undef = |i: usize| undefs.contains(&alu.srcs[i].src.index);
                let replacement = match alu.op {
                    AluOp::Bcsel if is_undef(1) => Instr::mov(alu.def, alu.srcs[2]),
                    AluOp::Bcsel if is_undef(2) => Instr::mov(alu.def, alu.srcs[1]),
                    op if op.is_vec() && (0..alu.srcs.len()).all(is_undef) => {
                        Instr::Undef(UndefInstr { def: alu.def })
                    }
                    _ => continue,
                };
                *instr = replacement;
                progress = true;
            }
        });
    }
    progress
}

pub fn lower_undef_to_zero(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        visit_blocks_mut(&mut body.body, &mut |block| {
            for instr in &mut block.instrs {
                if let Instr::Undef(undef) = instr {
                    let zeros: SmallVec<[u64; 4]> =
                        (0..undef.def.num_components).map(|_| 0).collect();
                    *instr = Instr::load_const(undef.def, &zeros);
                    progress = true;
                }
            }
        });
    }
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_shader;
    use crate::opt::AGX_OPTIONS;

    fn first_block(shader: &Shader) -> Vec<Instr> {
        shader.functions[0].body.as_ref().unwrap().blocks()[0].instrs.clone()
    }

    #[test]
    fn half_float_conversion() {
        assert_eq!(float_bits(1.0, 16), Some(0x3c00));
        assert_eq!(float_bits(-0.5, 16), Some(0xb800));
        assert_eq!(float_bits(65536.0, 16), Some(0x7c00));
        assert_eq!(float_value(0x3555, 16).map(|v| (v * 1000.0).round()), Some(333.0));
        assert_eq!(float_value(0x0001, 16), Some(2f64.powi(-24)));
        assert_eq!(float_bits(2f64.powi(-24), 16), Some(0x0001));
    }

    #[test]
    fn integer_edge_cases() {
        assert_eq!(eval_alu(AluOp::Iadd, 32, 32, &[0xffff_ffff, 2]), Some(1));
        assert_eq!(eval_alu(AluOp::Ilt, 32, 1, &[0xffff_ffff, 0]), Some(1));
        assert_eq!(eval_alu(AluOp::Udiv, 32, 32, &[4, 0]), None);
        assert_eq!(eval_alu(AluOp::Ishr, 32, 32, &[0x8000_0000, 31]), Some(0xffff_ffff));
        assert_eq!(eval_alu(AluOp::UmulHigh, 32, 32, &[0x8000_0000, 4]), Some(2));
        assert_eq!(eval_alu(AluOp::I2i32, 16, 32, &[0x8000]), Some(0xffff_8000));
    }

    #[test]
    fn folds_through_swizzles_and_modifiers() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:32x2 = load_const 0x3f800000, 0x40000000
                 %1:32 = fadd %0.y, -%0.x
                 %2:32 = fmul %1, %1
                 %3:32x2 = vec2 %2, %1
               }
             }",
        )
        .unwrap();
        assert!(constant_folding(&mut shader, &AGX_OPTIONS));
        let instrs = first_block(&shader);
        assert_eq!(instrs[1], Instr::load_const(crate::ir::Ssa::new(1, 32, 1), &[0x3f80_0000]));
        assert!(matches!(instrs[2], Instr::LoadConst(_)));
        assert!(matches!(&instrs[3], Instr::Alu(a) if a.op == AluOp::Vec2));
        assert!(!constant_folding(&mut shader, &AGX_OPTIONS));
    }

    #[test]
    fn undef_arms_and_stores_disappear() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = undef
                 %1:1 = load_const 0x1
                 %2:32 = load_const 0x7
                 %3:32 = bcsel %1, %0, %2
                 %4:32x2 = vec2 %0, %0
                 store_output %0, %2 base=0
               }
             }",
        )
        .unwrap();
        assert!(opt_undef(&mut shader, &AGX_OPTIONS));
        let instrs = first_block(&shader);
        assert_eq!(instrs.len(), 5);
        assert!(matches!(&instrs[3], Instr::Alu(a) if a.op == AluOp::Mov && a.srcs[0].src.index == 2));
        assert!(matches!(&instrs[4], Instr::Undef(_)));

        assert!(lower_undef_to_zero(&mut shader, &AGX_OPTIONS));
        let instrs = first_block(&shader);
        assert_eq!(instrs[4], Instr::load_const(crate::ir::Ssa::new(4, 32, 2), &[0, 0]));
    }
}
