//! Scalarization of ALU operations and constant loads.
//!
//! A vector value becomes one scalar instruction per component followed by
//! a `vecN` pack writing the original def, so uses stay untouched.

use smallvec::SmallVec;

use super::CompilerOptions;
use crate::ir::{next_ssa, visit_blocks_mut, AluOp, AluSrc, Instr, Shader};

pub fn lower_alu_to_scalar(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        let alloc = &mut body.ssa_alloc;
        visit_blocks_mut(&mut body.body, &mut |block| {
            for instr in std::mem::take(&mut block.instrs) {
                let (alu, vec_op) = match instr {
                    Instr::Alu(alu) if !alu.op.is_vec() && (2..=4).contains(&alu.def.num_components) => {
                        match AluOp::vec(alu.def.num_components) {
                            Some(vec_op) => (alu, vec_op),
                            None => {
                                block.instrs.push(Instr::Alu(alu));
                                continue;
                            }
                        }
                    }
                    other => {
                        block.instrs.push(other);
                        continue;
                    }
                };

                let mut chans: SmallVec<[AluSrc; 4]> = SmallVec::new();
                for c in 0..usize::from(alu.def.num_components) {
                    let def = next_ssa(alloc, alu.def.bit_size, 1);
                    let srcs: SmallVec<[AluSrc; 4]> = alu
                        .srcs
                        .iter()
                        .map(|s| AluSrc {
                            swizzle: [s.swizzle[c]; 4],
                            ..*s
                        })
                        .collect();
                    block.instrs.push(Instr::alu(alu.op, def, &srcs));
                    chans.push(AluSrc::new(def));
                }
                block.instrs.push(Instr::alu(vec_op, alu.def, &chans));
                progress = true;
            }
        });
    }
    progress
}

pub fn lower_load_const_to_scalar(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        let alloc = &mut body.ssa_alloc;
        visit_blocks_mut(&mut body.body, &mut |block| {
            for instr in std::mem::take(&mut block.instrs) {
                let (lc, vec_op) = match instr {
                    Instr::LoadConst(lc) if lc.def.num_components > 1 => {
                        match AluOp::vec(lc.def.num_components) {
                            Some(vec_op) if lc.def.num_components <= 4 => (lc, vec_op),
                            _ => {
                                block.instrs.push(Instr::LoadConst(lc));
                                continue;
                            }
                        }
                    }
                    other => {
                        block.instrs.push(other);
                        continue;
                    }
                };

                let chans: SmallVec<[AluSrc; 4]> = lc
                    .values
                    .iter()
                    .map(|value| {
                        let def = next_ssa(alloc, lc.def.bit_size, 1);
                        block.instrs.push(Instr::load_const(def, &[*value]));
                        AluSrc::new(def)
                    })
                    .collect();
                block.instrs.push(Instr::alu(vec_op, lc.def, &chans));
                progress = true;
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

    #[test]
    fn vector_alu_is_split_per_component() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:32x4 = undef
                 %1:32x2 = fadd %0.zw, -%0.xy
               }
             }",
        )
        .unwrap();
        assert!(lower_alu_to_scalar(&mut shader, &AGX_OPTIONS));

        let body = shader.functions[0].body.as_ref().unwrap();
        let instrs = &body.blocks()[0].instrs;
        assert_eq!(instrs.len(), 4);
        let Instr::Alu(y) = &instrs[2] else { panic!() };
        assert_eq!(y.def.num_components, 1);
        assert_eq!(y.srcs[0].swizzle[0], 3);
        assert!(y.srcs[1].negate);
        let Instr::Alu(pack) = &instrs[3] else { panic!() };
        assert_eq!(pack.op, AluOp::Vec2);
        assert_eq!(pack.def.index, 1);

        assert!(!lower_alu_to_scalar(&mut shader, &AGX_OPTIONS));
    }

    #[test]
    fn constants_are_split() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:16x3 = load_const 0x1, 0x2, 0x3
               }
             }",
        )
        .unwrap();
        assert!(lower_load_const_to_scalar(&mut shader, &AGX_OPTIONS));
        let body = shader.functions[0].body.as_ref().unwrap();
        let instrs = &body.blocks()[0].instrs;
        assert_eq!(instrs.len(), 4);
        assert!(matches!(&instrs[3], Instr::Alu(a) if a.op == AluOp::Vec3));
        assert_eq!(body.ssa_alloc, 4);
    }
}
