// This module implements instruction selection for AGX: every legalized source-IR
// instruction in a straight-line block becomes zero or more target pseudo-instructions
// appended through a Builder. Dispatch is an exhaustive match over instruction kind,
// intrinsic and shader stage, so a new source construct cannot slip through unhandled.
// Constructs the hardware path does not cover yet fail with CompileError::Unimplemented;
// inputs the optimization pipeline should have legalized away fail with
// CompileError::InvariantViolation. Either aborts the whole compilation.

//! Instruction selection.

use log::trace;
use smallvec::SmallVec;

use super::{Builder, Index, Size};
use crate::core::{CompileError, CompileResult, Unsupported};
use crate::ir::io::{FRAG_RESULT_COLOR, FRAG_RESULT_DATA0};
use crate::ir::{
    self, AluInstr, AluOp, AluSrc, InterpMode, Intrinsic, IntrinsicInstr, LoadConstInstr, Ssa,
    Stage, VarMode,
};

/// Writeout control words emitted ahead of every blend, in order. Their
/// exact hardware meaning is unknown.
pub const WRITEOUT_CONTROL: [u32; 2] = [0xC200, 0x000C];

fn unimplemented<T>(construct: Unsupported) -> CompileResult<T> {
    Err(CompileError::unimplemented(construct))
}

pub fn emit_instr(b: &mut Builder<'_, '_>, instr: &ir::Instr) -> CompileResult<()> {
    trace!("selecting {}", instr.name());
    match instr {
        ir::Instr::LoadConst(load) => emit_load_const(b, load),
        ir::Instr::Alu(alu) => emit_alu(b, alu),
        ir::Instr::Intrinsic(intr) => emit_intrinsic(b, intr),
        ir::Instr::Tex(_) => unimplemented(Unsupported::Texture),
        ir::Instr::Jump(_) => unimplemented(Unsupported::Jump),
        ir::Instr::Undef(_) => Err(CompileError::invariant("undef", "must be lowered to zero")),
        ir::Instr::Phi(_) => Err(CompileError::invariant("phi", "must be removed before selection")),
    }
}

fn emit_load_const(b: &mut Builder<'_, '_>, load: &LoadConstInstr) -> CompileResult<()> {
    let def = load.def;
    if def.num_components != 1 {
        return Err(CompileError::invariant(
            "load_const",
            format!("%{} has {} components", def.index, def.num_components),
        ));
    }
    if !matches!(def.bit_size, 16 | 32) {
        return Err(CompileError::invariant(
            "load_const",
            format!("%{} is a {}-bit constant", def.index, def.bit_size),
        ));
    }
    let value = load
        .values
        .first()
        .copied()
        .ok_or_else(|| CompileError::invariant("load_const", "no value"))?;
    let dest = b.ctx.ssa_index(&def, "load_const")?;
    b.mov_imm_to(dest, value as u32);
    Ok(())
}

/// Register holding the lane `src` reads, extracted from a vector if needed.
fn alu_src_index(b: &mut Builder<'_, '_>, src: &AluSrc) -> CompileResult<Index> {
    let ssa = src.src;
    let size = Size::from_bits(ssa.bit_size).ok_or_else(|| {
        CompileError::invariant("alu source", format!("%{} has width {}", ssa.index, ssa.bit_size))
    })?;
    if src.negate || src.abs {
        return Err(CompileError::invariant(
            "alu source",
            format!("modifiers on %{} must be lowered", ssa.index),
        ));
    }
    let channel = src.swizzle[0];
    if channel >= ssa.num_components {
        return Err(CompileError::invariant(
            "alu source",
            format!("channel {channel} of %{} is out of range", ssa.index),
        ));
    }

    let index = b.ctx.ssa_index(&ssa, "alu source")?;
    if ssa.num_components > 1 {
        Ok(b.p_extract(index, size, channel))
    } else {
        Ok(index)
    }
}

fn emit_alu(b: &mut Builder<'_, '_>, alu: &AluInstr) -> CompileResult<()> {
    let def = alu.def;
    if def.num_components != 1 && !alu.op.is_vec() {
        return Err(CompileError::invariant(
            "alu",
            format!("{} writes {} components", alu.op.name(), def.num_components),
        ));
    }
    match alu.op {
        AluOp::Vec2 | AluOp::Vec3 | AluOp::Vec4 => {}
        AluOp::Vec8 | AluOp::Vec16 => {
            return Err(CompileError::invariant(
                "alu",
                format!("{} should have been lowered", alu.op.name()),
            ))
        }
        op => return unimplemented(Unsupported::AluOp(op)),
    }

    let dest = b.ctx.ssa_index(&def, "alu")?;
    let srcs = alu
        .srcs
        .iter()
        .map(|src| alu_src_index(b, src))
        .collect::<CompileResult<SmallVec<[Index; 4]>>>()?;
    b.p_combine_to(dest, &srcs);
    Ok(())
}

fn emit_intrinsic(b: &mut Builder<'_, '_>, intr: &IntrinsicInstr) -> CompileResult<()> {
    let stage = b.ctx.stage;
    match intr.intrinsic {
        // Consumed by the varying load reading them.
        Intrinsic::LoadBarycentricPixel
        | Intrinsic::LoadBarycentricCentroid
        | Intrinsic::LoadBarycentricSample
        | Intrinsic::LoadBarycentricAtSample
        | Intrinsic::LoadBarycentricAtOffset => Ok(()),

        Intrinsic::LoadInterpolatedInput | Intrinsic::LoadInput => match stage {
            Stage::Fragment => emit_load_vary(b, intr),
            Stage::Vertex => emit_load_attr(b, intr),
            Stage::Compute => unimplemented(Unsupported::ShaderStage(stage)),
        },

        Intrinsic::StoreOutput => match stage {
            Stage::Fragment => emit_fragment_out(b, intr),
            Stage::Vertex => emit_store_vary(b, intr),
            Stage::Compute => unimplemented(Unsupported::ShaderStage(stage)),
        },

        Intrinsic::LoadUbo
        | Intrinsic::LoadSsbo
        | Intrinsic::StoreSsbo
        | Intrinsic::LoadReg
        | Intrinsic::StoreReg
        | Intrinsic::Discard => unimplemented(Unsupported::Intrinsic(intr.intrinsic.name())),
    }
}

/// Constant I/O offset of `intr`.
fn io_offset(b: &Builder<'_, '_>, intr: &IntrinsicInstr) -> CompileResult<u32> {
    let offset = intr.io_offset_src().ok_or_else(|| {
        CompileError::invariant(intr.intrinsic.name(), "missing offset source")
    })?;
    let value = match b.ctx.const_value(offset) {
        Some(value) => value,
        None => return unimplemented(Unsupported::IndirectOffset),
    };
    u32::try_from(value).map_err(|_| {
        CompileError::invariant(
            intr.intrinsic.name(),
            format!("offset {value:#x} does not fit a varying slot"),
        )
    })
}

/// Varying slot `scale * base + component + offset`, failing instead of wrapping.
fn slot_index(
    intr: &IntrinsicInstr,
    scale: u32,
    component: u8,
    offset: u32,
) -> CompileResult<u32> {
    intr.base
        .checked_mul(scale)
        .and_then(|slot| slot.checked_add(u32::from(component)))
        .and_then(|slot| slot.checked_add(offset))
        .ok_or_else(|| {
            CompileError::invariant(
                intr.intrinsic.name(),
                format!("slot of base {} plus offset {offset} overflows", intr.base),
            )
        })
}

fn first_src<'i>(intr: &'i IntrinsicInstr) -> CompileResult<&'i Ssa> {
    intr.srcs
        .first()
        .ok_or_else(|| CompileError::invariant(intr.intrinsic.name(), "missing source"))
}

fn emit_load_vary(b: &mut Builder<'_, '_>, intr: &IntrinsicInstr) -> CompileResult<()> {
    if intr.intrinsic == Intrinsic::LoadInput {
        return unimplemented(Unsupported::FlatVarying);
    }

    let barycentric = first_src(intr)?;
    let mode = match b.ctx.source_def(barycentric) {
        Some(ir::Instr::Intrinsic(parent)) => parent.intrinsic.interp_mode(),
        _ => None,
    };
    match mode {
        Some(InterpMode::Pixel) => {}
        Some(mode) => return unimplemented(Unsupported::InterpolationMode(mode)),
        None => {
            return Err(CompileError::invariant(
                "load_interpolated_input",
                format!("%{} is not a barycentric load", barycentric.index),
            ))
        }
    }

    let offset = io_offset(b, intr)?;
    let def = intr
        .def
        .ok_or_else(|| CompileError::invariant("load_interpolated_input", "missing destination"))?;
    let components = intr.num_components;
    if !(1..=4).contains(&components) {
        return Err(CompileError::invariant(
            "load_interpolated_input",
            format!("%{} loads {components} components", def.index),
        ));
    }
    let index = slot_index(intr, 1, 0, offset)?;
    let dest = b.ctx.ssa_index(&def, "load_interpolated_input")?;

    let ld = b.ld_vary_to(dest, index, true);
    if components != 4 {
        ld.mask = (1u8 << components) - 1;
    }
    Ok(())
}

fn emit_load_attr(_b: &mut Builder<'_, '_>, _intr: &IntrinsicInstr) -> CompileResult<()> {
    unimplemented(Unsupported::VertexAttributeLoad)
}

fn emit_store_vary(b: &mut Builder<'_, '_>, intr: &IntrinsicInstr) -> CompileResult<()> {
    let offset = io_offset(b, intr)?;
    if intr.write_mask != 0x1 {
        return unimplemented(Unsupported::MultiComponentOutputStore);
    }
    let index = slot_index(intr, 4, intr.component, offset)?;
    let value = b.ctx.ssa_index(first_src(intr)?, "store_output")?;
    b.st_vary(value, index);
    Ok(())
}

fn emit_fragment_out(b: &mut Builder<'_, '_>, intr: &IntrinsicInstr) -> CompileResult<()> {
    let shader = b.ctx.shader;
    let var = shader.find_variable(VarMode::ShaderOut, intr.base).ok_or_else(|| {
        CompileError::invariant(
            "store_output",
            format!("no output variable at driver location {}", intr.base),
        )
    })?;
    if var.index != 0 {
        return unimplemented(Unsupported::DualSourceBlending);
    }
    let rt = match var.location {
        FRAG_RESULT_COLOR => 0,
        location if location >= FRAG_RESULT_DATA0 => location - FRAG_RESULT_DATA0,
        location => return unimplemented(Unsupported::FragmentOutput { location }),
    };
    if rt != 0 {
        return unimplemented(Unsupported::MultipleRenderTargets { rt });
    }

    let value = b.ctx.ssa_index(first_src(intr)?, "store_output")?;
    let format = b.ctx.key.fs.tib_formats[rt as usize];
    for pattern in WRITEOUT_CONTROL {
        b.writeout(pattern);
    }
    b.blend(value, format);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agx::Context;
    use crate::core::{CompileKey, ErrorKind, PixelFormat};
    use crate::ir::Shader;

    /// Select every instruction of the first block and print the result.
    fn select(text: &str, key: &CompileKey) -> CompileResult<Vec<String>> {
        let shader = Shader::parse(text).unwrap();
        let mut ctx = Context::new(&shader, key);
        let block = ctx.create_block();
        let body = shader.functions[0].body.as_ref().unwrap();
        let source = body.blocks()[0];
        let mut b = Builder::new(&mut ctx, block);
        for instr in &source.instrs {
            emit_instr(&mut b, instr)?;
        }
        Ok(ctx.block(block).instrs.iter().map(|i| i.to_string()).collect())
    }

    /// Select only the last instruction of the first block. Earlier
    /// instructions still serve as definitions for constant lookups.
    fn select_last(text: &str) -> CompileResult<Vec<String>> {
        let shader = Shader::parse(text).unwrap();
        let key = CompileKey::default();
        let mut ctx = Context::new(&shader, &key);
        let block = ctx.create_block();
        let body = shader.functions[0].body.as_ref().unwrap();
        let last = body.blocks()[0].instrs.last().unwrap();
        emit_instr(&mut Builder::new(&mut ctx, block), last)?;
        Ok(ctx.block(block).instrs.iter().map(|i| i.to_string()).collect())
    }

    fn unsupported(result: CompileResult<Vec<String>>) -> Unsupported {
        match result {
            Err(CompileError::Unimplemented { construct }) => construct,
            other => panic!("expected an unimplemented construct, got {other:?}"),
        }
    }

    fn invariant(result: CompileResult<Vec<String>>) -> bool {
        matches!(result, Err(e) if e.kind() == ErrorKind::InvariantViolation)
    }

    #[test]
    fn constants_become_move_immediates() {
        let key = CompileKey::default();
        let out = select(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x3f800000
                 %1:16 = load_const 0x3c00
               }
             }",
            &key,
        )
        .unwrap();
        assert_eq!(out, ["%0 = mov_imm 0x3f800000", "%1:16 = mov_imm 0x3c00"]);

        assert!(invariant(select(
            "shader fragment
             fn main {
               block b0 {
                 %0:64 = load_const 0x100000000
               }
             }",
            &key,
        )));
        assert!(invariant(select(
            "shader fragment
             fn main {
               block b0 {
                 %0:32x2 = load_const 0x1, 0x2
               }
             }",
            &key,
        )));
    }

    #[test]
    fn vector_packs_extract_their_lanes() {
        let out = select(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x0
                 %1:32 = load_const 0x1
                 %2:32x2 = vec2 %0, %1
                 %3:32x2 = vec2 %2.y, %2.x
               }
             }",
            &CompileKey::default(),
        )
        .unwrap();
        assert_eq!(
            out,
            [
                "%0 = mov_imm 0x0",
                "%1 = mov_imm 0x1",
                "%2 = p_combine %0, %1",
                "%4 = p_extract %2, 1",
                "%5 = p_extract %2, 0",
                "%3 = p_combine %4, %5",
            ]
        );
    }

    #[test]
    fn alu_rejections() {
        let key = CompileKey::default();
        let fadd = select(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x0
                 %1:32 = fadd %0, %0
               }
             }",
            &key,
        );
        assert_eq!(unsupported(fadd), Unsupported::AluOp(AluOp::Fadd));

        let modifier = select(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x0
                 %1:32x2 = vec2 -%0, %0
               }
             }",
            &key,
        );
        assert!(invariant(modifier));
    }

    #[test]
    fn interpolated_loads_pick_slot_and_mask() {
        let out = select(
            "shader fragment
             var in vec3 v_normal loc=32
             fn main {
               block b0 {
                 %0:32 = load_const 0x1
                 %1:32x2 = load_barycentric_pixel
                 %2:32x3 = load_interpolated_input %1, %0 base=2
               }
             }",
            &CompileKey::default(),
        )
        .unwrap();
        assert_eq!(out[1], "%1 = ld_vary 3, perspective, mask=0x7");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn varying_loads_need_one_to_four_components() {
        let load = |components: u8| {
            select(
                &format!(
                    "shader fragment
                     fn main {{
                       block b0 {{
                         %0:32 = load_const 0x0
                         %1:32x2 = load_barycentric_pixel
                         %2:32x{components} = load_interpolated_input %1, %0 base=0
                       }}
                     }}"
                ),
                &CompileKey::default(),
            )
        };
        assert_eq!(load(1).unwrap()[1], "%1 = ld_vary 0, perspective, mask=0x1");
        assert_eq!(load(4).unwrap()[1], "%1 = ld_vary 0, perspective");
        for components in [0, 5, 16, 32] {
            assert!(invariant(load(components)), "{components} components accepted");
        }
    }

    #[test]
    fn slot_overflow_is_rejected() {
        let store = select(
            "shader vertex
             fn main {
               block b0 {
                 %0:32 = load_const 0x0
                 store_output %0, %0 base=1073741824 wrmask=0x1
               }
             }",
            &CompileKey::default(),
        );
        assert!(invariant(store));

        let load = select(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x1
                 %1:32x2 = load_barycentric_pixel
                 %2:32x4 = load_interpolated_input %1, %0 base=4294967295
               }
             }",
            &CompileKey::default(),
        );
        assert!(invariant(load));

        let wide_offset = select_last(
            "shader vertex
             fn main {
               block b0 {
                 %0:64 = load_const 0x100000000
                 %1:32 = load_const 0x3f800000
                 store_output %1, %0 base=0 wrmask=0x1
               }
             }",
        );
        assert!(invariant(wide_offset));

        let near_limit = select_last(
            "shader vertex
             fn main {
               block b0 {
                 %0:32 = load_const 0x3
                 %1:32 = load_const 0x3f800000
                 store_output %1, %0 base=1073741823 wrmask=0x1
               }
             }",
        );
        assert_eq!(near_limit.unwrap(), ["st_vary %0, 4294967295"]);
    }

    #[test]
    fn varying_load_rejections() {
        let key = CompileKey::default();
        let centroid = select(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x0
                 %1:32x2 = load_barycentric_centroid
                 %2:32x4 = load_interpolated_input %1, %0 base=0
               }
             }",
            &key,
        );
        assert_eq!(unsupported(centroid), Unsupported::InterpolationMode(InterpMode::Centroid));

        let indirect = select(
            "shader fragment
             fn main {
               block b0 {
                 %1:32x2 = load_barycentric_pixel
                 %2:32x2 = load_barycentric_centroid
                 %3:32x4 = load_interpolated_input %1, %2 base=0
               }
             }",
            &key,
        );
        assert_eq!(unsupported(indirect), Unsupported::IndirectOffset);

        let flat = select(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x0
                 %1:32x4 = load_input %0 base=0
               }
             }",
            &key,
        );
        assert_eq!(unsupported(flat), Unsupported::FlatVarying);

        let attribute = select(
            "shader vertex
             fn main {
               block b0 {
                 %0:32 = load_const 0x0
                 %1:32x4 = load_input %0 base=0
               }
             }",
            &key,
        );
        assert_eq!(unsupported(attribute), Unsupported::VertexAttributeLoad);
    }

    #[test]
    fn vertex_stores_address_scalar_slots() {
        let key = CompileKey::default();
        let out = select(
            "shader vertex
             fn main {
               block b0 {
                 %0:32 = load_const 0x1
                 %1:32 = load_const 0x3f800000
                 store_output %1, %0 base=2 comp=3 wrmask=0x1
               }
             }",
            &key,
        )
        .unwrap();
        assert_eq!(out[2], "st_vary %1, 12");

        let wide = select(
            "shader vertex
             fn main {
               block b0 {
                 %0:32 = load_const 0x0
                 %1:32 = load_const 0x3f800000
                 store_output %1, %0 base=0 wrmask=0x3
               }
             }",
            &key,
        );
        assert_eq!(unsupported(wide), Unsupported::MultiComponentOutputStore);
    }

    #[test]
    fn color_output_writes_out_then_blends() {
        let key = CompileKey::with_rt0(PixelFormat::F16);
        let out = select(
            "shader fragment
             var out vec4 color loc=2
             fn main {
               block b0 {
                 %0:32 = load_const 0x0
                 %1:32 = load_const 0x3f800000
                 store_output %1, %0 base=0 wrmask=0xf
               }
             }",
            &key,
        )
        .unwrap();
        assert_eq!(
            out[2..],
            ["writeout 0xc200", "writeout 0xc", "blend %1, f16"]
        );
    }

    #[test]
    fn fragment_output_rejections() {
        let key = CompileKey::default();
        let store = |decl: &str| {
            select(
                &format!(
                    "shader fragment
                     {decl}
                     fn main {{
                       block b0 {{
                         %0:32 = load_const 0x0
                         store_output %0, %0 base=0 wrmask=0x1
                       }}
                     }}"
                ),
                &key,
            )
        };
        assert_eq!(
            unsupported(store("var out vec4 second loc=5")),
            Unsupported::MultipleRenderTargets { rt: 1 }
        );
        assert_eq!(
            unsupported(store("var out vec4 color loc=4 index=1")),
            Unsupported::DualSourceBlending
        );
        assert_eq!(
            unsupported(store("var out float depth loc=0")),
            Unsupported::FragmentOutput { location: 0 }
        );
        assert!(invariant(store("")));
        assert!(store("var out vec4 color loc=4").is_ok());
    }

    #[test]
    fn unsupported_instructions_are_named() {
        let key = CompileKey::default();
        let tex = select(
            "shader fragment
             fn main {
               block b0 {
                 %0:32x2 = load_barycentric_pixel
                 %1:32x4 = tex %0
               }
             }",
            &key,
        );
        assert_eq!(unsupported(tex), Unsupported::Texture);

        let discard = select(
            "shader fragment
             fn main {
               block b0 {
                 discard
               }
             }",
            &key,
        );
        assert_eq!(unsupported(discard), Unsupported::Intrinsic("discard"));

        let compute = select(
            "shader compute
             fn main {
               block b0 {
                 %0:32 = load_const 0x0
                 store_output %0, %0 base=0 wrmask=0x1
               }
             }",
            &key,
        );
        assert_eq!(unsupported(compute), Unsupported::ShaderStage(Stage::Compute));
    }
}
