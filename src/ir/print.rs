//! Printer for the textual source-IR format. Output parses back with
//! [`parse_shader`](super::parser::parse_shader).

use std::fmt::{self, Write};

use super::io::VarMode;
use super::{AluInstr, AluSrc, CfNode, Function, Instr, Shader, Ssa};

fn def_str(def: &Ssa) -> String {
    if def.num_components == 1 {
        format!("%{}:{}", def.index, def.bit_size)
    } else {
        format!("%{}:{}x{}", def.index, def.bit_size, def.num_components)
    }
}

fn alu_src_str(src: &AluSrc, lanes: u8) -> String {
    let mut out = String::new();
    if src.negate {
        out.push('-');
    }
    if src.abs {
        out.push('|');
    }
    let _ = write!(out, "%{}", src.src.index);
    let identity = src.is_identity(lanes) && src.src.num_components <= lanes.max(1);
    if !identity {
        out.push('.');
        for lane in &src.swizzle[..lanes.max(1) as usize] {
            out.push(['x', 'y', 'z', 'w'][usize::from(*lane & 3)]);
        }
    }
    if src.abs {
        out.push('|');
    }
    out
}

fn alu_str(alu: &AluInstr) -> String {
    let lanes = alu.src_lanes();
    let srcs: Vec<String> = alu.srcs.iter().map(|s| alu_src_str(s, lanes)).collect();
    format!("{} = {} {}", def_str(&alu.def), alu.op.name(), srcs.join(", "))
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::LoadConst(lc) => {
                let values: Vec<String> = lc.values.iter().map(|v| format!("{v:#x}")).collect();
                write!(f, "{} = load_const {}", def_str(&lc.def), values.join(", "))
            }
            Instr::Undef(undef) => write!(f, "{} = undef", def_str(&undef.def)),
            Instr::Alu(alu) => f.write_str(&alu_str(alu)),
            Instr::Intrinsic(intr) => {
                if let Some(def) = &intr.def {
                    write!(f, "{} = ", def_str(def))?;
                }
                f.write_str(intr.intrinsic.name())?;
                let srcs: Vec<String> = intr.srcs.iter().map(|s| format!("%{}", s.index)).collect();
                if !srcs.is_empty() {
                    write!(f, " {}", srcs.join(", "))?;
                }
                if intr.base != 0 || intr.intrinsic.info().num_srcs > 0 {
                    write!(f, " base={}", intr.base)?;
                }
                if intr.component != 0 {
                    write!(f, " comp={}", intr.component)?;
                }
                if intr.write_mask != 0 {
                    write!(f, " wrmask={:#x}", intr.write_mask)?;
                }
                if intr.def.is_none()
                    && intr.num_components != intr.srcs.first().map_or(0, |s| s.num_components)
                {
                    write!(f, " comps={}", intr.num_components)?;
                }
                Ok(())
            }
            Instr::Tex(tex) => write!(
                f,
                "{} = tex %{} texture={} sampler={}",
                def_str(&tex.def),
                tex.coord.index,
                tex.texture_index,
                tex.sampler_index
            ),
            Instr::Jump(kind) => f.write_str(kind.name()),
            Instr::Phi(phi) => {
                let srcs: Vec<String> = phi
                    .srcs
                    .iter()
                    .map(|s| format!("b{}:%{}", s.pred, s.src.index))
                    .collect();
                write!(f, "{} = phi {}", def_str(&phi.def), srcs.join(", "))
            }
        }
    }
}

fn print_cf_list(out: &mut String, list: &[CfNode], depth: usize) {
    let indent = "  ".repeat(depth);
    for node in list {
        match node {
            CfNode::Block(block) => {
                let _ = writeln!(out, "{indent}block b{} {{", block.index);
                for instr in &block.instrs {
                    let _ = writeln!(out, "{indent}  {instr}");
                }
                let _ = writeln!(out, "{indent}}}");
            }
            CfNode::If(nif) => {
                let _ = writeln!(out, "{indent}if %{} {{", nif.condition.index);
                print_cf_list(out, &nif.then_list, depth + 1);
                if !nif.else_list.is_empty() {
                    let _ = writeln!(out, "{indent}}} else {{");
                    print_cf_list(out, &nif.else_list, depth + 1);
                }
                let _ = writeln!(out, "{indent}}}");
            }
            CfNode::Loop(nloop) => {
                let _ = writeln!(out, "{indent}loop {{");
                print_cf_list(out, &nloop.body, depth + 1);
                let _ = writeln!(out, "{indent}}}");
            }
        }
    }
}

fn print_function(out: &mut String, func: &Function) {
    match &func.body {
        Some(body) => {
            let _ = writeln!(out, "fn {} {{", func.name);
            print_cf_list(out, &body.body, 1);
            out.push_str("}\n");
        }
        None => {
            let _ = writeln!(out, "decl fn {}", func.name);
        }
    }
}

impl Shader {
    pub fn print(&self) -> String {
        let mut out = format!("shader {}", self.stage());
        if let Some(label) = &self.info.label {
            let _ = write!(out, " label={label}");
        }
        if self.info.internal {
            out.push_str(" internal");
        }
        out.push('\n');

        for var in &self.variables {
            let mode = match var.mode {
                VarMode::ShaderIn => "in",
                VarMode::ShaderOut => "out",
            };
            let _ = write!(out, "var {mode} {} {} loc={}", var.ty.glsl_name(), var.name, var.location);
            if var.index != 0 {
                let _ = write!(out, " index={}", var.index);
            }
            if var.driver_location != 0 {
                let _ = write!(out, " driver_loc={}", var.driver_location);
            }
            out.push('\n');
        }

        // Declarations first so the entry point stays the first body parsed.
        for func in self.functions.iter().filter(|f| f.body.is_none()) {
            print_function(&mut out, func);
        }
        for func in self.functions.iter().filter(|f| f.body.is_some()) {
            print_function(&mut out, func);
        }
        out
    }
}

impl fmt::Display for Shader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.print())
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_shader;
    use super::super::{AluOp, Intrinsic, ShaderBuilder, Stage};
    use super::*;

    #[test]
    fn printed_shaders_parse_back() {
        let mut b = ShaderBuilder::new(Stage::Fragment);
        b.label("roundtrip");
        let zero = b.imm32(0);
        let bary = b.load_barycentric(Intrinsic::LoadBarycentricPixel);
        let color = b.load_interpolated_input(bary, zero, 4, 0);
        let cond = b.alu_src(
            AluOp::Flt,
            1,
            &[AluSrc::channel(color, 3), AluSrc::channel(color, 0)],
        );
        b.begin_if(cond);
        b.store_output(color, zero, 0, 0, 0xf);
        b.end_if();
        let shader = b.finish();

        let text = shader.print();
        let reparsed = parse_shader(&text).unwrap();
        assert_eq!(reparsed.print(), text);
        assert!(text.contains("flt %2.w, %2.x"), "{text}");
    }

    #[test]
    fn modifiers_are_printed() {
        let mut src = AluSrc::channel(Ssa::new(4, 32, 4), 1);
        src.negate = true;
        src.abs = true;
        assert_eq!(alu_src_str(&src, 2), "-|%4.yy|");
        assert_eq!(alu_src_str(&AluSrc::new(Ssa::new(2, 32, 2)), 2), "%2");
    }
}
