//! Parser for the textual source-IR format (see the [`ir`](super) module docs).
//!
//! The format is line oriented. Uses may refer to values defined later (phi
//! sources in loops), so operand shapes are filled in once a function body is
//! complete.

use hashbrown::HashMap;
use smallvec::SmallVec;

use super::io::{IoType, VarMode, Variable};
use super::{
    visit_blocks, visit_uses_mut, AluOp, AluSrc, Block, CfNode, Function, FunctionBody, IfNode,
    Instr, Intrinsic, IntrinsicInstr, JumpKind, LoadConstInstr, LoopNode, PhiInstr, PhiSrc, Shader,
    Ssa, Stage, TexInstr, UndefInstr,
};
use crate::core::ParseError;

pub fn parse_shader(text: &str) -> Result<Shader, ParseError> {
    Parser::new(text).parse()
}

impl Shader {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        parse_shader(text)
    }
}

/// How a nested CF list was closed.
#[derive(PartialEq, Eq)]
enum ListEnd {
    Brace,
    Else,
}

struct Parser<'a> {
    lines: Vec<(usize, &'a str)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        let lines = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.split(';').next().unwrap_or("").trim()))
            .filter(|(_, line)| !line.is_empty())
            .collect();
        Self { lines, pos: 0 }
    }

    fn next_line(&mut self) -> Option<(usize, &'a str)> {
        let line = self.lines.get(self.pos).copied();
        self.pos += 1;
        line
    }

    fn last_line_no(&self) -> usize {
        self.lines.last().map_or(0, |(n, _)| *n)
    }

    fn parse(mut self) -> Result<Shader, ParseError> {
        let (line_no, header) = self
            .next_line()
            .ok_or_else(|| ParseError::new(0, "empty input"))?;
        let mut shader = parse_header(line_no, header)?;

        while let Some((line_no, line)) = self.next_line() {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("var") => shader.variables.push(parse_variable(line_no, words)?),
                Some("decl") => {
                    let name = match (words.next(), words.next()) {
                        (Some("fn"), Some(name)) => name,
                        _ => return Err(ParseError::new(line_no, "expected `decl fn <name>`")),
                    };
                    shader.functions.push(Function {
                        name: name.to_string(),
                        is_entrypoint: false,
                        body: None,
                    });
                }
                Some("fn") => {
                    let name = words
                        .next()
                        .ok_or_else(|| ParseError::new(line_no, "missing function name"))?;
                    if words.next() != Some("{") {
                        return Err(ParseError::new(line_no, "expected `{` after function name"));
                    }
                    let (body, end) = self.parse_cf_list()?;
                    if end != ListEnd::Brace {
                        return Err(ParseError::new(line_no, "unexpected `else` in function"));
                    }
                    let body = finish_body(line_no, body)?;
                    let is_entrypoint = !shader.functions.iter().any(|f| f.is_entrypoint);
                    shader.functions.push(Function {
                        name: name.to_string(),
                        is_entrypoint,
                        body: Some(body),
                    });
                }
                _ => return Err(ParseError::new(line_no, format!("unexpected `{line}`"))),
            }
        }
        Ok(shader)
    }

    fn parse_cf_list(&mut self) -> Result<(Vec<CfNode>, ListEnd), ParseError> {
        let mut list = Vec::new();
        loop {
            let (line_no, line) = self
                .next_line()
                .ok_or_else(|| ParseError::new(self.last_line_no(), "unterminated block"))?;
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                ["}"] => return Ok((list, ListEnd::Brace)),
                ["}", "else", "{"] => return Ok((list, ListEnd::Else)),
                ["block", name, "{"] => {
                    let index = name
                        .strip_prefix('b')
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| ParseError::new(line_no, format!("bad block name `{name}`")))?;
                    let mut block = Block::new(index);
                    loop {
                        let (line_no, line) = self.next_line().ok_or_else(|| {
                            ParseError::new(self.last_line_no(), "unterminated block")
                        })?;
                        if line == "}" {
                            break;
                        }
                        block.instrs.push(parse_instr(line_no, line)?);
                    }
                    list.push(CfNode::Block(block));
                }
                ["if", cond, "{"] => {
                    let condition = parse_ref(line_no, cond)?;
                    let (then_list, end) = self.parse_cf_list()?;
                    let else_list = if end == ListEnd::Else {
                        match self.parse_cf_list()? {
                            (list, ListEnd::Brace) => list,
                            _ => return Err(ParseError::new(line_no, "duplicate `else`")),
                        }
                    } else {
                        Vec::new()
                    };
                    list.push(CfNode::If(IfNode {
                        condition,
                        then_list,
                        else_list,
                    }));
                }
                ["loop", "{"] => match self.parse_cf_list()? {
                    (body, ListEnd::Brace) => list.push(CfNode::Loop(LoopNode { body })),
                    _ => return Err(ParseError::new(line_no, "`else` inside loop")),
                },
                _ => return Err(ParseError::new(line_no, format!("unexpected `{line}`"))),
            }
        }
    }
}

fn parse_header(line_no: usize, line: &str) -> Result<Shader, ParseError> {
    let mut words = line.split_whitespace();
    if words.next() != Some("shader") {
        return Err(ParseError::new(line_no, "expected `shader <stage>` header"));
    }
    let stage = words
        .next()
        .and_then(Stage::from_name)
        .ok_or_else(|| ParseError::new(line_no, "unknown shader stage"))?;
    let mut shader = Shader::new(stage);
    for word in words {
        match word.split_once('=') {
            Some(("label", label)) => shader.info.label = Some(label.to_string()),
            None if word == "internal" => shader.info.internal = true,
            _ => return Err(ParseError::new(line_no, format!("unknown shader attribute `{word}`"))),
        }
    }
    Ok(shader)
}

fn parse_variable<'a>(
    line_no: usize,
    mut words: impl Iterator<Item = &'a str>,
) -> Result<Variable, ParseError> {
    let mode = match words.next() {
        Some("in") => VarMode::ShaderIn,
        Some("out") => VarMode::ShaderOut,
        _ => return Err(ParseError::new(line_no, "expected `in` or `out`")),
    };
    let ty = words
        .next()
        .and_then(IoType::from_glsl_name)
        .ok_or_else(|| ParseError::new(line_no, "bad variable type"))?;
    let name = words
        .next()
        .ok_or_else(|| ParseError::new(line_no, "missing variable name"))?;

    let mut var = Variable::new(name, mode, ty, 0);
    for word in words {
        let (key, value) = word
            .split_once('=')
            .ok_or_else(|| ParseError::new(line_no, format!("bad attribute `{word}`")))?;
        let value = parse_int(line_no, value)?;
        match key {
            "loc" => var.location = value as u32,
            "index" => var.index = value as u8,
            "driver_loc" => var.driver_location = value as u32,
            _ => return Err(ParseError::new(line_no, format!("unknown attribute `{key}`"))),
        }
    }
    Ok(var)
}

fn parse_int(line_no: usize, s: &str) -> Result<u64, ParseError> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| ParseError::new(line_no, format!("bad number `{s}`")))
}

/// `%N`, shape left for [`finish_body`] to fill in.
fn parse_ref(line_no: usize, s: &str) -> Result<Ssa, ParseError> {
    s.strip_prefix('%')
        .and_then(|n| n.parse().ok())
        .map(|index| Ssa::new(index, 0, 0))
        .ok_or_else(|| ParseError::new(line_no, format!("bad value reference `{s}`")))
}

/// `%N:BITS` or `%N:BITSxCOMPS`.
fn parse_def(line_no: usize, s: &str) -> Result<Ssa, ParseError> {
    let bad = || ParseError::new(line_no, format!("bad definition `{s}`"));
    let (index, shape) = s.strip_prefix('%').and_then(|d| d.split_once(':')).ok_or_else(bad)?;
    let (bits, comps) = shape.split_once('x').unwrap_or((shape, "1"));
    Ok(Ssa::new(
        index.parse().map_err(|_| bad())?,
        bits.parse().map_err(|_| bad())?,
        comps.parse().map_err(|_| bad())?,
    ))
}

/// `[-][|]%N[.swizzle][|]`
fn parse_alu_src(line_no: usize, s: &str) -> Result<AluSrc, ParseError> {
    let (negate, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let (abs, s) = match s.strip_prefix('|').and_then(|r| r.strip_suffix('|')) {
        Some(inner) => (true, inner),
        None => (false, s),
    };
    let (reference, swizzle) = s.split_once('.').unwrap_or((s, ""));

    let mut src = AluSrc::new(parse_ref(line_no, reference)?);
    src.negate = negate;
    src.abs = abs;
    if !swizzle.is_empty() {
        let lanes: Vec<u8> = swizzle
            .chars()
            .map(|c| match c {
                'x' => Ok(0),
                'y' => Ok(1),
                'z' => Ok(2),
                'w' => Ok(3),
                _ => Err(ParseError::new(line_no, format!("bad swizzle `{swizzle}`"))),
            })
            .collect::<Result<_, _>>()?;
        if lanes.len() > 4 {
            return Err(ParseError::new(line_no, format!("swizzle too long `{swizzle}`")));
        }
        for (i, lane) in src.swizzle.iter_mut().enumerate() {
            *lane = lanes.get(i).or(lanes.last()).copied().unwrap_or(0);
        }
    }
    Ok(src)
}

fn parse_instr(line_no: usize, line: &str) -> Result<Instr, ParseError> {
    let (def, rhs) = match line.split_once(" = ") {
        Some((lhs, rhs)) => (Some(parse_def(line_no, lhs.trim())?), rhs.trim()),
        None => (None, line),
    };
    let (opcode, rest) = rhs.split_once(char::is_whitespace).unwrap_or((rhs, ""));
    let tokens: Vec<&str> = rest
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();
    let (attrs, operands): (Vec<&str>, Vec<&str>) =
        tokens.into_iter().partition(|t| t.contains('=') && !t.contains(':'));

    let need_def = || ParseError::new(line_no, format!("`{opcode}` needs a destination"));
    let instr = match opcode {
        "load_const" => {
            let def = def.ok_or_else(need_def)?;
            let values = operands
                .iter()
                .map(|v| parse_int(line_no, v))
                .collect::<Result<SmallVec<[u64; 4]>, _>>()?;
            if values.len() != def.num_components as usize {
                return Err(ParseError::new(line_no, "constant component count mismatch"));
            }
            Instr::LoadConst(LoadConstInstr { def, values })
        }
        "undef" => Instr::Undef(UndefInstr {
            def: def.ok_or_else(need_def)?,
        }),
        "break" => Instr::Jump(JumpKind::Break),
        "continue" => Instr::Jump(JumpKind::Continue),
        "return" => Instr::Jump(JumpKind::Return),
        "phi" => {
            let srcs = operands
                .iter()
                .map(|op| {
                    let (pred, value) = op
                        .split_once(':')
                        .ok_or_else(|| ParseError::new(line_no, format!("bad phi source `{op}`")))?;
                    let pred = pred
                        .strip_prefix('b')
                        .and_then(|p| p.parse().ok())
                        .ok_or_else(|| ParseError::new(line_no, format!("bad block `{pred}`")))?;
                    Ok(PhiSrc {
                        pred,
                        src: parse_ref(line_no, value)?,
                    })
                })
                .collect::<Result<_, ParseError>>()?;
            Instr::Phi(PhiInstr {
                def: def.ok_or_else(need_def)?,
                srcs,
            })
        }
        "tex" => {
            let coord = operands
                .first()
                .ok_or_else(|| ParseError::new(line_no, "tex needs a coordinate"))?;
            let mut tex = TexInstr {
                def: def.ok_or_else(need_def)?,
                coord: parse_ref(line_no, coord)?,
                texture_index: 0,
                sampler_index: 0,
            };
            for (key, value) in split_attrs(line_no, &attrs)? {
                match key {
                    "texture" => tex.texture_index = value as u32,
                    "sampler" => tex.sampler_index = value as u32,
                    _ => return Err(ParseError::new(line_no, format!("unknown attribute `{key}`"))),
                }
            }
            Instr::Tex(tex)
        }
        _ => {
            if let Some(op) = AluOp::from_name(opcode) {
                let srcs = operands
                    .iter()
                    .map(|s| parse_alu_src(line_no, s))
                    .collect::<Result<SmallVec<[AluSrc; 4]>, _>>()?;
                if srcs.len() != op.num_inputs() {
                    return Err(ParseError::new(
                        line_no,
                        format!("`{opcode}` takes {} sources", op.num_inputs()),
                    ));
                }
                Instr::alu(op, def.ok_or_else(need_def)?, &srcs)
            } else if let Some(intrinsic) = Intrinsic::from_name(opcode) {
                let srcs = operands
                    .iter()
                    .map(|s| parse_ref(line_no, s))
                    .collect::<Result<SmallVec<[Ssa; 2]>, _>>()?;
                if srcs.len() != intrinsic.info().num_srcs {
                    return Err(ParseError::new(
                        line_no,
                        format!("`{opcode}` takes {} sources", intrinsic.info().num_srcs),
                    ));
                }
                if def.is_some() != intrinsic.info().has_dest {
                    return Err(ParseError::new(line_no, format!("bad destination for `{opcode}`")));
                }
                let mut intr = IntrinsicInstr::new(intrinsic, def, &srcs);
                for (key, value) in split_attrs(line_no, &attrs)? {
                    match key {
                        "base" => intr.base = value as u32,
                        "comp" => intr.component = value as u8,
                        "wrmask" => intr.write_mask = value as u8,
                        "comps" => intr.num_components = value as u8,
                        _ => {
                            return Err(ParseError::new(line_no, format!("unknown attribute `{key}`")))
                        }
                    }
                }
                Instr::Intrinsic(intr)
            } else {
                return Err(ParseError::new(line_no, format!("unknown opcode `{opcode}`")));
            }
        }
    };
    Ok(instr)
}

fn split_attrs<'a>(line_no: usize, attrs: &[&'a str]) -> Result<Vec<(&'a str, u64)>, ParseError> {
    attrs
        .iter()
        .map(|attr| {
            let (key, value) = attr
                .split_once('=')
                .ok_or_else(|| ParseError::new(line_no, format!("bad attribute `{attr}`")))?;
            Ok((key, parse_int(line_no, value)?))
        })
        .collect()
}

/// Fill in operand shapes and the allocation counters.
fn finish_body(line_no: usize, body: Vec<CfNode>) -> Result<FunctionBody, ParseError> {
    let mut shapes: HashMap<u32, Ssa> = HashMap::new();
    let mut max_block = None;
    visit_blocks(&body, &mut |block| {
        max_block = max_block.max(Some(block.index));
        for instr in &block.instrs {
            if let Some(def) = instr.def() {
                shapes.insert(def.index, def);
            }
        }
    });

    let mut body = FunctionBody {
        ssa_alloc: shapes.keys().max().map_or(0, |m| m + 1),
        block_alloc: max_block.map_or(0, |m| m + 1),
        body,
    };

    let mut undefined = None;
    visit_uses_mut(&mut body.body, &mut |src| match shapes.get(&src.index) {
        Some(def) => *src = *def,
        None => undefined = undefined.or(Some(src.index)),
    });
    if let Some(index) = undefined {
        return Err(ParseError::new(line_no, format!("use of undefined value %{index}")));
    }

    // Stores without an explicit component count take it from their value.
    for_each_intrinsic_mut(&mut body.body, &mut |intr| {
        if intr.def.is_none() && intr.num_components == 0 {
            intr.num_components = intr.srcs.first().map_or(0, |s| s.num_components);
        }
    });
    Ok(body)
}

fn for_each_intrinsic_mut(list: &mut [CfNode], f: &mut dyn FnMut(&mut IntrinsicInstr)) {
    super::visit_blocks_mut(list, &mut |block| {
        for instr in &mut block.instrs {
            if let Instr::Intrinsic(intr) = instr {
                f(intr);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSTHROUGH: &str = "
        ; smooth passthrough
        shader fragment label=passthrough
        var in vec4 v_color loc=32
        var out vec4 color loc=2
        fn main {
          block b0 {
            %0:32 = load_const 0x0
            %1:32x2 = load_barycentric_pixel
            %2:32x4 = load_interpolated_input %1, %0 base=0
            store_output %2, %0 base=0 wrmask=0xf
          }
        }
    ";

    #[test]
    fn parses_passthrough_shader() {
        let shader = parse_shader(PASSTHROUGH).unwrap();
        assert_eq!(shader.stage(), Stage::Fragment);
        assert_eq!(shader.info.label.as_deref(), Some("passthrough"));
        assert_eq!(shader.variables.len(), 2);

        let body = shader.functions[0].body.as_ref().unwrap();
        assert_eq!(body.ssa_alloc, 3);
        assert_eq!(body.block_alloc, 1);

        let block = body.blocks()[0];
        let Instr::Intrinsic(store) = &block.instrs[3] else {
            panic!("expected store_output");
        };
        assert_eq!(store.srcs[0], Ssa::new(2, 32, 4));
        assert_eq!(store.num_components, 4);
        assert_eq!(store.write_mask, 0xf);
    }

    #[test]
    fn parses_swizzles_and_modifiers() {
        let src = parse_alu_src(1, "-|%3.zy|").unwrap();
        assert!(src.negate);
        assert!(src.abs);
        assert_eq!(src.swizzle, [2, 1, 1, 1]);
    }

    #[test]
    fn reports_undefined_values() {
        let err = parse_shader("shader vertex\nfn main {\nblock b0 {\n%1:32 = mov %0\n}\n}\n")
            .unwrap_err();
        assert!(err.message.contains("%0"), "{err}");
    }

    #[test]
    fn parses_structured_control_flow() {
        let text = "
            shader fragment
            fn main {
              block b0 {
                %0:1 = load_const 0x1
              }
              if %0 {
                block b1 {
                }
              } else {
                block b2 {
                }
              }
              block b3 {
              }
              loop {
                block b4 {
                  break
                }
              }
              block b5 {
              }
            }
        ";
        let shader = parse_shader(text).unwrap();
        let body = shader.functions[0].body.as_ref().unwrap();
        assert!(matches!(body.body[1], CfNode::If(_)));
        assert!(matches!(body.body[3], CfNode::Loop(_)));
        assert_eq!(body.block_alloc, 6);
    }
}
