//! Control-flow simplification: dead branches, select peephole and
//! single-iteration loop unrolling.
//!
//! All three rewrite the structured CF list directly and finish by merging
//! the blocks that became adjacent.

use hashbrown::HashMap;

use super::{last_block_index, merge_adjacent_blocks, prune_phi_sources, CompilerOptions, Pass};
use crate::ir::{
    visit_blocks, AluOp, AluSrc, Block, CfNode, Instr, Intrinsic, JumpKind, LoadConstInstr,
    Shader,
};

fn block_indices(list: &[CfNode]) -> Vec<u32> {
    let mut indices = Vec::new();
    visit_blocks(list, &mut |b| indices.push(b.index));
    indices
}

/// Replace the phis of `block` by moves of the source coming from `pred`.
/// Phis without such a source are left alone.
fn resolve_phis(block: &mut Block, pred: u32) {
    for instr in &mut block.instrs {
        let Instr::Phi(phi) = instr else { break };
        if let Some(src) = phi.srcs.iter().find(|s| s.pred == pred) {
            *instr = Instr::mov(phi.def, AluSrc::new(src.src));
        }
    }
}

pub fn dead_cf(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        let consts = body.constants();
        let mut removed = Vec::new();
        progress |= dead_cf_list(&mut body.body, &consts, &mut removed);
        if !removed.is_empty() {
            prune_phi_sources(&mut body.body, &removed);
        }
    }
    progress
}

fn dead_cf_list(
    list: &mut Vec<CfNode>,
    consts: &HashMap<u32, LoadConstInstr>,
    removed: &mut Vec<u32>,
) -> bool {
    let mut progress = false;
    for node in list.iter_mut() {
        match node {
            CfNode::Block(_) => {}
            CfNode::If(nif) => {
                progress |= dead_cf_list(&mut nif.then_list, consts, removed);
                progress |= dead_cf_list(&mut nif.else_list, consts, removed);
            }
            CfNode::Loop(nloop) => progress |= dead_cf_list(&mut nloop.body, consts, removed),
        }
    }

    // Inline ifs with a constant condition.
    let mut folded = false;
    let mut taken_end = None;
    for node in std::mem::take(list) {
        match node {
            CfNode::If(nif) => match consts.get(&nif.condition.index) {
                Some(lc) => {
                    let (taken, dead) = if lc.values.first().is_some_and(|v| *v != 0) {
                        (nif.then_list, nif.else_list)
                    } else {
                        (nif.else_list, nif.then_list)
                    };
                    removed.extend(block_indices(&dead));
                    taken_end = last_block_index(&taken);
                    list.extend(taken);
                    folded = true;
                }
                None => list.push(CfNode::If(nif)),
            },
            CfNode::Block(mut block) => {
                if let Some(pred) = taken_end.take() {
                    resolve_phis(&mut block, pred);
                }
                list.push(CfNode::Block(block));
            }
            other => {
                taken_end = None;
                list.push(other);
            }
        }
    }
    if folded {
        merge_adjacent_blocks(list);
        progress = true;
    }

    // Nothing after a jump is reachable.
    let jump_at = list.iter().enumerate().find_map(|(i, node)| {
        let block = node.as_block()?;
        let j = block.instrs.iter().position(Instr::is_jump)?;
        Some((i, j))
    });
    if let Some((i, j)) = jump_at {
        if let Some(block) = list[i].as_block_mut() {
            if block.instrs.len() > j + 1 {
                block.instrs.truncate(j + 1);
                progress = true;
            }
        }
        if list.len() > i + 1 {
            let dead: Vec<CfNode> = list.drain(i + 1..).collect();
            removed.extend(block_indices(&dead));
            progress = true;
        }
    }
    progress
}

/// Flatten small `if`s whose arms are cheap to execute unconditionally,
/// turning the join phis into `bcsel`s.
pub struct PeepholeSelect {
    /// Maximum instructions per arm.
    pub limit: usize,
    /// Allow speculating UBO loads with a dynamic offset.
    pub indirect_load_ok: bool,
    /// Allow speculating divisions and transcendentals.
    pub expensive_alu_ok: bool,
}

impl Pass for PeepholeSelect {
    fn name(&self) -> &'static str {
        "peephole_select"
    }

    fn run(&self, shader: &mut Shader, _options: &CompilerOptions) -> bool {
        let mut progress = false;
        for body in shader.bodies_mut() {
            let consts = body.constants();
            progress |= self.select_list(&mut body.body, &consts);
        }
        progress
    }
}

impl PeepholeSelect {
    fn can_speculate(&self, instr: &Instr, consts: &HashMap<u32, LoadConstInstr>) -> bool {
        match instr {
            Instr::LoadConst(_) | Instr::Undef(_) => true,
            Instr::Alu(alu) => {
                self.expensive_alu_ok
                    || !matches!(
                        alu.op,
                        AluOp::Fdiv
                            | AluOp::Frcp
                            | AluOp::Fpow
                            | AluOp::Fexp2
                            | AluOp::Flog2
                            | AluOp::Udiv
                            | AluOp::Idiv
                            | AluOp::Umod
                            | AluOp::Imod
                            | AluOp::Irem
                    )
            }
            Instr::Intrinsic(intr) if intr.intrinsic == Intrinsic::LoadUbo => {
                self.indirect_load_ok || intr.srcs.get(1).is_some_and(|o| consts.contains_key(&o.index))
            }
            Instr::Intrinsic(_) | Instr::Tex(_) | Instr::Jump(_) | Instr::Phi(_) => false,
        }
    }

    fn arm_block<'a>(
        &self,
        list: &'a [CfNode],
        consts: &HashMap<u32, LoadConstInstr>,
    ) -> Option<&'a Block> {
        match list {
            [CfNode::Block(block)]
                if block.instrs.len() <= self.limit
                    && block.instrs.iter().all(|i| self.can_speculate(i, consts)) =>
            {
                Some(block)
            }
            _ => None,
        }
    }

    fn select_list(&self, list: &mut Vec<CfNode>, consts: &HashMap<u32, LoadConstInstr>) -> bool {
        let mut progress = false;
        for node in list.iter_mut() {
            match node {
                CfNode::Block(_) => {}
                CfNode::If(nif) => {
                    progress |= self.select_list(&mut nif.then_list, consts);
                    progress |= self.select_list(&mut nif.else_list, consts);
                }
                CfNode::Loop(nloop) => progress |= self.select_list(&mut nloop.body, consts),
            }
        }

        let mut i = 1;
        while i + 1 < list.len() {
            let CfNode::If(nif) = &list[i] else {
                i += 1;
                continue;
            };
            let (Some(then_block), Some(else_block)) = (
                self.arm_block(&nif.then_list, consts),
                self.arm_block(&nif.else_list, consts),
            ) else {
                i += 1;
                continue;
            };
            let (then_index, else_index) = (then_block.index, else_block.index);
            let joins_cleanly = list[i + 1].as_block().is_some_and(|join| {
                join.instrs.iter().take_while(|i| i.is_phi()).all(|instr| match instr {
                    Instr::Phi(phi) => {
                        phi.srcs.iter().any(|s| s.pred == then_index)
                            && phi.srcs.iter().any(|s| s.pred == else_index)
                    }
                    _ => false,
                })
            });
            if !joins_cleanly || list[i - 1].as_block().is_none() {
                i += 1;
                continue;
            }

            let mut nodes: Vec<CfNode> = list.drain(i - 1..=i + 1).collect();
            let (Some(CfNode::Block(join)), Some(CfNode::If(nif)), Some(CfNode::Block(mut merged))) =
                (nodes.pop(), nodes.pop(), nodes.pop())
            else {
                unreachable!("node kinds were checked above");
            };
            let condition = AluSrc::channel(nif.condition, 0);
            for arm in [nif.then_list, nif.else_list] {
                for node in arm {
                    if let CfNode::Block(block) = node {
                        merged.instrs.extend(block.instrs);
                    }
                }
            }
            for instr in join.instrs {
                match instr {
                    Instr::Phi(phi) => {
                        let from = |pred: u32| {
                            phi.srcs
                                .iter()
                                .find(|s| s.pred == pred)
                                .map(|s| AluSrc::new(s.src))
                        };
                        if let (Some(t), Some(e)) = (from(then_index), from(else_index)) {
                            merged.instrs.push(Instr::alu(AluOp::Bcsel, phi.def, &[condition, t, e]));
                        }
                    }
                    other => merged.instrs.push(other),
                }
            }
            merged.index = join.index;
            list.insert(i - 1, CfNode::Block(merged));
            progress = true;
        }
        progress
    }
}

/// Inline loops that run exactly once: a straight-line body ending in an
/// unconditional `break` with no other jumps.
pub fn loop_unroll(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        progress |= unroll_list(&mut body.body);
    }
    progress
}

fn runs_once(body: &[CfNode]) -> bool {
    match body {
        [CfNode::Block(block)] => {
            let jumps = block.instrs.iter().filter(|i| i.is_jump()).count();
            jumps == 1 && matches!(block.instrs.last(), Some(Instr::Jump(JumpKind::Break)))
        }
        _ => false,
    }
}

fn unroll_list(list: &mut Vec<CfNode>) -> bool {
    let mut progress = false;
    for node in list.iter_mut() {
        match node {
            CfNode::Block(_) => {}
            CfNode::If(nif) => {
                progress |= unroll_list(&mut nif.then_list);
                progress |= unroll_list(&mut nif.else_list);
            }
            CfNode::Loop(nloop) => progress |= unroll_list(&mut nloop.body),
        }
    }

    let mut i = 1;
    while i + 1 < list.len() {
        let is_candidate = matches!(&list[i], CfNode::Loop(nloop) if runs_once(&nloop.body))
            && list[i - 1].as_block().is_some()
            && list[i + 1].as_block().is_some();
        if !is_candidate {
            i += 1;
            continue;
        }

        let mut nodes: Vec<CfNode> = list.drain(i - 1..=i + 1).collect();
        let (Some(CfNode::Block(mut after)), Some(CfNode::Loop(nloop)), Some(CfNode::Block(mut merged))) =
            (nodes.pop(), nodes.pop(), nodes.pop())
        else {
            unreachable!("node kinds were checked above");
        };
        let Some(CfNode::Block(mut header)) = nloop.body.into_iter().next() else {
            unreachable!("single-block body was checked above");
        };
        resolve_phis(&mut header, merged.index);
        header.instrs.pop();
        resolve_phis(&mut after, header.index);

        merged.instrs.extend(header.instrs);
        merged.instrs.extend(after.instrs);
        merged.index = after.index;
        list.insert(i - 1, CfNode::Block(merged));
        progress = true;
    }
    progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_shader;
    use crate::opt::AGX_OPTIONS;

    fn top_level(shader: &Shader) -> &[CfNode] {
        &shader.functions[0].body.as_ref().unwrap().body
    }

    #[test]
    fn constant_if_is_inlined() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:1 = load_const 0x0
                 %1:32 = load_const 0x1
                 %2:32 = load_const 0x2
               }
               if %0 {
                 block b1 {
                 }
               } else {
                 block b2 {
                 }
               }
               block b3 {
                 %3:32 = phi b1:%1, b2:%2
                 %4:32 = iadd %3, %3
               }
             }",
        )
        .unwrap();
        assert!(dead_cf(&mut shader, &AGX_OPTIONS));
        let list = top_level(&shader);
        assert_eq!(list.len(), 1);
        let block = list[0].as_block().unwrap();
        assert_eq!(block.index, 3);
        let Instr::Alu(mov) = &block.instrs[3] else { panic!() };
        assert_eq!(mov.op, AluOp::Mov);
        assert_eq!(mov.srcs[0].src.index, 2);
        assert!(!dead_cf(&mut shader, &AGX_OPTIONS));
    }

    #[test]
    fn code_after_break_is_removed() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:1 = undef
               }
               loop {
                 block b1 {
                   break
                   %1:32 = load_const 0x5
                 }
                 if %0 {
                   block b2 {
                   }
                 } else {
                   block b3 {
                   }
                 }
                 block b4 {
                 }
               }
               block b5 {
               }
             }",
        )
        .unwrap();
        assert!(dead_cf(&mut shader, &AGX_OPTIONS));
        let CfNode::Loop(nloop) = &top_level(&shader)[1] else { panic!() };
        assert_eq!(nloop.body.len(), 1);
        assert_eq!(nloop.body[0].as_block().unwrap().instrs.len(), 1);
    }

    #[test]
    fn small_if_becomes_select() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x3f800000
                 %1:1 = flt %0, %0
               }
               if %1 {
                 block b1 {
                   %2:32 = fadd %0, %0
                 }
               } else {
                 block b2 {
                   %3:32 = fmul %0, %0
                 }
               }
               block b3 {
                 %4:32 = phi b2:%3, b1:%2
               }
             }",
        )
        .unwrap();
        let select = PeepholeSelect {
            limit: 64,
            indirect_load_ok: false,
            expensive_alu_ok: true,
        };
        assert!(select.run(&mut shader, &AGX_OPTIONS));
        let list = top_level(&shader);
        assert_eq!(list.len(), 1);
        let block = list[0].as_block().unwrap();
        let Instr::Alu(sel) = block.instrs.last().unwrap() else { panic!() };
        assert_eq!(sel.op, AluOp::Bcsel);
        assert_eq!(sel.def.index, 4);
        assert_eq!(sel.srcs[1].src.index, 2);
        assert_eq!(sel.srcs[2].src.index, 3);
    }

    #[test]
    fn arms_over_the_limit_are_kept() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:1 = load_const 0x1
               }
               if %0 {
                 block b1 {
                   %1:32 = load_const 0x1
                   %2:32 = load_const 0x2
                 }
               } else {
                 block b2 {
                 }
               }
               block b3 {
               }
             }",
        )
        .unwrap();
        let select = PeepholeSelect {
            limit: 1,
            indirect_load_ok: false,
            expensive_alu_ok: true,
        };
        assert!(!select.run(&mut shader, &AGX_OPTIONS));
    }

    #[test]
    fn single_iteration_loop_is_unrolled() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x1
               }
               loop {
                 block b1 {
                   %1:32 = phi b0:%0
                   %2:32 = iadd %1, %1
                   break
                 }
               }
               block b2 {
                 %3:32 = phi b1:%2
               }
             }",
        )
        .unwrap();
        assert!(loop_unroll(&mut shader, &AGX_OPTIONS));
        let list = top_level(&shader);
        assert_eq!(list.len(), 1);
        let block = list[0].as_block().unwrap();
        assert_eq!(block.index, 2);
        assert_eq!(block.instrs.len(), 4);
        assert!(!block.instrs.iter().any(|i| i.is_jump() || i.is_phi()));
    }
}
