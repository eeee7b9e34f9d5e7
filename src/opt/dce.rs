//! Copy propagation, phi cleanup, dead-code and common-subexpression
//! elimination.

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;

use super::{compose, rewrite_uses, CompilerOptions};
use crate::ir::{
    visit_blocks, visit_blocks_mut, AluOp, AluSrc, CfNode, FunctionBody, Instr, Intrinsic, Shader,
    Ssa,
};

/// Copy-like definitions: `mov`s and `vecN`s without source modifiers.
fn collect_copies(body: &FunctionBody) -> HashMap<u32, (AluOp, SmallVec<[AluSrc; 4]>)> {
    let mut copies = HashMap::new();
    visit_blocks(&body.body, &mut |block| {
        for instr in &block.instrs {
            if let Instr::Alu(alu) = instr {
                let is_copy = alu.op == AluOp::Mov || alu.op.is_vec();
                if is_copy && alu.srcs.iter().all(|s| !s.negate && !s.abs) {
                    copies.insert(alu.def.index, (alu.op, alu.srcs.clone()));
                }
            }
        }
    });
    copies
}

/// Rewrite an ALU source reading `lanes` lanes of a copy to read the copied
/// value directly.
fn propagate_alu_src(src: &AluSrc, lanes: u8, op: AluOp, copy: &[AluSrc]) -> Option<AluSrc> {
    if op == AluOp::Mov {
        return Some(compose(src, &copy[0]));
    }
    // A vec reads lane 0 of each of its sources.
    let mut value: Option<Ssa> = None;
    let mut swizzle = src.swizzle;
    for lane in 0..usize::from(lanes.max(1)) {
        let from = copy.get(usize::from(src.swizzle[lane]))?;
        if value.is_some_and(|v| v != from.src) {
            return None;
        }
        value = Some(from.src);
        swizzle[lane] = from.swizzle[0];
    }
    // Unused lanes follow the last used one.
    for lane in usize::from(lanes.max(1))..4 {
        swizzle[lane] = swizzle[lane - 1];
    }
    Some(AluSrc {
        src: value?,
        swizzle,
        negate: src.negate,
        abs: src.abs,
    })
}

/// Value a copy forwards verbatim, if it is a whole-value copy.
fn whole_copy(def: Ssa, op: AluOp, copy: &[AluSrc]) -> Option<Ssa> {
    let first = copy.first()?.src;
    let whole = first.num_components == def.num_components
        && first.bit_size == def.bit_size
        && if op == AluOp::Mov {
            copy[0].is_identity(def.num_components)
        } else {
            copy.iter()
                .enumerate()
                .all(|(i, s)| s.src == first && usize::from(s.swizzle[0]) == i)
        };
    whole.then_some(first)
}

pub fn copy_prop(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        loop {
            let copies = collect_copies(body);
            if copies.is_empty() {
                break;
            }
            let defs: HashMap<u32, Ssa> = body
                .defs()
                .into_iter()
                .filter_map(|(index, instr)| Some((index, instr.def()?)))
                .collect();

            let mut changed = false;
            let mut whole: HashMap<u32, Ssa> = HashMap::new();
            for (index, (op, srcs)) in &copies {
                if let Some(value) = defs.get(index).and_then(|d| whole_copy(*d, *op, srcs)) {
                    whole.insert(*index, value);
                }
            }

            visit_blocks_mut(&mut body.body, &mut |block| {
                for instr in &mut block.instrs {
                    match instr {
                        Instr::Alu(alu) => {
                            let lanes = alu.src_lanes();
                            for src in alu.srcs.iter_mut() {
                                let Some((op, copy)) = copies.get(&src.src.index) else {
                                    continue;
                                };
                                if let Some(new) = propagate_alu_src(src, lanes, *op, copy) {
                                    *src = new;
                                    changed = true;
                                }
                            }
                        }
                        other => other.for_each_src_mut(|src| {
                            if let Some(value) = whole.get(&src.index) {
                                *src = *value;
                                changed = true;
                            }
                        }),
                    }
                }
            });
            changed |= rewrite_if_conditions(&mut body.body, &whole);

            if !changed {
                break;
            }
            progress = true;
        }
    }
    progress
}

fn rewrite_if_conditions(list: &mut [CfNode], map: &HashMap<u32, Ssa>) -> bool {
    let mut changed = false;
    for node in list {
        match node {
            CfNode::Block(_) => {}
            CfNode::If(nif) => {
                if let Some(value) = map.get(&nif.condition.index) {
                    nif.condition = *value;
                    changed = true;
                }
                changed |= rewrite_if_conditions(&mut nif.then_list, map);
                changed |= rewrite_if_conditions(&mut nif.else_list, map);
            }
            CfNode::Loop(nloop) => changed |= rewrite_if_conditions(&mut nloop.body, map),
        }
    }
    changed
}

/// Remove phis whose sources all carry the same value.
pub fn remove_phis(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        let mut replace: HashMap<u32, Ssa> = HashMap::new();
        visit_blocks_mut(&mut body.body, &mut |block| {
            block.instrs.retain(|instr| {
                let Instr::Phi(phi) = instr else { return true };
                let mut value = None;
                for src in &phi.srcs {
                    if src.src.index == phi.def.index || Some(src.src) == value {
                        continue;
                    }
                    if value.is_some() {
                        return true;
                    }
                    value = Some(src.src);
                }
                match value {
                    Some(value) => {
                        replace.insert(phi.def.index, value);
                        false
                    }
                    // Only self references: the phi is never initialised.
                    None => true,
                }
            });
        });
        if replace.is_empty() {
            continue;
        }
        // Chains of trivial phis resolve to their final value.
        let resolved: HashMap<u32, Ssa> = replace
            .keys()
            .map(|index| {
                let mut value = replace[index];
                // Bounded: mutually trivial phis form a cycle.
                for _ in 0..replace.len() {
                    match replace.get(&value.index) {
                        Some(next) => value = *next,
                        None => break,
                    }
                }
                (*index, value)
            })
            .collect();
        rewrite_uses(&mut body.body, &resolved);
        progress = true;
    }
    progress
}

/// Remove instructions whose results never reach a side effect.
pub fn dce(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        let mut live: HashSet<u32> = HashSet::new();
        let mut worklist: Vec<u32> = Vec::new();
        collect_roots(&body.body, &mut worklist);

        let srcs_of: HashMap<u32, SmallVec<[u32; 4]>> = body
            .defs()
            .into_iter()
            .map(|(index, instr)| {
                let mut srcs = SmallVec::new();
                instr.for_each_src(|s| srcs.push(s.index));
                (index, srcs)
            })
            .collect();

        while let Some(index) = worklist.pop() {
            if !live.insert(index) {
                continue;
            }
            if let Some(srcs) = srcs_of.get(&index) {
                worklist.extend(srcs.iter().copied());
            }
        }

        visit_blocks_mut(&mut body.body, &mut |block| {
            let before = block.instrs.len();
            block.instrs.retain(|instr| match instr.def() {
                _ if instr.has_side_effects() => true,
                Some(def) => live.contains(&def.index),
                None => true,
            });
            progress |= block.instrs.len() != before;
        });
    }
    progress
}

fn collect_roots(list: &[CfNode], roots: &mut Vec<u32>) {
    for node in list {
        match node {
            CfNode::Block(block) => {
                for instr in block.instrs.iter().filter(|i| i.has_side_effects()) {
                    instr.for_each_src(|s| roots.push(s.index));
                }
            }
            CfNode::If(nif) => {
                roots.push(nif.condition.index);
                collect_roots(&nif.then_list, roots);
                collect_roots(&nif.else_list, roots);
            }
            CfNode::Loop(nloop) => collect_roots(&nloop.body, roots),
        }
    }
}

/// Value-numbering key. Swizzle lanes nobody reads are masked out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CseKey {
    Const {
        bit_size: u8,
        values: SmallVec<[u64; 4]>,
    },
    Alu {
        op: AluOp,
        def: (u8, u8),
        srcs: SmallVec<[AluSrc; 4]>,
    },
    Intrinsic {
        intrinsic: Intrinsic,
        def: (u8, u8),
        srcs: SmallVec<[Ssa; 2]>,
        base: u32,
        component: u8,
    },
}

fn cse_key(instr: &Instr) -> Option<CseKey> {
    match instr {
        Instr::LoadConst(lc) => Some(CseKey::Const {
            bit_size: lc.def.bit_size,
            values: lc.values.clone(),
        }),
        Instr::Alu(alu) => {
            let lanes = usize::from(alu.src_lanes().max(1));
            let srcs = alu
                .srcs
                .iter()
                .map(|s| {
                    let mut s = *s;
                    for lane in lanes..4 {
                        s.swizzle[lane] = 0;
                    }
                    s
                })
                .collect();
            Some(CseKey::Alu {
                op: alu.op,
                def: (alu.def.bit_size, alu.def.num_components),
                srcs,
            })
        }
        Instr::Intrinsic(intr) if intr.intrinsic.info().can_reorder => {
            let def = intr.def?;
            Some(CseKey::Intrinsic {
                intrinsic: intr.intrinsic,
                def: (def.bit_size, def.num_components),
                srcs: intr.srcs.clone(),
                base: intr.base,
                component: intr.component,
            })
        }
        _ => None,
    }
}

/// Merge equal computations where the first one dominates the others.
///
/// In the structured CF list a node dominates everything after it in the
/// same list and everything nested in those; branches and loop bodies get
/// their own scope.
pub fn cse(shader: &mut Shader, _options: &CompilerOptions) -> bool {
    let mut progress = false;
    for body in shader.bodies_mut() {
        let mut scopes: Vec<HashMap<CseKey, Ssa>> = vec![HashMap::new()];
        let mut replace: HashMap<u32, Ssa> = HashMap::new();
        cse_list(&mut body.body, &mut scopes, &mut replace);
        if !replace.is_empty() {
            // Phis and back edges may refer to values later in program order.
            rewrite_uses(&mut body.body, &replace);
            progress = true;
        }
    }
    progress
}

fn cse_list(
    list: &mut [CfNode],
    scopes: &mut Vec<HashMap<CseKey, Ssa>>,
    replace: &mut HashMap<u32, Ssa>,
) {
    for node in list {
        match node {
            CfNode::Block(block) => {
                block.instrs.retain_mut(|instr| {
                    instr.for_each_src_mut(|s| {
                        if let Some(to) = replace.get(&s.index) {
                            *s = *to;
                        }
                    });
                    let (Some(key), Some(def)) = (cse_key(instr), instr.def()) else {
                        return true;
                    };
                    if let Some(existing) = scopes.iter().rev().find_map(|scope| scope.get(&key)) {
                        replace.insert(def.index, *existing);
                        return false;
                    }
                    if let Some(scope) = scopes.last_mut() {
                        scope.insert(key, def);
                    }
                    true
                });
            }
            CfNode::If(nif) => {
                if let Some(to) = replace.get(&nif.condition.index) {
                    nif.condition = *to;
                }
                for branch in [&mut nif.then_list, &mut nif.else_list] {
                    scopes.push(HashMap::new());
                    cse_list(branch, scopes, replace);
                    scopes.pop();
                }
            }
            CfNode::Loop(nloop) => {
                scopes.push(HashMap::new());
                cse_list(&mut nloop.body, scopes, replace);
                scopes.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parser::parse_shader;
    use crate::opt::AGX_OPTIONS;

    fn block_instrs(shader: &Shader, n: usize) -> Vec<Instr> {
        let body = shader.functions[0].body.as_ref().unwrap();
        body.blocks()[n].instrs.clone()
    }

    #[test]
    fn copies_are_forwarded_through_vecs() {
        let mut shader = parse_shader(
            "shader vertex
             fn main {
               block b0 {
                 %0:32x2 = undef
                 %1:32 = mov %0.y
                 %2:32 = mov %0.x
                 %3:32x2 = vec2 %1, %2
                 %4:32 = fadd %3.y, %1
                 %5:32 = load_const 0x0
                 store_output %4, %5 base=0 wrmask=0x1
               }
             }",
        )
        .unwrap();
        assert!(copy_prop(&mut shader, &AGX_OPTIONS));
        let instrs = block_instrs(&shader, 0);
        let Instr::Alu(add) = &instrs[4] else { panic!() };
        assert_eq!(add.srcs[0].src.index, 0);
        assert_eq!(add.srcs[0].swizzle[0], 0);
        assert_eq!(add.srcs[1].src.index, 0);
        assert_eq!(add.srcs[1].swizzle[0], 1);
        assert!(!copy_prop(&mut shader, &AGX_OPTIONS));

        assert!(dce(&mut shader, &AGX_OPTIONS));
        assert_eq!(block_instrs(&shader, 0).len(), 4);
    }

    #[test]
    fn dce_keeps_side_effects_and_if_conditions() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:1 = load_const 0x1
                 %1:32 = load_const 0x7
               }
               if %0 {
                 block b1 {
                   discard
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
        assert!(dce(&mut shader, &AGX_OPTIONS));
        assert_eq!(block_instrs(&shader, 0).len(), 1);
        assert_eq!(block_instrs(&shader, 1).len(), 1);
        assert!(!dce(&mut shader, &AGX_OPTIONS));
    }

    #[test]
    fn trivial_phis_are_removed() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x1
               }
               loop {
                 block b1 {
                   %1:32 = phi b0:%0, b1:%1
                   %2:32 = iadd %1, %1
                   break
                 }
               }
               block b2 {
               }
             }",
        )
        .unwrap();
        assert!(remove_phis(&mut shader, &AGX_OPTIONS));
        let instrs = block_instrs(&shader, 1);
        let Instr::Alu(add) = &instrs[0] else { panic!() };
        assert_eq!(add.srcs[0].src.index, 0);
    }

    #[test]
    fn cse_respects_branch_scopes() {
        let mut shader = parse_shader(
            "shader fragment
             fn main {
               block b0 {
                 %0:1 = load_const 0x1
                 %1:32 = load_const 0x2a
                 %2:32 = load_const 0x2a
               }
               if %0 {
                 block b1 {
                   %3:32 = iadd %1, %2
                 }
               } else {
                 block b2 {
                   %4:32 = iadd %2, %1
                 }
               }
               block b3 {
                 %5:32 = iadd %1, %1
               }
             }",
        )
        .unwrap();
        assert!(cse(&mut shader, &AGX_OPTIONS));
        assert_eq!(block_instrs(&shader, 0).len(), 2);
        // Both branch adds survive: neither dominates the other.
        assert_eq!(block_instrs(&shader, 1).len(), 1);
        assert_eq!(block_instrs(&shader, 2).len(), 1);
        assert_eq!(block_instrs(&shader, 3).len(), 1);
        assert!(!cse(&mut shader, &AGX_OPTIONS));
    }
}
