//! Code motion.
//!
//! [`Sink`] pushes cheap definitions into the later block that consumes them,
//! never into a loop. [`Move`] then packs them in front of their first user
//! inside each block so their live ranges stay short.

use hashbrown::{HashMap, HashSet};

use super::{CompilerOptions, MoveOptions, Pass};
use crate::ir::{visit_blocks, visit_blocks_mut, AluOp, Block, CfNode, FunctionBody, Instr, Intrinsic, Shader};

fn can_move(instr: &Instr, options: MoveOptions, ssbo_stable: bool) -> bool {
    match instr {
        Instr::LoadConst(_) | Instr::Undef(_) => options.contains(MoveOptions::CONST_UNDEF),
        Instr::Alu(alu) if alu.op.is_comparison() => options.contains(MoveOptions::COMPARISONS),
        Instr::Alu(alu) if alu.op == AluOp::Mov || alu.op.is_vec() => {
            options.contains(MoveOptions::COPIES)
        }
        Instr::Intrinsic(intr) => match intr.intrinsic {
            Intrinsic::LoadUbo => options.contains(MoveOptions::LOAD_UBO),
            Intrinsic::LoadSsbo => ssbo_stable && options.contains(MoveOptions::LOAD_SSBO),
            Intrinsic::LoadInput | Intrinsic::LoadInterpolatedInput => {
                options.contains(MoveOptions::LOAD_INPUT)
            }
            other => other.interp_mode().is_some() && options.contains(MoveOptions::LOAD_INPUT),
        },
        _ => false,
    }
}

/// SSBO loads may only move when nothing in the function writes SSBOs.
fn ssbo_stable(body: &FunctionBody) -> bool {
    let mut stable = true;
    visit_blocks(&body.body, &mut |block| {
        stable &= !block.instrs.iter().any(|i| {
            matches!(i, Instr::Intrinsic(intr) if intr.intrinsic == Intrinsic::StoreSsbo)
        });
    });
    stable
}

fn reads(instr: &Instr, value: u32) -> bool {
    let mut found = false;
    instr.for_each_src(|s| found |= s.index == value);
    found
}

/// Block placement and value uses of a function.
#[derive(Default)]
struct Layout {
    /// Program-order position and innermost loop of each block.
    blocks: HashMap<u32, (usize, u32)>,
    /// Blocks reading each value, `None` once a use pins the value.
    uses: HashMap<u32, Option<HashSet<u32>>>,
    loops: u32,
}

impl Layout {
    fn build(list: &[CfNode]) -> Self {
        let mut layout = Self::default();
        layout.walk(list, 0);
        layout
    }

    fn add_use(&mut self, value: u32, block: Option<u32>) {
        let entry = self.uses.entry(value).or_insert_with(|| Some(HashSet::new()));
        if let (Some(set), Some(block)) = (entry.as_mut(), block) {
            set.insert(block);
            return;
        }
        *entry = None;
    }

    fn walk(&mut self, list: &[CfNode], loop_id: u32) {
        let mut prev = None;
        for node in list {
            match node {
                CfNode::Block(block) => {
                    let position = self.blocks.len();
                    self.blocks.insert(block.index, (position, loop_id));
                    for instr in &block.instrs {
                        // Phi operands are read on the incoming edge.
                        let site = (!instr.is_phi()).then_some(block.index);
                        instr.for_each_src(|s| self.add_use(s.index, site));
                    }
                    prev = Some(block.index);
                }
                CfNode::If(nif) => {
                    self.add_use(nif.condition.index, prev);
                    self.walk(&nif.then_list, loop_id);
                    self.walk(&nif.else_list, loop_id);
                    prev = None;
                }
                CfNode::Loop(nloop) => {
                    self.loops += 1;
                    let id = self.loops;
                    self.walk(&nloop.body, id);
                    prev = None;
                }
            }
        }
    }
}

fn sink_body(body: &mut FunctionBody, options: MoveOptions) -> bool {
    let stable = ssbo_stable(body);
    let layout = Layout::build(&body.body);

    let mut plan: Vec<(u32, u32)> = Vec::new();
    visit_blocks(&body.body, &mut |block| {
        let Some(&(position, loop_id)) = layout.blocks.get(&block.index) else {
            return;
        };
        for instr in block.instrs.iter().rev() {
            if !can_move(instr, options, stable) {
                continue;
            }
            let Some(def) = instr.def() else { continue };
            let Some(Some(users)) = layout.uses.get(&def.index) else {
                continue;
            };
            let mut users = users.iter();
            let (Some(&target), None) = (users.next(), users.next()) else {
                continue;
            };
            let Some(&(target_position, target_loop)) = layout.blocks.get(&target) else {
                continue;
            };
            if target_position > position && target_loop == loop_id {
                plan.push((def.index, target));
            }
        }
    });
    if plan.is_empty() {
        return false;
    }

    let targets: HashSet<u32> = plan.iter().map(|(value, _)| *value).collect();
    let mut moving: HashMap<u32, Instr> = HashMap::new();
    visit_blocks_mut(&mut body.body, &mut |block| {
        for instr in std::mem::take(&mut block.instrs) {
            match instr.def() {
                Some(def) if targets.contains(&def.index) => {
                    moving.insert(def.index, instr);
                }
                _ => block.instrs.push(instr),
            }
        }
    });

    visit_blocks_mut(&mut body.body, &mut |block| {
        for (value, target) in &plan {
            if *target != block.index {
                continue;
            }
            let Some(instr) = moving.remove(value) else { continue };
            let end = block.instrs.len() - usize::from(block.ends_in_jump());
            let at = block.instrs.iter().position(|i| reads(i, *value)).unwrap_or(end);
            block.instrs.insert(at, instr);
        }
    });
    true
}

/// Sink definitions into the single later block using them.
pub struct Sink(pub MoveOptions);

impl Pass for Sink {
    fn name(&self) -> &'static str {
        "sink"
    }

    fn run(&self, shader: &mut Shader, _options: &CompilerOptions) -> bool {
        let mut progress = false;
        for body in shader.bodies_mut() {
            while sink_body(body, self.0) {
                progress = true;
            }
        }
        progress
    }
}

/// Place movable instructions of `block` right before their first user.
///
/// An instruction separated from its user only by other movable
/// instructions is already in place, which keeps the pass stable.
fn move_block(block: &mut Block, options: MoveOptions, stable: bool) -> bool {
    let mut progress = false;
    let mut i = block.instrs.len();
    while i > 0 {
        i -= 1;
        if !can_move(&block.instrs[i], options, stable) {
            continue;
        }
        let Some(def) = block.instrs[i].def() else { continue };
        let user = (i + 1..block.instrs.len())
            .find(|&j| !block.instrs[j].is_phi() && reads(&block.instrs[j], def.index));
        let Some(user) = user else { continue };
        if (i + 1..user).all(|j| can_move(&block.instrs[j], options, stable)) {
            continue;
        }
        let instr = block.instrs.remove(i);
        block.instrs.insert(user - 1, instr);
        progress = true;
    }
    progress
}

/// Shorten live ranges inside each block.
pub struct Move(pub MoveOptions);

impl Pass for Move {
    fn name(&self) -> &'static str {
        "move"
    }

    fn run(&self, shader: &mut Shader, _options: &CompilerOptions) -> bool {
        let mut progress = false;
        for body in shader.bodies_mut() {
            let stable = ssbo_stable(body);
            visit_blocks_mut(&mut body.body, &mut |block| {
                progress |= move_block(block, self.0, stable);
            });
        }
        progress
    }
}
