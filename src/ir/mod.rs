// This module defines the source IR consumed by the AGX backend: a shader made of I/O
// variables and functions whose bodies are structured control-flow lists (blocks, ifs,
// loops) holding SSA instructions. It is the representation the optimization pipeline
// rewrites in place and the instruction selector later walks. Every SSA reference
// carries its bit size and component count so consumers never need a side table to
// check widths. Submodules provide a programmatic builder, the I/O layout helpers, a
// text parser and a printer for the same text format.

//! Source IR: structured, SSA-form shader programs.
//!
//! # Text format
//!
//! ```text
//! shader fragment label=blit
//! var in vec4 v_color loc=32
//! var out vec4 color loc=2
//! fn main {
//!   block b0 {
//!     %0:32 = load_const 0x0
//!     %1:32x2 = load_barycentric_pixel
//!     %2:32x4 = load_interpolated_input %1, %0 base=0
//!     store_output %2, %0 base=0 wrmask=0xf
//!   }
//! }
//! ```

use std::fmt;

use hashbrown::HashMap;
use smallvec::SmallVec;

pub mod builder;
pub mod io;
pub mod parser;
pub mod print;

pub use builder::{InstrBuilder, ShaderBuilder};
pub use io::{BaseType, IoType, VarMode, Variable};

/// Pipeline stage a shader runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Vertex,
    Fragment,
    Compute,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Vertex => "vertex",
            Stage::Fragment => "fragment",
            Stage::Compute => "compute",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "vertex" => Some(Stage::Vertex),
            "fragment" => Some(Stage::Fragment),
            "compute" => Some(Stage::Compute),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to an SSA value together with its shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ssa {
    pub index: u32,
    pub bit_size: u8,
    pub num_components: u8,
}

impl Ssa {
    pub const fn new(index: u32, bit_size: u8, num_components: u8) -> Self {
        Self {
            index,
            bit_size,
            num_components,
        }
    }
}

/// Lane selector applying no reordering.
pub const IDENTITY_SWIZZLE: [u8; 4] = [0, 1, 2, 3];

/// ALU source operand: an SSA value read through a swizzle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AluSrc {
    pub src: Ssa,
    pub swizzle: [u8; 4],
    pub negate: bool,
    pub abs: bool,
}

impl AluSrc {
    pub fn new(src: Ssa) -> Self {
        Self {
            src,
            swizzle: IDENTITY_SWIZZLE,
            negate: false,
            abs: false,
        }
    }

    /// Read a single channel of `src`, replicated to every lane.
    pub fn channel(src: Ssa, channel: u8) -> Self {
        Self {
            swizzle: [channel; 4],
            ..Self::new(src)
        }
    }

    /// True when lanes `0..comps` read the same lanes of the source.
    pub fn is_identity(&self, comps: u8) -> bool {
        (0..comps as usize).all(|i| self.swizzle[i] as usize == i)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluClass {
    Move,
    Vec,
    Float,
    Int,
    Compare,
    Select,
    Convert,
}

#[derive(Debug, Clone, Copy)]
pub struct AluOpInfo {
    pub name: &'static str,
    pub num_inputs: usize,
    pub class: AluClass,
}

macro_rules! alu_ops {
    ($($variant:ident => ($name:literal, $inputs:literal, $class:ident),)*) => {
        /// Arithmetic and logic operations of the source IR.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum AluOp {
            $($variant,)*
        }

        impl AluOp {
            pub const ALL: &'static [AluOp] = &[$(AluOp::$variant,)*];

            pub const fn info(self) -> AluOpInfo {
                match self {
                    $(AluOp::$variant => AluOpInfo {
                        name: $name,
                        num_inputs: $inputs,
                        class: AluClass::$class,
                    },)*
                }
            }
        }
    };
}

alu_ops! {
    Mov => ("mov", 1, Move),
    Vec2 => ("vec2", 2, Vec),
    Vec3 => ("vec3", 3, Vec),
    Vec4 => ("vec4", 4, Vec),
    Vec8 => ("vec8", 8, Vec),
    Vec16 => ("vec16", 16, Vec),
    Fadd => ("fadd", 2, Float),
    Fsub => ("fsub", 2, Float),
    Fmul => ("fmul", 2, Float),
    Ffma => ("ffma", 3, Float),
    Fdiv => ("fdiv", 2, Float),
    Fneg => ("fneg", 1, Float),
    Fabs => ("fabs", 1, Float),
    Frcp => ("frcp", 1, Float),
    Ffloor => ("ffloor", 1, Float),
    Ffract => ("ffract", 1, Float),
    Fmod => ("fmod", 2, Float),
    Flrp => ("flrp", 3, Float),
    Fpow => ("fpow", 2, Float),
    Fexp2 => ("fexp2", 1, Float),
    Flog2 => ("flog2", 1, Float),
    Fsign => ("fsign", 1, Float),
    Iadd => ("iadd", 2, Int),
    Isub => ("isub", 2, Int),
    Imul => ("imul", 2, Int),
    Ineg => ("ineg", 1, Int),
    Iabs => ("iabs", 1, Int),
    Isign => ("isign", 1, Int),
    Udiv => ("udiv", 2, Int),
    Idiv => ("idiv", 2, Int),
    Umod => ("umod", 2, Int),
    Imod => ("imod", 2, Int),
    Irem => ("irem", 2, Int),
    UmulHigh => ("umul_high", 2, Int),
    Imin => ("imin", 2, Int),
    Imax => ("imax", 2, Int),
    Iand => ("iand", 2, Int),
    Ior => ("ior", 2, Int),
    Ixor => ("ixor", 2, Int),
    Inot => ("inot", 1, Int),
    Ishl => ("ishl", 2, Int),
    Ishr => ("ishr", 2, Int),
    Ushr => ("ushr", 2, Int),
    Feq => ("feq", 2, Compare),
    Fneu => ("fneu", 2, Compare),
    Flt => ("flt", 2, Compare),
    Fge => ("fge", 2, Compare),
    Ieq => ("ieq", 2, Compare),
    Ine => ("ine", 2, Compare),
    Ilt => ("ilt", 2, Compare),
    Ige => ("ige", 2, Compare),
    Ult => ("ult", 2, Compare),
    Uge => ("uge", 2, Compare),
    Bcsel => ("bcsel", 3, Select),
    U2f32 => ("u2f32", 1, Convert),
    I2f32 => ("i2f32", 1, Convert),
    F2u32 => ("f2u32", 1, Convert),
    F2i32 => ("f2i32", 1, Convert),
    U2u16 => ("u2u16", 1, Convert),
    U2u32 => ("u2u32", 1, Convert),
    I2i32 => ("i2i32", 1, Convert),
    Pack64_2x32Split => ("pack_64_2x32_split", 2, Convert),
    Unpack64_2x32SplitX => ("unpack_64_2x32_split_x", 1, Convert),
    Unpack64_2x32SplitY => ("unpack_64_2x32_split_y", 1, Convert),
}

impl AluOp {
    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn num_inputs(self) -> usize {
        self.info().num_inputs
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.name() == name)
    }

    pub fn is_vec(self) -> bool {
        self.info().class == AluClass::Vec
    }

    pub fn is_comparison(self) -> bool {
        self.info().class == AluClass::Compare
    }

    /// Vector pack producing `comps` components.
    pub fn vec(comps: u8) -> Option<Self> {
        match comps {
            2 => Some(AluOp::Vec2),
            3 => Some(AluOp::Vec3),
            4 => Some(AluOp::Vec4),
            8 => Some(AluOp::Vec8),
            16 => Some(AluOp::Vec16),
            _ => None,
        }
    }

    /// Bit size of the result given the bit size of the first value source.
    pub fn dest_bit_size(self, src_bits: u8) -> u8 {
        match self {
            _ if self.is_comparison() => 1,
            AluOp::U2f32 | AluOp::I2f32 | AluOp::F2u32 | AluOp::F2i32 => 32,
            AluOp::U2u32 | AluOp::I2i32 | AluOp::Unpack64_2x32SplitX => 32,
            AluOp::Unpack64_2x32SplitY => 32,
            AluOp::U2u16 => 16,
            AluOp::Pack64_2x32Split => 64,
            _ => src_bits,
        }
    }
}

/// Interpolation requested by a barycentric load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterpMode {
    Pixel,
    Centroid,
    Sample,
    AtSample,
    AtOffset,
}

#[derive(Debug, Clone, Copy)]
pub struct IntrinsicInfo {
    pub name: &'static str,
    pub num_srcs: usize,
    pub has_dest: bool,
    /// Result depends only on the sources, so equal calls may be merged.
    pub can_reorder: bool,
}

macro_rules! intrinsics {
    ($($variant:ident => ($name:literal, $srcs:literal, $dest:literal, $reorder:literal),)*) => {
        /// Intrinsic operations of the source IR.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Intrinsic {
            $($variant,)*
        }

        impl Intrinsic {
            pub const ALL: &'static [Intrinsic] = &[$(Intrinsic::$variant,)*];

            pub const fn info(self) -> IntrinsicInfo {
                match self {
                    $(Intrinsic::$variant => IntrinsicInfo {
                        name: $name,
                        num_srcs: $srcs,
                        has_dest: $dest,
                        can_reorder: $reorder,
                    },)*
                }
            }
        }
    };
}

intrinsics! {
    LoadBarycentricPixel => ("load_barycentric_pixel", 0, true, true),
    LoadBarycentricCentroid => ("load_barycentric_centroid", 0, true, true),
    LoadBarycentricSample => ("load_barycentric_sample", 0, true, true),
    LoadBarycentricAtSample => ("load_barycentric_at_sample", 1, true, true),
    LoadBarycentricAtOffset => ("load_barycentric_at_offset", 1, true, true),
    LoadInterpolatedInput => ("load_interpolated_input", 2, true, true),
    LoadInput => ("load_input", 1, true, true),
    StoreOutput => ("store_output", 2, false, false),
    LoadUbo => ("load_ubo", 2, true, true),
    LoadSsbo => ("load_ssbo", 2, true, false),
    StoreSsbo => ("store_ssbo", 3, false, false),
    LoadReg => ("load_reg", 0, true, false),
    StoreReg => ("store_reg", 1, false, false),
    Discard => ("discard", 0, false, false),
}

impl Intrinsic {
    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|i| i.name() == name)
    }

    pub fn interp_mode(self) -> Option<InterpMode> {
        match self {
            Intrinsic::LoadBarycentricPixel => Some(InterpMode::Pixel),
            Intrinsic::LoadBarycentricCentroid => Some(InterpMode::Centroid),
            Intrinsic::LoadBarycentricSample => Some(InterpMode::Sample),
            Intrinsic::LoadBarycentricAtSample => Some(InterpMode::AtSample),
            Intrinsic::LoadBarycentricAtOffset => Some(InterpMode::AtOffset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadConstInstr {
    pub def: Ssa,
    /// Raw bit pattern of each component.
    pub values: SmallVec<[u64; 4]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UndefInstr {
    pub def: Ssa,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AluInstr {
    pub op: AluOp,
    pub def: Ssa,
    pub srcs: SmallVec<[AluSrc; 4]>,
}

impl AluInstr {
    /// Number of swizzle lanes each source contributes.
    ///
    /// Vector packs read one lane per source; everything else is
    /// component-wise over the destination.
    pub fn src_lanes(&self) -> u8 {
        if self.op.is_vec() {
            1
        } else {
            self.def.num_components
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicInstr {
    pub intrinsic: Intrinsic,
    pub def: Option<Ssa>,
    pub srcs: SmallVec<[Ssa; 2]>,
    pub num_components: u8,
    pub base: u32,
    pub component: u8,
    pub write_mask: u8,
}

impl IntrinsicInstr {
    pub fn new(intrinsic: Intrinsic, def: Option<Ssa>, srcs: &[Ssa]) -> Self {
        let num_components = match def {
            Some(def) => def.num_components,
            None => srcs.first().map_or(0, |s| s.num_components),
        };
        Self {
            intrinsic,
            def,
            srcs: SmallVec::from_slice(srcs),
            num_components,
            base: 0,
            component: 0,
            write_mask: 0,
        }
    }

    /// Offset source of an I/O intrinsic.
    pub fn io_offset_src(&self) -> Option<&Ssa> {
        match self.intrinsic {
            Intrinsic::LoadInput => self.srcs.first(),
            Intrinsic::LoadInterpolatedInput | Intrinsic::StoreOutput => self.srcs.get(1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TexInstr {
    pub def: Ssa,
    pub coord: Ssa,
    pub texture_index: u32,
    pub sampler_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Break,
    Continue,
    Return,
}

impl JumpKind {
    pub fn name(self) -> &'static str {
        match self {
            JumpKind::Break => "break",
            JumpKind::Continue => "continue",
            JumpKind::Return => "return",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhiSrc {
    /// Index of the predecessor block.
    pub pred: u32,
    pub src: Ssa,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhiInstr {
    pub def: Ssa,
    pub srcs: SmallVec<[PhiSrc; 2]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    LoadConst(LoadConstInstr),
    Undef(UndefInstr),
    Alu(AluInstr),
    Intrinsic(IntrinsicInstr),
    Tex(TexInstr),
    Jump(JumpKind),
    Phi(PhiInstr),
}

impl Instr {
    pub fn alu(op: AluOp, def: Ssa, srcs: &[AluSrc]) -> Self {
        Instr::Alu(AluInstr {
            op,
            def,
            srcs: SmallVec::from_slice(srcs),
        })
    }

    pub fn mov(def: Ssa, src: AluSrc) -> Self {
        Self::alu(AluOp::Mov, def, &[src])
    }

    pub fn load_const(def: Ssa, values: &[u64]) -> Self {
        Instr::LoadConst(LoadConstInstr {
            def,
            values: SmallVec::from_slice(values),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Instr::LoadConst(_) => "load_const",
            Instr::Undef(_) => "undef",
            Instr::Alu(alu) => alu.op.name(),
            Instr::Intrinsic(intr) => intr.intrinsic.name(),
            Instr::Tex(_) => "tex",
            Instr::Jump(kind) => kind.name(),
            Instr::Phi(_) => "phi",
        }
    }

    pub fn def(&self) -> Option<Ssa> {
        match self {
            Instr::LoadConst(lc) => Some(lc.def),
            Instr::Undef(undef) => Some(undef.def),
            Instr::Alu(alu) => Some(alu.def),
            Instr::Intrinsic(intr) => intr.def,
            Instr::Tex(tex) => Some(tex.def),
            Instr::Jump(_) => None,
            Instr::Phi(phi) => Some(phi.def),
        }
    }

    pub fn for_each_src(&self, mut f: impl FnMut(&Ssa)) {
        match self {
            Instr::LoadConst(_) | Instr::Undef(_) | Instr::Jump(_) => {}
            Instr::Alu(alu) => alu.srcs.iter().for_each(|s| f(&s.src)),
            Instr::Intrinsic(intr) => intr.srcs.iter().for_each(f),
            Instr::Tex(tex) => f(&tex.coord),
            Instr::Phi(phi) => phi.srcs.iter().for_each(|s| f(&s.src)),
        }
    }

    pub fn for_each_src_mut(&mut self, mut f: impl FnMut(&mut Ssa)) {
        match self {
            Instr::LoadConst(_) | Instr::Undef(_) | Instr::Jump(_) => {}
            Instr::Alu(alu) => alu.srcs.iter_mut().for_each(|s| f(&mut s.src)),
            Instr::Intrinsic(intr) => intr.srcs.iter_mut().for_each(f),
            Instr::Tex(tex) => f(&mut tex.coord),
            Instr::Phi(phi) => phi.srcs.iter_mut().for_each(|s| f(&mut s.src)),
        }
    }

    /// Instructions that must be kept even when their result is unused.
    pub fn has_side_effects(&self) -> bool {
        match self {
            Instr::Jump(_) => true,
            Instr::Intrinsic(intr) => !intr.intrinsic.info().has_dest,
            _ => false,
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Instr::Phi(_))
    }

    pub fn is_jump(&self) -> bool {
        matches!(self, Instr::Jump(_))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub index: u32,
    pub instrs: Vec<Instr>,
}

impl Block {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            instrs: Vec::new(),
        }
    }

    /// Number of leading phi instructions.
    pub fn phi_count(&self) -> usize {
        self.instrs.iter().take_while(|i| i.is_phi()).count()
    }

    pub fn ends_in_jump(&self) -> bool {
        self.instrs.last().is_some_and(Instr::is_jump)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfNode {
    pub condition: Ssa,
    pub then_list: Vec<CfNode>,
    pub else_list: Vec<CfNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoopNode {
    pub body: Vec<CfNode>,
}

/// Node of a structured control-flow list.
#[derive(Debug, Clone, PartialEq)]
pub enum CfNode {
    Block(Block),
    If(IfNode),
    Loop(LoopNode),
}

impl CfNode {
    pub fn as_block(&self) -> Option<&Block> {
        match self {
            CfNode::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_block_mut(&mut self) -> Option<&mut Block> {
        match self {
            CfNode::Block(block) => Some(block),
            _ => None,
        }
    }
}

/// Visit every block of a CF list in program order.
pub fn visit_blocks<'a>(list: &'a [CfNode], f: &mut dyn FnMut(&'a Block)) {
    for node in list {
        match node {
            CfNode::Block(block) => f(block),
            CfNode::If(nif) => {
                visit_blocks(&nif.then_list, f);
                visit_blocks(&nif.else_list, f);
            }
            CfNode::Loop(nloop) => visit_blocks(&nloop.body, f),
        }
    }
}

pub fn visit_blocks_mut(list: &mut [CfNode], f: &mut dyn FnMut(&mut Block)) {
    for node in list {
        match node {
            CfNode::Block(block) => f(block),
            CfNode::If(nif) => {
                visit_blocks_mut(&mut nif.then_list, f);
                visit_blocks_mut(&mut nif.else_list, f);
            }
            CfNode::Loop(nloop) => visit_blocks_mut(&mut nloop.body, f),
        }
    }
}

/// Visit every SSA use in a CF list, including `if` conditions.
pub fn visit_uses_mut(list: &mut [CfNode], f: &mut dyn FnMut(&mut Ssa)) {
    for node in list {
        match node {
            CfNode::Block(block) => {
                for instr in &mut block.instrs {
                    instr.for_each_src_mut(&mut *f);
                }
            }
            CfNode::If(nif) => {
                f(&mut nif.condition);
                visit_uses_mut(&mut nif.then_list, f);
                visit_uses_mut(&mut nif.else_list, f);
            }
            CfNode::Loop(nloop) => visit_uses_mut(&mut nloop.body, f),
        }
    }
}

/// Body of a function with an implementation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionBody {
    pub body: Vec<CfNode>,
    /// Number of SSA indices handed out so far.
    pub ssa_alloc: u32,
    /// Number of block indices handed out so far.
    pub block_alloc: u32,
}

impl FunctionBody {
    pub fn alloc_ssa(&mut self, bit_size: u8, num_components: u8) -> Ssa {
        next_ssa(&mut self.ssa_alloc, bit_size, num_components)
    }

    pub fn alloc_block(&mut self) -> Block {
        let block = Block::new(self.block_alloc);
        self.block_alloc += 1;
        block
    }

    pub fn blocks(&self) -> Vec<&Block> {
        let mut blocks = Vec::new();
        visit_blocks(&self.body, &mut |b| blocks.push(b));
        blocks
    }

    pub fn instr_count(&self) -> usize {
        self.blocks().iter().map(|b| b.instrs.len()).sum()
    }

    /// Number of uses of each SSA index, `if` conditions included.
    pub fn use_counts(&self) -> HashMap<u32, usize> {
        let mut counts = HashMap::new();
        collect_uses(&self.body, &mut counts);
        counts
    }

    /// Constant loads by SSA index.
    pub fn constants(&self) -> HashMap<u32, LoadConstInstr> {
        let mut consts = HashMap::new();
        visit_blocks(&self.body, &mut |block| {
            for instr in &block.instrs {
                if let Instr::LoadConst(lc) = instr {
                    consts.insert(lc.def.index, lc.clone());
                }
            }
        });
        consts
    }

    /// Defining instruction of each SSA index.
    pub fn defs(&self) -> HashMap<u32, &Instr> {
        let mut defs = HashMap::new();
        visit_blocks(&self.body, &mut |block| {
            for instr in &block.instrs {
                if let Some(def) = instr.def() {
                    defs.insert(def.index, instr);
                }
            }
        });
        defs
    }
}

fn collect_uses(list: &[CfNode], counts: &mut HashMap<u32, usize>) {
    for node in list {
        match node {
            CfNode::Block(block) => {
                for instr in &block.instrs {
                    instr.for_each_src(|s| *counts.entry(s.index).or_insert(0) += 1);
                }
            }
            CfNode::If(nif) => {
                *counts.entry(nif.condition.index).or_insert(0) += 1;
                collect_uses(&nif.then_list, counts);
                collect_uses(&nif.else_list, counts);
            }
            CfNode::Loop(nloop) => collect_uses(&nloop.body, counts),
        }
    }
}

/// Hand out the next SSA index from `alloc`.
pub fn next_ssa(alloc: &mut u32, bit_size: u8, num_components: u8) -> Ssa {
    let ssa = Ssa::new(*alloc, bit_size, num_components);
    *alloc += 1;
    ssa
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub is_entrypoint: bool,
    /// `None` for declarations.
    pub body: Option<FunctionBody>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderInfo {
    pub stage: Stage,
    pub label: Option<String>,
    /// Generated by the driver rather than the application.
    pub internal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shader {
    pub info: ShaderInfo,
    pub variables: Vec<Variable>,
    pub functions: Vec<Function>,
}

impl Shader {
    pub fn new(stage: Stage) -> Self {
        Self {
            info: ShaderInfo {
                stage,
                label: None,
                internal: false,
            },
            variables: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.info.stage
    }

    pub fn bodies(&self) -> impl Iterator<Item = &FunctionBody> {
        self.functions.iter().filter_map(|f| f.body.as_ref())
    }

    pub fn bodies_mut(&mut self) -> impl Iterator<Item = &mut FunctionBody> {
        self.functions.iter_mut().filter_map(|f| f.body.as_mut())
    }

    /// Variable of `mode` assigned to `driver_location`.
    pub fn find_variable(&self, mode: VarMode, driver_location: u32) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|v| v.mode == mode && v.driver_location == driver_location)
    }
}
