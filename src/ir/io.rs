//! Shader I/O declarations and layout.
//!
//! Variables are laid out in attribute slots before selection runs: each one
//! receives a `driver_location`, which is what I/O intrinsics refer to through
//! their `base` index.

use log::trace;

use super::{next_ssa, visit_blocks_mut, AluSrc, Instr, Intrinsic, Shader, Stage};

pub const FRAG_RESULT_DEPTH: u32 = 0;
pub const FRAG_RESULT_STENCIL: u32 = 1;
pub const FRAG_RESULT_COLOR: u32 = 2;
pub const FRAG_RESULT_SAMPLE_MASK: u32 = 3;
pub const FRAG_RESULT_DATA0: u32 = 4;

/// First generic varying slot.
pub const VARYING_SLOT_VAR0: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarMode {
    ShaderIn,
    ShaderOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Float,
    Int,
    Uint,
    Bool,
    Double,
}

impl BaseType {
    pub fn bit_size(self) -> u8 {
        match self {
            BaseType::Double => 64,
            _ => 32,
        }
    }
}

/// Type of an I/O variable: scalar, vector, matrix or an array of those.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoType {
    pub base: BaseType,
    pub vector: u8,
    pub columns: u8,
    pub array_len: Option<u32>,
}

impl IoType {
    pub const fn vector(base: BaseType, vector: u8) -> Self {
        Self {
            base,
            vector,
            columns: 1,
            array_len: None,
        }
    }

    pub const fn matrix(base: BaseType, columns: u8, rows: u8) -> Self {
        Self {
            base,
            vector: rows,
            columns,
            array_len: None,
        }
    }

    pub const fn array(self, len: u32) -> Self {
        Self {
            array_len: Some(len),
            ..self
        }
    }

    /// GLSL-style spelling, e.g. `vec4`, `ivec2`, `mat3`, `float[4]`.
    pub fn glsl_name(&self) -> String {
        let elem = if self.columns > 1 {
            let prefix = if self.base == BaseType::Double { "d" } else { "" };
            if self.columns == self.vector {
                format!("{prefix}mat{}", self.columns)
            } else {
                format!("{prefix}mat{}x{}", self.columns, self.vector)
            }
        } else if self.vector == 1 {
            match self.base {
                BaseType::Float => "float",
                BaseType::Int => "int",
                BaseType::Uint => "uint",
                BaseType::Bool => "bool",
                BaseType::Double => "double",
            }
            .to_string()
        } else {
            let prefix = match self.base {
                BaseType::Float => "",
                BaseType::Int => "i",
                BaseType::Uint => "u",
                BaseType::Bool => "b",
                BaseType::Double => "d",
            };
            format!("{prefix}vec{}", self.vector)
        };
        match self.array_len {
            Some(len) => format!("{elem}[{len}]"),
            None => elem,
        }
    }

    pub fn from_glsl_name(name: &str) -> Option<Self> {
        let (elem, array_len) = match name.split_once('[') {
            Some((elem, rest)) => (elem, Some(rest.strip_suffix(']')?.parse().ok()?)),
            None => (name, None),
        };
        let ty = match elem {
            "float" => Self::vector(BaseType::Float, 1),
            "int" => Self::vector(BaseType::Int, 1),
            "uint" => Self::vector(BaseType::Uint, 1),
            "bool" => Self::vector(BaseType::Bool, 1),
            "double" => Self::vector(BaseType::Double, 1),
            _ => {
                let (base, rest) = match elem.as_bytes().first()? {
                    b'i' => (BaseType::Int, &elem[1..]),
                    b'u' => (BaseType::Uint, &elem[1..]),
                    b'b' => (BaseType::Bool, &elem[1..]),
                    b'd' => (BaseType::Double, &elem[1..]),
                    _ => (BaseType::Float, elem),
                };
                if let Some(n) = rest.strip_prefix("vec") {
                    Self::vector(base, parse_dim(n)?)
                } else if let Some(dims) = rest.strip_prefix("mat") {
                    match dims.split_once('x') {
                        Some((c, r)) => Self::matrix(base, parse_dim(c)?, parse_dim(r)?),
                        None => {
                            let n = parse_dim(dims)?;
                            Self::matrix(base, n, n)
                        }
                    }
                } else {
                    return None;
                }
            }
        };
        Some(match array_len {
            Some(len) => ty.array(len),
            None => ty,
        })
    }
}

fn parse_dim(s: &str) -> Option<u8> {
    s.parse().ok().filter(|n| (2..=4).contains(n))
}

/// Number of attribute slots occupied by a value of type `ty`.
pub fn type_size(ty: &IoType) -> u32 {
    let per_column = if ty.base.bit_size() == 64 && ty.vector > 2 { 2 } else { 1 };
    per_column * u32::from(ty.columns) * ty.array_len.unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub mode: VarMode,
    pub ty: IoType,
    /// Varying slot, or fragment result slot for fragment outputs.
    pub location: u32,
    /// Dual-source blend index.
    pub index: u8,
    pub driver_location: u32,
}

impl Variable {
    pub fn new(name: impl Into<String>, mode: VarMode, ty: IoType, location: u32) -> Self {
        Self {
            name: name.into(),
            mode,
            ty,
            location,
            index: 0,
            driver_location: 0,
        }
    }
}

/// Assign driver locations per mode, in `location` order, spaced by
/// [`type_size`].
pub fn assign_io_locations(shader: &mut Shader, type_size: fn(&IoType) -> u32) {
    for mode in [VarMode::ShaderIn, VarMode::ShaderOut] {
        let mut vars: Vec<&mut Variable> =
            shader.variables.iter_mut().filter(|v| v.mode == mode).collect();
        vars.sort_by_key(|v| (v.location, v.index));

        let mut next = 0;
        for var in vars {
            var.driver_location = next;
            next += type_size(&var.ty);
            trace!("{:?} {} -> driver location {}", mode, var.name, var.driver_location);
        }
    }
}

/// Split vector `store_output`s of a vertex shader into scalar stores.
///
/// Varying outputs are written one component at a time.
pub fn lower_io_to_scalar(shader: &mut Shader) -> bool {
    if shader.stage() != Stage::Vertex {
        return false;
    }

    let mut progress = false;
    for body in shader.bodies_mut() {
        let alloc = &mut body.ssa_alloc;
        visit_blocks_mut(&mut body.body, &mut |block| {
            let old = std::mem::take(&mut block.instrs);
            for instr in old {
                let store = match instr {
                    Instr::Intrinsic(intr)
                        if intr.intrinsic == Intrinsic::StoreOutput && intr.num_components > 1 =>
                    {
                        intr
                    }
                    other => {
                        block.instrs.push(other);
                        continue;
                    }
                };

                let value = store.srcs[0];
                let offset = store.srcs[1];
                let write_mask = if store.write_mask == 0 {
                    ((1u16 << store.num_components) - 1) as u8
                } else {
                    store.write_mask
                };
                for c in 0..store.num_components {
                    if write_mask & (1 << c) == 0 {
                        continue;
                    }
                    let chan = next_ssa(alloc, value.bit_size, 1);
                    block.instrs.push(Instr::mov(chan, AluSrc::channel(value, c)));

                    let mut scalar = store.clone();
                    scalar.srcs[0] = chan;
                    scalar.srcs[1] = offset;
                    scalar.num_components = 1;
                    scalar.component = store.component + c;
                    scalar.write_mask = 0x1;
                    block.instrs.push(Instr::Intrinsic(scalar));
                }
                progress = true;
            }
        });
    }
    progress
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_sizes_count_attribute_slots() {
        assert_eq!(type_size(&IoType::vector(BaseType::Float, 4)), 1);
        assert_eq!(type_size(&IoType::matrix(BaseType::Float, 4, 4)), 4);
        assert_eq!(type_size(&IoType::vector(BaseType::Double, 4)), 2);
        assert_eq!(type_size(&IoType::vector(BaseType::Double, 2)), 1);
        assert_eq!(type_size(&IoType::vector(BaseType::Float, 2).array(3)), 3);
    }

    #[test]
    fn glsl_names_round_trip() {
        for name in ["float", "vec4", "ivec2", "uvec3", "mat4", "mat2x3", "dvec4", "float[4]"] {
            let ty = IoType::from_glsl_name(name).unwrap();
            assert_eq!(ty.glsl_name(), name);
        }
        assert!(IoType::from_glsl_name("vec5").is_none());
    }

    #[test]
    fn locations_follow_slot_order() {
        let mut shader = Shader::new(Stage::Vertex);
        shader.variables.push(Variable::new(
            "b",
            VarMode::ShaderOut,
            IoType::vector(BaseType::Float, 4),
            VARYING_SLOT_VAR0 + 1,
        ));
        shader.variables.push(Variable::new(
            "a",
            VarMode::ShaderOut,
            IoType::matrix(BaseType::Float, 2, 2),
            VARYING_SLOT_VAR0,
        ));
        shader.variables.push(Variable::new(
            "in",
            VarMode::ShaderIn,
            IoType::vector(BaseType::Float, 4),
            0,
        ));

        assign_io_locations(&mut shader, type_size);

        let loc = |name: &str| {
            shader.variables.iter().find(|v| v.name == name).unwrap().driver_location
        };
        assert_eq!(loc("a"), 0);
        assert_eq!(loc("b"), 2);
        assert_eq!(loc("in"), 0);
    }
}
