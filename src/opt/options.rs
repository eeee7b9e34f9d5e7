//! Target capability table consumed by the optimization pipeline.

use bitflags::bitflags;

bitflags! {
    /// 64-bit integer operations that must be split into 32-bit halves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Int64Lowering: u32 {
        const IADD = 1 << 0;
        const ISUB = 1 << 1;
        const INEG = 1 << 2;
        const IMUL = 1 << 3;
        const IMUL_2X32_64 = 1 << 4;
        const LOGIC = 1 << 5;
        const ICMP = 1 << 6;
    }
}

bitflags! {
    /// Instruction classes the code-motion passes may relocate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MoveOptions: u32 {
        const CONST_UNDEF = 1 << 0;
        const LOAD_UBO = 1 << 1;
        const LOAD_INPUT = 1 << 2;
        const COMPARISONS = 1 << 3;
        const COPIES = 1 << 4;
        const LOAD_SSBO = 1 << 5;
    }
}

/// Integer division lowering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdivOptions {
    /// Skip the two refinement steps of the reciprocal sequence.
    pub imprecise_32bit: bool,
    /// Lower 16-bit division by widening instead of leaving it alone.
    pub allow_fp16: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerOptions {
    /// Bit sizes (as a mask of 16, 32, 64) whose `flrp` is expanded.
    pub lower_flrp: u32,
    pub lower_ffract: bool,
    pub lower_fmod: bool,
    pub lower_fdiv: bool,
    pub lower_isign: bool,
    pub lower_fpow: bool,
    pub lower_fsign: bool,
    pub has_fsub: bool,
    pub has_isub: bool,
    pub fuse_ffma16: bool,
    pub fuse_ffma32: bool,
    pub fuse_ffma64: bool,
    pub lower_int64: Int64Lowering,
    pub lower_idiv: IdivOptions,
}

impl CompilerOptions {
    pub fn fuse_ffma(&self, bit_size: u8) -> bool {
        match bit_size {
            16 => self.fuse_ffma16,
            32 => self.fuse_ffma32,
            64 => self.fuse_ffma64,
            _ => false,
        }
    }

    pub fn lowers_flrp(&self, bit_size: u8) -> bool {
        self.lower_flrp & u32::from(bit_size) != 0
    }
}

/// What the AGX backend needs from the pipeline.
pub const AGX_OPTIONS: CompilerOptions = CompilerOptions {
    lower_flrp: 16 | 32 | 64,
    lower_ffract: true,
    lower_fmod: true,
    lower_fdiv: true,
    lower_isign: true,
    lower_fpow: true,
    lower_fsign: true,
    has_fsub: true,
    has_isub: true,
    fuse_ffma16: true,
    fuse_ffma32: true,
    fuse_ffma64: false,
    lower_int64: Int64Lowering::all()
        .difference(Int64Lowering::IADD.union(Int64Lowering::IMUL_2X32_64)),
    lower_idiv: IdivOptions {
        imprecise_32bit: false,
        allow_fp16: true,
    },
};

/// Everything the code-motion passes run with.
pub const MOVE_ALL: MoveOptions = MoveOptions::all();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agx_keeps_native_64bit_add() {
        assert!(!AGX_OPTIONS.lower_int64.contains(Int64Lowering::IADD));
        assert!(AGX_OPTIONS.lower_int64.contains(Int64Lowering::IMUL));
        assert!(AGX_OPTIONS.lowers_flrp(64));
        assert!(AGX_OPTIONS.fuse_ffma(32));
        assert!(!AGX_OPTIONS.fuse_ffma(64));
    }
}
