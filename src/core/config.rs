//! Per-compilation configuration: debug flags and the compile key.
//!
//! Both are plain values handed to the compile entry points. Nothing here is
//! process-global, so independent compilations can run in parallel.

use std::env;
use std::fmt;

use bitflags::bitflags;
use log::{warn, LevelFilter};

/// Environment variable read by [`DebugFlags::from_env`].
pub const DEBUG_ENV: &str = "AGX_MESA_DEBUG";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DebugFlags: u32 {
        /// Print debug messages.
        const MSGS = 1 << 0;
        /// Dump shaders in source IR and target IR.
        const SHADERS = 1 << 1;
        /// Print statistics.
        const SHADERDB = 1 << 2;
        /// Disassemble verbosely.
        const VERBOSE = 1 << 3;
        /// Dump even internal shaders.
        const INTERNAL = 1 << 4;
    }
}

const DEBUG_OPTIONS: &[(&str, DebugFlags)] = &[
    ("msgs", DebugFlags::MSGS),
    ("shaders", DebugFlags::SHADERS),
    ("shaderdb", DebugFlags::SHADERDB),
    ("verbose", DebugFlags::VERBOSE),
    ("internal", DebugFlags::INTERNAL),
];

impl DebugFlags {
    /// Parse a comma separated list such as `"shaders,shaderdb"`.
    ///
    /// Unknown names are reported and ignored.
    pub fn parse(spec: &str) -> Self {
        let mut flags = DebugFlags::empty();
        for name in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match DEBUG_OPTIONS.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
                Some((_, flag)) => flags |= *flag,
                None => warn!("ignoring unknown {DEBUG_ENV} option '{name}'"),
            }
        }
        flags
    }

    /// Read the flags once from `AGX_MESA_DEBUG`.
    pub fn from_env() -> Self {
        env::var(DEBUG_ENV).map(|v| Self::parse(&v)).unwrap_or_default()
    }

    /// Default log level for a front end honouring these flags. `MSGS` messages
    /// are logged at info level.
    pub fn log_filter(self) -> LevelFilter {
        if self.contains(DebugFlags::MSGS) {
            LevelFilter::Info
        } else {
            LevelFilter::Warn
        }
    }
}

/// Tile-buffer pixel format of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PixelFormat {
    I8 = 0x0,
    I16 = 0x1,
    I32 = 0x2,
    F16 = 0x3,
    #[default]
    U8Norm = 0x8,
    S8Norm = 0x9,
    U16Norm = 0xA,
    S16Norm = 0xB,
    Rgb10A2 = 0xC,
    Srgba8 = 0xE,
    Rg11B10F = 0xF,
    Rgb9E5 = 0x10,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 12] = [
        PixelFormat::I8,
        PixelFormat::I16,
        PixelFormat::I32,
        PixelFormat::F16,
        PixelFormat::U8Norm,
        PixelFormat::S8Norm,
        PixelFormat::U16Norm,
        PixelFormat::S16Norm,
        PixelFormat::Rgb10A2,
        PixelFormat::Srgba8,
        PixelFormat::Rg11B10F,
        PixelFormat::Rgb9E5,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::I8 => "i8",
            PixelFormat::I16 => "i16",
            PixelFormat::I32 => "i32",
            PixelFormat::F16 => "f16",
            PixelFormat::U8Norm => "u8norm",
            PixelFormat::S8Norm => "s8norm",
            PixelFormat::U16Norm => "u16norm",
            PixelFormat::S16Norm => "s16norm",
            PixelFormat::Rgb10A2 => "rgb10a2",
            PixelFormat::Srgba8 => "srgba8",
            PixelFormat::Rg11B10F => "rg11b10f",
            PixelFormat::Rgb9E5 => "rgb9e5",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maximum number of render targets described by a fragment key.
pub const MAX_RENDER_TARGETS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentKey {
    pub tib_formats: [PixelFormat; MAX_RENDER_TARGETS],
}

/// State the shader is compiled against, supplied by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileKey {
    pub fs: FragmentKey,
}

impl CompileKey {
    /// Key with render target 0 in `format` and the remaining targets defaulted.
    pub fn with_rt0(format: PixelFormat) -> Self {
        let mut key = Self::default();
        key.fs.tib_formats[0] = format;
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_debug_flags() {
        assert_eq!(
            DebugFlags::parse("shaders, shaderdb"),
            DebugFlags::SHADERS | DebugFlags::SHADERDB
        );
        assert_eq!(DebugFlags::parse("MSGS,bogus"), DebugFlags::MSGS);
        assert!(DebugFlags::parse("").is_empty());
    }

    #[test]
    fn debug_flags_come_from_the_mesa_variable() {
        assert_eq!(DEBUG_ENV, "AGX_MESA_DEBUG");
        env::set_var(DEBUG_ENV, "shaderdb,internal");
        let flags = DebugFlags::from_env();
        env::remove_var(DEBUG_ENV);
        assert_eq!(flags, DebugFlags::SHADERDB | DebugFlags::INTERNAL);
    }

    #[test]
    fn msgs_enables_info_logging() {
        assert_eq!(DebugFlags::MSGS.log_filter(), LevelFilter::Info);
        assert_eq!((DebugFlags::MSGS | DebugFlags::SHADERS).log_filter(), LevelFilter::Info);
        assert_eq!(DebugFlags::SHADERDB.log_filter(), LevelFilter::Warn);
    }

    #[test]
    fn pixel_format_names_round_trip() {
        for format in PixelFormat::ALL {
            assert_eq!(PixelFormat::from_name(format.name()), Some(format));
        }
        assert_eq!(CompileKey::with_rt0(PixelFormat::F16).fs.tib_formats[0], PixelFormat::F16);
    }
}
