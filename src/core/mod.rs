//! Shared infrastructure: error types and per-compilation configuration.

pub mod config;
pub mod error;

pub use config::{CompileKey, DebugFlags, FragmentKey, PixelFormat, DEBUG_ENV, MAX_RENDER_TARGETS};
pub use error::{CompileError, CompileResult, ErrorKind, ParseError, Unsupported};
