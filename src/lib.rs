//! agxc - shader compiler backend for the AGX GPU.
//!
//! Lowers a structured SSA shader ("source IR") into AGX pseudo-instructions
//! grouped into basic blocks, ready for an external register allocator and
//! binary packer.
//!
//! # Primary Usage
//!
//! ```
//! use agxc::{compile_shader, CompileKey, DebugFlags, NoopBackend, PixelFormat, Shader};
//!
//! let mut shader = Shader::parse(
//!     "shader fragment
//!      var out vec4 color loc=2
//!      fn main {
//!        block b0 {
//!          %0:32 = load_const 0x0
//!          %1:32 = load_const 0x3f800000
//!          store_output %1, %0 base=0 wrmask=0x1
//!        }
//!      }",
//! )
//! .unwrap();
//! let key = CompileKey::with_rt0(PixelFormat::U8Norm);
//! let compiled = compile_shader(&mut shader, &key, DebugFlags::empty(), &mut NoopBackend).unwrap();
//! assert!(compiled.listing.contains("blend"));
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - source IR, text format, I/O layout
//! - [`opt`] - legalization and optimization pipeline
//! - [`agx`] - target IR, instruction selection, block construction
//! - [`compiler`] - compilation driver and backend hook
//! - [`core`] - errors and per-compilation configuration

pub mod agx;
pub mod compiler;
pub mod core;
pub mod ir;
pub mod opt;

pub use compiler::{compile_shader, compile_to_ir, Backend, CompiledShader, NoopBackend, ShaderStats};
pub use crate::core::{CompileError, CompileKey, CompileResult, DebugFlags, ErrorKind, ParseError, PixelFormat, Unsupported};
pub use ir::{Shader, Stage};
