// This module drives a whole AGX compilation. compile_to_ir lays out the shader's I/O,
// runs the optimization pipeline, and builds the target block graph in a fresh Context;
// compile_shader then hands that Context to a Backend (the register allocator and
// binary packer, which live outside this crate) and collects the result. Debug output
// is controlled by the DebugFlags value passed in by the caller: shader dumps go to
// stdout, the shaderdb statistics line to stderr, and MSGS enables info-level log
// messages. Internal shaders are not dumped unless DebugFlags::INTERNAL is set.

//! Compilation driver.

use std::fmt;

use log::{debug, info};

use crate::agx::emit::{emit_cf_list, emit_epilogue};
use crate::agx::Context;
use crate::core::{CompileError, CompileKey, CompileResult, DebugFlags, Unsupported};
use crate::ir::io::{assign_io_locations, lower_io_to_scalar, type_size};
use crate::ir::Shader;
use crate::opt::{optimize, AGX_OPTIONS};

/// Register allocation and binary packing, run after instruction selection.
pub trait Backend {
    /// Rewrite virtual registers in place, updating the spill and fill counters.
    fn allocate_registers(&mut self, ctx: &mut Context<'_>) -> CompileResult<()>;

    /// Encode the allocated program.
    fn pack(&mut self, ctx: &Context<'_>) -> CompileResult<Vec<u8>>;
}

/// Backend that leaves registers virtual and produces an empty binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

impl Backend for NoopBackend {
    fn allocate_registers(&mut self, _ctx: &mut Context<'_>) -> CompileResult<()> {
        Ok(())
    }

    fn pack(&mut self, _ctx: &Context<'_>) -> CompileResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Internal shaders stay quiet unless explicitly requested.
fn skip_internal(shader: &Shader, debug: DebugFlags) -> bool {
    shader.info.internal && !debug.contains(DebugFlags::INTERNAL)
}

/// Lay out, optimize and select `shader` into a target block graph.
pub fn compile_to_ir<'a>(
    shader: &'a mut Shader,
    key: &'a CompileKey,
    debug: DebugFlags,
) -> CompileResult<Context<'a>> {
    if debug.contains(DebugFlags::MSGS) {
        info!(
            "compiling {} shader {}",
            shader.stage(),
            shader.info.label.as_deref().unwrap_or("<unnamed>")
        );
    }

    assign_io_locations(shader, type_size);
    if lower_io_to_scalar(shader) {
        debug!("scalarized vertex outputs");
    }
    optimize(shader, &AGX_OPTIONS);

    let shader: &'a Shader = shader;
    if debug.contains(DebugFlags::SHADERS) && !skip_internal(shader, debug) {
        print!("{}", shader.print());
    }

    let mut bodies = shader.bodies();
    let body = bodies
        .next()
        .ok_or_else(|| CompileError::invariant("shader", "no function has a body"))?;
    if bodies.next().is_some() {
        return Err(CompileError::unimplemented(Unsupported::MultiFunction));
    }

    let mut ctx = Context::new(shader, key);
    emit_cf_list(&mut ctx, &body.body)?;
    emit_epilogue(&mut ctx)?;
    ctx.name_blocks();

    if debug.contains(DebugFlags::MSGS) {
        info!(
            "selected {} instructions in {} blocks",
            ctx.instr_count(),
            ctx.blocks.len()
        );
    }
    Ok(ctx)
}

/// Statistics reported under [`DebugFlags::SHADERDB`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderStats {
    pub label: String,
    pub instructions: usize,
    pub bytes: usize,
    pub threads: u32,
    pub loops: u32,
    pub spills: u32,
    pub fills: u32,
}

impl ShaderStats {
    fn collect(ctx: &Context<'_>, bytes: usize) -> Self {
        Self {
            label: ctx.shader.info.label.clone().unwrap_or_default(),
            instructions: ctx.instr_count(),
            bytes,
            threads: 1,
            loops: ctx.loop_count,
            spills: ctx.spills,
            fills: ctx.fills,
        }
    }
}

impl fmt::Display for ShaderStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} shader: {} inst, {} bytes, {} threads, {} loops, {}:{} spills:fills",
            self.label, self.instructions, self.bytes, self.threads, self.loops, self.spills,
            self.fills
        )
    }
}

/// Output of [`compile_shader`].
#[derive(Debug, Clone)]
pub struct CompiledShader {
    /// Target program as printed after register allocation.
    pub listing: String,
    pub binary: Vec<u8>,
    pub stats: ShaderStats,
}

/// Compile `shader` all the way through `backend`.
pub fn compile_shader(
    shader: &mut Shader,
    key: &CompileKey,
    debug: DebugFlags,
    backend: &mut dyn Backend,
) -> CompileResult<CompiledShader> {
    let mut ctx = compile_to_ir(shader, key, debug)?;
    let quiet = skip_internal(ctx.shader, debug);
    let dump = debug.contains(DebugFlags::SHADERS) && !quiet;

    if dump {
        print!("{}", ctx.print());
    }
    backend.allocate_registers(&mut ctx)?;
    if dump {
        print!("{}", ctx.print());
    }

    let binary = backend.pack(&ctx)?;
    let stats = ShaderStats::collect(&ctx, binary.len());
    if debug.contains(DebugFlags::SHADERDB) && !quiet {
        eprintln!("{stats}");
    }

    Ok(CompiledShader {
        listing: ctx.print(),
        binary,
        stats,
    })
}
