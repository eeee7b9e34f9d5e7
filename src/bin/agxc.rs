//! Command line driver: compile a source-IR text file and print the AGX block graph.

use std::fs;
use std::path::PathBuf;
use std::process;

use agxc::{compile_shader, CompileKey, DebugFlags, NoopBackend, PixelFormat, Shader};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "agxc", version, about = "Compile a shader for the AGX GPU")]
struct Args {
    /// Source-IR text file.
    input: PathBuf,

    /// Tile-buffer format of render target 0.
    #[arg(long, default_value = "u8norm", value_parser = parse_format)]
    rt0: PixelFormat,

    /// Debug options, comma separated (msgs, shaders, shaderdb, verbose, internal).
    /// Added to whatever AGX_MESA_DEBUG enables.
    #[arg(long, short = 'd', default_value = "")]
    debug: String,
}

fn parse_format(name: &str) -> Result<PixelFormat, String> {
    PixelFormat::from_name(name).ok_or_else(|| {
        let known: Vec<&str> = PixelFormat::ALL.iter().map(|f| f.name()).collect();
        format!("unknown format '{name}', expected one of: {}", known.join(", "))
    })
}

fn main() {
    let args = Args::parse();
    let debug = DebugFlags::from_env() | DebugFlags::parse(&args.debug);
    // RUST_LOG still takes precedence over the level implied by the flags.
    env_logger::Builder::new()
        .filter_level(debug.log_filter())
        .parse_default_env()
        .init();

    let text = match fs::read_to_string(&args.input) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("agxc: {}: {e}", args.input.display());
            process::exit(1);
        }
    };
    let mut shader = match Shader::parse(&text) {
        Ok(shader) => shader,
        Err(e) => {
            eprintln!("agxc: {}: {e}", args.input.display());
            process::exit(1);
        }
    };

    let key = CompileKey::with_rt0(args.rt0);
    match compile_shader(&mut shader, &key, debug, &mut NoopBackend) {
        Ok(compiled) => print!("{}", compiled.listing),
        Err(e) => {
            eprintln!("agxc: {}: {e}", args.input.display());
            process::exit(1);
        }
    }
}
