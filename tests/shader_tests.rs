//! End-to-end tests over the `.sir` fixtures in `tests/shaders/`.
//!
//! A fixture either compiles and its listing contains every `; CHECK:` line
//! in order, or it carries `; EXPECT-ERROR:` and compilation fails with a
//! message containing that text.

use std::fs;
use std::path::{Path, PathBuf};

use agxc::agx::{Index, Instr, Opcode};
use agxc::opt::{optimize, AGX_OPTIONS};
use agxc::{compile_shader, compile_to_ir, CompileKey, DebugFlags, NoopBackend, PixelFormat, Shader};

fn shader_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("shaders")
}

fn discover_sir_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("sir"))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn load(name: &str) -> Shader {
    let text = fs::read_to_string(shader_dir().join(name)).unwrap();
    Shader::parse(&text).unwrap()
}

fn directives<'a>(text: &'a str, prefix: &str) -> Vec<&'a str> {
    text.lines()
        .filter_map(|l| l.trim().strip_prefix(prefix))
        .map(str::trim)
        .collect()
}

/// Compile one fixture and check it against its directives.
fn run_sir_file(path: &Path) -> Result<(), String> {
    let _ = env_logger::builder().is_test(true).try_init();

    let text = fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let mut shader = Shader::parse(&text).map_err(|e| format!("{}: {e}", path.display()))?;
    let expected_error = directives(&text, "; EXPECT-ERROR:");
    let checks = directives(&text, "; CHECK:");

    let key = CompileKey::default();
    let result = compile_shader(&mut shader, &key, DebugFlags::empty(), &mut NoopBackend);
    match (result, expected_error.first()) {
        (Ok(_), Some(expected)) => Err(format!("expected failure `{expected}`, compiled fine")),
        (Err(e), Some(expected)) if e.to_string().contains(expected) => Ok(()),
        (Err(e), Some(expected)) => Err(format!("expected `{expected}`, got `{e}`")),
        (Err(e), None) => Err(format!("unexpected failure: {e}")),
        (Ok(compiled), None) => {
            let mut lines = compiled.listing.lines();
            for check in checks {
                if !lines.any(|l| l.contains(check)) {
                    return Err(format!("CHECK `{check}` not found in:\n{}", compiled.listing));
                }
            }
            Ok(())
        }
    }
}

#[test]
fn all_fixtures() {
    let files = discover_sir_files(&shader_dir());
    assert!(files.len() >= 10, "fixtures missing from {}", shader_dir().display());

    let failures: Vec<String> = files
        .iter()
        .filter_map(|path| {
            run_sir_file(path)
                .err()
                .map(|e| format!("{}: {e}", path.file_name().unwrap().to_string_lossy()))
        })
        .collect();
    assert!(failures.is_empty(), "{}", failures.join("\n"));
}

#[test]
fn passthrough_is_one_straight_line_block() {
    let mut shader = load("passthrough.sir");
    let key = CompileKey::with_rt0(PixelFormat::Rgb10A2);
    let ctx = compile_to_ir(&mut shader, &key, DebugFlags::empty()).unwrap();

    assert_eq!(ctx.blocks.len(), 1);
    let instrs: Vec<&Instr> = ctx.blocks[0]
        .instrs
        .iter()
        .filter(|i| i.op != Opcode::MovImm)
        .collect();
    let ops: Vec<Opcode> = instrs.iter().map(|i| i.op).collect();
    let mut expected = vec![
        Opcode::LdVary,
        Opcode::Writeout,
        Opcode::Writeout,
        Opcode::Blend,
        Opcode::Stop,
    ];
    expected.extend([Opcode::Trap; 8]);
    assert_eq!(ops, expected);

    let ld = instrs[0];
    assert_eq!(ld.imm, 0);
    assert_eq!(ld.mask, 0);
    assert!(ld.perspective);
    assert_eq!(instrs[1].imm, 0xC200);
    assert_eq!(instrs[2].imm, 0x000C);
    assert_eq!(instrs[3].src[0], ld.dest);
    assert_eq!(instrs[3].format, Some(PixelFormat::Rgb10A2));
}

#[test]
fn vertex_outputs_store_each_component() {
    let mut shader = load("vertex_constant.sir");
    let key = CompileKey::default();
    let ctx = compile_to_ir(&mut shader, &key, DebugFlags::empty()).unwrap();
    let instrs = &ctx.blocks[0].instrs;

    let constant = |reg: Index| {
        instrs
            .iter()
            .find(|i| i.op == Opcode::MovImm && i.dest == reg)
            .map(|i| i.imm)
    };
    let values = [0x0, 0x3f80_0000, 0x4000_0000, 0x4040_0000];

    let mut slots: Vec<u32> = Vec::new();
    for store in instrs.iter().filter(|i| i.op == Opcode::StVary) {
        let component = (store.imm - 4) as usize;
        assert_eq!(constant(store.src[0]), Some(values[component]));
        slots.push(store.imm);
    }
    slots.sort();
    assert_eq!(slots, [4, 5, 6, 7]);
}

#[test]
fn pipeline_reaches_a_fixed_point() {
    for name in ["passthrough.sir", "vertex_constant.sir", "folded_math.sir", "loop.sir"] {
        let mut shader = load(name);
        optimize(&mut shader, &AGX_OPTIONS);
        let once = shader.print();
        optimize(&mut shader, &AGX_OPTIONS);
        assert_eq!(shader.print(), once, "{name} changed on a second run");
    }
}

#[test]
fn failed_compilations_leave_no_context() {
    let mut shader = load("if_statement.sir");
    let key = CompileKey::default();
    let result = compile_to_ir(&mut shader, &key, DebugFlags::empty());
    assert!(result.is_err());
}
