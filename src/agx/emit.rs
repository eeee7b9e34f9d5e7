//! Block/CFG construction: one target block per straight-line source block.

use log::debug;

use super::select::emit_instr;
use super::{BlockId, Builder, Context};
use crate::core::{CompileError, CompileResult, Unsupported};
use crate::ir::{self, CfNode};

/// Trap instructions padding the end of every program.
pub const TRAP_PADDING: usize = 8;

fn emit_block(ctx: &mut Context<'_>, block: &ir::Block) -> CompileResult<BlockId> {
    let id = ctx.create_block();
    debug!("emitting source block b{} into {id}", block.index);
    let mut b = Builder::new(ctx, id);
    for instr in &block.instrs {
        emit_instr(&mut b, instr)?;
    }
    Ok(id)
}

/// Emit a CF list, returning the first block it created.
pub fn emit_cf_list(ctx: &mut Context<'_>, list: &[CfNode]) -> CompileResult<Option<BlockId>> {
    let mut first = None;
    for node in list {
        let block = match node {
            CfNode::Block(block) => emit_block(ctx, block)?,
            CfNode::If(_) => return Err(CompileError::unimplemented(Unsupported::IfStatement)),
            CfNode::Loop(_) => return Err(CompileError::unimplemented(Unsupported::Loop)),
        };
        first.get_or_insert(block);
    }
    Ok(first)
}

/// Terminate the program in the last block.
pub fn emit_epilogue(ctx: &mut Context<'_>) -> CompileResult<()> {
    let last = ctx
        .last_block()
        .ok_or_else(|| CompileError::invariant("epilogue", "no blocks were emitted"))?;
    let mut b = Builder::new(ctx, last);
    b.stop();
    for _ in 0..TRAP_PADDING {
        b.trap();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agx::Opcode;
    use crate::core::CompileKey;
    use crate::ir::Shader;

    #[test]
    fn each_source_block_gets_a_target_block() {
        let shader = Shader::parse(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x1
               }
               block b1 {
               }
               block b2 {
                 %1:32 = load_const 0x2
               }
             }",
        )
        .unwrap();
        let key = CompileKey::default();
        let mut ctx = Context::new(&shader, &key);
        let body = &shader.functions[0].body.as_ref().unwrap().body;

        assert_eq!(emit_cf_list(&mut ctx, body).unwrap(), Some(BlockId(0)));
        assert_eq!(ctx.blocks.len(), 3);
        emit_epilogue(&mut ctx).unwrap();

        let last = &ctx.blocks[2].instrs;
        assert_eq!(last.len(), 1 + 1 + TRAP_PADDING);
        assert_eq!(last[1].op, Opcode::Stop);
        assert!(last[2..].iter().all(|i| i.op == Opcode::Trap));
        assert!(ctx.blocks[1].instrs.is_empty());
    }

    #[test]
    fn structured_control_flow_is_rejected() {
        let shader = Shader::parse(
            "shader fragment
             fn main {
               block b0 {
                 %0:32 = load_const 0x1
               }
               if %0 {
                 block b1 {
                 }
               } else {
                 block b2 {
                 }
               }
               block b3 {
               }
             }",
        )
        .unwrap();
        let key = CompileKey::default();
        let mut ctx = Context::new(&shader, &key);
        let body = &shader.functions[0].body.as_ref().unwrap().body;
        let err = emit_cf_list(&mut ctx, body).unwrap_err();
        assert_eq!(err, CompileError::unimplemented(Unsupported::IfStatement));
    }
}
